// src/core/channel/builtin.rs

//! Channels shipped with the broker.

use super::{Channel, ChannelContext};
use crate::core::BrokerError;
use tracing::debug;

/// The name `StreamChannel` is registered under by the server binary.
pub const PUBSUB_CHANNEL: &str = "$pubsub";

/// Streams one broadcasting, named by the identifier's `stream_name`, straight
/// to the client. Subscriptions without a `stream_name` are rejected.
#[derive(Debug, Default)]
pub struct StreamChannel;

impl Channel for StreamChannel {
    fn subscribed(&mut self, ctx: &mut ChannelContext) -> Result<(), BrokerError> {
        let Some(stream) = ctx.param_str("stream_name").map(str::to_string) else {
            debug!("Rejecting {} without a stream_name.", PUBSUB_CHANNEL);
            ctx.reject();
            return Ok(());
        };
        ctx.stream_from(&stream)
    }
}
