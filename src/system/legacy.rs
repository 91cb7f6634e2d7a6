//! Legacy architecture: syringe pumps and selector valves daisy-chained on
//! one RS-232 line, ASCII framing.

use super::bus::{BusSystem, ChannelSet, HardwareFamily};
use crate::error::FlowResult;
use crate::hardware::{LegacyCodec, WireCodec};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub type LegacySystem = BusSystem<Legacy>;

#[derive(Debug, Default, Clone, Copy)]
pub struct Legacy;

#[async_trait]
impl HardwareFamily for Legacy {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn codec(&self) -> Arc<dyn WireCodec> {
        Arc::new(LegacyCodec)
    }

    /// Valves home before pumps so no pump pushes against a closed port.
    async fn handshake(&self, channels: &ChannelSet) -> FlowResult<()> {
        for channel in channels.valves().iter().chain(channels.pumps()) {
            channel.initialize().await?;
            debug!(channel = %channel.id(), "initialized");
        }
        Ok(())
    }
}
