//! Current architecture: self-homing pumps and valves speaking a
//! checksummed line protocol.

use super::bus::{BusSystem, ChannelSet, HardwareFamily};
use crate::error::FlowResult;
use crate::hardware::{ChannelKind, FramedCodec, WireCodec};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

pub type CurrentSystem = BusSystem<Current>;

#[derive(Debug, Default, Clone, Copy)]
pub struct Current;

#[async_trait]
impl HardwareFamily for Current {
    fn name(&self) -> &'static str {
        "current"
    }

    fn codec(&self) -> Arc<dyn WireCodec> {
        Arc::new(FramedCodec)
    }

    /// Devices home on power-up. Check every one answers, halt any pump
    /// left running by a previous session, and re-home the valves.
    async fn handshake(&self, channels: &ChannelSet) -> FlowResult<()> {
        for channel in channels.iter() {
            let state = channel.query().await?;
            if channel.kind() == ChannelKind::Pump && state.busy {
                warn!(pump = %channel.id(), rate = ?state.rate, "pump running at connect, stopping");
                channel.stop().await?;
            }
        }
        for valve in channels.valves() {
            valve.initialize().await?;
        }
        debug!(channels = channels.iter().count(), "handshake complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemType;
    use crate::error::FlowError;
    use crate::hardware::{Directive, MockBus, Transport};
    use crate::network::tests::selector_network;
    use crate::network::FluidicNetwork;
    use crate::system::{build_system_with, FluidSystem};
    use std::time::Duration;

    fn current_system(bus: &MockBus) -> Arc<dyn FluidSystem> {
        let (tubing, mut sys) = selector_network();
        sys.system_type = SystemType::Current;
        sys.port = "/dev/ttyACM0".into();
        sys.baud_rate = 115_200;
        let network = Arc::new(FluidicNetwork::build(&tubing, &sys).unwrap());
        build_system_with(&sys, network, Arc::new(bus.clone()), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_handshake_stops_running_pump() {
        let bus = MockBus::new(Arc::new(FramedCodec));
        let handle = bus.handle();
        handle.add_pump("1");
        handle.add_valve("2", 2);
        let system = current_system(&bus);

        // Left running by someone else.
        let mut transport: Box<dyn Transport> = Box::new(bus.clone());
        transport
            .write(&FramedCodec.encode_request("1", Directive::SetRate(3.0)))
            .await
            .unwrap();
        let mut sink = [0u8; 64];
        transport.read(&mut sink).await.unwrap();
        handle.clear_requests();

        system.connect().await.unwrap();
        assert_eq!(system.name(), "current");
        assert_eq!(handle.pump_rate("1"), Some(0.0));
        assert!(handle
            .requests()
            .contains(&("1".to_string(), Directive::Stop)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_device_fails_connect() {
        let bus = MockBus::new(Arc::new(FramedCodec));
        bus.handle().add_pump("1");
        let system = current_system(&bus);

        let err = system.connect().await.unwrap_err();
        assert!(matches!(err, FlowError::Timeout { .. }));
        assert!(!system.is_connected());
    }

    #[tokio::test]
    async fn test_link_down_refuses_connection() {
        let bus = MockBus::new(Arc::new(FramedCodec));
        bus.handle().set_link_down(true);
        let system = current_system(&bus);
        assert!(matches!(
            system.connect().await,
            Err(FlowError::Connection(_))
        ));
    }
}
