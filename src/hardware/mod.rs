//! Hardware channels.
//!
//! Every pump and valve is driven through a [`HardwareChannel`]: one
//! addressable device with a uniform actuate / query / stop contract. The
//! two hardware families differ only in wire framing (see [`codec`]), so a
//! single bus-backed implementation, [`BusChannel`], serves both.
//!
//! Channel calls are bounded by a timeout. A call that does not complete in
//! time fails with [`FlowError::Timeout`](crate::error::FlowError::Timeout);
//! the orchestrator decides whether to retry.

pub mod channel;
pub mod codec;
pub mod mock;
pub mod transport;

pub use channel::BusChannel;
pub use codec::{Directive, FramedCodec, LegacyCodec, Reply, ReplyStatus, WireCodec};
pub use mock::{MockBus, MockBusHandle};
pub use transport::{BusLink, Connector, SerialConnector, SharedTransport, StreamTransport, Transport};

use crate::error::FlowResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Pump,
    Valve,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pump => f.write_str("pump"),
            Self::Valve => f.write_str("valve"),
        }
    }
}

/// Requested device state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TargetState {
    /// Commanded pump rate in µl/s (after calibration)
    Rate(f64),
    /// Valve position
    Position(u8),
}

/// Device state as reported by the hardware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservedState {
    pub busy: bool,
    /// Commanded rate the pump reports, in µl/s
    pub rate: Option<f64>,
    pub position: Option<u8>,
}

/// One addressable pump or valve.
#[async_trait]
pub trait HardwareChannel: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> ChannelKind;

    /// Bring the device to a known state after connecting.
    async fn initialize(&self) -> FlowResult<()>;

    async fn actuate(&self, target: TargetState) -> FlowResult<()>;

    async fn query(&self) -> FlowResult<ObservedState>;

    /// Halt the device. Any failure is reported as a hardware fault.
    async fn stop(&self) -> FlowResult<()>;
}
