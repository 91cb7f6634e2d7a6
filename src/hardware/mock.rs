//! Simulated device bus.
//!
//! [`MockBus`] is an in-memory [`Transport`] that answers requests the way a
//! daisy-chain of pumps and valves would, in either wire framing. It also
//! implements [`Connector`], so a complete hardware system can be exercised
//! without a serial port.
//!
//! Faults are injected through a [`MockBusHandle`]:
//! - `drop_replies` makes a device stay silent (the caller times out)
//! - `set_fault` makes a device answer with a fault status
//! - `set_link_down` fails every write and refuses new connections
//! - `set_reply_delay` holds each reply back for a while

use super::codec::{Directive, Reply, ReplyStatus, WireCodec};
use super::transport::{Connector, Transport};
use crate::error::{FlowError, FlowResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
enum DeviceModel {
    Pump { rate: f64 },
    Valve { positions: u8, position: u8 },
}

#[derive(Debug, Clone)]
struct Device {
    model: DeviceModel,
    fault: Option<String>,
    drop_replies: u32,
}

impl Device {
    fn new(model: DeviceModel) -> Self {
        Self {
            model,
            fault: None,
            drop_replies: 0,
        }
    }

    fn respond(&mut self, directive: Directive) -> Reply {
        if let Some(fault) = &self.fault {
            return Reply {
                status: ReplyStatus::Fault(fault.clone()),
                data: String::new(),
            };
        }
        let rejected = |msg: &str| Reply {
            status: ReplyStatus::Rejected(msg.to_string()),
            data: String::new(),
        };
        match (&mut self.model, directive) {
            (DeviceModel::Pump { rate }, Directive::Initialize | Directive::Stop) => {
                *rate = 0.0;
                Reply::ok("")
            }
            (DeviceModel::Pump { rate }, Directive::SetRate(new_rate)) => {
                if new_rate < 0.0 {
                    return rejected("invalid operand");
                }
                *rate = new_rate;
                Reply::ok("")
            }
            (DeviceModel::Pump { rate }, Directive::Query) => Reply {
                status: ReplyStatus::Ok { busy: *rate > 0.0 },
                data: rate.to_string(),
            },
            (DeviceModel::Valve { position, .. }, Directive::Initialize) => {
                *position = 1;
                Reply::ok("")
            }
            (DeviceModel::Valve { positions, position }, Directive::MoveValve(target)) => {
                if target == 0 || target > *positions {
                    return rejected("invalid operand");
                }
                *position = target;
                Reply::ok("")
            }
            (DeviceModel::Valve { position, .. }, Directive::Query) => Reply::ok(position.to_string()),
            (DeviceModel::Valve { .. }, Directive::Stop) => Reply::ok(""),
            (_, _) => rejected("invalid command"),
        }
    }
}

#[derive(Debug)]
struct BusState {
    codec: Arc<dyn WireCodec>,
    devices: HashMap<String, Device>,
    inbound: Vec<u8>,
    outbound: VecDeque<u8>,
    requests: Vec<(String, Directive)>,
    link_down: bool,
    reply_delay: Duration,
    connects: u32,
}

impl BusState {
    fn handle_frames(&mut self) {
        while let Some(end) = self.codec.request_end(&self.inbound) {
            let frame: Vec<u8> = self.inbound.drain(..end).collect();
            // Garbled frames go unanswered, as on a real bus.
            let Ok((address, directive)) = self.codec.decode_request(&frame) else {
                continue;
            };
            self.requests.push((address.clone(), directive));
            let Some(device) = self.devices.get_mut(&address) else {
                continue;
            };
            if device.drop_replies > 0 {
                device.drop_replies -= 1;
                continue;
            }
            let reply = device.respond(directive);
            let bytes = self.codec.encode_reply(&address, &reply);
            self.outbound.extend(bytes);
        }
    }
}

fn lock(state: &Mutex<BusState>) -> MutexGuard<'_, BusState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory device bus. Clones share the same devices.
#[derive(Debug, Clone)]
pub struct MockBus {
    state: Arc<Mutex<BusState>>,
}

impl MockBus {
    pub fn new(codec: Arc<dyn WireCodec>) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                codec,
                devices: HashMap::new(),
                inbound: Vec::new(),
                outbound: VecDeque::new(),
                requests: Vec::new(),
                link_down: false,
                reply_delay: Duration::ZERO,
                connects: 0,
            })),
        }
    }

    pub fn handle(&self) -> MockBusHandle {
        MockBusHandle {
            state: Arc::clone(&self.state),
        }
    }
}

#[async_trait]
impl Transport for MockBus {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = lock(&self.state);
        if state.link_down {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down"));
        }
        state.inbound.extend_from_slice(bytes);
        state.handle_frames();
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let delay = lock(&self.state).reply_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        {
            let mut state = lock(&self.state);
            if !state.outbound.is_empty() {
                let n = buf.len().min(state.outbound.len());
                for (slot, byte) in buf.iter_mut().zip(state.outbound.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
        }
        // Nothing will ever arrive for this request.
        futures::future::pending().await
    }
}

#[async_trait]
impl Connector for MockBus {
    async fn connect(&self, port: &str, _baud_rate: u32) -> FlowResult<Box<dyn Transport>> {
        let mut state = lock(&self.state);
        if state.link_down {
            return Err(FlowError::Connection(format!("{port}: no such device")));
        }
        state.connects += 1;
        state.inbound.clear();
        state.outbound.clear();
        Ok(Box::new(self.clone()))
    }
}

/// Test-side control over a [`MockBus`].
#[derive(Debug, Clone)]
pub struct MockBusHandle {
    state: Arc<Mutex<BusState>>,
}

impl MockBusHandle {
    pub fn add_pump(&self, address: &str) {
        lock(&self.state)
            .devices
            .insert(address.to_string(), Device::new(DeviceModel::Pump { rate: 0.0 }));
    }

    pub fn add_valve(&self, address: &str, positions: u8) {
        lock(&self.state).devices.insert(
            address.to_string(),
            Device::new(DeviceModel::Valve {
                positions,
                position: 1,
            }),
        );
    }

    pub fn remove_device(&self, address: &str) {
        lock(&self.state).devices.remove(address);
    }

    /// Leave the next `count` requests to `address` unanswered.
    pub fn drop_replies(&self, address: &str, count: u32) {
        if let Some(device) = lock(&self.state).devices.get_mut(address) {
            device.drop_replies = count;
        }
    }

    pub fn set_fault(&self, address: &str, fault: Option<&str>) {
        if let Some(device) = lock(&self.state).devices.get_mut(address) {
            device.fault = fault.map(str::to_string);
        }
    }

    pub fn set_link_down(&self, down: bool) {
        lock(&self.state).link_down = down;
    }

    pub fn set_reply_delay(&self, delay: Duration) {
        lock(&self.state).reply_delay = delay;
    }

    /// Every decoded request, in arrival order.
    pub fn requests(&self) -> Vec<(String, Directive)> {
        lock(&self.state).requests.clone()
    }

    pub fn clear_requests(&self) {
        lock(&self.state).requests.clear();
    }

    pub fn pump_rate(&self, address: &str) -> Option<f64> {
        match lock(&self.state).devices.get(address)?.model {
            DeviceModel::Pump { rate } => Some(rate),
            DeviceModel::Valve { .. } => None,
        }
    }

    pub fn valve_position(&self, address: &str) -> Option<u8> {
        match lock(&self.state).devices.get(address)?.model {
            DeviceModel::Valve { position, .. } => Some(position),
            DeviceModel::Pump { .. } => None,
        }
    }

    pub fn connects(&self) -> u32 {
        lock(&self.state).connects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::codec::LegacyCodec;

    #[tokio::test]
    async fn test_bus_answers_addressed_device_only() {
        let codec: Arc<dyn WireCodec> = Arc::new(LegacyCodec);
        let mut bus = MockBus::new(Arc::clone(&codec));
        let handle = bus.handle();
        handle.add_pump("1");

        bus.write(&codec.encode_request("1", Directive::SetRate(3.0)))
            .await
            .unwrap();
        let mut buf = [0u8; 32];
        let n = bus.read(&mut buf).await.unwrap();
        assert_eq!(
            codec.decode_reply(&buf[..n]).unwrap().status,
            ReplyStatus::Ok { busy: false }
        );
        assert_eq!(handle.pump_rate("1"), Some(3.0));

        // Unknown address: logged, never answered.
        bus.write(&codec.encode_request("7", Directive::Query)).await.unwrap();
        assert_eq!(handle.requests().len(), 2);
        let pending = tokio::time::timeout(Duration::from_millis(10), bus.read(&mut buf)).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_link_down_fails_writes_and_connects() {
        let bus = MockBus::new(Arc::new(LegacyCodec));
        bus.handle().set_link_down(true);
        let mut transport: Box<dyn Transport> = Box::new(bus.clone());
        assert!(transport.write(b"/1QR\r").await.is_err());
        assert!(matches!(
            bus.connect("/dev/mock", 9600).await,
            Err(FlowError::Connection(_))
        ));
    }
}
