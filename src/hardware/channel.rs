//! Bus-backed hardware channel.

use super::codec::{Directive, Reply, ReplyStatus, WireCodec};
use super::transport::{BusLink, SharedTransport};
use super::{ChannelKind, HardwareChannel, ObservedState, TargetState};
use crate::error::{FlowError, FlowResult};
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

const READ_CHUNK: usize = 64;
const MAX_FRAME: usize = 1024;

/// A pump or valve addressed on a shared bus.
pub struct BusChannel {
    id: String,
    kind: ChannelKind,
    address: String,
    codec: Arc<dyn WireCodec>,
    bus: SharedTransport,
    timeout: Duration,
}

impl BusChannel {
    pub fn new(
        id: impl Into<String>,
        kind: ChannelKind,
        address: impl Into<String>,
        codec: Arc<dyn WireCodec>,
        bus: SharedTransport,
        timeout: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            address: address.into(),
            codec,
            bus,
            timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send one directive and wait for its reply, bounded by the channel
    /// timeout. Device-reported errors are classified here.
    async fn transaction(&self, directive: Directive) -> FlowResult<Reply> {
        let mut bus = self.bus.lock().await;
        if bus.is_stale() {
            let dropped = bus
                .drain(self.timeout)
                .await
                .map_err(|e| FlowError::communication(&self.id, format!("drain failed: {e}")))?;
            if dropped > 0 {
                warn!(channel = %self.id, dropped, "discarded late reply bytes");
            }
        }
        let exchange = self.exchange(&mut bus, directive);
        let reply = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(FlowError::Timeout {
                    channel: self.id.clone(),
                    timeout: self.timeout,
                })
            }
        };
        match &reply.status {
            ReplyStatus::Ok { .. } => Ok(reply),
            ReplyStatus::Rejected(message) => Err(FlowError::Rejected {
                channel: self.id.clone(),
                message: message.clone(),
            }),
            ReplyStatus::Fault(message) => Err(FlowError::HardwareFault {
                channel: self.id.clone(),
                message: message.clone(),
            }),
        }
    }

    /// One request/response on a locked bus. The bus stays stale until the
    /// full reply frame is in.
    async fn exchange(&self, bus: &mut BusLink, directive: Directive) -> FlowResult<Reply> {
        let request = self.codec.encode_request(&self.address, directive);
        bus.set_stale(true);

        trace!(channel = %self.id, codec = self.codec.name(), frame = ?String::from_utf8_lossy(&request), "tx");
        bus.write(&request)
            .await
            .map_err(|e| FlowError::communication(&self.id, format!("write failed: {e}")))?;

        let mut response = BytesMut::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];
        let end = loop {
            if let Some(end) = self.codec.reply_end(&response) {
                break end;
            }
            if response.len() > MAX_FRAME {
                return Err(FlowError::communication(&self.id, "reply exceeds frame limit"));
            }
            let n = bus
                .read(&mut chunk)
                .await
                .map_err(|e| FlowError::communication(&self.id, format!("read failed: {e}")))?;
            if n == 0 {
                return Err(FlowError::communication(&self.id, "bus closed mid-reply"));
            }
            response.extend_from_slice(&chunk[..n]);
        };
        bus.set_stale(false);
        let frame = response.split_to(end);
        if !response.is_empty() {
            warn!(channel = %self.id, extra = response.len(), "discarding trailing bytes");
        }
        trace!(channel = %self.id, frame = ?String::from_utf8_lossy(&frame), "rx");

        self.codec
            .decode_reply(&frame)
            .map_err(|e| FlowError::communication(&self.id, e.0))
    }

    fn reject(&self, message: String) -> FlowError {
        FlowError::Rejected {
            channel: self.id.clone(),
            message,
        }
    }
}

#[async_trait]
impl HardwareChannel for BusChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn initialize(&self) -> FlowResult<()> {
        self.transaction(Directive::Initialize).await?;
        debug!(channel = %self.id, "initialized");
        Ok(())
    }

    async fn actuate(&self, target: TargetState) -> FlowResult<()> {
        let directive = match (self.kind, target) {
            (ChannelKind::Pump, TargetState::Rate(rate)) => {
                if !rate.is_finite() || rate < 0.0 {
                    return Err(self.reject(format!("invalid rate {rate}")));
                }
                Directive::SetRate(rate)
            }
            (ChannelKind::Valve, TargetState::Position(pos)) => Directive::MoveValve(pos),
            (kind, target) => {
                return Err(self.reject(format!("{kind} cannot take {target:?}")));
            }
        };
        self.transaction(directive).await?;
        debug!(channel = %self.id, ?target, "actuated");
        Ok(())
    }

    async fn query(&self) -> FlowResult<ObservedState> {
        let reply = self.transaction(Directive::Query).await?;
        let busy = matches!(reply.status, ReplyStatus::Ok { busy: true });
        let data = reply.data.trim();
        let mut observed = ObservedState {
            busy,
            ..ObservedState::default()
        };
        if !data.is_empty() {
            let bad = || FlowError::communication(&self.id, format!("unparseable status '{data}'"));
            match self.kind {
                ChannelKind::Pump => observed.rate = Some(data.parse().map_err(|_| bad())?),
                ChannelKind::Valve => observed.position = Some(data.parse().map_err(|_| bad())?),
            }
        }
        Ok(observed)
    }

    async fn stop(&self) -> FlowResult<()> {
        match self.transaction(Directive::Stop).await {
            Ok(_) => Ok(()),
            Err(err @ FlowError::HardwareFault { .. }) => Err(err),
            Err(err) => Err(FlowError::HardwareFault {
                channel: self.id.clone(),
                message: format!("stop failed: {err}"),
            }),
        }
    }
}
