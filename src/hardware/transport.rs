//! Byte transports and the connectors that open them.
//!
//! A transport is a half-duplex byte pipe to one hardware bus. Pumps and
//! valves on the same bus share it through [`SharedTransport`]; the mutex is
//! held for the whole request/response exchange so frames never interleave.
//!
//! An exchange abandoned mid-reply (a timeout, a cancelled command) leaves
//! the bus stale: the device may still answer. The next exchange drains the
//! line before writing so that late reply is never read as its own.

use crate::error::{FlowError, FlowResult};
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Bytes a single drain may discard before giving up on a chattering line.
const DRAIN_LIMIT: usize = 4096;

#[async_trait]
pub trait Transport: Send {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read whatever is available. `Ok(0)` means the peer closed.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A bus transport plus what the last exchange left behind on it.
pub struct BusLink {
    transport: Box<dyn Transport>,
    stale: bool,
}

impl BusLink {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            stale: false,
        }
    }

    pub async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.transport.write(bytes).await
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.transport.read(buf).await
    }

    pub async fn close(&mut self) -> io::Result<()> {
        self.transport.close().await
    }

    /// True while an exchange is open or was abandoned before its reply.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn set_stale(&mut self, stale: bool) {
        self.stale = stale;
    }

    /// Discard input until the line stays quiet for `quiet`. Returns the
    /// number of bytes dropped.
    pub async fn drain(&mut self, quiet: Duration) -> io::Result<usize> {
        let mut dropped = 0;
        let mut chunk = [0u8; 64];
        while dropped < DRAIN_LIMIT {
            match tokio::time::timeout(quiet, self.transport.read(&mut chunk)).await {
                Err(_) | Ok(Ok(0)) => break,
                Ok(Ok(n)) => dropped += n,
                Ok(Err(e)) => return Err(e),
            }
        }
        self.stale = false;
        Ok(dropped)
    }
}

/// One bus, shared by every channel addressed on it.
pub type SharedTransport = Arc<Mutex<BusLink>>;

pub fn shared(transport: Box<dyn Transport>) -> SharedTransport {
    Arc::new(Mutex::new(BusLink::new(transport)))
}

/// Any tokio byte stream can act as a transport.
pub struct StreamTransport<S> {
    stream: S,
}

impl<S> StreamTransport<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

/// Opens the transport for a configured port.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, port: &str, baud_rate: u32) -> FlowResult<Box<dyn Transport>>;
}

/// Serial connector (8N1, no flow control).
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialConnector;

#[cfg(feature = "tokio_serial")]
#[async_trait]
impl Connector for SerialConnector {
    async fn connect(&self, port: &str, baud_rate: u32) -> FlowResult<Box<dyn Transport>> {
        use tokio_serial::SerialPortBuilderExt;

        let stream = tokio_serial::new(port, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| FlowError::Connection(format!("failed to open serial port {port}: {e}")))?;
        Ok(Box::new(StreamTransport::new(stream)))
    }
}

#[cfg(not(feature = "tokio_serial"))]
#[async_trait]
impl Connector for SerialConnector {
    async fn connect(&self, port: &str, _baud_rate: u32) -> FlowResult<Box<dyn Transport>> {
        Err(FlowError::Connection(format!(
            "cannot open {port}: serial support not enabled, rebuild with --features tokio_serial"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_transport_over_duplex() {
        let (host, mut device) = tokio::io::duplex(64);
        let mut transport = StreamTransport::new(host);

        transport.write(b"/1QR\r").await.unwrap();
        let mut buf = [0u8; 16];
        let n = device.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"/1QR\r");

        device.write_all(b"/0`\x03").await.unwrap();
        let n = transport.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"/0`\x03");
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_discards_late_bytes() {
        let (host, mut device) = tokio::io::duplex(64);
        let mut link = BusLink::new(Box::new(StreamTransport::new(host)));
        link.set_stale(true);

        device.write_all(b"/0`\x03\r\n").await.unwrap();
        let dropped = link.drain(Duration::from_millis(50)).await.unwrap();
        assert_eq!(dropped, 6);
        assert!(!link.is_stale());

        // Quiet line: nothing to drop.
        assert_eq!(link.drain(Duration::from_millis(50)).await.unwrap(), 0);
    }

    #[cfg(not(feature = "tokio_serial"))]
    #[tokio::test]
    async fn test_serial_connector_requires_feature() {
        let err = SerialConnector.connect("/dev/ttyUSB0", 9600).await.err().unwrap();
        assert!(matches!(err, FlowError::Connection(_)));
    }
}
