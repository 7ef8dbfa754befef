//! Raw frame output towards the TUN device

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Accepts complete IPv4 frames for transmission to the client side.
///
/// Each call writes exactly one frame. Implementations serialize concurrent
/// callers so frames are never interleaved.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Write one frame, returning the number of bytes accepted
    async fn write_frame(&self, frame: &[u8]) -> io::Result<usize>;
}

/// [`FrameSink`] over the write half of a TUN device
#[derive(Debug)]
pub struct DeviceWriter<W> {
    writer: Mutex<W>,
}

impl<W> DeviceWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> FrameSink for DeviceWriter<W> {
    async fn write_frame(&self, frame: &[u8]) -> io::Result<usize> {
        let mut writer = self.writer.lock().await;
        // TUN devices take one packet per write call
        let n = writer.write(frame).await?;
        writer.flush().await?;
        Ok(n)
    }
}
