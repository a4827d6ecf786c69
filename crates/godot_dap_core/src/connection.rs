use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::codec;
use crate::{DapError, Result};

/// One TCP stream to the debug adapter.
///
/// Writes are serialized behind a mutex so concurrent callers never
/// interleave bytes of two frames. Reads are only ever driven by the pump.
#[derive(Debug)]
pub struct Connection {
    address: String,
    writer: Mutex<OwnedWriteHalf>,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    closed: AtomicBool,
}

impl Connection {
    pub async fn connect(address: &str, connect_timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| DapError::timeout(format!("connection to {address}"), connect_timeout))?
            .map_err(|source| DapError::Connect {
                address: address.to_string(),
                source,
            })?;

        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed on {address}: {err}");
        }

        tracing::info!("Connected to DAP server at {address}");
        Ok(Self::from_stream(address, stream))
    }

    pub(crate) fn from_stream(address: &str, stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            address: address.to_string(),
            writer: Mutex::new(write_half),
            reader: Mutex::new(BufReader::new(read_half)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Writes one complete frame. The whole frame goes out under a single
    /// lock acquisition.
    pub async fn send(&self, frame: &[u8]) -> Result<()> {
        if !self.is_alive() {
            return Err(DapError::connection_lost("connection is closed"));
        }

        let mut writer = self.writer.lock().await;
        let written: std::io::Result<()> = async {
            writer.write_all(frame).await?;
            writer.flush().await
        }
        .await;

        written.map_err(|e| {
            DapError::connection_lost(format!("write to {} failed: {e}", self.address))
        })
    }

    /// Reads the next raw frame. Only the read pump calls this.
    pub(crate) async fn receive_frame(&self) -> Result<Vec<u8>> {
        let mut reader = self.reader.lock().await;
        codec::read_frame(&mut *reader).await
    }

    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Flips the connection to dead. True only for the first caller.
    pub(crate) fn mark_dead(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Idempotent. Returns true only for the call that actually closed.
    pub async fn close(&self) -> bool {
        if !self.mark_dead() {
            return false;
        }
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.shutdown().await {
            tracing::debug!("shutdown of {} failed: {err}", self.address);
        }
        tracing::info!("Closed DAP connection to {}", self.address);
        true
    }
}
