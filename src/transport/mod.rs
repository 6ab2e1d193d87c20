//! Transport layer for Tor connections
//!
//! The link to the first relay (TLS, sockets, proxies) is owned by the
//! embedding application. This module defines the outbound seam the
//! connection writes whole cells into, plus two adapters.

use crate::error::{Result, TorError};
use async_trait::async_trait;
use futures::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

/// Outbound half of a link to a relay
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one serialized 512-byte cell
    async fn write_cell(&self, cell: &[u8]) -> Result<()>;

    /// Shut the link down; further writes fail
    async fn close(&self) -> Result<()>;
}

/// Adapter over any futures `AsyncWrite` (a TLS stream, a socket half)
pub struct AsyncWriteTransport<W> {
    writer: Mutex<Option<W>>,
}

impl<W> AsyncWriteTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
        }
    }
}

#[async_trait]
impl<W> Transport for AsyncWriteTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_cell(&self, cell: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| TorError::Transport("Link already closed".into()))?;

        writer
            .write_all(cell)
            .await
            .map_err(|e| TorError::Transport(format!("Failed to send cell: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| TorError::Transport(format!("Failed to flush: {}", e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.close().await?;
        }
        Ok(())
    }
}

/// Adapter that hands every outbound cell to a channel, for links whose
/// socket is driven by another task
pub struct ChannelTransport {
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl ChannelTransport {
    /// Create the transport and the receiver the socket task drains
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn write_cell(&self, cell: &[u8]) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .await
            .clone()
            .ok_or_else(|| TorError::Transport("Link already closed".into()))?;
        tx.send(cell.to_vec())
            .await
            .map_err(|_| TorError::Transport("Link receiver dropped".into()))
    }

    async fn close(&self) -> Result<()> {
        self.tx.lock().await.take();
        Ok(())
    }
}
