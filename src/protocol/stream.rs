//! Tor streams
//!
//! Opens TCP streams through a circuit with RELAY_BEGIN and exposes them
//! as byte streams (inherent async methods plus futures `AsyncRead` /
//! `AsyncWrite`). Stream-level SENDME accounting is done by the circuit
//! as cells arrive; the stream only ever sees DATA, END, CONNECTED and
//! RESOLVED.

use super::cell::{RelayCell, RelayCommand};
use super::circuit::{lock, Circuit, StreamSlot};
use crate::error::{end_reason_name, Result, TorError};
use futures::future::BoxFuture;
use futures::io::{AsyncRead, AsyncWrite};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// RELAY_END reason for a normal close
pub const END_REASON_DONE: u8 = 6;

/// RELAY_END reason assumed when the exit sends none
pub(crate) const END_REASON_MISC: u8 = 1;

/// State shared between a stream and its circuit's stream table
pub(crate) struct StreamShared {
    destination: String,
    closed: AtomicBool,
    end_reason: Mutex<Option<u8>>,
    failure: Mutex<Option<TorError>>,
    last_activity: Mutex<Instant>,
}

impl StreamShared {
    pub(crate) fn new(destination: &str) -> Self {
        Self {
            destination: destination.to_string(),
            closed: AtomicBool::new(false),
            end_reason: Mutex::new(None),
            failure: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    pub(crate) fn idle_time(&self) -> Duration {
        lock(&self.last_activity).elapsed()
    }

    /// The exit sent RELAY_END
    pub(crate) fn mark_ended(&self, reason: Option<u8>) {
        *lock(&self.end_reason) = Some(reason.unwrap_or(END_REASON_MISC));
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Closed locally or by the circuit; `failure` is reported to a reader
    /// that has not seen END
    pub(crate) fn mark_closed(&self, failure: Option<TorError>) {
        if let Some(err) = failure {
            lock(&self.failure).get_or_insert(err);
        }
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn failure(&self) -> Option<TorError> {
        lock(&self.failure).clone()
    }

    pub(crate) fn end_reason(&self) -> Option<u8> {
        *lock(&self.end_reason)
    }
}

/// A TCP stream carried by a circuit
pub struct TorStream {
    id: u16,
    circuit: Arc<Circuit>,
    rx: mpsc::Receiver<RelayCell>,
    shared: Arc<StreamShared>,
    recv_buffer: VecDeque<u8>,
    eof: bool,
    error: Option<TorError>,
    remote_address: Option<Ipv4Addr>,
    write_future: Option<BoxFuture<'static, Result<usize>>>,
    close_future: Option<BoxFuture<'static, ()>>,
}

impl TorStream {
    /// Open a stream to `host:port` through the circuit's last hop
    pub async fn open(circuit: &Arc<Circuit>, host: &str, port: u16) -> Result<TorStream> {
        let destination = format!("{}:{}", host, port);
        let slot = circuit.assign_stream_id(&destination)?;
        let mut stream = TorStream::from_slot(Arc::clone(circuit), slot);
        let started = Instant::now();

        log::info!("Opening stream {} to {} on circuit {}", stream.id, destination, circuit.id());
        let begin = RelayCell::new(
            RelayCommand::Begin,
            stream.id,
            format!("{}\0", destination).into_bytes(),
        );

        let connected = match circuit.send_relay(begin, None).await {
            Ok(()) => {
                let timeout = circuit.config().stream_build_timeout();
                match tokio::time::timeout(timeout, stream.next_control(RelayCommand::Connected))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(TorError::StreamBuildFailed {
                        reason: TorError::timeout("RELAY_CONNECTED", timeout).to_string(),
                    }),
                }
            }
            Err(e) => Err(TorError::StreamBuildFailed {
                reason: e.to_string(),
            }),
        };

        match connected {
            Ok(cell) => {
                if cell.data.len() >= 4 {
                    stream.remote_address =
                        Some(Ipv4Addr::new(cell.data[0], cell.data[1], cell.data[2], cell.data[3]));
                }
                let setup = started.elapsed();
                circuit.record_stream_success(&destination, setup);
                log::info!(
                    "Stream {} to {} built within {} ms",
                    stream.id,
                    destination,
                    setup.as_millis()
                );
                Ok(stream)
            }
            Err(e) => {
                log::warn!("Stream {} to {} failed: {}", stream.id, destination, e);
                stream.abandon();
                circuit.report_stream_failure().await;
                Err(e)
            }
        }
    }

    fn from_slot(circuit: Arc<Circuit>, slot: StreamSlot) -> Self {
        Self {
            id: slot.id,
            circuit,
            rx: slot.rx,
            shared: slot.shared,
            recv_buffer: VecDeque::new(),
            eof: false,
            error: None,
            remote_address: None,
            write_future: None,
            close_future: None,
        }
    }

    /// Wait for the first `expected` cell, buffering any early DATA
    async fn next_control(&mut self, expected: RelayCommand) -> Result<RelayCell> {
        loop {
            let Some(cell) = self.rx.recv().await else {
                return Err(self.shared.failure().unwrap_or(TorError::StreamClosed));
            };
            match cell.command {
                command if command == expected => return Ok(cell),
                RelayCommand::End => {
                    let reason = cell.data.first().copied().unwrap_or(END_REASON_MISC);
                    return Err(TorError::StreamBuildFailed {
                        reason: format!(
                            "exit sent END: {} ({})",
                            reason,
                            end_reason_name(reason)
                        ),
                    });
                }
                RelayCommand::Data => self.recv_buffer.extend(cell.data),
                other => {
                    log::debug!("Stream {} ignoring {:?} while waiting for {:?}", self.id, other, expected)
                }
            }
        }
    }

    pub fn stream_id(&self) -> u16 {
        self.id
    }

    pub fn circuit(&self) -> &Arc<Circuit> {
        &self.circuit
    }

    pub fn destination(&self) -> &str {
        &self.shared.destination
    }

    /// Address the exit reported in RELAY_CONNECTED
    pub fn remote_address(&self) -> Option<Ipv4Addr> {
        self.remote_address
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// RELAY_END reason sent by the exit, if any
    pub fn end_reason(&self) -> Option<u8> {
        self.shared.end_reason()
    }

    /// Time since a cell for this stream was last seen
    pub fn cell_idle_time(&self) -> Duration {
        self.shared.idle_time()
    }

    /// Send `data` as DATA cells of at most 498 bytes
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.shared.is_closed() {
            return Err(TorError::StreamClosed);
        }

        for chunk in data.chunks(RelayCell::MAX_DATA_SIZE) {
            send_data(Arc::clone(&self.circuit), self.id, chunk.to_vec()).await?;
        }
        Ok(())
    }

    /// Read into `buf`; `Ok(0)` is end of stream
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        futures::future::poll_fn(|cx| self.poll_read_inner(cx, buf)).await
    }

    /// Like [`read`](Self::read) but gives up after `timeout`
    pub async fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        tokio::time::timeout(timeout, self.read(buf))
            .await
            .map_err(|_| TorError::timeout("stream data", timeout))?
    }

    /// Read until end of stream
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let mut buf = [0u8; RelayCell::MAX_DATA_SIZE];
        let mut total = 0;
        loop {
            match self.read(&mut buf).await? {
                0 => return Ok(total),
                n => {
                    out.extend_from_slice(&buf[..n]);
                    total += n;
                }
            }
        }
    }

    fn poll_read_inner(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<Result<usize>> {
        loop {
            if !self.recv_buffer.is_empty() {
                let len = self.recv_buffer.len().min(buf.len());
                for (slot, byte) in buf.iter_mut().zip(self.recv_buffer.drain(..len)) {
                    *slot = byte;
                }
                return Poll::Ready(Ok(len));
            }
            if let Some(err) = &self.error {
                return Poll::Ready(Err(err.clone()));
            }
            if self.eof {
                return Poll::Ready(Ok(0));
            }

            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(cell)) => self.absorb(cell),
                Poll::Ready(None) => match self.shared.failure() {
                    Some(err) => self.error = Some(err),
                    None => self.eof = true,
                },
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn absorb(&mut self, cell: RelayCell) {
        match cell.command {
            RelayCommand::Data => self.recv_buffer.extend(cell.data),
            RelayCommand::End => {
                let reason = cell.data.first().copied().unwrap_or(END_REASON_MISC);
                if reason == END_REASON_DONE {
                    log::debug!("Stream {} finished", self.id);
                    self.eof = true;
                } else {
                    log::info!("Stream {} ended by exit: {}", self.id, end_reason_name(reason));
                    self.error = Some(TorError::stream_ended(reason));
                }
            }
            other => log::debug!("Stream {} ignoring {:?}", self.id, other),
        }
    }

    /// RELAY_DROP keepalive to the exit
    pub async fn send_keepalive(&self) -> Result<()> {
        let cell = RelayCell::new(RelayCommand::Drop, self.id, Vec::new());
        self.circuit.send_relay(cell, None).await
    }

    /// Close the stream. Unless forced or already closed by the exit,
    /// RELAY_END (DONE) is sent first.
    pub async fn close(&mut self, force: bool) {
        if !(self.shared.is_closed() || force) {
            let end = RelayCell::new(RelayCommand::End, self.id, vec![END_REASON_DONE]);
            if let Err(e) = self.circuit.send_relay(end, None).await {
                log::debug!("Stream {} END not sent: {}", self.id, e);
            }
        }
        self.abandon();
    }

    /// Mark closed and leave the circuit's stream table without telling the exit
    fn abandon(&mut self) {
        self.shared.mark_closed(None);
        self.circuit.deregister_stream(self.id);
        self.eof = true;
    }
}

async fn send_data(circuit: Arc<Circuit>, stream_id: u16, chunk: Vec<u8>) -> Result<usize> {
    let len = chunk.len();
    let cell = RelayCell::new(RelayCommand::Data, stream_id, chunk);
    if let Err(e) = circuit.send_relay(cell, None).await {
        circuit.report_stream_failure().await;
        return Err(e);
    }
    circuit.note_data_sent(stream_id);
    Ok(len)
}

impl fmt::Display for TorStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on circuit {} to {}",
            self.id,
            self.circuit.id(),
            self.shared.destination
        )?;
        if self.is_closed() {
            write!(f, " (closed)")?;
        }
        Ok(())
    }
}

impl fmt::Debug for TorStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TorStream")
            .field("id", &self.id)
            .field("circuit", &self.circuit.id())
            .field("destination", &self.shared.destination)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for TorStream {
    fn drop(&mut self) {
        if !self.shared.is_closed() {
            log::warn!("Stream {} dropped without being closed", self.id);
            self.shared.mark_closed(None);
            self.circuit.deregister_stream(self.id);
        }
    }
}

/// AsyncRead implementation for TorStream
impl AsyncRead for TorStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_read_inner(cx, buf).map_err(io::Error::from)
    }
}

/// AsyncWrite implementation for TorStream
///
/// Each `poll_write` sends at most one DATA cell. A write that returned
/// `Pending` is completed on the next poll regardless of the buffer passed.
impl AsyncWrite for TorStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.write_future.is_none() {
            if self.shared.is_closed() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "Stream is closed",
                )));
            }
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            let len = buf.len().min(RelayCell::MAX_DATA_SIZE);
            let fut = send_data(Arc::clone(&self.circuit), self.id, buf[..len].to_vec());
            self.write_future = Some(Box::pin(fut));
        }

        let Some(fut) = self.write_future.as_mut() else {
            return Poll::Ready(Ok(0));
        };
        match fut.as_mut().poll(cx) {
            Poll::Ready(result) => {
                self.write_future = None;
                Poll::Ready(result.map_err(io::Error::from))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Some(fut) = self.write_future.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        match fut.as_mut().poll(cx) {
            Poll::Ready(result) => {
                self.write_future = None;
                Poll::Ready(result.map(|_| ()).map_err(io::Error::from))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Poll::Pending = self.as_mut().poll_flush(cx)? {
            return Poll::Pending;
        }

        if self.close_future.is_none() {
            if self.shared.is_closed() {
                return Poll::Ready(Ok(()));
            }
            let circuit = Arc::clone(&self.circuit);
            let id = self.id;
            self.close_future = Some(Box::pin(async move {
                let end = RelayCell::new(RelayCommand::End, id, vec![END_REASON_DONE]);
                if let Err(e) = circuit.send_relay(end, None).await {
                    log::debug!("Stream {} END not sent: {}", id, e);
                }
            }));
        }

        let Some(fut) = self.close_future.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        match fut.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.close_future = None;
                self.abandon();
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// One answer from RELAY_RESOLVED
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAnswer {
    /// Answer to a reverse lookup
    Hostname(String),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
}

/// Parse the first answer of a RELAY_RESOLVED payload
pub fn parse_resolved(data: &[u8]) -> Result<ResolvedAnswer> {
    if data.len() < 2 {
        return Err(TorError::Resolve("Empty RELAY_RESOLVED".into()));
    }
    let (kind, len) = (data[0], data[1] as usize);
    let value = data
        .get(2..2 + len)
        .ok_or_else(|| TorError::Resolve(format!("Answer of {} bytes is truncated", len)))?;

    match (kind, len) {
        (0x00, _) => Ok(ResolvedAnswer::Hostname(
            String::from_utf8_lossy(value).into_owned(),
        )),
        (0x04, 4) => Ok(ResolvedAnswer::Ipv4(Ipv4Addr::new(
            value[0], value[1], value[2], value[3],
        ))),
        (0x06, 16) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(value);
            Ok(ResolvedAnswer::Ipv6(Ipv6Addr::from(octets)))
        }
        (0xf0, _) => Err(TorError::Resolve(format!(
            "transient error: {}",
            String::from_utf8_lossy(value)
        ))),
        (0xf1, _) => Err(TorError::Resolve(format!(
            "non transient error: {}",
            String::from_utf8_lossy(value)
        ))),
        (kind, len) => Err(TorError::Resolve(format!(
            "can't handle answers of type {} (length {})",
            kind, len
        ))),
    }
}

/// Resolve `hostname` at the exit on a short-lived stream id
pub(crate) async fn resolve(circuit: &Arc<Circuit>, hostname: &str) -> Result<ResolvedAnswer> {
    let slot = circuit.assign_stream_id(hostname)?;
    let mut stream = TorStream::from_slot(Arc::clone(circuit), slot);
    circuit.remember_destination(hostname);
    log::debug!("Resolving {} on stream {}", hostname, stream.id);

    let mut query = hostname.as_bytes().to_vec();
    query.push(0);
    let sent = circuit
        .send_relay(RelayCell::new(RelayCommand::Resolve, stream.id, query), None)
        .await;

    let answer = match sent {
        Ok(()) => {
            let timeout = circuit.config().resolve_timeout();
            match tokio::time::timeout(timeout, stream.next_control(RelayCommand::Resolved)).await {
                Ok(Ok(cell)) => parse_resolved(&cell.data),
                Ok(Err(e)) => Err(TorError::Resolve(e.to_string())),
                Err(_) => Err(TorError::timeout("RELAY_RESOLVED", timeout)),
            }
        }
        Err(e) => Err(e),
    };

    stream.abandon();
    answer
}
