//! Circuit state machine
//!
//! A circuit is an ordered list of hops sharing one link. It is extended
//! one hop at a time, layers every outbound relay cell for its target hop,
//! peels inbound relay cells until a hop recognizes them, and multiplexes
//! streams by id.
//!
//! ```text
//! Building(n) --extend--> Building(n+1) --all hops--> Established
//! Established --close(false)--> Closing --streams drained--> Destructed
//! any --close(true) / DESTROY--> Destructed
//! ```
//!
//! Hop state sits behind a synchronous mutex that is never held across an
//! await. Outbound relay cells are digested, encrypted and written under
//! one async send lock so wire order always matches keystream order.

use crate::config::CircuitConfig;
use crate::error::{destroy_reason_name, Result, TorError};
use crate::protocol::cell::{
    Cell, CellCommand, FixedCell, RelayCell, RelayCommand, RelayDecrypt, DIGEST_RANGE,
    PAYLOAD_SIZE, RECOGNIZED_RANGE,
};
use crate::protocol::flow_control::{FlowWindow, WindowAction};
use crate::protocol::hop::{create_onion_skin, HopCrypto};
use crate::protocol::relay::ServerDescriptor;
use crate::protocol::stream::{ResolvedAnswer, StreamShared, END_REASON_MISC};
use crate::transport::Transport;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::Instant;

/// DESTROY reason sent when we tear a circuit down ourselves
const DESTROY_REASON_REQUESTED: u8 = 3;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handshake replies and teardown notices routed to a building circuit
#[derive(Debug)]
enum ControlMessage {
    Created(Vec<u8>),
    Extended(Vec<u8>),
    Destroyed(u8),
    Truncated(u8),
}

impl ControlMessage {
    fn name(&self) -> &'static str {
        match self {
            ControlMessage::Created(_) => "CREATED",
            ControlMessage::Extended(_) => "RELAY_EXTENDED",
            ControlMessage::Destroyed(_) => "DESTROY",
            ControlMessage::Truncated(_) => "RELAY_TRUNCATED",
        }
    }
}

/// Lifecycle of a circuit as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    /// `n` hops established so far
    Building(usize),
    Established,
    /// No new streams; waiting for existing ones to finish
    Closing,
    Destructed,
}

/// What a stream needs from the circuit after registering
pub(crate) struct StreamSlot {
    pub id: u16,
    pub rx: mpsc::Receiver<RelayCell>,
    pub shared: Arc<StreamShared>,
}

struct StreamEntry {
    tx: mpsc::Sender<RelayCell>,
    shared: Arc<StreamShared>,
    window: FlowWindow,
}

struct CircuitState {
    established: bool,
    closed: bool,
    destruct: bool,
    streams: HashMap<u16, StreamEntry>,
    /// Streams successfully opened over the lifetime of the circuit
    stream_counter: u32,
    stream_fails: u32,
    setup_duration: Duration,
    sum_stream_setup: Duration,
    ranking: f64,
    window: FlowWindow,
    stream_history: HashSet<String>,
    last_cell: Instant,
    last_action: Instant,
}

/// A multi-hop circuit over one link
pub struct Circuit {
    id: u16,
    config: CircuitConfig,
    transport: Arc<dyn Transport>,
    hops: Mutex<Vec<HopCrypto>>,
    state: Mutex<CircuitState>,
    send_lock: AsyncMutex<()>,
    control_tx: mpsc::Sender<ControlMessage>,
    control_rx: AsyncMutex<mpsc::Receiver<ControlMessage>>,
    created_at: Instant,
}

impl Circuit {
    /// Create an empty circuit; the caller registers it with the link
    /// before extending so handshake replies can be routed to it.
    pub fn new(id: u16, transport: Arc<dyn Transport>, config: CircuitConfig) -> Arc<Self> {
        let (control_tx, control_rx) = mpsc::channel(config.control_queue_capacity.max(1));
        let now = Instant::now();
        Arc::new(Self {
            id,
            transport,
            hops: Mutex::new(Vec::new()),
            state: Mutex::new(CircuitState {
                established: false,
                closed: false,
                destruct: false,
                streams: HashMap::new(),
                stream_counter: 0,
                stream_fails: 0,
                setup_duration: Duration::ZERO,
                sum_stream_setup: Duration::ZERO,
                ranking: -1.0,
                window: FlowWindow::circuit(&config),
                stream_history: HashSet::new(),
                last_cell: now,
                last_action: now,
            }),
            send_lock: AsyncMutex::new(()),
            control_tx,
            control_rx: AsyncMutex::new(control_rx),
            created_at: now,
            config,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Number of hops whose keys are established
    pub fn route_established(&self) -> usize {
        lock(&self.hops).len()
    }

    /// Established hops, entry first
    pub fn route(&self) -> Vec<ServerDescriptor> {
        lock(&self.hops).iter().map(|h| h.server().clone()).collect()
    }

    pub fn is_established(&self) -> bool {
        lock(&self.state).established
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn is_destructed(&self) -> bool {
        lock(&self.state).destruct
    }

    pub fn status(&self) -> CircuitStatus {
        let state = lock(&self.state);
        if state.destruct {
            CircuitStatus::Destructed
        } else if state.closed {
            CircuitStatus::Closing
        } else if state.established {
            CircuitStatus::Established
        } else {
            CircuitStatus::Building(self.route_established())
        }
    }

    /// Lower is better; -1 until the circuit is built
    pub fn ranking(&self) -> f64 {
        lock(&self.state).ranking
    }

    pub fn stream_counter(&self) -> u32 {
        lock(&self.state).stream_counter
    }

    pub fn stream_fails(&self) -> u32 {
        lock(&self.state).stream_fails
    }

    pub fn setup_duration(&self) -> Duration {
        lock(&self.state).setup_duration
    }

    /// Ids of streams currently registered
    pub fn stream_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = lock(&self.state).streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Whether a stream to `destination` was opened on this circuit before
    pub fn has_used(&self, destination: &str) -> bool {
        lock(&self.state).stream_history.contains(destination)
    }

    /// Built, open and carrying no streams
    pub fn is_idle(&self) -> bool {
        let state = lock(&self.state);
        state.established && !state.closed && state.streams.is_empty()
    }

    /// Time since the last cell was received or sent on this circuit
    pub fn last_activity_age(&self) -> Duration {
        let state = lock(&self.state);
        state.last_cell.max(state.last_action).elapsed()
    }

    /// Time since the last cell was received
    pub fn cell_idle_time(&self) -> Duration {
        lock(&self.state).last_cell.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    // ===== Building =====

    /// Extend through every server in `route`, entry first
    pub async fn build(&self, route: &[ServerDescriptor]) -> Result<()> {
        if route.is_empty() {
            return Err(TorError::InvalidState("Cannot build an empty route".into()));
        }

        log::info!("🔨 Building circuit {} with {} hops", self.id, route.len());
        let started = Instant::now();
        for server in route {
            log::debug!("  Circuit {} extending to {}", self.id, server);
            self.extend_one_hop(server).await?;
        }

        let setup = started.elapsed();
        {
            let mut state = lock(&self.state);
            state.setup_duration = setup;
            state.established = true;
            Self::update_ranking(&mut state, &self.config);
        }
        log::info!("✅ Circuit {} established within {} ms", self, setup.as_millis());
        Ok(())
    }

    /// Run one handshake with `server` and append it to the route
    pub async fn extend_one_hop(&self, server: &ServerDescriptor) -> Result<()> {
        if self.is_destructed() {
            return Err(TorError::CircuitClosed(format!("Circuit {} is gone", self.id)));
        }

        let hop_index = self.route_established();
        let (dh, onion_skin) = {
            let mut rng = rand::thread_rng();
            create_onion_skin(&mut rng, server)?
        };

        let reply = if hop_index == 0 {
            log::info!("  📤 CREATE to {} on circuit {}", server.nickname, self.id);
            let cell = FixedCell::new(self.id, CellCommand::Create, &onion_skin)?;
            self.send_control(&cell).await?;
            match self.await_control("CREATED").await? {
                ControlMessage::Created(payload) => payload,
                other => return Err(unexpected("CREATED", &other)),
            }
        } else {
            log::info!(
                "  📤 EXTEND to {} through {} hop(s) on circuit {}",
                server.nickname,
                hop_index,
                self.id
            );
            let mut data = Vec::with_capacity(4 + 2 + onion_skin.len() + 20);
            data.extend_from_slice(&server.address.octets());
            data.extend_from_slice(&server.or_port.to_be_bytes());
            data.extend_from_slice(&onion_skin);
            data.extend_from_slice(&server.fingerprint);
            self.send_relay(RelayCell::new(RelayCommand::Extend, 0, data), None)
                .await?;
            match self.await_control("RELAY_EXTENDED").await? {
                ControlMessage::Extended(payload) => payload,
                other => return Err(unexpected("RELAY_EXTENDED", &other)),
            }
        };

        let hop = HopCrypto::new(server.clone(), &reply, &dh)?;
        lock(&self.hops).push(hop);
        log::info!("  ✓ Hop {} ({}) established", hop_index, server.nickname);
        Ok(())
    }

    async fn await_control(&self, expected: &'static str) -> Result<ControlMessage> {
        let timeout = self.config.circuit_timeout();
        let mut rx = self.control_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Err(_) => {
                log::warn!("Circuit {} timed out waiting for {}", self.id, expected);
                Err(TorError::timeout(expected, timeout))
            }
            Ok(None) => Err(TorError::CircuitClosed(format!(
                "Circuit {} control queue closed",
                self.id
            ))),
            Ok(Some(ControlMessage::Destroyed(reason))) => Err(TorError::circuit_destroyed(reason)),
            Ok(Some(ControlMessage::Truncated(reason))) => Err(TorError::CircuitClosed(format!(
                "Circuit {} truncated: {}",
                self.id,
                destroy_reason_name(reason)
            ))),
            Ok(Some(message)) => Ok(message),
        }
    }

    // ===== Sending =====

    /// Write a non-relay cell on this circuit
    pub(crate) async fn send_control(&self, cell: &FixedCell) -> Result<()> {
        let _guard = self.send_lock.lock().await;
        self.transport.write_cell(&cell.to_bytes()).await?;
        self.touch_action();
        Ok(())
    }

    /// Layer and send a relay cell.
    ///
    /// `addressed_hop` selects the hop that must recognize the cell;
    /// the default is the last established hop.
    pub async fn send_relay(&self, cell: RelayCell, addressed_hop: Option<usize>) -> Result<()> {
        if self.is_destructed() {
            return Err(TorError::CircuitClosed(format!("Circuit {} is gone", self.id)));
        }

        let mut payload = cell.encode_payload()?;
        payload[RECOGNIZED_RANGE].fill(0);
        payload[DIGEST_RANGE].fill(0);

        let _guard = self.send_lock.lock().await;
        {
            let mut hops = lock(&self.hops);
            let established = hops.len();
            let target = match addressed_hop {
                Some(hop) if hop < established => hop,
                Some(hop) => {
                    return Err(TorError::InvalidState(format!(
                        "Hop {} addressed but only {} established",
                        hop, established
                    )))
                }
                None if established > 0 => established - 1,
                None => {
                    return Err(TorError::InvalidState(
                        "Relay cell on a circuit without established hops".into(),
                    ))
                }
            };

            let digest = hops[target].forward_digest(&payload);
            payload[DIGEST_RANGE].copy_from_slice(&digest);
            for hop in hops[..=target].iter_mut().rev() {
                hop.encrypt_through_this_hop(&mut payload);
            }
            log::trace!(
                "Circuit {} {:?} stream {} -> hop {} digest {:02x?}",
                self.id,
                cell.command,
                cell.stream_id,
                target,
                digest
            );
        }

        let fixed = FixedCell {
            circuit_id: self.id,
            command: CellCommand::Relay,
            payload,
        };
        if let Err(e) = self.transport.write_cell(&fixed.to_bytes()).await {
            // Keystreams already advanced; the circuit cannot continue.
            log::warn!("Circuit {} lost a relay cell: {}", self.id, e);
            self.hard_close(None);
            return Err(e);
        }
        self.touch_action();
        Ok(())
    }

    /// PADDING keepalive towards the entry hop
    pub async fn send_keepalive(&self) -> Result<()> {
        self.send_control(&FixedCell::padding(self.id)).await
    }

    // ===== Receiving =====

    /// Route a decoded inbound cell
    pub async fn deliver(&self, cell: Cell) {
        lock(&self.state).last_cell = Instant::now();

        match cell {
            Cell::Control(fixed) => self.deliver_control(fixed),
            Cell::Relay { hop, cell, .. } => self.deliver_relay(hop, cell).await,
        }
    }

    fn deliver_control(&self, fixed: FixedCell) {
        match fixed.command {
            CellCommand::Created | CellCommand::CreatedFast => {
                self.push_control(ControlMessage::Created(fixed.payload.to_vec()));
            }
            CellCommand::Destroy => {
                let reason = fixed.payload[0];
                log::info!(
                    "💥 Circuit {} destroyed by relay: {} ({})",
                    self.id,
                    reason,
                    destroy_reason_name(reason)
                );
                self.push_control(ControlMessage::Destroyed(reason));
                self.hard_close(Some(TorError::circuit_destroyed(reason)));
            }
            CellCommand::Padding => {}
            other => {
                log::warn!("Circuit {} ignoring unexpected {:?} cell", self.id, other);
            }
        }
    }

    async fn deliver_relay(&self, hop: usize, cell: RelayCell) {
        // Every recognized relay cell moves the circuit window.
        self.account_circuit_window().await;

        if cell.stream_id == 0 {
            self.deliver_circuit_relay(hop, cell).await;
            return;
        }

        // Stream-level bookkeeping happens here; the stream only sees
        // DATA, END, CONNECTED and RESOLVED.
        let stream_id = cell.stream_id;
        let (tx, window_action) = {
            let mut state = lock(&self.state);
            let Some(entry) = state.streams.get_mut(&stream_id) else {
                log::debug!(
                    "Circuit {} dropping {:?} for unknown stream {}",
                    self.id,
                    cell.command,
                    stream_id
                );
                return;
            };
            entry.shared.touch();
            match cell.command {
                RelayCommand::Sendme => {
                    entry.window.on_sendme_received();
                    return;
                }
                RelayCommand::Drop => return,
                RelayCommand::Data => (entry.tx.clone(), entry.window.on_cell()),
                RelayCommand::End => {
                    let reason = cell.data.first().copied();
                    entry.shared.mark_ended(reason);
                    (entry.tx.clone(), WindowAction::None)
                }
                _ => (entry.tx.clone(), WindowAction::None),
            }
        };

        if window_action == WindowAction::SendSendme {
            self.send_stream_sendme(stream_id).await;
        }

        // Never wait on a stream queue here: this runs on the link reader.
        let ended = cell.command == RelayCommand::End;
        match tx.try_send(cell) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => {
                log::debug!("Stream {} reader already gone", stream_id);
            }
            Err(TrySendError::Full(_)) if ended => {
                log::warn!("Stream {} queue full, END not queued", stream_id);
            }
            Err(TrySendError::Full(_)) => {
                self.close_overrun_stream(stream_id).await;
                return;
            }
        }
        if ended {
            self.deregister_stream(stream_id);
        }
    }

    /// The reader fell too far behind: fail the stream and tell the exit
    async fn close_overrun_stream(&self, stream_id: u16) {
        let capacity = self.config.stream_queue_capacity.max(1);
        log::warn!(
            "Circuit {} stream {} inbound queue full ({} cells), closing it",
            self.id,
            stream_id,
            capacity
        );
        let removed = lock(&self.state).streams.remove(&stream_id);
        if let Some(entry) = removed {
            entry
                .shared
                .mark_closed(Some(TorError::StreamOverrun { capacity }));
        }

        let end = RelayCell::new(RelayCommand::End, stream_id, vec![END_REASON_MISC]);
        if let Err(e) = self.send_relay(end, None).await {
            log::debug!("Stream {} END not sent: {}", stream_id, e);
        }
    }

    async fn deliver_circuit_relay(&self, hop: usize, cell: RelayCell) {
        match cell.command {
            RelayCommand::Extended => {
                self.push_control(ControlMessage::Extended(cell.data));
            }
            RelayCommand::Truncated => {
                let reason = cell.data.first().copied().unwrap_or(0);
                log::warn!(
                    "Circuit {} truncated at hop {}: {}",
                    self.id,
                    hop,
                    destroy_reason_name(reason)
                );
                self.push_control(ControlMessage::Truncated(reason));
                self.close(false).await;
            }
            RelayCommand::Sendme => {
                lock(&self.state).window.on_sendme_received();
            }
            RelayCommand::Drop => {}
            other => {
                log::debug!(
                    "Circuit {} ignoring circuit-level {:?} from hop {}",
                    self.id,
                    other,
                    hop
                );
            }
        }
    }

    fn push_control(&self, message: ControlMessage) {
        if let Err(e) = self.control_tx.try_send(message) {
            log::warn!("Circuit {} control queue rejected a cell: {}", self.id, e);
        }
    }

    /// One SENDME per established hop, each addressed to that hop
    async fn account_circuit_window(&self) {
        if lock(&self.state).window.on_cell() != WindowAction::SendSendme {
            return;
        }

        let hops = self.route_established();
        log::debug!("Circuit {} window low, sending {} SENDME(s)", self.id, hops);
        for hop in 0..hops {
            let sendme = RelayCell::new(RelayCommand::Sendme, 0, Vec::new());
            if let Err(e) = self.send_relay(sendme, Some(hop)).await {
                log::warn!("Circuit {} error sending SENDME to hop {}: {}", self.id, hop, e);
                return;
            }
        }
        lock(&self.state).window.credit();
    }

    async fn send_stream_sendme(&self, stream_id: u16) {
        log::debug!("Stream {} window low, sending SENDME", stream_id);
        let sendme = RelayCell::new(RelayCommand::Sendme, stream_id, Vec::new());
        match self.send_relay(sendme, None).await {
            Ok(()) => {
                if let Some(entry) = lock(&self.state).streams.get_mut(&stream_id) {
                    entry.window.credit();
                }
            }
            Err(e) => log::warn!("Stream {} error sending SENDME: {}", stream_id, e),
        }
    }

    // ===== Streams =====

    /// Reserve a free stream id other than zero and register the stream.
    ///
    /// The scan starts at an offset that rotates with the number of streams
    /// opened so far, so ids are not reused immediately.
    pub(crate) fn assign_stream_id(&self, destination: &str) -> Result<StreamSlot> {
        let mut state = lock(&self.state);
        if state.closed || state.destruct {
            return Err(TorError::CircuitClosed(format!(
                "Circuit {} accepts no new streams",
                self.id
            )));
        }

        let offset = state.stream_counter;
        let id = (1u32..0x10000)
            .map(|nr| (nr.wrapping_add(offset) & 0xffff) as u16)
            .find(|id| *id != 0 && !state.streams.contains_key(id))
            .ok_or(TorError::NoFreeStreamIds)?;

        let (tx, rx) = mpsc::channel(self.config.stream_queue_capacity.max(1));
        let shared = Arc::new(StreamShared::new(destination));
        state.streams.insert(
            id,
            StreamEntry {
                tx,
                shared: Arc::clone(&shared),
                window: FlowWindow::stream(&self.config),
            },
        );
        state.last_action = Instant::now();
        log::debug!("Circuit {} assigned stream id {} for {}", self.id, id, destination);
        Ok(StreamSlot { id, rx, shared })
    }

    /// Forget a stream; dropping its sender releases a blocked reader
    pub(crate) fn deregister_stream(&self, stream_id: u16) {
        let removed = lock(&self.state).streams.remove(&stream_id);
        if let Some(entry) = removed {
            entry.shared.mark_closed(None);
        }
    }

    pub(crate) fn note_data_sent(&self, stream_id: u16) {
        let mut state = lock(&self.state);
        if let Some(entry) = state.streams.get_mut(&stream_id) {
            entry.window.on_sent();
        }
        state.window.on_sent();
    }

    /// Account a successfully opened stream
    pub(crate) fn record_stream_success(&self, destination: &str, setup: Duration) {
        let mut state = lock(&self.state);
        state.sum_stream_setup += setup;
        state.stream_counter += 1;
        state.stream_history.insert(destination.to_string());
        Self::update_ranking(&mut state, &self.config);
    }

    pub(crate) fn remember_destination(&self, destination: &str) {
        lock(&self.state)
            .stream_history
            .insert(destination.to_string());
    }

    /// Account a stream that failed; too many failures soft-close the circuit
    pub async fn report_stream_failure(&self) {
        let should_close = {
            let mut state = lock(&self.state);
            state.stream_fails += 1;
            Self::update_ranking(&mut state, &self.config);
            state.stream_fails > self.config.closes_on_failures
                && state.stream_fails > state.stream_counter * 3 / 2
        };

        if should_close {
            if !self.is_closed() {
                log::info!("Circuit {} closing due to stream failures", self.id);
            }
            self.close(false).await;
        }
    }

    /// Weighted average of circuit and stream setup times, scaled up
    /// exponentially by the number of failed streams
    fn update_ranking(state: &mut CircuitState, config: &CircuitConfig) {
        let impact = config.establishment_time_impact as f64;
        let setup_ms = state.setup_duration.as_secs_f64() * 1000.0;
        let streams_ms = state.sum_stream_setup.as_secs_f64() * 1000.0;
        let average = (impact * setup_ms + streams_ms) / (state.stream_counter as f64 + impact);
        state.ranking = average * (state.stream_fails as f64).exp();
    }

    /// Resolve `hostname` through the exit
    pub async fn resolve(self: &Arc<Self>, hostname: &str) -> Result<ResolvedAnswer> {
        crate::protocol::stream::resolve(self, hostname).await
    }

    // ===== Teardown =====

    /// Close the circuit.
    ///
    /// Forced: every stream is dropped and the circuit is destructed
    /// without notifying the relays. Soft: no new streams are accepted,
    /// streams idle beyond the drain limit are dropped, and once none
    /// remain a DESTROY is sent. Returns whether the circuit is gone.
    pub async fn close(&self, force: bool) -> bool {
        let drain_limit = self.config.drain_idle_limit();
        let (remaining, send_destroy) = {
            let mut state = lock(&self.state);
            if state.destruct {
                return true;
            }
            if !state.closed {
                log::info!("Circuit {} closing (force={})", self.id, force);
            }
            state.closed = true;
            state.established = false;

            state.streams.retain(|id, entry| {
                let drop_it = force || entry.shared.idle_time() > drain_limit;
                if drop_it {
                    if !force {
                        log::info!("Circuit {} forcing timeout on stream {}", self.id, id);
                    }
                    entry.shared.mark_closed(None);
                }
                !drop_it
            });

            if !force && !state.streams.is_empty() {
                (state.streams.len(), false)
            } else {
                state.destruct = true;
                (0, !force)
            }
        };

        if remaining > 0 {
            log::debug!("Circuit {} waiting on {} stream(s)", self.id, remaining);
            return false;
        }

        if send_destroy && self.route_established() > 0 {
            log::debug!("Circuit {} sending DESTROY", self.id);
            let destroy = FixedCell::destroy(self.id, DESTROY_REASON_REQUESTED);
            if let Err(e) = self.send_control(&destroy).await {
                log::debug!("Circuit {} DESTROY not sent: {}", self.id, e);
            }
        }
        true
    }

    /// Soft close repeatedly until drained or `drain_timeout` expires,
    /// then force
    pub async fn shutdown(&self, drain_timeout: Duration) {
        let deadline = Instant::now() + drain_timeout;
        while !self.close(false).await {
            if Instant::now() >= deadline {
                log::info!("Circuit {} drain timeout, forcing close", self.id);
                self.close(true).await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Synchronous hard close, used from the receive path
    fn hard_close(&self, error: Option<TorError>) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.established = false;
        state.destruct = true;
        for (_, entry) in state.streams.drain() {
            entry.shared.mark_closed(error.clone());
        }
    }

    fn touch_action(&self) {
        lock(&self.state).last_action = Instant::now();
    }
}

impl RelayDecrypt for Circuit {
    /// Peel layers hop by hop until one recognizes the cell.
    ///
    /// A zero `recognized` field is only a hint: the digest must match as
    /// well, otherwise the next hop is tried.
    fn decrypt_payload(&self, payload: &mut [u8; PAYLOAD_SIZE]) -> Result<usize> {
        let mut hops = lock(&self.hops);
        for (index, hop) in hops.iter_mut().enumerate() {
            hop.decrypt_through_this_hop(payload);

            if payload[RECOGNIZED_RANGE] != [0, 0] {
                continue;
            }

            let mut digest = [0u8; 4];
            digest.copy_from_slice(&payload[DIGEST_RANGE]);
            payload[DIGEST_RANGE].fill(0);
            let matched = hop.check_backward_digest(&payload[..], &digest);
            payload[DIGEST_RANGE].copy_from_slice(&digest);

            if matched {
                return Ok(index);
            }
            log::trace!("Circuit {} hop {}: recognized=0 but digest differs", self.id, index);
        }

        log::warn!(
            "Circuit {} relay cell not recognized by any of {} hop(s)",
            self.id,
            hops.len()
        );
        Err(TorError::RelayCellNotRecognized)
    }
}

impl fmt::Display for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        let names: Vec<String> = lock(&self.hops)
            .iter()
            .map(|h| h.server().nickname.clone())
            .collect();
        if !names.is_empty() {
            write!(f, " [{}]", names.join(" "))?;
        }
        match self.status() {
            CircuitStatus::Closing | CircuitStatus::Destructed => write!(f, " (closed)"),
            CircuitStatus::Building(_) => write!(f, " (establishing)"),
            CircuitStatus::Established => Ok(()),
        }
    }
}

impl fmt::Debug for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("route_established", &self.route_established())
            .finish_non_exhaustive()
    }
}

fn unexpected(expected: &str, got: &ControlMessage) -> TorError {
    TorError::UnexpectedCell {
        expected: expected.into(),
        got: got.name().into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::hop::KDF_LEN;
    use crate::protocol::test_keys::test_descriptor;
    use crate::transport::ChannelTransport;

    fn circuit_with_hops(n: usize) -> (Arc<Circuit>, mpsc::Receiver<Vec<u8>>) {
        let (transport, rx) = ChannelTransport::new(64);
        let circuit = Circuit::new(7, Arc::new(transport), CircuitConfig::default());
        for i in 0..n {
            let k = [i as u8 + 1; KDF_LEN];
            lock(&circuit.hops).push(HopCrypto::from_key_material(test_descriptor("hop"), &k));
        }
        lock(&circuit.state).established = n > 0;
        (circuit, rx)
    }

    #[test]
    fn test_stream_ids_unique_and_nonzero() {
        let (circuit, _rx) = circuit_with_hops(1);
        let mut seen = HashSet::new();
        let mut slots = Vec::new();
        for _ in 0..100 {
            let slot = circuit.assign_stream_id("example.com:80").unwrap();
            assert_ne!(slot.id, 0);
            assert!(seen.insert(slot.id));
            slots.push(slot);
        }

        // Release some and reallocate: never collides with live ids
        for slot in slots.drain(..50) {
            circuit.deregister_stream(slot.id);
        }
        let live: HashSet<u16> = circuit.stream_ids().into_iter().collect();
        for _ in 0..50 {
            let slot = circuit.assign_stream_id("example.com:80").unwrap();
            assert_ne!(slot.id, 0);
            assert!(!live.contains(&slot.id));
        }
    }

    #[test]
    fn test_stream_id_offset_rotates() {
        let (circuit, _rx) = circuit_with_hops(1);
        lock(&circuit.state).stream_counter = 0xfffe;
        let slot = circuit.assign_stream_id("a").unwrap();
        assert_eq!(slot.id, 0xffff);
        let slot = circuit.assign_stream_id("a").unwrap();
        assert_eq!(slot.id, 1);
    }

    #[test]
    fn test_no_free_stream_ids() {
        let (circuit, _rx) = circuit_with_hops(1);
        {
            let mut state = lock(&circuit.state);
            for id in 1..=u16::MAX {
                let (tx, _) = mpsc::channel(1);
                state.streams.insert(
                    id,
                    StreamEntry {
                        tx,
                        shared: Arc::new(StreamShared::new("x")),
                        window: FlowWindow::default(),
                    },
                );
            }
        }
        assert!(matches!(
            circuit.assign_stream_id("x"),
            Err(TorError::NoFreeStreamIds)
        ));
    }

    #[tokio::test]
    async fn test_closed_circuit_refuses_streams() {
        let (circuit, _rx) = circuit_with_hops(1);
        assert!(circuit.close(false).await);
        assert!(matches!(
            circuit.assign_stream_id("x"),
            Err(TorError::CircuitClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_send_relay_layers_for_target_hop() {
        let (circuit, mut rx) = circuit_with_hops(3);
        let cell = RelayCell::new(RelayCommand::Data, 5, b"abc".to_vec());
        circuit.send_relay(cell.clone(), None).await.unwrap();

        let wire = rx.recv().await.unwrap();
        assert_eq!(wire.len(), 512);
        assert_eq!(&wire[..3], &[0, 7, CellCommand::Relay as u8]);

        // Peel with fresh twins of the three hops, as the relays would
        let mut payload = [0u8; PAYLOAD_SIZE];
        payload.copy_from_slice(&wire[3..]);
        let mut twins: Vec<HopCrypto> = (0..3)
            .map(|i| HopCrypto::from_key_material(test_descriptor("t"), &[i as u8 + 1; KDF_LEN]))
            .collect();
        for twin in twins.iter_mut() {
            twin.encrypt_through_this_hop(&mut payload);
        }
        let parsed = RelayCell::decode_payload(&payload).unwrap();
        assert_eq!(parsed.data, b"abc");
        assert_eq!(parsed.stream_id, 5);

        let mut zeroed = payload;
        zeroed[DIGEST_RANGE].fill(0);
        assert_eq!(twins[2].forward_digest(&zeroed), parsed.digest);
    }

    #[tokio::test]
    async fn test_send_relay_rejects_unknown_hop() {
        let (circuit, _rx) = circuit_with_hops(2);
        let cell = RelayCell::new(RelayCommand::Drop, 0, Vec::new());
        assert!(matches!(
            circuit.send_relay(cell, Some(2)).await,
            Err(TorError::InvalidState(_))
        ));

        let (empty, _rx) = circuit_with_hops(0);
        let cell = RelayCell::new(RelayCommand::Drop, 0, Vec::new());
        assert!(empty.send_relay(cell, None).await.is_err());
    }

    #[test]
    fn test_ranking_formula() {
        let (circuit, _rx) = circuit_with_hops(1);
        let mut state = lock(&circuit.state);
        state.setup_duration = Duration::from_millis(1000);
        state.sum_stream_setup = Duration::from_millis(500);
        state.stream_counter = 5;
        Circuit::update_ranking(&mut state, &circuit.config);
        assert!((state.ranking - 550.0).abs() < 1e-6);

        state.stream_fails = 2;
        Circuit::update_ranking(&mut state, &circuit.config);
        assert!((state.ranking - 550.0 * 2f64.exp()).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_failures_soft_close() {
        let (circuit, _rx) = circuit_with_hops(1);
        for _ in 0..3 {
            circuit.report_stream_failure().await;
            assert!(!circuit.is_closed());
        }
        circuit.report_stream_failure().await;
        assert!(circuit.is_closed());
        assert_eq!(circuit.stream_fails(), 4);
    }

    #[tokio::test]
    async fn test_failures_tolerated_on_busy_circuit() {
        let (circuit, _rx) = circuit_with_hops(1);
        lock(&circuit.state).stream_counter = 10;
        for _ in 0..10 {
            circuit.report_stream_failure().await;
        }
        // 10 failures against 10 good streams stays below 3/2
        assert!(!circuit.is_closed());
    }

    #[tokio::test]
    async fn test_soft_close_waits_for_busy_streams() {
        let (circuit, mut rx) = circuit_with_hops(1);
        let slot = circuit.assign_stream_id("busy").unwrap();

        assert!(!circuit.close(false).await);
        assert_eq!(circuit.status(), CircuitStatus::Closing);
        assert!(rx.try_recv().is_err());

        circuit.deregister_stream(slot.id);
        assert!(circuit.close(false).await);
        let destroy = rx.recv().await.unwrap();
        assert_eq!(&destroy[..4], &[0, 7, CellCommand::Destroy as u8, 3]);
        assert!(circuit.is_destructed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_close_drops_idle_streams() {
        let (circuit, _rx) = circuit_with_hops(1);
        let slot = circuit.assign_stream_id("idle").unwrap();

        tokio::time::advance(circuit.config.drain_idle_limit() + Duration::from_secs(1)).await;
        assert!(circuit.close(false).await);
        assert!(slot.shared.is_closed());
    }

    #[tokio::test]
    async fn test_forced_close_sends_nothing() {
        let (circuit, mut rx) = circuit_with_hops(1);
        let slot = circuit.assign_stream_id("x").unwrap();
        assert!(circuit.close(true).await);
        assert!(slot.shared.is_closed());
        assert!(rx.try_recv().is_err());
        assert!(circuit.stream_ids().is_empty());
    }

    #[tokio::test]
    async fn test_inbound_destroy_hard_closes() {
        let (circuit, _rx) = circuit_with_hops(1);
        let slot = circuit.assign_stream_id("x").unwrap();
        circuit
            .deliver(Cell::Control(FixedCell::destroy(7, 8)))
            .await;
        assert!(circuit.is_destructed());
        assert!(matches!(
            slot.shared.failure(),
            Some(TorError::CircuitDestroyed { reason: 8, .. })
        ));
    }

    #[tokio::test]
    async fn test_idle_and_display() {
        let (circuit, _rx) = circuit_with_hops(2);
        assert!(circuit.is_idle());
        assert_eq!(circuit.to_string(), "7 [hop hop]");

        let _slot = circuit.assign_stream_id("x").unwrap();
        assert!(!circuit.is_idle());
        circuit.close(true).await;
        assert_eq!(circuit.to_string(), "7 [hop hop] (closed)");
    }
}
