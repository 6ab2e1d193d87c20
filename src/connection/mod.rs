//! Link multiplexer
//!
//! One `Connection` owns every circuit built over a single link to an
//! entry relay. Outbound cells go straight from each circuit to the shared
//! [`Transport`]; inbound bytes are reassembled into cells and routed by
//! circuit id.
//!
//! ```text
//! transport bytes -> Dispatcher -> circuit id -> Circuit::decrypt_payload
//!                                             -> Circuit::deliver -> stream queue
//! ```

mod dispatch;

pub use dispatch::Dispatcher;

use crate::config::ConnectionConfig;
use crate::error::{Result, TorError};
use crate::protocol::{decode_cell, peek_circuit_id, Circuit, RelayDecrypt, ServerDescriptor};
use crate::transport::Transport;
use futures::io::{AsyncRead, AsyncReadExt};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Mutex as AsyncMutex;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Circuits sharing one link
pub struct Connection {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    circuits: Mutex<HashMap<u16, Arc<Circuit>>>,
    inbound: AsyncMutex<Dispatcher>,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        Self {
            transport,
            config,
            circuits: Mutex::new(HashMap::new()),
            inbound: AsyncMutex::new(Dispatcher::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn circuit(&self, id: u16) -> Option<Arc<Circuit>> {
        lock(&self.circuits).get(&id).cloned()
    }

    /// All registered circuits, ordered by id
    pub fn circuits(&self) -> Vec<Arc<Circuit>> {
        let mut circuits: Vec<Arc<Circuit>> = lock(&self.circuits).values().cloned().collect();
        circuits.sort_by_key(|c| c.id());
        circuits
    }

    /// Established, open circuit with the best (lowest) ranking
    pub fn best_circuit(&self) -> Option<Arc<Circuit>> {
        lock(&self.circuits)
            .values()
            .filter(|c| c.is_established() && !c.is_closed())
            .min_by(|a, b| a.ranking().total_cmp(&b.ranking()))
            .cloned()
    }

    fn allocate_circuit_id(&self, circuits: &HashMap<u16, Arc<Circuit>>) -> Result<u16> {
        let mut rng = rand::thread_rng();
        for _ in 0..self.config.circuit_id_attempts {
            let id: u16 = rng.gen_range(1..=u16::MAX);
            if !circuits.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(TorError::NoFreeCircuitIds)
    }

    /// Register a new circuit and extend it through `route`.
    ///
    /// The circuit is in the table before the first CREATE goes out, so the
    /// CREATED reply can be routed to it. A failed build is force-closed and
    /// unregistered.
    pub async fn build_circuit(&self, route: &[ServerDescriptor]) -> Result<Arc<Circuit>> {
        let circuit = {
            let mut circuits = lock(&self.circuits);
            if self.is_closed() {
                return Err(TorError::Transport("Connection is closed".into()));
            }
            let id = self.allocate_circuit_id(&circuits)?;
            let circuit = Circuit::new(id, Arc::clone(&self.transport), self.config.circuit.clone());
            circuits.insert(id, Arc::clone(&circuit));
            circuit
        };

        match circuit.build(route).await {
            Ok(()) => Ok(circuit),
            Err(e) => {
                log::warn!("Circuit {} build failed: {}", circuit.id(), e);
                circuit.close(true).await;
                lock(&self.circuits).remove(&circuit.id());
                Err(e)
            }
        }
    }

    /// Feed raw bytes read from the link.
    ///
    /// Partial cells are kept for the next call. Framing errors are fatal
    /// for the link and returned; everything else is handled per circuit.
    pub async fn deliver(&self, bytes: &[u8]) -> Result<()> {
        let mut dispatcher = self.inbound.lock().await;
        for raw in dispatcher.push(bytes) {
            self.deliver_cell(&raw).await?;
        }
        Ok(())
    }

    async fn deliver_cell(&self, raw: &[u8]) -> Result<()> {
        let circuit_id = peek_circuit_id(raw)?;
        let Some(circuit) = self.circuit(circuit_id) else {
            if circuit_id == 0 {
                log::trace!("Ignoring link-level cell, command {}", raw.get(2).copied().unwrap_or(0));
            } else {
                log::debug!("Dropping cell for unknown circuit {}", circuit_id);
            }
            return Ok(());
        };

        match decode_cell(raw, Some(circuit.as_ref() as &dyn RelayDecrypt)) {
            Ok(cell) => {
                log::trace!("Circuit {} received {:?}", circuit_id, cell);
                circuit.deliver(cell).await;
                Ok(())
            }
            Err(TorError::RelayCellNotRecognized) => {
                // The backward keystreams already moved past this cell.
                log::warn!("Circuit {} integrity failure, closing", circuit_id);
                circuit.report_stream_failure().await;
                circuit.close(false).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Read cells from `reader` until end of file or a framing error, then
    /// force-close every circuit
    pub async fn run_reader<R>(&self, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; 4096];
        let result = loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    log::info!("Link closed by peer");
                    break Ok(());
                }
                Ok(n) => n,
                Err(e) => break Err(TorError::from(e)),
            };
            if let Err(e) = self.deliver(&buf[..n]).await {
                log::error!("Dropping link: {}", e);
                break Err(e);
            }
        };

        self.close(true).await;
        result
    }

    /// Close every circuit and forget the destructed ones. Returns whether
    /// no circuit is left.
    pub async fn close(&self, force: bool) -> bool {
        if force {
            self.closed.store(true, Ordering::SeqCst);
        }
        for circuit in self.circuits() {
            circuit.close(force).await;
        }
        self.reap().await;

        let empty = lock(&self.circuits).is_empty();
        if force {
            if let Err(e) = self.transport.close().await {
                log::debug!("Transport close failed: {}", e);
            }
        }
        empty
    }

    /// Soft-close circuits idle beyond the configured limit and remove
    /// destructed ones. Returns the number removed.
    pub async fn reap(&self) -> usize {
        let idle_timeout = self.config.circuit.idle_timeout();
        for circuit in self.circuits() {
            if circuit.is_idle() && circuit.last_activity_age() > idle_timeout {
                log::info!("Circuit {} idle, closing", circuit.id());
                circuit.close(false).await;
            }
        }

        let mut circuits = lock(&self.circuits);
        let before = circuits.len();
        circuits.retain(|_, c| !c.is_destructed());
        before - circuits.len()
    }
}
