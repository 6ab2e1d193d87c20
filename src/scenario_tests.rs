//! End-to-end scenarios against an in-process relay chain
//!
//! The mock relays implement their side of the protocol independently of
//! `HopCrypto`: they answer the TAP handshake, peel and check outbound
//! cells with their own ciphers and digests, and originate inbound cells.

use crate::config::{CircuitConfig, ConnectionConfig};
use crate::connection::Connection;
use crate::error::TorError;
use crate::protocol::test_keys::{onion_private_key, test_descriptor};
use crate::protocol::{
    hybrid_decrypt, kdf_tap, AesCounterMode, CellCommand, Circuit, CircuitStatus, DhKeyPair,
    FixedCell, HopKeys, RelayCell, RelayCommand, RelayDecrypt, ResolvedAnswer, ServerDescriptor,
    TorStream, CELL_SIZE, DH_LEN, DIGEST_RANGE, ONION_SKIN_LEN, PAYLOAD_SIZE, RECOGNIZED_RANGE,
};
use crate::transport::ChannelTransport;
use futures::io::{AsyncReadExt, AsyncWriteExt};
use sha1::{Digest, Sha1};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Relay-side state of one hop
struct RelaySide {
    forward_cipher: AesCounterMode,
    backward_cipher: AesCounterMode,
    forward_digest: Sha1,
    backward_digest: Sha1,
}

impl RelaySide {
    /// Answer an onion skin; returns the relay state and g^y || KH
    fn accept(skin: &[u8]) -> (Self, Vec<u8>) {
        let (_, body) = hybrid_decrypt(&skin[..ONION_SKIN_LEN], onion_private_key()).unwrap();
        let dh = DhKeyPair::generate(&mut rand::thread_rng());
        let secret = dh.shared_secret(&body[..DH_LEN]).unwrap();
        let keys = HopKeys::from_kdf(&kdf_tap(&secret[..]));

        let mut reply = dh.public_bytes().to_vec();
        reply.extend_from_slice(&keys.key_handle);
        let relay = Self {
            forward_cipher: AesCounterMode::new(false, &keys.forward_key),
            backward_cipher: AesCounterMode::new(true, &keys.backward_key),
            forward_digest: Sha1::new_with_prefix(keys.forward_digest),
            backward_digest: Sha1::new_with_prefix(keys.backward_digest),
        };
        (relay, reply)
    }

    /// Remove our layer; true if the cell is addressed to us
    fn peel(&mut self, payload: &mut [u8; PAYLOAD_SIZE]) -> bool {
        self.forward_cipher.apply_keystream(payload);
        if payload[RECOGNIZED_RANGE] != [0, 0] {
            return false;
        }

        let mut digest = [0u8; 4];
        digest.copy_from_slice(&payload[DIGEST_RANGE]);
        payload[DIGEST_RANGE].fill(0);
        let mut trial = self.forward_digest.clone();
        trial.update(&payload[..]);
        payload[DIGEST_RANGE].copy_from_slice(&digest);

        if trial.clone().finalize()[..4] == digest {
            self.forward_digest = trial;
            true
        } else {
            false
        }
    }

    fn originate(&mut self, cell: &RelayCell) -> [u8; PAYLOAD_SIZE] {
        let mut payload = cell.encode_payload().unwrap();
        payload[DIGEST_RANGE].fill(0);
        self.backward_digest.update(&payload[..]);
        let digest = self.backward_digest.clone().finalize();
        payload[DIGEST_RANGE].copy_from_slice(&digest[..4]);
        self.backward_cipher.apply_keystream(&mut payload);
        payload
    }

    fn wrap(&mut self, payload: &mut [u8; PAYLOAD_SIZE]) {
        self.backward_cipher.apply_keystream(payload);
    }
}

struct MockChain {
    circuit_id: u16,
    hops: Vec<RelaySide>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl MockChain {
    async fn next_outbound(&mut self) -> Vec<u8> {
        let raw = self.rx.recv().await.unwrap();
        assert_eq!(raw.len(), CELL_SIZE);
        raw
    }

    /// Peel an outbound relay cell; returns the hop that recognized it
    fn open(&mut self, raw: &[u8]) -> (usize, RelayCell) {
        assert_eq!(raw[2], CellCommand::Relay as u8);
        let mut payload = [0u8; PAYLOAD_SIZE];
        payload.copy_from_slice(&raw[3..]);
        for (index, hop) in self.hops.iter_mut().enumerate() {
            if hop.peel(&mut payload) {
                return (index, RelayCell::decode_payload(&payload).unwrap());
            }
        }
        panic!("relay cell not recognized by any mock relay");
    }

    /// Wire bytes of a relay cell sent by hop `from` towards the client
    fn reply(&mut self, from: usize, cell: RelayCell) -> Vec<u8> {
        let mut payload = self.hops[from].originate(&cell);
        for hop in self.hops[..from].iter_mut().rev() {
            hop.wrap(&mut payload);
        }
        FixedCell {
            circuit_id: self.circuit_id,
            command: CellCommand::Relay,
            payload,
        }
        .to_bytes()
        .to_vec()
    }

    async fn serve_build(&mut self, conn: &Connection, hops: usize) {
        let create = self.next_outbound().await;
        assert_eq!(create[2], CellCommand::Create as u8);
        self.circuit_id = u16::from_be_bytes([create[0], create[1]]);
        let (relay, reply) = RelaySide::accept(&create[3..]);
        self.hops.push(relay);
        let created = FixedCell::new(self.circuit_id, CellCommand::Created, &reply).unwrap();
        conn.deliver(&created.to_bytes()).await.unwrap();

        for _ in 1..hops {
            let raw = self.next_outbound().await;
            let (hop, extend) = self.open(&raw);
            assert_eq!(hop, self.hops.len() - 1);
            assert_eq!(extend.command, RelayCommand::Extend);
            assert_eq!(extend.data.len(), 4 + 2 + ONION_SKIN_LEN + 20);
            assert_eq!(&extend.data[..6], &[10, 0, 0, 1, 0x23, 0x29]);

            let (relay, reply) = RelaySide::accept(&extend.data[6..]);
            let extended = self.reply(hop, RelayCell::new(RelayCommand::Extended, 0, reply));
            self.hops.push(relay);
            conn.deliver(&extended).await.unwrap();
        }
    }
}

fn setup() -> (Connection, MockChain) {
    setup_with(CircuitConfig::default())
}

fn setup_with(circuit: CircuitConfig) -> (Connection, MockChain) {
    let (transport, rx) = ChannelTransport::new(64);
    let config = ConnectionConfig {
        circuit,
        ..ConnectionConfig::default()
    };
    let conn = Connection::new(Arc::new(transport), config);
    let chain = MockChain {
        circuit_id: 0,
        hops: Vec::new(),
        rx,
    };
    (conn, chain)
}

fn route(hops: usize) -> Vec<ServerDescriptor> {
    ["guard", "middle", "exit"][..hops]
        .iter()
        .map(|name| test_descriptor(name))
        .collect()
}

async fn build(conn: &Connection, chain: &mut MockChain, hops: usize) -> Arc<Circuit> {
    let route = route(hops);
    let (circuit, ()) = tokio::join!(conn.build_circuit(&route), chain.serve_build(conn, hops));
    circuit.unwrap()
}

async fn open_stream(
    conn: &Connection,
    chain: &mut MockChain,
    circuit: &Arc<Circuit>,
) -> TorStream {
    let exit = chain.hops.len() - 1;
    let relay = async {
        let raw = chain.next_outbound().await;
        let (hop, begin) = chain.open(&raw);
        assert_eq!(hop, exit);
        assert_eq!(begin.command, RelayCommand::Begin);
        assert_eq!(begin.data, b"example.com:80\0");
        let connected = RelayCell::new(
            RelayCommand::Connected,
            begin.stream_id,
            vec![93, 184, 216, 34, 0, 0, 0, 60],
        );
        conn.deliver(&chain.reply(exit, connected)).await.unwrap();
    };
    let (stream, ()) = tokio::join!(TorStream::open(circuit, "example.com", 80), relay);
    stream.unwrap()
}

#[tokio::test]
async fn test_three_hop_build_and_http_exchange() {
    let (conn, mut chain) = setup();
    let circuit = build(&conn, &mut chain, 3).await;

    assert_eq!(circuit.status(), CircuitStatus::Established);
    assert_eq!(circuit.route_established(), 3);
    assert!(circuit.ranking() >= 0.0);
    assert_eq!(circuit.to_string(), format!("{} [guard middle exit]", circuit.id()));

    let mut stream = open_stream(&conn, &mut chain, &circuit).await;
    let stream_id = stream.stream_id();
    assert_ne!(stream_id, 0);
    assert_eq!(stream.remote_address(), Some(Ipv4Addr::new(93, 184, 216, 34)));
    assert_eq!(circuit.stream_counter(), 1);
    assert!(circuit.has_used("example.com:80"));

    let request = b"GET / HTTP/1.0\r\n\r\n";
    stream.write(request).await.unwrap();
    let raw = chain.next_outbound().await;
    let (hop, data) = chain.open(&raw);
    assert_eq!(hop, 2);
    assert_eq!(data.command, RelayCommand::Data);
    assert_eq!(data.stream_id, stream_id);
    assert_eq!(data.data, request);
    assert!(chain.rx.try_recv().is_err());

    let response = b"HTTP/1.0 200 OK\r\n\r\nhello".to_vec();
    let cell = chain.reply(2, RelayCell::new(RelayCommand::Data, stream_id, response.clone()));
    conn.deliver(&cell).await.unwrap();
    let end = chain.reply(2, RelayCell::new(RelayCommand::End, stream_id, vec![6]));
    conn.deliver(&end).await.unwrap();

    let mut body = Vec::new();
    stream.read_to_end(&mut body).await.unwrap();
    assert_eq!(body, response);
    assert!(stream.is_closed());

    // The exit already ended the stream, so nothing goes back
    stream.close(false).await;
    assert!(chain.rx.try_recv().is_err());
    assert!(circuit.stream_ids().is_empty());
}

#[tokio::test]
async fn test_corrupted_digest_not_recognized() {
    let (conn, mut chain) = setup();
    let circuit = build(&conn, &mut chain, 2).await;

    let raw = chain.reply(1, RelayCell::new(RelayCommand::Drop, 0, b"noise".to_vec()));
    let mut payload = [0u8; PAYLOAD_SIZE];
    payload.copy_from_slice(&raw[3..]);
    payload[DIGEST_RANGE.start] ^= 0x80;
    assert!(matches!(
        circuit.decrypt_payload(&mut payload),
        Err(TorError::RelayCellNotRecognized)
    ));

    // Through the link the failure is charged to the circuit, which closes
    let mut raw = chain.reply(1, RelayCell::new(RelayCommand::Drop, 0, Vec::new()));
    raw[3 + DIGEST_RANGE.start] ^= 0x80;
    conn.deliver(&raw).await.unwrap();
    assert_eq!(circuit.stream_fails(), 1);
    assert!(circuit.is_destructed());

    let destroy = chain.next_outbound().await;
    assert_eq!(destroy[2], CellCommand::Destroy as u8);
    assert_eq!(destroy[3], 3);
}

#[tokio::test]
async fn test_refused_stream_is_charged_to_circuit() {
    let (conn, mut chain) = setup();
    let circuit = build(&conn, &mut chain, 2).await;

    let relay = async {
        let raw = chain.next_outbound().await;
        let (hop, begin) = chain.open(&raw);
        let end = RelayCell::new(RelayCommand::End, begin.stream_id, vec![4]);
        conn.deliver(&chain.reply(hop, end)).await.unwrap();
    };
    let (result, ()) = tokio::join!(TorStream::open(&circuit, "example.com", 80), relay);

    assert!(matches!(result, Err(TorError::StreamBuildFailed { .. })));
    assert_eq!(circuit.stream_fails(), 1);
    assert_eq!(circuit.stream_counter(), 0);
    assert!(circuit.stream_ids().is_empty());
    assert!(chain.rx.try_recv().is_err());
}

#[tokio::test]
async fn test_resolve_through_exit() {
    let (conn, mut chain) = setup();
    let circuit = build(&conn, &mut chain, 1).await;

    let relay = async {
        let raw = chain.next_outbound().await;
        let (hop, query) = chain.open(&raw);
        assert_eq!(query.command, RelayCommand::Resolve);
        assert_eq!(query.data, b"example.com\0");
        let answer = RelayCell::new(
            RelayCommand::Resolved,
            query.stream_id,
            vec![4, 4, 93, 184, 216, 34, 0, 0, 0, 60],
        );
        conn.deliver(&chain.reply(hop, answer)).await.unwrap();
    };
    let (answer, ()) = tokio::join!(circuit.resolve("example.com"), relay);

    assert_eq!(
        answer.unwrap(),
        ResolvedAnswer::Ipv4(Ipv4Addr::new(93, 184, 216, 34))
    );
    assert!(circuit.has_used("example.com"));
    assert!(circuit.stream_ids().is_empty());
}

#[tokio::test]
async fn test_sendme_cadence() {
    let (conn, mut chain) = setup();
    let circuit = build(&conn, &mut chain, 2).await;
    let stream = open_stream(&conn, &mut chain, &circuit).await;
    let stream_id = stream.stream_id();

    for _ in 0..100 {
        let cell = chain.reply(1, RelayCell::new(RelayCommand::Data, stream_id, vec![0; 100]));
        conn.deliver(&cell).await.unwrap();
    }

    let mut sendmes = Vec::new();
    while let Ok(raw) = chain.rx.try_recv() {
        let (hop, cell) = chain.open(&raw);
        assert_eq!(cell.command, RelayCommand::Sendme);
        sendmes.push((hop, cell.stream_id));
    }
    assert_eq!(
        sendmes,
        vec![(1, stream_id), (0, 0), (1, 0), (1, stream_id)]
    );
}

#[tokio::test]
async fn test_every_relay_cell_moves_circuit_window() {
    let (conn, mut chain) = setup();
    // RELAY_EXTENDED from the middle hop already took one cell of the window
    let circuit = build(&conn, &mut chain, 2).await;

    for i in 0..98 {
        let cell = if i % 2 == 0 {
            RelayCell::new(RelayCommand::Drop, 0, Vec::new())
        } else {
            RelayCell::new(RelayCommand::Sendme, 0, Vec::new())
        };
        conn.deliver(&chain.reply(1, cell)).await.unwrap();
    }
    assert!(chain.rx.try_recv().is_err());

    let last = chain.reply(0, RelayCell::new(RelayCommand::Drop, 0, Vec::new()));
    conn.deliver(&last).await.unwrap();

    let mut sendmes = Vec::new();
    while let Ok(raw) = chain.rx.try_recv() {
        let (hop, cell) = chain.open(&raw);
        assert_eq!(cell.command, RelayCommand::Sendme);
        sendmes.push((hop, cell.stream_id));
    }
    assert_eq!(sendmes, vec![(0, 0), (1, 0)]);
    assert_eq!(circuit.status(), CircuitStatus::Established);
}

#[tokio::test]
async fn test_unread_stream_does_not_stall_link() {
    let config = CircuitConfig {
        stream_queue_capacity: 2,
        ..CircuitConfig::default()
    };
    let (conn, mut chain) = setup_with(config);
    let circuit = build(&conn, &mut chain, 1).await;
    let mut idle = open_stream(&conn, &mut chain, &circuit).await;
    let mut busy = open_stream(&conn, &mut chain, &circuit).await;
    let idle_id = idle.stream_id();

    for chunk in [&b"one"[..], &b"two"[..], &b"three"[..]] {
        let cell = chain.reply(0, RelayCell::new(RelayCommand::Data, idle_id, chunk.to_vec()));
        tokio::time::timeout(Duration::from_secs(1), conn.deliver(&cell))
            .await
            .expect("link reader blocked on a full stream queue")
            .unwrap();
    }

    // The overrun stream is failed locally and ended towards the exit
    let raw = chain.next_outbound().await;
    let (_, end) = chain.open(&raw);
    assert_eq!(end.command, RelayCommand::End);
    assert_eq!(end.stream_id, idle_id);
    assert_eq!(end.data, vec![1]);
    assert!(idle.is_closed());
    assert_eq!(circuit.stream_ids(), vec![busy.stream_id()]);

    let busy_id = busy.stream_id();
    let cell = chain.reply(0, RelayCell::new(RelayCommand::Data, busy_id, b"ok".to_vec()));
    conn.deliver(&cell).await.unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(busy.read(&mut buf).await.unwrap(), 2);
    assert_eq!(&buf[..2], b"ok");

    // Queued data is still readable before the failure surfaces
    assert_eq!(idle.read(&mut buf).await.unwrap(), 3);
    assert_eq!(&buf[..3], b"one");
    assert_eq!(idle.read(&mut buf).await.unwrap(), 3);
    assert_eq!(&buf[..3], b"two");
    assert!(matches!(
        idle.read(&mut buf).await,
        Err(TorError::StreamOverrun { capacity: 2 })
    ));
}

#[tokio::test]
async fn test_forced_close_releases_pending_read() {
    let (conn, mut chain) = setup();
    let circuit = build(&conn, &mut chain, 1).await;
    let mut stream = open_stream(&conn, &mut chain, &circuit).await;

    let mut buf = [0u8; 16];
    let (read, gone) = tokio::join!(stream.read(&mut buf), async {
        tokio::task::yield_now().await;
        circuit.close(true).await
    });
    assert!(gone);
    assert_eq!(read.unwrap(), 0);
    assert!(stream.is_closed());
}

#[tokio::test]
async fn test_destroy_releases_pending_read() {
    let (conn, mut chain) = setup();
    let circuit = build(&conn, &mut chain, 1).await;
    let mut stream = open_stream(&conn, &mut chain, &circuit).await;

    let destroy = FixedCell::destroy(circuit.id(), 9).to_bytes();
    let mut buf = [0u8; 16];
    let (read, delivered) = tokio::join!(stream.read(&mut buf), async {
        tokio::task::yield_now().await;
        conn.deliver(&destroy).await
    });
    delivered.unwrap();
    assert!(matches!(
        read,
        Err(TorError::CircuitDestroyed { reason: 9, .. })
    ));
    assert!(circuit.is_destructed());
}

#[tokio::test]
async fn test_destroy_fails_open_stream() {
    let (conn, mut chain) = setup();
    let circuit = build(&conn, &mut chain, 1).await;
    let mut stream = open_stream(&conn, &mut chain, &circuit).await;

    conn.deliver(&FixedCell::destroy(circuit.id(), 9).to_bytes())
        .await
        .unwrap();

    let mut buf = [0u8; 16];
    assert!(matches!(
        stream.read(&mut buf).await,
        Err(TorError::CircuitDestroyed { reason: 9, .. })
    ));
    assert!(circuit.is_destructed());
    assert!(matches!(
        stream.write(b"late").await,
        Err(TorError::StreamClosed)
    ));
}

#[tokio::test]
async fn test_async_io_traits() {
    let (conn, mut chain) = setup();
    let circuit = build(&conn, &mut chain, 1).await;
    let mut stream = open_stream(&conn, &mut chain, &circuit).await;
    let stream_id = stream.stream_id();

    stream.write_all(&[7u8; 1000]).await.unwrap();
    let mut lengths = Vec::new();
    for _ in 0..3 {
        let raw = chain.next_outbound().await;
        let (_, cell) = chain.open(&raw);
        assert_eq!(cell.command, RelayCommand::Data);
        lengths.push(cell.data.len());
    }
    assert_eq!(lengths, vec![498, 498, 4]);

    let cell = chain.reply(0, RelayCell::new(RelayCommand::Data, stream_id, b"pong".to_vec()));
    conn.deliver(&cell).await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    AsyncWriteExt::close(&mut stream).await.unwrap();
    let raw = chain.next_outbound().await;
    let (_, end) = chain.open(&raw);
    assert_eq!(end.command, RelayCommand::End);
    assert_eq!(end.data, vec![6]);
    assert!(stream.is_closed());
    assert!(circuit.stream_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_silent_exit_times_out() {
    let (conn, mut chain) = setup();
    let circuit = build(&conn, &mut chain, 1).await;

    let result = TorStream::open(&circuit, "example.com", 80).await;
    assert!(matches!(result, Err(TorError::StreamBuildFailed { .. })));
    assert_eq!(circuit.stream_fails(), 1);

    // Only the BEGIN went out
    let raw = chain.next_outbound().await;
    assert_eq!(chain.open(&raw).1.command, RelayCommand::Begin);
    assert!(chain.rx.try_recv().is_err());
}
