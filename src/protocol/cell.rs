//! Tor cell protocol
//!
//! Implements the fixed 512-byte cell format and the RELAY sub-protocol.
//! Cells are the basic unit of communication in the Tor protocol.
//!
//! ```text
//! cell:   circ_id (2) | command (1) | payload (509)
//! relay:  command (1) | recognized (2) | stream_id (2) | digest (4) | length (2) | data (498)
//! ```

use crate::error::{Result, TorError};
use std::fmt;

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CellCommand {
    /// PADDING - keepalive, ignored by the receiver
    Padding = 0,
    /// CREATE - create a circuit with the onion-skin handshake
    Create = 1,
    /// CREATED - circuit created
    Created = 2,
    /// RELAY - relay cell, onion encrypted
    Relay = 3,
    /// DESTROY - tear down a circuit
    Destroy = 4,
    /// CREATE_FAST - create a circuit without public-key crypto
    CreateFast = 5,
    /// CREATED_FAST - fast circuit created
    CreatedFast = 6,
}

impl CellCommand {
    /// Parse command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            _ => None,
        }
    }
}

/// Relay command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RelayCommand {
    /// BEGIN - open stream
    Begin = 1,
    /// DATA - relay data
    Data = 2,
    /// END - close stream
    End = 3,
    /// CONNECTED - stream connected
    Connected = 4,
    /// SENDME - flow control
    Sendme = 5,
    /// EXTEND - extend circuit by one hop
    Extend = 6,
    /// EXTENDED - circuit extended
    Extended = 7,
    /// TRUNCATE - truncate circuit
    Truncate = 8,
    /// TRUNCATED - circuit truncated
    Truncated = 9,
    /// DROP - long-range padding
    Drop = 10,
    /// RESOLVE - DNS resolve
    Resolve = 11,
    /// RESOLVED - DNS resolved
    Resolved = 12,
    /// BEGIN_DIR - begin directory connection
    BeginDir = 13,
    /// ESTABLISH_INTRO - hidden service introduction point setup
    EstablishIntro = 32,
    /// ESTABLISH_RENDEZVOUS - client rendezvous point setup
    EstablishRendezvous = 33,
    /// INTRODUCE1 - client to introduction point
    Introduce1 = 34,
    /// INTRODUCE2 - introduction point to service
    Introduce2 = 35,
    /// RENDEZVOUS1 - service to rendezvous point
    Rendezvous1 = 36,
    /// RENDEZVOUS2 - rendezvous point to client
    Rendezvous2 = 37,
    /// INTRO_ESTABLISHED
    IntroEstablished = 38,
    /// RENDEZVOUS_ESTABLISHED
    RendezvousEstablished = 39,
    /// INTRODUCE_ACK
    IntroduceAck = 40,
}

impl RelayCommand {
    /// Parse relay command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            32 => Some(RelayCommand::EstablishIntro),
            33 => Some(RelayCommand::EstablishRendezvous),
            34 => Some(RelayCommand::Introduce1),
            35 => Some(RelayCommand::Introduce2),
            36 => Some(RelayCommand::Rendezvous1),
            37 => Some(RelayCommand::Rendezvous2),
            38 => Some(RelayCommand::IntroEstablished),
            39 => Some(RelayCommand::RendezvousEstablished),
            40 => Some(RelayCommand::IntroduceAck),
            _ => None,
        }
    }
}

/// Cell size (512 bytes total: 2 circuit_id + 1 command + 509 payload)
pub const CELL_SIZE: usize = 512;

/// Payload size for fixed-length cells
pub const PAYLOAD_SIZE: usize = 509;

/// Bytes preceding the relay data
pub const RELAY_HEADER_SIZE: usize = 11;

/// Position of the `recognized` field in a relay payload
pub const RECOGNIZED_RANGE: std::ops::Range<usize> = 1..3;

/// Position of the `digest` field in a relay payload
pub const DIGEST_RANGE: std::ops::Range<usize> = 5..9;

/// Something that can strip the onion layers off a RELAY payload in place
/// and report which hop the cell originated from.
pub trait RelayDecrypt {
    fn decrypt_payload(&self, payload: &mut [u8; PAYLOAD_SIZE]) -> Result<usize>;
}

/// A non-relay cell, or a relay cell whose payload is still opaque
#[derive(Clone, PartialEq, Eq)]
pub struct FixedCell {
    pub circuit_id: u16,
    pub command: CellCommand,
    pub payload: [u8; PAYLOAD_SIZE],
}

impl FixedCell {
    /// Create a new cell; the payload is zero-padded to 509 bytes
    pub fn new(circuit_id: u16, command: CellCommand, data: &[u8]) -> Result<Self> {
        if data.len() > PAYLOAD_SIZE {
            return Err(TorError::MalformedCell(format!(
                "Payload of {} bytes exceeds {}",
                data.len(),
                PAYLOAD_SIZE
            )));
        }
        let mut payload = [0u8; PAYLOAD_SIZE];
        payload[..data.len()].copy_from_slice(data);
        Ok(Self {
            circuit_id,
            command,
            payload,
        })
    }

    /// DESTROY cell carrying a reason byte
    pub fn destroy(circuit_id: u16, reason: u8) -> Self {
        let mut payload = [0u8; PAYLOAD_SIZE];
        payload[0] = reason;
        Self {
            circuit_id,
            command: CellCommand::Destroy,
            payload,
        }
    }

    /// Empty PADDING cell
    pub fn padding(circuit_id: u16) -> Self {
        Self {
            circuit_id,
            command: CellCommand::Padding,
            payload: [0u8; PAYLOAD_SIZE],
        }
    }

    /// Serialize cell to bytes
    pub fn to_bytes(&self) -> [u8; CELL_SIZE] {
        let mut buf = [0u8; CELL_SIZE];
        buf[0..2].copy_from_slice(&self.circuit_id.to_be_bytes());
        buf[2] = self.command as u8;
        buf[3..].copy_from_slice(&self.payload);
        buf
    }

    /// Parse cell from bytes without touching the payload
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < CELL_SIZE {
            return Err(TorError::TruncatedRead {
                got: data.len(),
                expected: CELL_SIZE,
            });
        }

        let circuit_id = peek_circuit_id(data)?;
        let command = CellCommand::from_u8(data[2])
            .ok_or_else(|| TorError::MalformedCell(format!("Unknown command: {}", data[2])))?;

        let mut payload = [0u8; PAYLOAD_SIZE];
        payload.copy_from_slice(&data[3..CELL_SIZE]);

        Ok(Self {
            circuit_id,
            command,
            payload,
        })
    }
}

impl fmt::Debug for FixedCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedCell")
            .field("circuit_id", &self.circuit_id)
            .field("command", &self.command)
            .field("payload", &format_args!("{:02x?}..", &self.payload[..16]))
            .finish()
    }
}

/// Relay cell (payload within a RELAY cell)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    /// Relay command
    pub command: RelayCommand,

    /// Recognized (always 0 for outgoing)
    pub recognized: u16,

    /// Stream ID (0 for circuit-level commands)
    pub stream_id: u16,

    /// Digest (4 bytes)
    pub digest: [u8; 4],

    /// Data (up to 498 bytes); its length is the wire `length` field
    pub data: Vec<u8>,
}

impl RelayCell {
    /// Maximum data size in relay cell
    pub const MAX_DATA_SIZE: usize = PAYLOAD_SIZE - RELAY_HEADER_SIZE;

    /// Create a new relay cell
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            data,
        }
    }

    /// Length field as it appears on the wire
    pub fn length(&self) -> u16 {
        self.data.len() as u16
    }

    /// Serialize relay cell to a cell payload
    pub fn encode_payload(&self) -> Result<[u8; PAYLOAD_SIZE]> {
        if self.data.len() > Self::MAX_DATA_SIZE {
            return Err(TorError::MalformedCell(format!(
                "Relay data of {} bytes exceeds {}",
                self.data.len(),
                Self::MAX_DATA_SIZE
            )));
        }

        let mut buf = [0u8; PAYLOAD_SIZE];
        buf[0] = self.command as u8;
        buf[RECOGNIZED_RANGE].copy_from_slice(&self.recognized.to_be_bytes());
        buf[3..5].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[DIGEST_RANGE].copy_from_slice(&self.digest);
        buf[9..11].copy_from_slice(&self.length().to_be_bytes());
        buf[RELAY_HEADER_SIZE..RELAY_HEADER_SIZE + self.data.len()].copy_from_slice(&self.data);
        Ok(buf)
    }

    /// Parse relay cell from a (decrypted) cell payload
    pub fn decode_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < PAYLOAD_SIZE {
            return Err(TorError::TruncatedRead {
                got: payload.len(),
                expected: PAYLOAD_SIZE,
            });
        }

        let command = RelayCommand::from_u8(payload[0]).ok_or_else(|| {
            TorError::MalformedCell(format!("Unknown relay command: {}", payload[0]))
        })?;

        let recognized = u16::from_be_bytes([payload[1], payload[2]]);
        let stream_id = u16::from_be_bytes([payload[3], payload[4]]);
        let digest = [payload[5], payload[6], payload[7], payload[8]];
        let length = u16::from_be_bytes([payload[9], payload[10]]) as usize;

        if length > Self::MAX_DATA_SIZE {
            return Err(TorError::MalformedCell(format!(
                "Relay length {} exceeds {}",
                length,
                Self::MAX_DATA_SIZE
            )));
        }

        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            data: payload[RELAY_HEADER_SIZE..RELAY_HEADER_SIZE + length].to_vec(),
        })
    }
}

/// A decoded cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    /// Any cell other than RELAY
    Control(FixedCell),
    /// A RELAY cell after its onion layers were removed
    Relay {
        circuit_id: u16,
        /// Index of the hop that originated the cell
        hop: usize,
        cell: RelayCell,
    },
}

impl Cell {
    pub fn circuit_id(&self) -> u16 {
        match self {
            Cell::Control(fixed) => fixed.circuit_id,
            Cell::Relay { circuit_id, .. } => *circuit_id,
        }
    }
}

/// Read the circuit id of a raw cell
pub fn peek_circuit_id(data: &[u8]) -> Result<u16> {
    if data.len() < 2 {
        return Err(TorError::TruncatedRead {
            got: data.len(),
            expected: CELL_SIZE,
        });
    }
    Ok(u16::from_be_bytes([data[0], data[1]]))
}

/// Serialize a cell. Relay payloads are written in the clear; onion
/// encryption is the circuit's job.
pub fn encode_cell(cell: &Cell) -> Result<[u8; CELL_SIZE]> {
    match cell {
        Cell::Control(fixed) => Ok(fixed.to_bytes()),
        Cell::Relay {
            circuit_id, cell, ..
        } => {
            let fixed = FixedCell {
                circuit_id: *circuit_id,
                command: CellCommand::Relay,
                payload: cell.encode_payload()?,
            };
            Ok(fixed.to_bytes())
        }
    }
}

/// Parse a cell. A RELAY payload is handed to `decryptor` before its
/// sub-fields are read; without a decryptor it is parsed as-is (hop 0).
pub fn decode_cell(data: &[u8], decryptor: Option<&dyn RelayDecrypt>) -> Result<Cell> {
    let mut fixed = FixedCell::from_bytes(data)?;
    if fixed.command != CellCommand::Relay {
        return Ok(Cell::Control(fixed));
    }

    let hop = match decryptor {
        Some(d) => d.decrypt_payload(&mut fixed.payload)?,
        None => 0,
    };
    let cell = RelayCell::decode_payload(&fixed.payload)?;
    Ok(Cell::Relay {
        circuit_id: fixed.circuit_id,
        hop,
        cell,
    })
}
