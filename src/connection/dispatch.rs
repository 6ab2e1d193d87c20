//! Cell reassembly
//!
//! Transports hand over byte chunks of any size. The dispatcher buffers
//! partial cells across chunks and yields whole 512-byte cells in order.

use crate::protocol::CELL_SIZE;

#[derive(Debug, Default)]
pub struct Dispatcher {
    pending: Vec<u8>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and drain every complete cell
    pub fn push(&mut self, bytes: &[u8]) -> Vec<[u8; CELL_SIZE]> {
        self.pending.extend_from_slice(bytes);

        let complete = self.pending.len() / CELL_SIZE;
        let mut cells = Vec::with_capacity(complete);
        for chunk in self.pending.chunks_exact(CELL_SIZE) {
            let mut cell = [0u8; CELL_SIZE];
            cell.copy_from_slice(chunk);
            cells.push(cell);
        }
        self.pending.drain(..complete * CELL_SIZE);
        cells
    }

    /// Bytes of an incomplete cell still waiting for the rest
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}
