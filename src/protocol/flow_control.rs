//! Tor SENDME Flow Control
//!
//! One window algorithm serves both circuits and streams.
//!
//! ## How It Works:
//!
//! 1. **Deliver window:** starts at `start_level`, decrements on each
//!    accounted inbound cell
//! 2. **SENDME:** once the window falls to `start_level - increment`, the
//!    owner emits SENDME and, if that succeeded, credits `increment`; a
//!    failed SENDME is retried on the next cell
//! 3. **Package window:** decrements on each DATA cell we send, grows by
//!    `increment` on each SENDME we receive; it is tracked and logged but
//!    never blocks a sender
//!
//! ## Window Values:
//!
//! - **Circuit:** 1000 cells, increment 100 (one SENDME per established hop)
//! - **Stream:** 500 cells, increment 50 (end-to-end)

use crate::config::CircuitConfig;

/// Result of accounting one inbound cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAction {
    /// Nothing to send
    None,
    /// The owner must emit SENDME now
    SendSendme,
}

/// SENDME window shared by circuits and streams
#[derive(Debug, Clone)]
pub struct FlowWindow {
    /// Cells we may still receive before the peer expects a SENDME
    window: i32,

    /// Cells we may still send before the peer owes us a SENDME
    package_window: i32,

    start_level: i32,
    increment: i32,
}

impl FlowWindow {
    /// Initial circuit window size (1000 cells)
    pub const CIRCUIT_START: u32 = 1000;

    /// Circuit window increment per SENDME (100 cells)
    pub const CIRCUIT_INCREMENT: u32 = 100;

    /// Initial stream window size (500 cells)
    pub const STREAM_START: u32 = 500;

    /// Stream window increment per SENDME (50 cells)
    pub const STREAM_INCREMENT: u32 = 50;

    pub fn new(start_level: u32, increment: u32) -> Self {
        let start_level = start_level.min(i32::MAX as u32) as i32;
        let increment = (increment.min(i32::MAX as u32) as i32).clamp(1, start_level.max(1));
        Self {
            window: start_level,
            package_window: start_level,
            start_level,
            increment,
        }
    }

    /// Window for a circuit, from configuration
    pub fn circuit(config: &CircuitConfig) -> Self {
        Self::new(config.circuit_window_start, config.circuit_window_increment)
    }

    /// Window for a stream, from configuration
    pub fn stream(config: &CircuitConfig) -> Self {
        Self::new(config.stream_window_start, config.stream_window_increment)
    }

    /// Account one inbound cell
    pub fn on_cell(&mut self) -> WindowAction {
        self.window -= 1;
        if self.window <= self.start_level - self.increment {
            WindowAction::SendSendme
        } else {
            WindowAction::None
        }
    }

    /// Credit the window after a SENDME went out
    pub fn credit(&mut self) {
        self.window += self.increment;
    }

    /// Account one outbound DATA cell
    pub fn on_sent(&mut self) {
        self.package_window -= 1;
        if self.package_window == 0 {
            log::debug!("Package window exhausted; peer has not sent SENDME yet");
        }
    }

    /// Credit the package window for an inbound SENDME
    pub fn on_sendme_received(&mut self) {
        self.package_window += self.increment;
        log::trace!("Package window: {} (+{})", self.package_window, self.increment);
    }

    pub fn window(&self) -> i32 {
        self.window
    }

    pub fn package_window(&self) -> i32 {
        self.package_window
    }

    pub fn increment(&self) -> i32 {
        self.increment
    }
}

impl Default for FlowWindow {
    fn default() -> Self {
        Self::new(Self::CIRCUIT_START, Self::CIRCUIT_INCREMENT)
    }
}
