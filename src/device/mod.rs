//! Device port: control requests and frame formats of the sniffer hardware.
//!
//! The com-on-air driver exposes a character device. Control is a handful of
//! ioctls (mode, channel, sync-target RFPI); data is fixed-size frames read
//! from the same fd. This module defines the control trait the engine talks
//! to and the two frame shapes the driver delivers; `coa` holds the real
//! ioctl-backed implementation.

mod coa;

pub use coa::CoaDevice;

use thiserror::Error;

use crate::rfpi::Rfpi;

/// Length of one scan-mode frame: channel, RSSI, 5-byte RFPI.
pub const SCAN_FRAME_LEN: usize = 7;

/// Length of one synchronized-mode frame: channel, slot, RSSI, 53-byte payload.
pub const SYNC_FRAME_LEN: usize = 3 + PAYLOAD_LEN;

/// Payload bytes carried per synchronized frame (A-field + B-field).
pub const PAYLOAD_LEN: usize = 53;

/// Sniffer operating mode selected via the set-mode control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    /// Receiver idle.
    Idle,
    /// Sniff submode: scan for basestation beacons.
    ScanBases,
    /// Sniff submode: scan for active calls.
    ScanCalls,
    /// Sniff submode: synchronize on one RFPI.
    Sync,
}

/// A control request was rejected by the driver. Always fatal to the
/// caller: after a failed request the hardware state is unknown.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("set-mode request failed: {0}")]
    SetMode(#[source] std::io::Error),
    #[error("set-channel request failed: {0}")]
    SetChannel(#[source] std::io::Error),
    #[error("set-rfpi request failed: {0}")]
    SetRfpi(#[source] std::io::Error),
}

/// Control surface of the sniffer peripheral. Request/acknowledge only, no
/// retry semantics — the engine treats any failure as fatal.
pub trait DeviceControl {
    fn set_mode(&mut self, mode: DeviceMode) -> Result<(), DeviceError>;
    fn set_channel(&mut self, channel: u8) -> Result<(), DeviceError>;
    fn set_rfpi(&mut self, rfpi: &Rfpi) -> Result<(), DeviceError>;
}

/// Frame side of the device. `try_read_frame` fills `buf` with exactly one
/// frame and returns `true`, or returns `false` when no complete frame is
/// buffered. An `Err` is a source-level failure and shuts the process down.
pub trait FrameSource {
    fn try_read_frame(&mut self, buf: &mut [u8]) -> std::io::Result<bool>;
}

/// One frame delivered while scanning (fpscan/callscan).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanFrame {
    pub channel: u8,
    pub rssi: u8,
    pub rfpi: Rfpi,
}

impl ScanFrame {
    pub fn parse(buf: &[u8; SCAN_FRAME_LEN]) -> Self {
        let mut rfpi = [0u8; 5];
        rfpi.copy_from_slice(&buf[2..7]);
        Self {
            channel: buf[0],
            rssi: buf[1],
            rfpi: Rfpi(rfpi),
        }
    }
}

/// One frame delivered while synchronized on a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncFrame {
    pub channel: u8,
    pub slot: u8,
    pub rssi: u8,
    pub payload: [u8; PAYLOAD_LEN],
}

impl SyncFrame {
    pub fn parse(buf: &[u8; SYNC_FRAME_LEN]) -> Self {
        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&buf[3..]);
        Self {
            channel: buf[0],
            slot: buf[1],
            rssi: buf[2],
            payload,
        }
    }

    /// Whether this frame carries a B-field (voice data). The A-field header
    /// announces "no B-field" with the reserved 0x0e pattern in the low
    /// nibble of byte 5; anything else means traffic is present.
    pub fn has_b_field(&self) -> bool {
        (self.payload[5] & 0x0e) != 0x0e
    }
}
