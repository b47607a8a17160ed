//! Capture session: one pcap file per synchronized call.
//!
//! Records use the layout established by the original com-on-air tooling so
//! existing Wireshark dissectors keep working: a 100-byte scratch frame with
//! a `0x23 0x23` marker, channel/slot/RSSI header bytes and the raw 53-byte
//! payload, truncated to 73 bytes on disk.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use pcap_file::DataLink;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::{SyncFrame, PAYLOAD_LEN};
use crate::rfpi::Rfpi;

/// On-disk bytes per record (declared and captured length).
pub const RECORD_LEN: usize = 73;

/// Size of the scratch buffer a record is assembled in.
const FRAME_BUF_LEN: usize = 100;

/// Byte offsets within a record.
const OFF_MAGIC: usize = 12;
const OFF_DIRECTION: usize = 14;
const OFF_CHANNEL: usize = 15;
const OFF_SLOT: usize = 17;
const OFF_RSSI: usize = 19;
const OFF_PAYLOAD: usize = 20;

const MAGIC: [u8; 2] = [0x23, 0x23];

/// One decoded capture record. Mirrors the wire layout; used for encoding
/// on the write path and parsing when reading dumps back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRecord {
    pub channel: u8,
    pub slot: u8,
    pub rssi: u8,
    pub payload: [u8; PAYLOAD_LEN],
}

impl CaptureRecord {
    pub fn from_frame(frame: &SyncFrame) -> Self {
        Self {
            channel: frame.channel,
            slot: frame.slot,
            rssi: frame.rssi,
            payload: frame.payload,
        }
    }

    /// Serialize into the fixed capture layout. Only the first
    /// [`RECORD_LEN`] bytes are written to disk.
    pub fn to_bytes(&self) -> [u8; FRAME_BUF_LEN] {
        let mut buf = [0u8; FRAME_BUF_LEN];
        buf[OFF_MAGIC..OFF_MAGIC + 2].copy_from_slice(&MAGIC);
        buf[OFF_DIRECTION] = 0x00; // receive direction
        buf[OFF_CHANNEL] = self.channel;
        buf[OFF_SLOT] = self.slot;
        buf[OFF_RSSI] = self.rssi;
        buf[OFF_PAYLOAD..OFF_PAYLOAD + PAYLOAD_LEN].copy_from_slice(&self.payload);
        buf
    }

    /// Parse a record read back from a dump. Returns `None` if the data is
    /// too short or the marker is missing.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < RECORD_LEN || data[OFF_MAGIC..OFF_MAGIC + 2] != MAGIC {
            return None;
        }
        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&data[OFF_PAYLOAD..OFF_PAYLOAD + PAYLOAD_LEN]);
        Some(Self {
            channel: data[OFF_CHANNEL],
            slot: data[OFF_SLOT],
            rssi: data[OFF_RSSI],
            payload,
        })
    }
}

/// Derive the dump base name (no extension) from the sync time and target.
pub fn dump_base_name(rfpi: &Rfpi, now: DateTime<Utc>) -> String {
    let stamp = now.with_timezone(&Local).format("%Y-%m-%d_%H_%M_%S");
    let b = rfpi.as_bytes();
    format!(
        "dump_{}_RFPI_{:02x}_{:02x}_{:02x}_{:02x}_{:02x}",
        stamp, b[0], b[1], b[2], b[3], b[4]
    )
}

/// An open pcap dump for one synchronized call. At most one session exists
/// at a time; the engine enforces that through mode exclusivity.
pub struct CaptureSession {
    /// Base path without extension; audio sinks derive their names from it.
    base: PathBuf,
    writer: Option<PcapWriter<BufWriter<File>>>,
    records: u64,
}

impl CaptureSession {
    /// Create the pcap file under `dir` and write its header.
    pub fn open(dir: &Path, rfpi: &Rfpi, now: DateTime<Utc>) -> Result<Self> {
        let base = dir.join(dump_base_name(rfpi, now));
        let path = base.with_extension("pcap");

        let file = File::create(&path)
            .with_context(|| format!("couldn't create dump file {:?}", path))?;
        let header = PcapHeader {
            snaplen: RECORD_LEN as u32,
            datalink: DataLink::ETHERNET,
            ..Default::default()
        };
        let writer = PcapWriter::with_header(BufWriter::new(file), header)
            .with_context(|| format!("couldn't write pcap header to {:?}", path))?;

        tracing::info!("dumping to {:?}", path);
        Ok(Self {
            base,
            writer: Some(writer),
            records: 0,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    pub fn records_written(&self) -> u64 {
        self.records
    }

    /// Append one synchronized frame, stamped with its arrival time.
    pub fn append(&mut self, frame: &SyncFrame, ts: DateTime<Utc>) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(()); // closed; nothing to write to
        };
        let buf = CaptureRecord::from_frame(frame).to_bytes();
        let timestamp = Duration::new(
            ts.timestamp().max(0) as u64,
            ts.timestamp_subsec_nanos(),
        );
        let packet = PcapPacket::new(timestamp, RECORD_LEN as u32, &buf[..RECORD_LEN]);
        writer
            .write_packet(&packet)
            .context("couldn't append capture record")?;
        self.records += 1;
        Ok(())
    }

    /// Flush and release the file. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(writer) = self.writer.take() {
            let mut inner = writer.into_writer();
            if let Err(e) = inner.flush() {
                tracing::warn!("flush of capture file failed: {}", e);
            }
            tracing::info!("closed capture ({} records)", self.records);
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.close();
    }
}
