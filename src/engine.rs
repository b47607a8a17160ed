//! The scan/track/capture engine.
//!
//! Owns every piece of run state: operating mode, channel hopper, station
//! registry, ignore list, autorec policy and the capture session. All of it
//! is driven from the event loop's thread — commands, device frames and the
//! once-per-second tick all arrive through the methods below, so no locking
//! exists anywhere in here.
//!
//! Operator-facing output goes to stdout with the traditional `###` / `!!!`
//! prefixes; diagnostics go through `tracing`.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Local, Utc};
use std::path::PathBuf;

use crate::audio::{AudioPipeline, PlaybackSink};
use crate::capture::CaptureSession;
use crate::device::{
    DeviceControl, DeviceMode, FrameSource, ScanFrame, SyncFrame, SCAN_FRAME_LEN, SYNC_FRAME_LEN,
};
use crate::rfpi::Rfpi;
use crate::station::{IgnoreSet, Sighting, StationKind, StationRegistry};
use crate::storage::Config;

/// Current operating mode. Exactly one is active; transitions are
/// synchronous and always go through the engine methods so the device mode
/// can never drift from ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Stopped,
    /// Scanning for basestation beacons (fpscan).
    FpScan,
    /// Scanning for active calls (callscan).
    CallScan,
    /// Synchronized on one call.
    PpScan { target: Rfpi },
    /// Reserved; the hardware supports it but the command is not wired up.
    #[allow(dead_code)]
    Jam,
}

impl Mode {
    /// Modes in which the channel hopper may advance.
    fn hops(&self) -> bool {
        !matches!(self, Mode::Stopped)
    }
}

pub struct Engine<D> {
    device: D,
    registry: StationRegistry,
    ignored: IgnoreSet,
    mode: Mode,

    channel: u8,
    hop: bool,
    hop_interval: Duration,
    last_hop: DateTime<Utc>,

    autorec: bool,
    autorec_timeout: Duration,
    /// Last time a traffic-bearing frame was seen on the current sync.
    /// (Re)armed when sync is first confirmed, even though that frame is not
    /// itself a B-field — the sync moment doubles as a grace period and the
    /// timeout math depends on it.
    last_bfield: DateTime<Utc>,

    session: Option<CaptureSession>,
    audio: AudioPipeline,
    capture_dir: PathBuf,

    wav_dump: bool,
    ima_dump: bool,
    audio_play: bool,
    verbose: bool,

    quit: bool,
    shutdown_done: bool,
}

impl<D: DeviceControl + FrameSource> Engine<D> {
    pub fn new(
        device: D,
        config: &Config,
        playback: Option<Box<dyn PlaybackSink>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            device,
            registry: StationRegistry::new(),
            ignored: IgnoreSet::new(),
            mode: Mode::Stopped,
            channel: config.start_channel,
            hop: config.hop,
            hop_interval: Duration::seconds(config.hop_interval_secs as i64),
            last_hop: now,
            autorec: false,
            autorec_timeout: Duration::seconds(config.autorec_timeout_secs as i64),
            last_bfield: now,
            session: None,
            audio: AudioPipeline::new(config.direction, playback),
            capture_dir: config.capture_directory.clone(),
            wav_dump: config.wav_dump,
            ima_dump: config.ima_dump,
            audio_play: config.audio_play,
            verbose: config.verbose,
            quit: false,
            shutdown_done: false,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn quit_requested(&self) -> bool {
        self.quit
    }

    // ─── Command dispatch ────────────────────────────────────────────────

    /// Dispatch one operator line. Commands match on case-insensitive
    /// prefixes, so `helpme` runs `help` — same contract the original tool
    /// always had. A returned error is a failed control request and fatal.
    pub fn handle_command(&mut self, line: &str, now: DateTime<Utc>) -> Result<()> {
        let line = line.trim();

        if starts_ci(line, "help") {
            self.print_help();
        } else if starts_ci(line, "fpscan") {
            self.start_fpscan(now)?;
        } else if starts_ci(line, "callscan") {
            self.start_callscan(now)?;
        } else if starts_ci(line, "autorec") {
            self.autorec = !self.autorec;
            println!("### autorec turned {}", on_off(self.autorec));
        } else if starts_ci(line, "ppscan") {
            match line[6..].parse::<Rfpi>() {
                Ok(rfpi) => self.start_ppscan(rfpi, now)?,
                Err(_) => println!("!!! please enter a valid RFPI (e.g. 00 01 02 03 04)"),
            }
        } else if starts_ci(line, "chan") {
            match parse_number(&line[4..]) {
                Some(ch) if ch <= 9 => {
                    self.channel = ch;
                    self.set_channel(now)?;
                }
                _ => println!("!!! please enter a valid channel number [0-9]"),
            }
        } else if starts_ci(line, "slot") {
            match parse_number(&line[4..]) {
                Some(slot) if slot <= 23 => println!("!!! not yet implemented :("),
                _ => println!("!!! please enter a valid slot number [0-23]"),
            }
        } else if starts_ci(line, "jam") {
            println!("!!! not yet implemented :(");
        } else if starts_ci(line, "ignore") {
            match line[6..].parse::<Rfpi>() {
                Ok(rfpi) => {
                    if self.ignored.toggle(rfpi) {
                        println!("### ignoring RFPI {}", rfpi);
                    } else {
                        println!("### no longer ignoring RFPI {}", rfpi);
                    }
                }
                Err(_) => println!("!!! please enter a valid RFPI (e.g. 00 01 02 03 04)"),
            }
        } else if starts_ci(line, "dump") {
            self.dump();
        } else if starts_ci(line, "hop") {
            self.hop = !self.hop;
            println!("### channel hopping turned {}", on_off(self.hop));
        } else if starts_ci(line, "audio") {
            self.audio_play = !self.audio_play;
            println!("### audio playing turned {}", on_off(self.audio_play));
        } else if starts_ci(line, "direction") {
            let direction = self.audio.direction().toggled();
            self.audio.set_direction(direction);
            println!("### audio channel playing: {}", direction.label());
        } else if starts_ci(line, "wav") {
            self.wav_dump = !self.wav_dump;
            println!("### WAV dumping turned {}", on_off(self.wav_dump));
        } else if starts_ci(line, "ima") {
            self.ima_dump = !self.ima_dump;
            println!("### IMA dumping turned {}", on_off(self.ima_dump));
        } else if starts_ci(line, "verb") {
            self.verbose = !self.verbose;
            println!("### verbosity turned {}", on_off(self.verbose));
        } else if starts_ci(line, "stop") {
            self.stop(now)?;
        } else if starts_ci(line, "quit") {
            self.quit = true;
        } else if !line.is_empty() {
            println!("!!! no such command: {}", line);
        }

        Ok(())
    }

    fn print_help(&self) {
        println!();
        println!("   help          - this help");
        println!("   fpscan        - async scan for basestations, dump RFPIs");
        println!("   callscan      - async scan for active calls, dump RFPIs");
        println!("   autorec       - sync on any call in callscan, autodump in pcap");
        println!("   ppscan <rfpi> - sync scan for active calls");
        println!(
            "   chan <ch>     - set current channel [0-9], currently {}",
            self.channel
        );
        println!("   ignore <rfpi> - toggle ignoring of an RFPI in autorec");
        println!("   dump          - dump stations and calls we have seen");
        println!(
            "   audio         - toggle \"on the fly\" audio playing, currently {}",
            on_off(self.audio_play)
        );
        println!(
            "   direction     - toggle audio playback direction, currently {}",
            self.audio.direction().label()
        );
        println!(
            "   wav           - toggle autodump in a wav file, currently {}",
            on_off(self.wav_dump)
        );
        println!(
            "   ima           - toggle autodump in a ima file, currently {}",
            on_off(self.ima_dump)
        );
        println!(
            "   hop           - toggle channel hopping, currently {}",
            on_off(self.hop)
        );
        println!(
            "   verb          - toggle verbosity, currently {}",
            on_off(self.verbose)
        );
        println!("   stop          - stop it - whatever we were doing");
        println!("   quit          - well :)");
        println!();
    }

    // ─── Mode transitions ────────────────────────────────────────────────

    fn set_channel(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.verbose {
            println!("### switching to channel {}", self.channel);
        }
        self.device
            .set_channel(self.channel)
            .context("channel change rejected by device")?;
        self.last_hop = now;
        Ok(())
    }

    fn start_fpscan(&mut self, now: DateTime<Utc>) -> Result<()> {
        println!("### starting fpscan");
        self.device
            .set_mode(DeviceMode::ScanBases)
            .context("couldn't enter fpscan mode")?;
        self.set_channel(now)?;
        self.mode = Mode::FpScan;
        self.autorec = false;
        Ok(())
    }

    fn start_callscan(&mut self, now: DateTime<Utc>) -> Result<()> {
        println!("### starting callscan");
        self.device
            .set_mode(DeviceMode::ScanCalls)
            .context("couldn't enter callscan mode")?;
        self.set_channel(now)?;
        self.mode = Mode::CallScan;
        Ok(())
    }

    fn start_ppscan(&mut self, target: Rfpi, now: DateTime<Utc>) -> Result<()> {
        println!("### trying to sync on {}", target);
        self.device
            .set_mode(DeviceMode::Sync)
            .context("couldn't enter sync mode")?;
        self.device
            .set_rfpi(&target)
            .context("couldn't load sync target")?;
        self.set_channel(now)?;
        self.mode = Mode::PpScan { target };
        // Grace period: no B-field exists yet, but the timeout clock has to
        // start somewhere or autorec would abandon the sync immediately.
        self.last_bfield = now;
        Ok(())
    }

    /// Idle the device and close the capture session. Leaves the autorec
    /// flag alone so the policy loop can restart scanning.
    fn stop_keep_autorec(&mut self) -> Result<()> {
        if self.mode != Mode::Stopped {
            println!("### stopping");
            self.device
                .set_mode(DeviceMode::Idle)
                .context("couldn't idle the device")?;
            self.mode = Mode::Stopped;
        }
        self.close_session();
        Ok(())
    }

    fn stop(&mut self, _now: DateTime<Utc>) -> Result<()> {
        self.stop_keep_autorec()?;
        self.autorec = false;
        Ok(())
    }

    fn close_session(&mut self) {
        self.audio.close();
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }

    // ─── Frame handling ──────────────────────────────────────────────────

    /// Drain every frame the device has buffered. Called whenever the
    /// device fd polls readable; frames can arrive much faster than ticks.
    pub fn drain_device(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.mode {
            Mode::FpScan | Mode::CallScan => {
                let kind = if self.mode == Mode::FpScan {
                    StationKind::Base
                } else {
                    StationKind::Handset
                };
                let mut buf = [0u8; SCAN_FRAME_LEN];
                while self
                    .device
                    .try_read_frame(&mut buf)
                    .context("read from device failed")?
                {
                    let frame = ScanFrame::parse(&buf);
                    self.handle_scan_frame(kind, frame, now)?;
                }
            }
            Mode::PpScan { target } => {
                let mut buf = [0u8; SYNC_FRAME_LEN];
                while self
                    .device
                    .try_read_frame(&mut buf)
                    .context("read from device failed")?
                {
                    let frame = SyncFrame::parse(&buf);
                    self.handle_sync_frame(target, frame, now);
                }
            }
            Mode::Stopped | Mode::Jam => {}
        }
        Ok(())
    }

    /// One beacon sighting from fpscan/callscan. Feeds the registry and, if
    /// autorec is armed, chases the call.
    pub fn handle_scan_frame(
        &mut self,
        kind: StationKind,
        frame: ScanFrame,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.observe(Sighting {
            rfpi: frame.rfpi,
            kind,
            channel: frame.channel,
            rssi: frame.rssi,
        }, now);

        if self.autorec && !matches!(self.mode, Mode::PpScan { .. }) {
            if self.ignored.contains(&frame.rfpi) {
                if self.verbose {
                    println!("### skipping ignored RFPI {}", frame.rfpi);
                }
            } else {
                self.start_ppscan(frame.rfpi, now)?;
            }
        }
        Ok(())
    }

    /// One frame received while synchronized: keep statistics current, open
    /// the capture on first sync, track call liveness, write the record and
    /// feed the audio sinks.
    pub fn handle_sync_frame(&mut self, target: Rfpi, frame: SyncFrame, now: DateTime<Utc>) {
        self.observe(Sighting {
            rfpi: target,
            kind: StationKind::Handset,
            channel: frame.channel,
            rssi: frame.rssi,
        }, now);

        // Hopping would break the sync we just acquired.
        self.hop = false;

        if self.session.is_none() {
            match CaptureSession::open(&self.capture_dir, &target, now) {
                Ok(session) => {
                    println!("### got sync");
                    if let Err(e) = self.audio.open(
                        session.base_path(),
                        self.wav_dump,
                        self.ima_dump,
                        self.audio_play,
                    ) {
                        // Degraded capture: pcap still runs without audio.
                        println!("!!! couldn't open audio sinks: {:#}", e);
                    }
                    self.session = Some(session);
                    self.last_bfield = now;
                }
                Err(e) => {
                    // Non-fatal: keep tracking the call, retry next frame.
                    println!("!!! couldn't open capture file: {:#}", e);
                }
            }
        }

        if frame.has_b_field() {
            self.last_bfield = now;
        }

        if let Some(session) = self.session.as_mut() {
            if let Err(e) = session.append(&frame, now) {
                tracing::warn!("capture write failed: {:#}", e);
            }
        }

        self.audio.process(&frame);
    }

    fn observe(&mut self, sighting: Sighting, now: DateTime<Utc>) {
        let obs = self.registry.observe(sighting, now);
        if obs.is_new {
            println!(
                "### found new {} {} on channel {} RSSI {}",
                match sighting.kind {
                    StationKind::Base => "station",
                    StationKind::Handset => "call",
                },
                sighting.rfpi,
                sighting.channel,
                sighting.rssi
            );
        }
        if let Some((old, new)) = obs.channel_change {
            if self.verbose {
                println!(
                    "### station {} switched from channel {} to channel {}",
                    sighting.rfpi, old, new
                );
            }
        }
    }

    // ─── Periodic policy ─────────────────────────────────────────────────

    /// Run the hopper and the autorec policy. Called once per event-loop
    /// iteration whether or not any I/O happened.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.hop && self.mode.hops() && now - self.last_hop >= self.hop_interval {
            self.channel = (self.channel + 1) % 10;
            self.set_channel(now)?;
        }

        if self.autorec
            && self.mode != Mode::CallScan
            && now - self.last_bfield > self.autorec_timeout
        {
            // No B-field for too long: the call is over. There is no hangup
            // signal from the hardware, this timeout is the only way back.
            let was_synced = matches!(self.mode, Mode::PpScan { .. });
            if was_synced {
                println!("### call timed out, back to callscan");
            }
            self.stop_keep_autorec()?;
            self.start_callscan(now)?;
            if was_synced {
                self.hop = true;
            }
        }

        Ok(())
    }

    // ─── Reporting and shutdown ──────────────────────────────────────────

    /// Print everything seen this run: stations first, then calls, then the
    /// ignore list.
    pub fn dump(&self) {
        if self.registry.is_empty() {
            println!("### nothing found so far");
        } else {
            println!("### stations");
            self.dump_kind(StationKind::Base);
            println!("### calls");
            self.dump_kind(StationKind::Handset);
        }

        if !self.ignored.is_empty() {
            println!("### RFPIs ignored");
            for rfpi in self.ignored.iter() {
                println!("    {} is ignored", rfpi);
            }
        }
    }

    fn dump_kind(&self, kind: StationKind) {
        for r in self.registry.list().iter().filter(|r| r.kind == kind) {
            println!(
                "    {}  ch {}  RSSI {:5.2}  count {:4}  first {}  last {}",
                r.rfpi,
                r.channel,
                r.rssi_avg(),
                r.count_seen,
                r.first_seen.with_timezone(&Local).format("%H:%M:%S"),
                r.last_seen.with_timezone(&Local).format("%H:%M:%S"),
            );
        }
    }

    /// Orderly shutdown: idle the device, flush and close every sink, dump
    /// final state. Idempotent — `quit`, termination signals and fatal-error
    /// paths all funnel through here, possibly more than once.
    pub fn shutdown(&mut self) {
        if self.shutdown_done {
            return;
        }
        self.shutdown_done = true;

        if self.mode != Mode::Stopped {
            // Best effort: a failing control request must not keep us from
            // flushing the dumps.
            if let Err(e) = self.device.set_mode(DeviceMode::Idle) {
                tracing::error!("couldn't idle device during shutdown: {}", e);
            }
            self.mode = Mode::Stopped;
        }
        self.autorec = false;
        self.close_session();
        self.dump();
    }
}

/// Case-insensitive ASCII prefix match on bytes. Slicing the `&str` at the
/// prefix length would panic when a multi-byte character straddles it.
fn starts_ci(line: &str, prefix: &str) -> bool {
    line.as_bytes()
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix.as_bytes()))
}

/// Number parsing for command arguments: decimal, or hex with a `0x` prefix.
fn parse_number(s: &str) -> Option<u8> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn on_off(v: bool) -> &'static str {
    if v {
        "ON"
    } else {
        "OFF"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceError;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Request {
        Mode(DeviceMode),
        Channel(u8),
        Target(Rfpi),
    }

    /// Recording device: logs every control request, serves queued frames.
    #[derive(Default)]
    struct MockDevice {
        requests: Vec<Request>,
        frames: VecDeque<Vec<u8>>,
        fail_control: bool,
    }

    impl DeviceControl for MockDevice {
        fn set_mode(&mut self, mode: DeviceMode) -> Result<(), DeviceError> {
            if self.fail_control {
                return Err(DeviceError::SetMode(std::io::Error::other("nak")));
            }
            self.requests.push(Request::Mode(mode));
            Ok(())
        }

        fn set_channel(&mut self, channel: u8) -> Result<(), DeviceError> {
            if self.fail_control {
                return Err(DeviceError::SetChannel(std::io::Error::other("nak")));
            }
            self.requests.push(Request::Channel(channel));
            Ok(())
        }

        fn set_rfpi(&mut self, rfpi: &Rfpi) -> Result<(), DeviceError> {
            if self.fail_control {
                return Err(DeviceError::SetRfpi(std::io::Error::other("nak")));
            }
            self.requests.push(Request::Target(*rfpi));
            Ok(())
        }
    }

    impl FrameSource for MockDevice {
        fn try_read_frame(&mut self, buf: &mut [u8]) -> std::io::Result<bool> {
            match self.frames.pop_front() {
                Some(frame) if frame.len() == buf.len() => {
                    buf.copy_from_slice(&frame);
                    Ok(true)
                }
                Some(_) => Ok(false),
                None => Ok(false),
            }
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default_for(&std::env::temp_dir().join("dectcap-test"));
        config.capture_directory = std::env::temp_dir();
        config.autorec_timeout_secs = 10;
        config
    }

    fn engine() -> Engine<MockDevice> {
        Engine::new(MockDevice::default(), &test_config(), None, Utc::now())
    }

    fn rfpi() -> Rfpi {
        Rfpi([0xaa, 0xbb, 0xcc, 0xdd, 0xee])
    }

    fn scan_frame(channel: u8, rssi: u8) -> ScanFrame {
        ScanFrame {
            channel,
            rssi,
            rfpi: rfpi(),
        }
    }

    fn sync_frame_bytes(slot: u8, b_field: bool) -> Vec<u8> {
        let mut buf = vec![0u8; SYNC_FRAME_LEN];
        buf[1] = slot;
        // payload[5]: reserved low nibble 0x0e means "no B-field"
        buf[8] = if b_field { 0x00 } else { 0x0e };
        buf
    }

    #[test]
    fn test_every_mode_reachable_from_stopped() {
        let now = Utc::now();

        let mut e = engine();
        e.handle_command("fpscan", now).unwrap();
        assert_eq!(e.mode(), Mode::FpScan);
        assert_eq!(
            e.device.requests[0],
            Request::Mode(DeviceMode::ScanBases)
        );
        e.handle_command("stop", now).unwrap();
        assert_eq!(e.mode(), Mode::Stopped);

        e.handle_command("callscan", now).unwrap();
        assert_eq!(e.mode(), Mode::CallScan);
        e.handle_command("stop", now).unwrap();

        e.handle_command("ppscan aa:bb:cc:dd:ee", now).unwrap();
        assert_eq!(e.mode(), Mode::PpScan { target: rfpi() });
        // sync transition: mode, target rfpi, channel
        assert!(e.device.requests.contains(&Request::Mode(DeviceMode::Sync)));
        assert!(e.device.requests.contains(&Request::Target(rfpi())));
        e.handle_command("stop", now).unwrap();
        assert_eq!(e.mode(), Mode::Stopped);
    }

    #[test]
    fn test_commands_match_case_insensitive_prefixes() {
        let now = Utc::now();
        let mut e = engine();
        e.handle_command("FPSCAN", now).unwrap();
        assert_eq!(e.mode(), Mode::FpScan);
        e.handle_command("STOPnow", now).unwrap();
        assert_eq!(e.mode(), Mode::Stopped);
        e.handle_command("QuIt", now).unwrap();
        assert!(e.quit_requested());
    }

    #[test]
    fn test_bad_input_is_rejected_without_state_change() {
        let now = Utc::now();
        let mut e = engine();
        e.handle_command("chan 12", now).unwrap();
        e.handle_command("chan x", now).unwrap();
        e.handle_command("ppscan zz", now).unwrap();
        e.handle_command("frobnicate", now).unwrap();
        assert_eq!(e.mode(), Mode::Stopped);
        assert!(e.device.requests.is_empty());
    }

    #[test]
    fn test_non_ascii_input_is_rejected_without_panic() {
        let now = Utc::now();
        let mut e = engine();
        // multi-byte char straddling the "help" prefix length
        e.handle_command("hel\u{e9}", now).unwrap();
        e.handle_command("\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}", now).unwrap();
        e.handle_command("ppscan \u{e9}\u{e9}", now).unwrap();
        assert_eq!(e.mode(), Mode::Stopped);
        assert!(e.device.requests.is_empty());
    }

    #[test]
    fn test_chan_accepts_hex_prefix() {
        let now = Utc::now();
        let mut e = engine();
        e.handle_command("chan 0x7", now).unwrap();
        assert_eq!(e.channel, 7);
        assert_eq!(e.device.requests, vec![Request::Channel(7)]);

        // out of range either way
        e.device.requests.clear();
        e.handle_command("chan 0x0a", now).unwrap();
        assert!(e.device.requests.is_empty());
    }

    #[test]
    fn test_fpscan_clears_autorec() {
        let now = Utc::now();
        let mut e = engine();
        e.handle_command("autorec", now).unwrap();
        assert!(e.autorec);
        e.handle_command("fpscan", now).unwrap();
        assert!(!e.autorec);
    }

    #[test]
    fn test_control_failure_is_fatal() {
        let now = Utc::now();
        let mut e = engine();
        e.device.fail_control = true;
        assert!(e.handle_command("callscan", now).is_err());
    }

    #[test]
    fn test_hopper_advances_mod_10() {
        let now = Utc::now();
        let mut e = engine();
        e.channel = 9;
        e.handle_command("callscan", now).unwrap();
        e.device.requests.clear();

        // interval not yet elapsed
        e.tick(now).unwrap();
        assert!(e.device.requests.is_empty());

        let later = now + Duration::seconds(1);
        e.tick(later).unwrap();
        assert_eq!(e.channel, 0);
        assert_eq!(e.device.requests, vec![Request::Channel(0)]);

        // hop timer was reset; next advance needs another full interval
        e.tick(later).unwrap();
        assert_eq!(e.channel, 0);
    }

    #[test]
    fn test_hopper_idle_when_stopped_or_disabled() {
        let now = Utc::now();
        let mut e = engine();
        let later = now + Duration::seconds(5);
        e.tick(later).unwrap();
        assert!(e.device.requests.is_empty());

        e.handle_command("callscan", now).unwrap();
        e.handle_command("hop", now).unwrap(); // off
        e.device.requests.clear();
        e.tick(later).unwrap();
        assert!(e.device.requests.is_empty());
    }

    #[test]
    fn test_autorec_chases_new_handset() {
        let now = Utc::now();
        let mut e = engine();
        e.handle_command("callscan", now).unwrap();
        e.handle_command("autorec", now).unwrap();

        e.handle_scan_frame(StationKind::Handset, scan_frame(2, 30), now)
            .unwrap();
        assert_eq!(e.mode(), Mode::PpScan { target: rfpi() });
    }

    #[test]
    fn test_autorec_skips_ignored_rfpi() {
        let now = Utc::now();
        let mut e = engine();
        e.handle_command("ignore aa:bb:cc:dd:ee", now).unwrap();
        e.handle_command("callscan", now).unwrap();
        e.handle_command("autorec", now).unwrap();

        e.handle_scan_frame(StationKind::Handset, scan_frame(2, 30), now)
            .unwrap();
        // no pursuit, but the sighting is still recorded
        assert_eq!(e.mode(), Mode::CallScan);
        assert_eq!(e.registry.list().len(), 1);
    }

    #[test]
    fn test_autorec_off_does_not_chase() {
        let now = Utc::now();
        let mut e = engine();
        e.handle_command("callscan", now).unwrap();
        e.handle_scan_frame(StationKind::Handset, scan_frame(2, 30), now)
            .unwrap();
        assert_eq!(e.mode(), Mode::CallScan);
    }

    #[test]
    fn test_sync_suspends_hopping_and_opens_session() {
        let now = Utc::now();
        let mut e = engine();
        e.handle_command("ppscan aa:bb:cc:dd:ee", now).unwrap();
        assert!(e.hop);

        e.device.frames.push_back(sync_frame_bytes(0, true));
        e.drain_device(now).unwrap();

        assert!(!e.hop);
        assert!(e.session.is_some());
        assert_eq!(e.session.as_ref().unwrap().records_written(), 1);
        e.close_session();
    }

    #[test]
    fn test_every_sync_frame_is_recorded_liveness_tracks_b_fields() {
        // 5 frames, 2 with a B-field: 5 records written, last_bfield at the
        // later marker-bearing frame.
        let t0 = Utc::now();
        let mut e = engine();
        e.handle_command("ppscan aa:bb:cc:dd:ee", t0).unwrap();

        let with_b = [false, true, false, true, false];
        let mut t_marker = t0;
        for (i, &b) in with_b.iter().enumerate() {
            let t = t0 + Duration::milliseconds(10 * (i as i64 + 1));
            e.device.frames.push_back(sync_frame_bytes(i as u8, b));
            e.drain_device(t).unwrap();
            if b {
                t_marker = t;
            }
        }

        assert_eq!(e.session.as_ref().unwrap().records_written(), 5);
        assert_eq!(e.last_bfield, t_marker);
        e.close_session();
    }

    #[test]
    fn test_idle_timeout_returns_to_callscan() {
        let t0 = Utc::now();
        let mut e = engine();
        e.handle_command("autorec", t0).unwrap();
        e.handle_command("ppscan aa:bb:cc:dd:ee", t0).unwrap();
        e.device.frames.push_back(sync_frame_bytes(0, false));
        e.drain_device(t0).unwrap();
        assert!(e.session.is_some());
        assert!(!e.hop);

        // strictly within the timeout: stay synced
        let before = t0 + Duration::seconds(10);
        e.tick(before).unwrap();
        assert!(matches!(e.mode(), Mode::PpScan { .. }));

        // past the timeout: session closed, scanning resumes, hop re-enabled
        let after = t0 + Duration::seconds(11);
        e.tick(after).unwrap();
        assert_eq!(e.mode(), Mode::CallScan);
        assert!(e.session.is_none());
        assert!(e.hop);
    }

    #[test]
    fn test_autorec_toggle_off_keeps_current_sync() {
        let t0 = Utc::now();
        let mut e = engine();
        e.handle_command("autorec", t0).unwrap();
        e.handle_command("ppscan aa:bb:cc:dd:ee", t0).unwrap();
        e.handle_command("autorec", t0).unwrap(); // off again
        assert!(matches!(e.mode(), Mode::PpScan { .. }));
        // without autorec nothing times the call out
        e.tick(t0 + Duration::seconds(60)).unwrap();
        assert!(matches!(e.mode(), Mode::PpScan { .. }));
    }

    #[test]
    fn test_stop_closes_session() {
        let t0 = Utc::now();
        let mut e = engine();
        e.handle_command("ppscan aa:bb:cc:dd:ee", t0).unwrap();
        e.device.frames.push_back(sync_frame_bytes(0, true));
        e.drain_device(t0).unwrap();
        assert!(e.session.is_some());

        e.handle_command("stop", t0).unwrap();
        assert_eq!(e.mode(), Mode::Stopped);
        assert!(e.session.is_none());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let t0 = Utc::now();
        let mut e = engine();
        e.handle_command("callscan", t0).unwrap();
        e.shutdown();
        assert_eq!(e.mode(), Mode::Stopped);
        let requests = e.device.requests.len();
        e.shutdown();
        assert_eq!(e.device.requests.len(), requests);
    }
}
