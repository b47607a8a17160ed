//! Configuration storage.
//!
//! Application data lives under `~/.config/dectcap/`:
//!
//! ```text
//! ~/.config/dectcap/
//!   config.ini          — startup defaults for flags and timers
//! ```
//!
//! Capture files (.pcap / .wav / .ima) are written to the configured
//! capture directory (default: the current working directory, the way the
//! original tooling behaved). The station registry is in-memory only and is
//! dumped to stdout at exit.

use anyhow::{Context, Result};
use configparser::ini::Ini;
use std::fs;
use std::path::PathBuf;

use crate::audio::Direction;

/// Startup configuration loaded from `~/.config/dectcap/config.ini`.
/// Everything here is also reachable at runtime through the operator
/// commands; nothing is written back on exit.
#[derive(Debug, Clone)]
pub struct Config {
    // [general]
    /// Directory capture files are written to.
    pub capture_directory: PathBuf,
    /// Start with verbose operator output.
    pub verbose: bool,

    // [device]
    /// Path of the com-on-air character device.
    pub device_path: PathBuf,
    /// Channel to start on (0-9).
    pub start_channel: u8,
    /// Start with channel hopping enabled.
    pub hop: bool,
    /// Seconds between channel hops.
    pub hop_interval_secs: u64,

    // [autorec]
    /// Seconds without a B-field before a synced call counts as ended.
    pub autorec_timeout_secs: u64,

    // [audio]
    /// Dump decoded audio to a .wav next to the pcap.
    pub wav_dump: bool,
    /// Dump the raw ADPCM stream to a .ima next to the pcap.
    pub ima_dump: bool,
    /// Forward decoded audio to the playback sink while synced.
    pub audio_play: bool,
    /// Which call direction feeds the audio sinks.
    pub direction: Direction,
}

impl Config {
    /// Defaults matching the original tool: hop on channel 0 every second,
    /// 10 s autorec timeout, wav + playback on, ima off, handset side.
    pub fn default_for(_config_dir: &PathBuf) -> Self {
        Self {
            capture_directory: PathBuf::from("."),
            verbose: false,
            device_path: PathBuf::from("/dev/coa"),
            start_channel: 0,
            hop: true,
            hop_interval_secs: 1,
            autorec_timeout_secs: 10,
            wav_dump: true,
            ima_dump: false,
            audio_play: true,
            direction: Direction::Pp,
        }
    }

    /// Load config from an INI file, falling back to defaults for missing keys.
    fn load_from_ini(path: &std::path::Path, config_dir: &PathBuf) -> Result<Self> {
        let mut ini = Ini::new();
        ini.load(path)
            .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

        let defaults = Config::default_for(config_dir);

        let capture_directory = ini
            .get("general", "capture_directory")
            .map(|s| expand_tilde(&s))
            .unwrap_or(defaults.capture_directory);

        let verbose = ini
            .getbool("general", "verbose")
            .ok()
            .flatten()
            .unwrap_or(defaults.verbose);

        let device_path = ini
            .get("device", "path")
            .map(PathBuf::from)
            .unwrap_or(defaults.device_path);

        let start_channel = ini
            .getuint("device", "start_channel")
            .ok()
            .flatten()
            .map(|v| (v % 10) as u8)
            .unwrap_or(defaults.start_channel);

        let hop = ini
            .getbool("device", "hop")
            .ok()
            .flatten()
            .unwrap_or(defaults.hop);

        let hop_interval_secs = ini
            .getuint("device", "hop_interval")
            .ok()
            .flatten()
            .filter(|&v| v > 0)
            .unwrap_or(defaults.hop_interval_secs);

        let autorec_timeout_secs = ini
            .getuint("autorec", "timeout")
            .ok()
            .flatten()
            .filter(|&v| v > 0)
            .unwrap_or(defaults.autorec_timeout_secs);

        let wav_dump = ini
            .getbool("audio", "wav_dump")
            .ok()
            .flatten()
            .unwrap_or(defaults.wav_dump);

        let ima_dump = ini
            .getbool("audio", "ima_dump")
            .ok()
            .flatten()
            .unwrap_or(defaults.ima_dump);

        let audio_play = ini
            .getbool("audio", "play")
            .ok()
            .flatten()
            .unwrap_or(defaults.audio_play);

        let direction = match ini.get("audio", "direction").as_deref() {
            Some("fp") | Some("FP") => Direction::Fp,
            Some("pp") | Some("PP") => Direction::Pp,
            _ => defaults.direction,
        };

        Ok(Self {
            capture_directory,
            verbose,
            device_path,
            start_channel,
            hop,
            hop_interval_secs,
            autorec_timeout_secs,
            wav_dump,
            ima_dump,
            audio_play,
            direction,
        })
    }

    /// Save config to an INI-style file with comments explaining each field.
    fn save_to_ini(&self, path: &std::path::Path) -> Result<()> {
        let content = format!(
            r#"; dectcap configuration
; Location: {path}
;
; Edit this file to change startup defaults. Every setting here can also
; be toggled at runtime from the command prompt.
; Lines starting with ; or # are comments.

[general]
; Directory where .pcap / .wav / .ima dumps are written.
; Supports ~ for home directory.
capture_directory = {capture_dir}

; Verbose operator output (channel switch notices etc.)
verbose = {verbose}

[device]
; com-on-air character device
path = {device}

; Channel to start on [0-9]
start_channel = {channel}

; Hop channels while scanning (true/false)
hop = {hop}

; Seconds between hops
hop_interval = {hop_interval}

[autorec]
; Seconds without voice data before a recorded call counts as ended
timeout = {timeout}

[audio]
; Decode the B-field to a .wav next to each pcap dump
wav_dump = {wav}

; Dump the raw ADPCM stream to a .ima next to each pcap dump
ima_dump = {ima}

; Play audio live while synced (needs a playback backend)
play = {play}

; Which side of the call feeds the audio sinks: fp or pp
direction = {direction}
"#,
            path = path.display(),
            capture_dir = self.capture_directory.to_string_lossy(),
            verbose = self.verbose,
            device = self.device_path.display(),
            channel = self.start_channel,
            hop = self.hop,
            hop_interval = self.hop_interval_secs,
            timeout = self.autorec_timeout_secs,
            wav = self.wav_dump,
            ima = self.ima_dump,
            play = self.audio_play,
            direction = self.direction.label().to_lowercase(),
        );

        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        Ok(())
    }
}

/// Expand `~` at the start of a path to the user's home directory.
fn expand_tilde(s: &str) -> PathBuf {
    if s.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(&s[2..]);
        }
    }
    PathBuf::from(s)
}

/// Resolve the config directory to `~/.config/dectcap/` regardless of OS.
pub fn resolve_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config").join("dectcap"))
}

/// Storage manager: owns the config directory and the loaded [`Config`].
///
/// On construction it ensures the directory tree exists and that a
/// commented `config.ini` is present for the user to edit.
pub struct Storage {
    /// Base config directory (~/.config/dectcap)
    #[allow(dead_code)]
    config_dir: PathBuf,
    /// Configuration
    pub config: Config,
}

impl Storage {
    /// Create a new storage manager.
    ///
    /// 1. Resolves the config directory (`~/.config/dectcap`).
    /// 2. Creates it if missing.
    /// 3. Loads `config.ini` if it exists, otherwise writes a default one.
    /// 4. Creates the capture directory if missing.
    pub fn new() -> Result<Self> {
        let config_dir = resolve_config_dir()
            .context("Could not determine home directory (is $HOME set?)")?;

        let config_path = config_dir.join("config.ini");

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config dir: {:?}", config_dir))?;
            tracing::info!("Created config directory: {:?}", config_dir);
        }

        let config = if config_path.exists() {
            tracing::info!("Loading config from {:?}", config_path);
            match Config::load_from_ini(&config_path, &config_dir) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!("Failed to parse config.ini, using defaults: {}", e);
                    Config::default_for(&config_dir)
                }
            }
        } else {
            tracing::info!("No config.ini found — creating default at {:?}", config_path);
            let config = Config::default_for(&config_dir);
            if let Err(e) = config.save_to_ini(&config_path) {
                tracing::warn!("Could not write default config.ini: {}", e);
            }
            config
        };

        if !config.capture_directory.exists() {
            fs::create_dir_all(&config.capture_directory).with_context(|| {
                format!("Failed to create capture dir: {:?}", config.capture_directory)
            })?;
            tracing::info!("Created capture directory: {:?}", config.capture_directory);
        }

        tracing::info!("Config dir: {:?}", config_dir);
        tracing::info!("Capture dir: {:?}", config.capture_directory);

        Ok(Self { config_dir, config })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_original_tool() {
        let config = Config::default_for(&PathBuf::from("/tmp"));
        assert_eq!(config.start_channel, 0);
        assert!(config.hop);
        assert_eq!(config.hop_interval_secs, 1);
        assert_eq!(config.autorec_timeout_secs, 10);
        assert!(config.wav_dump);
        assert!(!config.ima_dump);
        assert!(config.audio_play);
        assert!(!config.verbose);
        assert_eq!(config.direction, Direction::Pp);
    }

    #[test]
    fn test_ini_roundtrip() {
        let dir = std::env::temp_dir().join("dectcap-config-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.ini");

        let mut config = Config::default_for(&dir);
        config.start_channel = 7;
        config.hop = false;
        config.autorec_timeout_secs = 30;
        config.ima_dump = true;
        config.direction = Direction::Fp;
        config.save_to_ini(&path).unwrap();

        let loaded = Config::load_from_ini(&path, &dir).unwrap();
        assert_eq!(loaded.start_channel, 7);
        assert!(!loaded.hop);
        assert_eq!(loaded.autorec_timeout_secs, 30);
        assert!(loaded.ima_dump);
        assert_eq!(loaded.direction, Direction::Fp);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_expand_tilde() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/captures"), home.join("captures"));
        }
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
    }
}
