//! Audio fan-out for synchronized captures.
//!
//! DECT voice is 32 kbit/s ADPCM in the B-field: 40 bytes per frame, 100
//! frames per second per direction, which decodes to 8 kHz 16-bit mono PCM.
//! While a capture session is open this module can append the raw ADPCM
//! stream to a `.ima` file, decode it to a `.wav` via hound, and hand the
//! decoded samples to an attached playback sink. The playback device itself
//! (ALSA or similar) is an external collaborator behind [`PlaybackSink`].

use anyhow::{Context, Result};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::device::SyncFrame;

/// Decoded sample rate of the DECT voice channel.
const SAMPLE_RATE: u32 = 8_000;

/// B-field location within the 53-byte payload: 8 bytes of A-field first,
/// then 40 bytes of voice data.
const B_FIELD_START: usize = 8;
const B_FIELD_LEN: usize = 40;

/// Which half of the TDMA frame feeds the audio sinks. The basestation
/// transmits in slots 0-11, the handset answers in slots 12-23.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Fixed part (basestation) side.
    Fp,
    /// Portable part (handset) side.
    Pp,
}

impl Direction {
    pub fn toggled(self) -> Self {
        match self {
            Direction::Fp => Direction::Pp,
            Direction::Pp => Direction::Fp,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Direction::Fp => "FP",
            Direction::Pp => "PP",
        }
    }

    fn matches_slot(self, slot: u8) -> bool {
        match self {
            Direction::Fp => slot < 12,
            Direction::Pp => slot >= 12,
        }
    }
}

/// Live audio output. Implementations wrap a playback device; the engine
/// only decides when samples are forwarded.
pub trait PlaybackSink {
    fn write_pcm(&mut self, samples: &[i16]);
}

const INDEX_TABLE: [i8; 16] = [-1, -1, -1, -1, 2, 4, 6, 8, -1, -1, -1, -1, 2, 4, 6, 8];

const STEP_TABLE: [i32; 89] = [
    7, 8, 9, 10, 11, 12, 13, 14, 16, 17, 19, 21, 23, 25, 28, 31, 34, 37, 41, 45, 50, 55, 60, 66,
    73, 80, 88, 97, 107, 118, 130, 143, 157, 173, 190, 209, 230, 253, 279, 307, 337, 371, 408,
    449, 494, 544, 598, 658, 724, 796, 876, 963, 1060, 1166, 1282, 1411, 1552, 1707, 1878, 2066,
    2272, 2499, 2749, 3024, 3327, 3660, 4026, 4428, 4871, 5358, 5894, 6484, 7132, 7845, 8630,
    9493, 10442, 11487, 12635, 13899, 15289, 16818, 18500, 20350, 22385, 24623, 27086, 29794,
    32767,
];

/// Streaming IMA ADPCM decoder. State persists across frames so the
/// predictor tracks the call, not individual packets.
#[derive(Debug, Default)]
pub struct ImaAdpcmDecoder {
    predictor: i32,
    step_index: i8,
}

impl ImaAdpcmDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one 4-bit code into the next PCM sample.
    pub fn decode_nibble(&mut self, nibble: u8) -> i16 {
        let nibble = nibble & 0x0f;
        let step = STEP_TABLE[self.step_index as usize];

        let mut diff = step >> 3;
        if nibble & 4 != 0 {
            diff += step;
        }
        if nibble & 2 != 0 {
            diff += step >> 1;
        }
        if nibble & 1 != 0 {
            diff += step >> 2;
        }
        if nibble & 8 != 0 {
            diff = -diff;
        }

        self.predictor = (self.predictor + diff).clamp(-32768, 32767);
        self.step_index =
            (self.step_index + INDEX_TABLE[nibble as usize]).clamp(0, (STEP_TABLE.len() - 1) as i8);
        self.predictor as i16
    }

    /// Decode a byte stream, low nibble first, appending to `out`.
    pub fn decode(&mut self, data: &[u8], out: &mut Vec<i16>) {
        for &byte in data {
            out.push(self.decode_nibble(byte & 0x0f));
            out.push(self.decode_nibble(byte >> 4));
        }
    }
}

/// All audio sinks for the currently open capture session.
///
/// Opened alongside the capture session and fed one frame at a time; frames
/// that carry no B-field or belong to the other direction are skipped.
pub struct AudioPipeline {
    direction: Direction,
    wav: Option<WavWriter<BufWriter<File>>>,
    ima: Option<File>,
    playback: Option<Box<dyn PlaybackSink>>,
    play_enabled: bool,
    decoder: ImaAdpcmDecoder,
    scratch: Vec<i16>,
}

impl AudioPipeline {
    pub fn new(direction: Direction, playback: Option<Box<dyn PlaybackSink>>) -> Self {
        Self {
            direction,
            wav: None,
            ima: None,
            playback,
            play_enabled: false,
            decoder: ImaAdpcmDecoder::new(),
            scratch: Vec::with_capacity(B_FIELD_LEN * 2),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
    }

    /// Open the sinks selected by the dump flags next to the capture file.
    /// `base` is the session's path without extension.
    pub fn open(&mut self, base: &Path, wav: bool, ima: bool, play: bool) -> Result<()> {
        self.decoder = ImaAdpcmDecoder::new();

        if wav {
            let path = base.with_extension("wav");
            let spec = WavSpec {
                channels: 1,
                sample_rate: SAMPLE_RATE,
                bits_per_sample: 16,
                sample_format: SampleFormat::Int,
            };
            let writer = WavWriter::create(&path, spec)
                .with_context(|| format!("couldn't create wav file {:?}", path))?;
            tracing::info!("wav dump to {:?}", path);
            self.wav = Some(writer);
        }

        if ima {
            let path = base.with_extension("ima");
            let file = File::create(&path)
                .with_context(|| format!("couldn't create ima file {:?}", path))?;
            tracing::info!("ima dump to {:?}", path);
            self.ima = Some(file);
        }

        self.play_enabled = play;
        if play && self.playback.is_none() {
            tracing::warn!("audio playback enabled but no playback backend attached");
        }

        Ok(())
    }

    /// Whether any sink would consume frames right now.
    pub fn is_active(&self) -> bool {
        self.wav.is_some() || self.ima.is_some() || (self.play_enabled && self.playback.is_some())
    }

    /// Feed one synchronized frame through the open sinks.
    pub fn process(&mut self, frame: &SyncFrame) {
        if !self.is_active() || !frame.has_b_field() || !self.direction.matches_slot(frame.slot) {
            return;
        }

        let b_field = &frame.payload[B_FIELD_START..B_FIELD_START + B_FIELD_LEN];

        if let Some(ima) = self.ima.as_mut() {
            if let Err(e) = ima.write_all(b_field) {
                tracing::warn!("ima write failed, dropping sink: {}", e);
                self.ima = None;
            }
        }

        let need_pcm = self.wav.is_some() || (self.play_enabled && self.playback.is_some());
        if !need_pcm {
            return;
        }

        self.scratch.clear();
        let mut samples = std::mem::take(&mut self.scratch);
        self.decoder.decode(b_field, &mut samples);

        if let Some(wav) = self.wav.as_mut() {
            for &s in &samples {
                if let Err(e) = wav.write_sample(s) {
                    tracing::warn!("wav write failed, dropping sink: {}", e);
                    self.wav = None;
                    break;
                }
            }
        }

        if self.play_enabled {
            if let Some(playback) = self.playback.as_mut() {
                playback.write_pcm(&samples);
            }
        }

        self.scratch = samples;
    }

    /// Finalize and drop all open sinks. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(wav) = self.wav.take() {
            if let Err(e) = wav.finalize() {
                tracing::warn!("couldn't finalize wav file: {}", e);
            }
        }
        if let Some(mut ima) = self.ima.take() {
            let _ = ima.flush();
        }
        self.play_enabled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PAYLOAD_LEN;

    #[test]
    fn test_decoder_first_steps() {
        let mut dec = ImaAdpcmDecoder::new();
        // step 7, code 7: diff = 7 + 3 + 1 + 0 = 11, index 0 -> 8
        assert_eq!(dec.decode_nibble(0x7), 11);
        assert_eq!(dec.step_index, 8);
        // sign bit negates
        let mut dec = ImaAdpcmDecoder::new();
        assert_eq!(dec.decode_nibble(0xf), -11);
    }

    #[test]
    fn test_decoder_output_is_clamped() {
        let mut dec = ImaAdpcmDecoder::new();
        for _ in 0..4096 {
            dec.decode_nibble(0x7);
        }
        assert!(dec.predictor <= 32767);
        let sample = dec.decode_nibble(0x7);
        assert_eq!(sample, 32767);
    }

    #[test]
    fn test_decode_two_samples_per_byte() {
        let mut dec = ImaAdpcmDecoder::new();
        let mut out = Vec::new();
        dec.decode(&[0x00; 40], &mut out);
        assert_eq!(out.len(), 80);
    }

    #[test]
    fn test_direction_slot_filter() {
        assert!(Direction::Fp.matches_slot(0));
        assert!(Direction::Fp.matches_slot(11));
        assert!(!Direction::Fp.matches_slot(12));
        assert!(Direction::Pp.matches_slot(23));
        assert_eq!(Direction::Fp.toggled(), Direction::Pp);
    }

    #[test]
    fn test_pipeline_inactive_without_sinks() {
        let mut pipeline = AudioPipeline::new(Direction::Fp, None);
        assert!(!pipeline.is_active());
        // no sinks open: processing is a no-op and must not panic
        let frame = SyncFrame {
            channel: 0,
            slot: 0,
            rssi: 0,
            payload: [0; PAYLOAD_LEN],
        };
        pipeline.process(&frame);
        pipeline.close();
    }
}
