//! Voice activity detection adapter
//!
//! Classifies 20ms frames of 16kHz mono PCM as speech or silence and turns the
//! raw per-frame decisions into debounced `SpeechStart` / `SpeechEnd` edges.
//! The orchestrator only ever sees edges; classifier jitter is absorbed here.

use tracing::{debug, error};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Sample rate the detector expects
pub const VAD_SAMPLE_RATE: u32 = 16_000;

/// Samples in one 20ms frame at 16kHz
pub const VAD_FRAME_SAMPLES: usize = 320;

/// Error type for VAD operations
#[derive(Debug, thiserror::Error)]
pub enum VadError {
    #[error("invalid frame length {0}")]
    InvalidFrame(usize),
}

/// Edge event emitted by the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEdge {
    SpeechStart,
    SpeechEnd,
}

/// Classifier aggressiveness, mapped onto the WebRTC VAD modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadSensitivity {
    Quality,
    LowBitrate,
    Aggressive,
    VeryAggressive,
}

impl VadSensitivity {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "quality" => Some(Self::Quality),
            "low_bitrate" | "lowbitrate" => Some(Self::LowBitrate),
            "aggressive" => Some(Self::Aggressive),
            "very_aggressive" | "veryaggressive" => Some(Self::VeryAggressive),
            _ => None,
        }
    }

    fn mode(self) -> VadMode {
        match self {
            Self::Quality => VadMode::Quality,
            Self::LowBitrate => VadMode::LowBitrate,
            Self::Aggressive => VadMode::Aggressive,
            Self::VeryAggressive => VadMode::VeryAggressive,
        }
    }
}

/// Configuration for edge debouncing
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Consecutive voiced frames required to report `SpeechStart`
    pub open_voiced_frames: usize,

    /// Consecutive unvoiced frames required to report `SpeechEnd`
    pub close_silent_frames: usize,

    /// Classifier aggressiveness
    pub sensitivity: VadSensitivity,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            open_voiced_frames: 3,   // 60ms of speech to open
            close_silent_frames: 15, // 300ms of silence to close
            sensitivity: VadSensitivity::Aggressive,
        }
    }
}

/// Per-frame speech/silence classifier
pub trait SpeechClassifier {
    fn classify(&mut self, frame: &[i16]) -> Result<bool, VadError>;

    fn set_sensitivity(&mut self, _sensitivity: VadSensitivity) {}
}

/// WebRTC VAD backed classifier
pub struct WebRtcClassifier {
    vad: Vad,
}

impl WebRtcClassifier {
    pub fn new(sensitivity: VadSensitivity) -> Self {
        Self {
            vad: Vad::new_with_rate_and_mode(SampleRate::Rate16kHz, sensitivity.mode()),
        }
    }
}

impl SpeechClassifier for WebRtcClassifier {
    fn classify(&mut self, frame: &[i16]) -> Result<bool, VadError> {
        self.vad
            .is_voice_segment(frame)
            .map_err(|_| VadError::InvalidFrame(frame.len()))
    }

    fn set_sensitivity(&mut self, sensitivity: VadSensitivity) {
        self.vad.set_mode(sensitivity.mode());
    }
}

/// Debounced edge detector over a speech classifier
pub struct VoiceActivityDetector<C> {
    classifier: C,
    cfg: VadConfig,
    enabled: bool,
    speaking: bool,
    voiced_run: usize,
    silent_run: usize,
}

impl<C: SpeechClassifier> VoiceActivityDetector<C> {
    /// Create a detector. It starts disabled.
    pub fn new(mut classifier: C, cfg: VadConfig) -> Self {
        classifier.set_sensitivity(cfg.sensitivity);
        Self {
            classifier,
            cfg,
            enabled: false,
            speaking: false,
            voiced_run: 0,
            silent_run: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Enable or disable edge reporting without touching the audio stream.
    /// Any partial debouncing state is discarded on every toggle.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        debug!("VAD {}", if enabled { "enabled" } else { "disabled" });
        self.enabled = enabled;
        self.speaking = false;
        self.voiced_run = 0;
        self.silent_run = 0;
    }

    pub fn set_sensitivity(&mut self, sensitivity: VadSensitivity) {
        self.cfg.sensitivity = sensitivity;
        self.classifier.set_sensitivity(sensitivity);
    }

    /// Feed one frame; returns an edge when the debounced state flips.
    pub fn push_frame(&mut self, frame: &[i16]) -> Option<VadEdge> {
        if !self.enabled {
            return None;
        }

        let voiced = match self.classifier.classify(frame) {
            Ok(voiced) => voiced,
            Err(e) => {
                error!("VAD error: {}", e);
                false
            }
        };

        if voiced {
            self.voiced_run += 1;
            self.silent_run = 0;
        } else {
            self.silent_run += 1;
            self.voiced_run = 0;
        }

        if !self.speaking && self.voiced_run >= self.cfg.open_voiced_frames {
            self.speaking = true;
            debug!("VAD speech start after {} voiced frames", self.voiced_run);
            return Some(VadEdge::SpeechStart);
        }

        if self.speaking && self.silent_run >= self.cfg.close_silent_frames {
            self.speaking = false;
            debug!("VAD speech end after {} silent frames", self.silent_run);
            return Some(VadEdge::SpeechEnd);
        }

        None
    }
}
