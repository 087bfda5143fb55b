//! Real-time generation and playback
//!
//! A generation thread pulls frames from the active chip backend at a fixed
//! cadence, converts them to the output rate when the backend cannot run
//! there itself, and keeps a bounded ring buffer topped up ahead of the audio
//! device. Memory usage is limited to the ring buffer size.

pub mod engine;
pub mod renderer;
pub mod resampler;
pub mod ring_buffer;

#[cfg(feature = "streaming")]
pub mod audio_device;

#[cfg(feature = "streaming")]
pub use audio_device::AudioDevice;
pub use engine::{DeviceStatus, PlaybackStats, PreviewEngine};
pub use renderer::ChipRenderer;
pub use resampler::LinearResampler;
pub use ring_buffer::RingBuffer;

use serde::{Deserialize, Serialize};

use crate::{Opl3Error, Result};

/// Default output sample rate (44.1 kHz)
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Interleaved channels of every output frame
pub const OUTPUT_CHANNELS: u16 = 2;

/// Default generation period in milliseconds
pub const DEFAULT_CADENCE_MS: u64 = 5;

/// Highest output rate accepted by [`StreamConfig::validate`]
pub const MAX_SAMPLE_RATE: u32 = 192_000;

/// Configuration of the generation pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Output sample rate in Hz
    pub sample_rate: u32,

    /// Frames buffered ahead of the device
    /// Larger buffers = more latency but less chance of underrun
    pub ring_buffer_frames: usize,

    /// Period of the generation loop in milliseconds
    pub cadence_ms: u64,

    /// Fill level (in frames) below which a cycle counts as an underrun
    pub low_water_frames: usize,
}

impl StreamConfig {
    /// Create a streaming configuration optimized for low latency
    /// Buffer = 2048 frames ≈ 46ms @ 44.1kHz
    pub fn low_latency(sample_rate: u32) -> Self {
        StreamConfig {
            sample_rate,
            ring_buffer_frames: 2048,
            cadence_ms: 2,
            low_water_frames: 256,
        }
    }

    /// Create a streaming configuration optimized for stability
    /// Buffer = 8192 frames ≈ 186ms @ 44.1kHz
    pub fn stable(sample_rate: u32) -> Self {
        StreamConfig {
            sample_rate,
            ring_buffer_frames: 8192,
            cadence_ms: DEFAULT_CADENCE_MS,
            low_water_frames: 1024,
        }
    }

    /// Get latency in milliseconds
    pub fn latency_ms(&self) -> f32 {
        ((self.ring_buffer_frames as f32) / (self.sample_rate as f32)) * 1000.0
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.sample_rate > MAX_SAMPLE_RATE {
            return Err(Opl3Error::ConfigError(format!(
                "sample rate {} outside 1..={MAX_SAMPLE_RATE}",
                self.sample_rate
            )));
        }
        if self.ring_buffer_frames < 64 {
            return Err(Opl3Error::ConfigError(format!(
                "ring buffer of {} frames is too small",
                self.ring_buffer_frames
            )));
        }
        if self.cadence_ms == 0 || self.cadence_ms > 1000 {
            return Err(Opl3Error::ConfigError(format!(
                "cadence {}ms outside 1..=1000",
                self.cadence_ms
            )));
        }
        if self.low_water_frames >= self.ring_buffer_frames {
            return Err(Opl3Error::ConfigError(
                "low water mark must be below the ring buffer size".into(),
            ));
        }
        Ok(())
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::stable(DEFAULT_SAMPLE_RATE)
    }
}
