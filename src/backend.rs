//! Backend trait abstraction for OPL3 chip implementations
//!
//! Every emulator backend implements [`OplBackend`]. The rest of the crate
//! only talks to `Box<dyn OplBackend>` and never names a concrete backend
//! type, apart from [`BackendKind::create`] which constructs one.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use crate::opl3::registers::RegisterWrite;
use crate::opl3::Opl3;
use crate::softsynth::SoftOpl;
use crate::{Opl3Error, Result};

/// Chip family a backend emulates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipType {
    /// YM3812 (2-op only)
    Opl2,
    /// YMF262
    Opl3,
}

impl fmt::Display for ChipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChipType::Opl2 => "OPL2",
            ChipType::Opl3 => "OPL3",
        })
    }
}

/// Common interface for OPL3 chip backends
///
/// This trait allows different implementations to be used interchangeably:
/// - Accurate integer models that only run at the chip's native rate
/// - Fast approximations that render directly at the output rate
///
/// # Example
///
/// ```
/// use opl3_preview::{BackendKind, OplBackend};
///
/// let mut chip = BackendKind::Accurate.create(44_100).unwrap();
/// chip.write_reg(0x105, 0x01); // OPL3 mode
/// chip.write_reg(0xB0, 0x32); // Key on channel 0
///
/// let mut frame = [0i16; 2];
/// chip.native_generate(&mut frame);
/// ```
pub trait OplBackend: Send {
    /// Configure the output rate
    ///
    /// Backends that cannot run at arbitrary rates keep generating at their
    /// native rate and report `false` from [`can_run_at_pcm_rate`](Self::can_run_at_pcm_rate).
    fn set_rate(&mut self, sample_rate: u32);

    /// Whether [`native_generate`](Self::native_generate) produces frames at
    /// the rate passed to [`set_rate`](Self::set_rate)
    fn can_run_at_pcm_rate(&self) -> bool;

    /// Rate of the frames produced by [`native_generate`](Self::native_generate)
    fn native_rate(&self) -> u32;

    /// Return to the power-on state
    ///
    /// All registers are zero and all channels silent afterwards.
    fn reset(&mut self);

    /// Apply one register write
    ///
    /// # Arguments
    ///
    /// * `address` - 9-bit register address (bit 8 selects the second bank)
    /// * `data` - Register value
    fn write_reg(&mut self, address: u16, data: u8);

    /// Set the stereo position of a channel
    ///
    /// # Arguments
    ///
    /// * `channel` - Channel index (0-17)
    /// * `pan` - 0 = hard left, 64 = centre, 127 = hard right
    fn write_pan(&mut self, channel: u16, pan: u8);

    /// Produce exactly one stereo frame at the native rate
    fn native_generate(&mut self, frame: &mut [i16; 2]);

    /// Hook invoked before a batch of frames
    fn native_pre_generate(&mut self) {
        // Default: no-op for backends without per-batch bookkeeping
    }

    /// Hook invoked after a batch of frames
    fn native_post_generate(&mut self) {
        // Default: no-op for backends without per-batch bookkeeping
    }

    /// Human-readable emulator name
    fn emulator_name(&self) -> &'static str;

    /// Emulated chip family
    fn chip_type(&self) -> ChipType;

    /// Last value written to a register, if the backend keeps it
    fn read_register(&self, _address: u16) -> Option<u8> {
        None
    }

    /// Apply a sequence of register writes in order
    fn write_all(&mut self, writes: &[RegisterWrite]) {
        for w in writes {
            self.write_reg(w.address, w.value);
        }
    }

    /// Generate a batch of native-rate frames, running the batch hooks
    fn generate_into(&mut self, frames: &mut [[i16; 2]]) {
        self.native_pre_generate();
        for frame in frames.iter_mut() {
            self.native_generate(frame);
        }
        self.native_post_generate();
    }
}

/// Selectable backend variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Integer model at the native 49716 Hz rate
    #[default]
    Accurate,
    /// Floating-point approximation at the output rate
    Fast,
}

impl BackendKind {
    /// All backends, in fallback order
    pub const ALL: [BackendKind; 2] = [BackendKind::Accurate, BackendKind::Fast];

    /// Parse a backend name (case-insensitive)
    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "accurate" | "nuked" => Some(BackendKind::Accurate),
            "fast" | "softsynth" => Some(BackendKind::Fast),
            _ => None,
        }
    }

    /// Canonical name
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Accurate => "accurate",
            BackendKind::Fast => "fast",
        }
    }

    /// The other backend, used as fallback when initialization fails
    pub fn fallback(&self) -> Self {
        match self {
            BackendKind::Accurate => BackendKind::Fast,
            BackendKind::Fast => BackendKind::Accurate,
        }
    }

    /// Construct and reset a backend configured for `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns [`Opl3Error::BackendInit`] when the backend cannot run with the
    /// requested configuration. A failed backend is never returned silent.
    pub fn create(&self, sample_rate: u32) -> Result<Box<dyn OplBackend>> {
        let mut backend: Box<dyn OplBackend> = match self {
            BackendKind::Accurate => Box::new(Opl3::new()),
            BackendKind::Fast => Box::new(SoftOpl::new(sample_rate).map_err(|reason| {
                Opl3Error::BackendInit {
                    backend: self.as_str().to_string(),
                    reason,
                }
            })?),
        };
        backend.reset();
        backend.set_rate(sample_rate);
        info!(
            backend = self.as_str(),
            emulator = backend.emulator_name(),
            native_rate = backend.native_rate(),
            "Chip backend initialized"
        );
        Ok(backend)
    }

    /// Construct this backend, falling back to the other variant on failure
    ///
    /// Returns the kind that was actually created.
    pub fn create_with_fallback(&self, sample_rate: u32) -> Result<(BackendKind, Box<dyn OplBackend>)> {
        match self.create(sample_rate) {
            Ok(backend) => Ok((*self, backend)),
            Err(err) => {
                warn!(backend = self.as_str(), error = %err, "Backend failed, trying fallback");
                let fallback = self.fallback();
                fallback.create(sample_rate).map(|b| (fallback, b))
            }
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_names_roundtrip() {
        for kind in BackendKind::ALL {
            assert_eq!(BackendKind::from_str(kind.as_str()), Some(kind));
            assert_eq!(BackendKind::from_str(&kind.as_str().to_uppercase()), Some(kind));
        }
        assert_eq!(BackendKind::from_str("ymfm"), None);
    }

    #[test]
    fn test_capabilities_differ() {
        let accurate = BackendKind::Accurate.create(44_100).expect("accurate backend");
        assert!(!accurate.can_run_at_pcm_rate());
        assert_eq!(accurate.native_rate(), crate::opl3::NATIVE_RATE);

        let fast = BackendKind::Fast.create(44_100).expect("fast backend");
        assert!(fast.can_run_at_pcm_rate());
        assert_eq!(fast.native_rate(), 44_100);
        assert_ne!(accurate.emulator_name(), fast.emulator_name());
    }

    #[test]
    fn test_init_failure_is_distinct_from_silence() {
        let err = BackendKind::Fast.create(0).err().expect("zero rate must fail");
        assert!(matches!(err, Opl3Error::BackendInit { .. }), "got {err}");
    }

    #[test]
    fn test_fallback_on_init_failure() {
        let (kind, backend) = BackendKind::Fast
            .create_with_fallback(0)
            .expect("accurate fallback");
        assert_eq!(kind, BackendKind::Accurate);
        assert_eq!(backend.chip_type(), ChipType::Opl3);
    }

    #[test]
    fn test_write_all_applies_in_order() {
        let mut chip = BackendKind::Accurate.create(49_716).expect("backend");
        chip.write_all(&[RegisterWrite::new(0x40, 0x11), RegisterWrite::new(0x40, 0x22)]);
        assert_eq!(chip.read_register(0x40), Some(0x22));
    }
}
