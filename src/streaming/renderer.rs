//! Drives one chip backend at the output rate
//!
//! When the backend cannot run at the output rate it generates at its
//! native rate and the frames go through a [`LinearResampler`]; otherwise
//! they pass through unchanged.

use tracing::{debug, info};

use super::resampler::LinearResampler;
use crate::backend::{BackendKind, OplBackend};
use crate::opl3::registers::RegisterWrite;
use crate::Result;

/// Native frames generated per backend batch
const NATIVE_BATCH: usize = 512;

/// Backend plus whatever rate conversion it needs
pub struct ChipRenderer {
    backend: Box<dyn OplBackend>,
    kind: BackendKind,
    output_rate: u32,
    resampler: Option<LinearResampler>,
    native: Vec<[i16; 2]>,
    pending: Vec<[i16; 2]>,
    pending_pos: usize,
}

impl std::fmt::Debug for ChipRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChipRenderer")
            .field("kind", &self.kind)
            .field("emulator", &self.backend.emulator_name())
            .field("output_rate", &self.output_rate)
            .field("resampling", &self.resampler.is_some())
            .finish()
    }
}

impl ChipRenderer {
    /// Create `kind` for `output_rate`, falling back to the other backend
    pub fn new(kind: BackendKind, output_rate: u32) -> Result<Self> {
        let (kind, backend) = kind.create_with_fallback(output_rate)?;
        Ok(Self::with_backend(kind, backend, output_rate))
    }

    /// Wrap an already constructed backend
    pub fn with_backend(kind: BackendKind, mut backend: Box<dyn OplBackend>, output_rate: u32) -> Self {
        backend.set_rate(output_rate);
        let mut renderer = ChipRenderer {
            backend,
            kind,
            output_rate,
            resampler: None,
            native: Vec::with_capacity(NATIVE_BATCH),
            pending: Vec::new(),
            pending_pos: 0,
        };
        renderer.configure_rate();
        renderer
    }

    fn configure_rate(&mut self) {
        let native = self.backend.native_rate();
        self.resampler = if native == self.output_rate {
            None
        } else {
            debug!(native, output = self.output_rate, "Resampling backend output");
            Some(LinearResampler::new(native, self.output_rate))
        };
        self.pending.clear();
        self.pending_pos = 0;
    }

    /// Active backend variant
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// The backend itself
    pub fn backend(&self) -> &dyn OplBackend {
        self.backend.as_ref()
    }

    /// Output sample rate
    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Whether frames are rate-converted
    pub fn is_resampling(&self) -> bool {
        self.resampler.is_some()
    }

    /// Apply register writes in order
    pub fn apply(&mut self, writes: &[RegisterWrite]) {
        self.backend.write_all(writes);
    }

    /// Set the stereo position of a channel
    pub fn write_pan(&mut self, channel: u16, pan: u8) {
        self.backend.write_pan(channel, pan);
    }

    /// Change the output rate, dropping converted frames not yet delivered
    pub fn set_output_rate(&mut self, rate: u32) {
        if rate == self.output_rate {
            return;
        }
        info!(from = self.output_rate, to = rate, "Output rate changed");
        self.output_rate = rate;
        self.backend.set_rate(rate);
        self.configure_rate();
    }

    /// Replace the backend, discarding everything produced by the old one
    ///
    /// The new backend starts from reset; callers re-apply their patch.
    pub fn install_backend(&mut self, kind: BackendKind, mut backend: Box<dyn OplBackend>) {
        info!(
            from = self.kind.as_str(),
            to = kind.as_str(),
            emulator = backend.emulator_name(),
            "Switching chip backend"
        );
        backend.set_rate(self.output_rate);
        self.backend = backend;
        self.kind = kind;
        self.configure_rate();
    }

    /// Construct and install `kind`; the old backend stays on failure
    pub fn switch_backend(&mut self, kind: BackendKind) -> Result<()> {
        let backend = kind.create(self.output_rate)?;
        self.install_backend(kind, backend);
        Ok(())
    }

    /// Reset the backend to its silent power-on state
    pub fn reset(&mut self) {
        self.backend.reset();
        self.backend.set_rate(self.output_rate);
        if let Some(r) = self.resampler.as_mut() {
            r.reset();
        }
        self.pending.clear();
        self.pending_pos = 0;
    }

    /// Fill `out` with frames at the output rate
    pub fn render(&mut self, out: &mut [[i16; 2]]) {
        let Some(resampler) = self.resampler.as_mut() else {
            self.backend.generate_into(out);
            return;
        };

        let mut filled = 0;
        while filled < out.len() {
            if self.pending_pos >= self.pending.len() {
                self.pending.clear();
                self.pending_pos = 0;

                let wanted = resampler.input_len(out.len() - filled).clamp(1, NATIVE_BATCH);
                self.native.resize(wanted, [0, 0]);
                self.backend.generate_into(&mut self.native);
                resampler.process(&self.native, &mut self.pending);
                continue;
            }

            let take = (self.pending.len() - self.pending_pos).min(out.len() - filled);
            out[filled..filled + take]
                .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + take]);
            self.pending_pos += take;
            filled += take;
        }
    }
}
