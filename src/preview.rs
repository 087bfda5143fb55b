//! Synchronous preview core
//!
//! [`PreviewSynth`] ties the scheduler to a rendering backend on a single
//! timeline: commands are applied in order and frames are pulled on demand.
//! The background [`PreviewEngine`](crate::PreviewEngine) runs one of these on
//! its generation thread; tests and the WAV exporter drive it directly.

use tracing::{debug, warn};

use crate::backend::{BackendKind, OplBackend};
use crate::config::PreviewConfig;
use crate::instrument::Instrument;
use crate::opl3::registers::{ChipMode, NUM_CHANNELS};
use crate::opl3::PAN_CENTER;
use crate::scheduler::{NoteRequest, NoteScheduler};
use crate::streaming::{ChipRenderer, MAX_SAMPLE_RATE};
use crate::{Opl3Error, Result};

/// Editor-facing operations, applied before the next frame pull
#[derive(Debug, Clone, PartialEq)]
pub enum PreviewCommand {
    /// Replace the current instrument (re-pushes the whole patch)
    SetInstrument(Instrument),
    /// Key a note, chord or the percussion key
    NoteOn(NoteRequest),
    /// Release all sounding voices
    NoteOff,
    /// Enter or leave percussion (drum) mode
    SetPercussionMode(bool),
    /// Pan every channel (0 = left, 64 = centre, 127 = right)
    SetPan(u8),
    /// Switch emulator; the new one starts from reset
    SelectBackend(BackendKind),
    /// Change the output sample rate
    SetOutputRate(u32),
    /// Release everything and reset the chip
    Reset,
}

/// Scheduler plus renderer on one timeline
#[derive(Debug)]
pub struct PreviewSynth {
    renderer: ChipRenderer,
    scheduler: NoteScheduler,
    pan: u8,
}

impl PreviewSynth {
    /// Bring up the configured backend (or its fallback) and initialize the chip
    pub fn new(config: &PreviewConfig) -> Result<Self> {
        config.validate()?;
        let renderer = ChipRenderer::new(config.backend, config.stream.sample_rate)?;
        if renderer.kind() != config.backend {
            warn!(
                requested = config.backend.as_str(),
                active = renderer.kind().as_str(),
                "Using fallback backend"
            );
        }
        Ok(Self::with_renderer(renderer, config.chip_mode))
    }

    /// Wrap an existing renderer
    pub fn with_renderer(renderer: ChipRenderer, mode: ChipMode) -> Self {
        let mut synth = PreviewSynth {
            renderer,
            scheduler: NoteScheduler::new(mode),
            pan: PAN_CENTER,
        };
        synth.restore();
        synth
    }

    /// Active backend variant
    pub fn backend_kind(&self) -> BackendKind {
        self.renderer.kind()
    }

    /// Output sample rate
    pub fn output_rate(&self) -> u32 {
        self.renderer.output_rate()
    }

    /// Note scheduler state
    pub fn scheduler(&self) -> &NoteScheduler {
        &self.scheduler
    }

    /// Renderer state
    pub fn renderer(&self) -> &ChipRenderer {
        &self.renderer
    }

    /// Apply one command
    ///
    /// Only backend selection and invalid output rates can fail; in both
    /// cases the synth keeps running unchanged.
    pub fn apply(&mut self, command: PreviewCommand) -> Result<()> {
        match command {
            PreviewCommand::SetInstrument(inst) => {
                debug!(name = inst.name(), "Instrument pushed");
                let writes = self.scheduler.set_instrument(inst);
                self.renderer.apply(&writes);
            }
            PreviewCommand::NoteOn(request) => {
                let writes = self.scheduler.note_on(request);
                self.renderer.apply(&writes);
            }
            PreviewCommand::NoteOff => {
                let writes = self.scheduler.note_off();
                self.renderer.apply(&writes);
            }
            PreviewCommand::SetPercussionMode(enabled) => {
                self.scheduler.set_percussion_mode(enabled);
            }
            PreviewCommand::SetPan(pan) => {
                self.pan = pan;
                self.apply_pan();
            }
            PreviewCommand::SelectBackend(kind) => {
                if kind != self.renderer.kind() {
                    self.renderer.switch_backend(kind)?;
                    self.restore();
                }
            }
            PreviewCommand::SetOutputRate(rate) => {
                if rate == 0 || rate > MAX_SAMPLE_RATE {
                    return Err(Opl3Error::ConfigError(format!(
                        "output rate {rate} outside 1..={MAX_SAMPLE_RATE}"
                    )));
                }
                self.renderer.set_output_rate(rate);
            }
            PreviewCommand::Reset => {
                let writes = self.scheduler.note_off();
                self.renderer.apply(&writes);
                self.renderer.reset();
                self.restore();
            }
        }
        Ok(())
    }

    /// Install a backend constructed elsewhere and rebuild the chip state on it
    pub fn install_backend(&mut self, kind: BackendKind, backend: Box<dyn OplBackend>) {
        self.renderer.install_backend(kind, backend);
        self.restore();
    }

    /// Release all voices and leave the chip reset
    pub fn silence(&mut self) {
        let writes = self.scheduler.note_off();
        self.renderer.apply(&writes);
        self.renderer.reset();
    }

    /// Pull frames at the output rate
    pub fn render(&mut self, frames: &mut [[i16; 2]]) {
        self.renderer.render(frames);
    }

    /// Rebuild globals, pan and sounding voices on the current backend
    fn restore(&mut self) {
        let writes = self.scheduler.replay_writes();
        self.renderer.apply(&writes);
        self.apply_pan();
    }

    fn apply_pan(&mut self) {
        for channel in 0..NUM_CHANNELS as u16 {
            self.renderer.write_pan(channel, self.pan);
        }
    }
}
