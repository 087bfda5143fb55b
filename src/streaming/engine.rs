//! Background generation task
//!
//! ```text
//! Editor thread                Generation thread                Device thread
//!     │                               │                              │
//! [note_on / set_instrument]          │                              │
//!     │──────(mpsc + wake)──────────►[apply commands]                │
//!     │                              [render + resample]             │
//!     │                              [top up]──────(ring)─────────►[consume]
//! ```
//!
//! Editor calls only enqueue commands and never wait on the device. The
//! generation thread wakes every `cadence_ms` (or as soon as a command
//! arrives), applies pending commands, then tops the ring buffer up with
//! freshly rendered frames. Because the chip is a continuous oscillator an
//! underrun is answered with more rendered frames, never with silence.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use super::ring_buffer::RingBuffer;
use super::{StreamConfig, MAX_SAMPLE_RATE};
use crate::backend::{BackendKind, OplBackend};
use crate::config::PreviewConfig;
use crate::instrument::Instrument;
use crate::preview::{PreviewCommand, PreviewSynth};
use crate::scheduler::NoteRequest;
use crate::{Opl3Error, Result};

#[cfg(feature = "streaming")]
use super::{AudioDevice, OUTPUT_CHANNELS};

/// Generation statistics for monitoring buffer health
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackStats {
    /// Frames rendered into the ring buffer
    pub frames_rendered: u64,
    /// Cycles that found the buffer below its low-water mark
    pub underrun_count: u64,
    /// Backend switches performed
    pub backend_swaps: u64,
    /// Buffer fill percentage after the last cycle (0.0 to 1.0)
    pub fill_percentage: f32,
}

/// Audio device state as seen by the editor
///
/// The status is decided when a device is opened ([`PreviewEngine::start_with_device`],
/// [`PreviewEngine::retry_device`], or a rate change that reopens the device).
/// rodio does not report a device that disappears mid-stream, so a lost device
/// still reads [`Playing`](Self::Playing) until the caller retries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceStatus {
    /// No device was requested
    #[default]
    Disabled,
    /// Frames are being played
    Playing,
    /// The device could not be opened; frames keep being generated
    Unavailable(String),
}

enum EngineCommand {
    Preview(PreviewCommand),
    InstallBackend(BackendKind, Box<dyn OplBackend>),
}

struct Shared {
    stats: Mutex<PlaybackStats>,
    wake: (Mutex<bool>, Condvar),
    running: AtomicBool,
}

impl Shared {
    fn notify(&self) {
        let (lock, cvar) = &self.wake;
        *lock.lock() = true;
        cvar.notify_one();
    }
}

/// Handle to the running preview pipeline
pub struct PreviewEngine {
    tx: Option<Sender<EngineCommand>>,
    handle: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
    buffer: Arc<RingBuffer>,
    config: StreamConfig,
    backend: Mutex<BackendKind>,
    output_rate: AtomicU32,
    device_status: DeviceStatus,
    #[cfg(feature = "streaming")]
    device: Option<AudioDevice>,
}

impl PreviewEngine {
    /// Start the generation thread without an audio device
    ///
    /// Frames accumulate in [`buffer`](Self::buffer) for any consumer.
    pub fn start(config: PreviewConfig) -> Result<Self> {
        config.validate()?;
        let synth = PreviewSynth::new(&config)?;
        let buffer = Arc::new(RingBuffer::with_frames(config.stream.ring_buffer_frames)?);
        let shared = Arc::new(Shared {
            stats: Mutex::new(PlaybackStats::default()),
            wake: (Mutex::new(false), Condvar::new()),
            running: AtomicBool::new(true),
        });

        let (tx, rx) = mpsc::channel();
        let backend = synth.backend_kind();
        let generator = Generator {
            rx,
            synth,
            buffer: Arc::clone(&buffer),
            shared: Arc::clone(&shared),
            scratch: Vec::new(),
            cadence: Duration::from_millis(config.stream.cadence_ms),
            low_water: config.stream.low_water_frames,
            primed: false,
        };
        let handle = thread::Builder::new()
            .name("opl3-generator".into())
            .spawn(move || generator.run())?;

        info!(
            backend = backend.as_str(),
            sample_rate = config.stream.sample_rate,
            latency_ms = config.stream.latency_ms(),
            "Preview engine started"
        );

        Ok(PreviewEngine {
            tx: Some(tx),
            handle: Some(handle),
            shared,
            buffer,
            config: config.stream,
            backend: Mutex::new(backend),
            output_rate: AtomicU32::new(config.stream.sample_rate),
            device_status: DeviceStatus::Disabled,
            #[cfg(feature = "streaming")]
            device: None,
        })
    }

    /// Start the generation thread and play through the default device
    ///
    /// A missing device is not an error: the engine runs with
    /// [`DeviceStatus::Unavailable`] and [`retry_device`](Self::retry_device)
    /// can attach one later.
    #[cfg(feature = "streaming")]
    pub fn start_with_device(config: PreviewConfig) -> Result<Self> {
        let mut engine = Self::start(config)?;
        if let Err(err) = engine.retry_device() {
            warn!(error = %err, "Audio device unavailable, generating without playback");
        }
        Ok(engine)
    }

    /// Try to (re)open the default audio device
    #[cfg(feature = "streaming")]
    pub fn retry_device(&mut self) -> Result<()> {
        self.device = None;
        match AudioDevice::new(
            self.output_rate(),
            OUTPUT_CHANNELS,
            Arc::clone(&self.buffer),
        ) {
            Ok(device) => {
                info!("Audio device opened");
                self.device = Some(device);
                self.device_status = DeviceStatus::Playing;
                Ok(())
            }
            Err(err) => {
                self.device_status = DeviceStatus::Unavailable(err.to_string());
                Err(err)
            }
        }
    }

    fn send(&self, command: EngineCommand) {
        let Some(tx) = self.tx.as_ref() else {
            warn!("Preview engine already stopped");
            return;
        };
        if tx.send(command).is_err() {
            warn!("Generation thread disconnected");
            return;
        }
        self.shared.notify();
    }

    /// Replace the current instrument
    pub fn set_instrument(&self, instrument: Instrument) {
        self.send(EngineCommand::Preview(PreviewCommand::SetInstrument(instrument)));
    }

    /// Key a note, chord or the percussion key
    pub fn note_on(&self, request: NoteRequest) {
        self.send(EngineCommand::Preview(PreviewCommand::NoteOn(request)));
    }

    /// Release all sounding voices
    pub fn note_off(&self) {
        self.send(EngineCommand::Preview(PreviewCommand::NoteOff));
    }

    /// Enter or leave percussion mode
    pub fn set_percussion_mode(&self, enabled: bool) {
        self.send(EngineCommand::Preview(PreviewCommand::SetPercussionMode(enabled)));
    }

    /// Pan every channel
    pub fn set_pan(&self, pan: u8) {
        self.send(EngineCommand::Preview(PreviewCommand::SetPan(pan)));
    }

    /// Switch emulator
    ///
    /// The backend is constructed here so an initialization failure is
    /// reported to the caller and the running backend stays selected.
    pub fn select_backend(&self, kind: BackendKind) -> Result<()> {
        let backend = kind.create(self.output_rate())?;
        *self.backend.lock() = kind;
        self.send(EngineCommand::InstallBackend(kind, backend));
        Ok(())
    }

    /// Change the output rate
    ///
    /// Buffered frames at the old rate are discarded. An attached device is
    /// reopened at the new rate.
    pub fn set_output_rate(&mut self, rate: u32) -> Result<()> {
        if rate == 0 || rate > MAX_SAMPLE_RATE {
            return Err(Opl3Error::ConfigError(format!(
                "output rate {rate} outside 1..={MAX_SAMPLE_RATE}"
            )));
        }
        self.output_rate.store(rate, Ordering::Relaxed);
        self.send(EngineCommand::Preview(PreviewCommand::SetOutputRate(rate)));

        #[cfg(feature = "streaming")]
        {
            if self.device.is_some() {
                self.retry_device()?;
            }
        }
        Ok(())
    }

    /// Selected backend
    pub fn backend_kind(&self) -> BackendKind {
        *self.backend.lock()
    }

    /// Output sample rate
    pub fn output_rate(&self) -> u32 {
        self.output_rate.load(Ordering::Relaxed)
    }

    /// Stream settings the engine was started with
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Snapshot of the generation statistics
    pub fn stats(&self) -> PlaybackStats {
        *self.shared.stats.lock()
    }

    /// Ring buffer the generation thread fills
    pub fn buffer(&self) -> Arc<RingBuffer> {
        Arc::clone(&self.buffer)
    }

    /// Audio device state as of the last open attempt
    pub fn device_status(&self) -> &DeviceStatus {
        &self.device_status
    }

    /// Whether the generation thread is alive
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop generation immediately
    ///
    /// The backend is left silent and reset, and buffered frames are dropped.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        #[cfg(feature = "streaming")]
        {
            if let Some(device) = self.device.take() {
                device.finish();
            }
        }

        self.shared.running.store(false, Ordering::Release);
        // Dropping the sender also ends the loop if the flag is missed
        drop(self.tx.take());
        self.shared.notify();

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Generation thread panicked");
            }
            let stats = self.stats();
            info!(
                frames = stats.frames_rendered,
                underruns = stats.underrun_count,
                "Preview engine stopped"
            );
        }
        self.buffer.flush();
    }
}

impl Drop for PreviewEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State owned by the generation thread
struct Generator {
    rx: Receiver<EngineCommand>,
    synth: PreviewSynth,
    buffer: Arc<RingBuffer>,
    shared: Arc<Shared>,
    scratch: Vec<[i16; 2]>,
    cadence: Duration,
    low_water: usize,
    primed: bool,
}

impl Generator {
    fn run(mut self) {
        debug!("Preview generation thread started");

        'outer: loop {
            loop {
                match self.rx.try_recv() {
                    Ok(command) => self.handle(command),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        debug!("Command channel disconnected");
                        break 'outer;
                    }
                }
            }
            if !self.shared.running.load(Ordering::Acquire) {
                break;
            }

            self.top_up();

            let (lock, cvar) = &self.shared.wake;
            let mut pending = lock.lock();
            if !*pending {
                cvar.wait_for(&mut pending, self.cadence);
            }
            *pending = false;
        }

        self.synth.silence();
        self.buffer.flush();
        debug!("Preview generation thread finished");
    }

    fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::InstallBackend(kind, backend) => {
                self.synth.install_backend(kind, backend);
                self.discard_buffered();
                self.shared.stats.lock().backend_swaps += 1;
            }
            EngineCommand::Preview(command) => {
                let discards = matches!(
                    command,
                    PreviewCommand::SelectBackend(_) | PreviewCommand::SetOutputRate(_)
                );
                if let Err(err) = self.synth.apply(command) {
                    warn!(error = %err, "Preview command failed");
                } else if discards {
                    self.discard_buffered();
                }
            }
        }
    }

    /// Drop frames produced under the previous backend or rate
    fn discard_buffered(&mut self) {
        self.buffer.flush();
        self.primed = false;
    }

    fn top_up(&mut self) {
        let buffered = self.buffer.frames_available();
        if self.primed && buffered < self.low_water {
            trace!(buffered, low_water = self.low_water, "Buffer underrun, rendering ahead");
            self.shared.stats.lock().underrun_count += 1;
        }

        let frames = self.buffer.frames_free();
        if frames > 0 {
            self.scratch.resize(frames, [0, 0]);
            self.synth.render(&mut self.scratch);
            let written = self.buffer.write_frames(&self.scratch);
            self.primed = true;

            let mut stats = self.shared.stats.lock();
            stats.frames_rendered += written as u64;
            stats.fill_percentage = self.buffer.fill_percentage();
        }
    }
}
