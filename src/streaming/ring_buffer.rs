//! Ring buffer between the generation thread and the audio device
//!
//! A ring buffer (circular buffer) allows two threads to operate concurrently:
//! - Producer thread: renders chip frames and writes them to the buffer
//! - Consumer thread: reads interleaved samples and hands them to the device
//!
//! Memory consumption is fixed at buffer_size * sizeof(i16) regardless of
//! how long the preview runs. Uses mutex-based synchronization with atomic
//! position tracking for visibility.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::Opl3Error;

/// Error type for ring buffer operations
#[derive(Debug, Clone)]
pub struct RingBufferError(pub String);

impl std::fmt::Display for RingBufferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RingBufferError {}

impl From<RingBufferError> for Opl3Error {
    fn from(err: RingBufferError) -> Self {
        Opl3Error::ConfigError(err.0)
    }
}

/// Ring buffer of interleaved stereo i16 samples
///
/// # Thread Safety
/// - One producer thread (generation loop)
/// - One consumer thread (audio playback)
/// - Uses parking_lot::Mutex for buffer access with atomic variables for position tracking
#[derive(Debug)]
pub struct RingBuffer {
    /// Shared buffer storage
    buffer: Mutex<Vec<i16>>,
    /// Write position (producer), monotonically increasing
    write_pos: AtomicUsize,
    /// Read position (consumer), monotonically increasing
    read_pos: AtomicUsize,
    /// Capacity in samples (power of 2 for efficient modulo operation)
    capacity: usize,
    /// Capacity mask for fast modulo: `pos & mask == pos % capacity`
    mask: usize,
}

impl RingBuffer {
    /// Create a new ring buffer holding `requested_capacity` samples
    /// Capacity will be rounded up to the next power of 2
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Requested capacity is 0
    /// - Requested capacity would exceed maximum safe allocation (512 MB)
    pub fn new(requested_capacity: usize) -> Result<Self, RingBufferError> {
        if requested_capacity == 0 {
            return Err(RingBufferError(
                "Ring buffer capacity must be greater than 0".into(),
            ));
        }

        let capacity = requested_capacity
            .max(2)
            .checked_next_power_of_two()
            .unwrap_or(usize::MAX);

        const MAX_CAPACITY: usize = 512 * 1024 * 1024 / std::mem::size_of::<i16>();
        if capacity > MAX_CAPACITY {
            return Err(RingBufferError(format!(
                "Ring buffer capacity {capacity} exceeds maximum safe size {MAX_CAPACITY}"
            )));
        }

        Ok(RingBuffer {
            buffer: Mutex::new(vec![0; capacity]),
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            capacity,
            mask: capacity - 1,
        })
    }

    /// Ring buffer sized for `frames` stereo frames
    pub fn with_frames(frames: usize) -> Result<Self, RingBufferError> {
        Self::new(frames.saturating_mul(2))
    }

    /// Capacity in samples
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of samples available to read (without blocking)
    pub fn available_read(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.saturating_sub(read)
    }

    /// Whole stereo frames available to read
    pub fn frames_available(&self) -> usize {
        self.available_read() / 2
    }

    /// Samples that can be written before the buffer is full
    pub fn free_space(&self) -> usize {
        self.capacity - self.available_read() - 1
    }

    /// Whole stereo frames that can be written
    pub fn frames_free(&self) -> usize {
        self.free_space() / 2
    }

    /// Write samples to the buffer (producer)
    /// Returns the number of samples successfully written, 0 if full
    pub fn write(&self, samples: &[i16]) -> usize {
        let mut buf = self.buffer.lock();

        // Available space is computed under the lock
        let write_pos = self.write_pos.load(Ordering::Acquire);
        let read_pos = self.read_pos.load(Ordering::Acquire);
        let available = self.capacity - (write_pos - read_pos) - 1;

        let to_write = samples.len().min(available);
        if to_write == 0 {
            return 0;
        }

        let write_idx = write_pos & self.mask;
        if write_idx + to_write <= self.capacity {
            buf[write_idx..write_idx + to_write].copy_from_slice(&samples[..to_write]);
        } else {
            let first_part = self.capacity - write_idx;
            buf[write_idx..].copy_from_slice(&samples[..first_part]);
            buf[..to_write - first_part].copy_from_slice(&samples[first_part..to_write]);
        }

        drop(buf);

        self.write_pos.store(write_pos + to_write, Ordering::Release);
        to_write
    }

    /// Write whole stereo frames, interleaving left and right
    /// Returns the number of frames written
    pub fn write_frames(&self, frames: &[[i16; 2]]) -> usize {
        let mut buf = self.buffer.lock();

        let write_pos = self.write_pos.load(Ordering::Acquire);
        let read_pos = self.read_pos.load(Ordering::Acquire);
        let available = self.capacity - (write_pos - read_pos) - 1;

        let to_write = frames.len().min(available / 2);
        for (i, frame) in frames[..to_write].iter().enumerate() {
            let pos = write_pos + i * 2;
            buf[pos & self.mask] = frame[0];
            buf[(pos + 1) & self.mask] = frame[1];
        }

        drop(buf);

        self.write_pos
            .store(write_pos + to_write * 2, Ordering::Release);
        to_write
    }

    /// Read samples from the buffer (consumer)
    /// Returns the number of samples successfully read
    pub fn read(&self, dest: &mut [i16]) -> usize {
        let buf = self.buffer.lock();

        let write_pos = self.write_pos.load(Ordering::Acquire);
        let read_pos = self.read_pos.load(Ordering::Acquire);
        let available = write_pos - read_pos;

        let to_read = dest.len().min(available);
        if to_read == 0 {
            return 0;
        }

        let read_idx = read_pos & self.mask;
        if read_idx + to_read <= self.capacity {
            dest[..to_read].copy_from_slice(&buf[read_idx..read_idx + to_read]);
        } else {
            let first_part = self.capacity - read_idx;
            dest[..first_part].copy_from_slice(&buf[read_idx..]);
            dest[first_part..to_read].copy_from_slice(&buf[..to_read - first_part]);
        }

        drop(buf);

        self.read_pos.store(read_pos + to_read, Ordering::Release);
        to_read
    }

    /// Drain and discard all buffered samples
    pub fn flush(&self) {
        let _buf = self.buffer.lock();
        let write_pos = self.write_pos.load(Ordering::Acquire);
        self.read_pos.store(write_pos, Ordering::Release);
    }

    /// Check if the buffer has any samples to read
    pub fn is_empty(&self) -> bool {
        self.available_read() == 0
    }

    /// Check if the buffer is full
    pub fn is_full(&self) -> bool {
        self.free_space() == 0
    }

    /// Get fill percentage (0.0 to 1.0)
    pub fn fill_percentage(&self) -> f32 {
        (self.available_read() as f32) / (self.capacity as f32)
    }
}
