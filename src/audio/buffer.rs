//! Fixed-capacity sample buffers and the pool that allocates them
//!
//! Every buffer the engine will ever use is allocated once by
//! [`SampleBufferPool::allocate`]. After that, buffers are only moved between
//! owners; nothing on the audio path allocates or frees sample storage.

use tracing::{debug, error};

use super::error::AudioError;

/// Bits per sample used by the pipeline (signed 16-bit PCM)
pub const BITS_PER_SAMPLE: u16 = 16;

/// PCM layout shared by the devices, the buffers and the effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Interleaved channel count
    pub channels: u16,
    /// Bits per sample
    pub bits_per_sample: u16,
    /// Frames delivered per device buffer
    pub frames_per_buffer: u32,
}

impl SampleFormat {
    pub fn new(sample_rate: u32, channels: u16, frames_per_buffer: u32) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: BITS_PER_SAMPLE,
            frames_per_buffer,
        }
    }

    /// Bytes in one device buffer, rounded up to whole bytes
    pub fn buffer_bytes(&self) -> usize {
        let bits = self.frames_per_buffer as usize
            * self.channels as usize
            * self.bits_per_sample as usize;
        (bits + 7) >> 3
    }

    /// Interleaved samples in one device buffer
    pub fn samples_per_buffer(&self) -> usize {
        self.frames_per_buffer as usize * self.channels as usize
    }

    /// Duration of one buffer in milliseconds
    pub fn buffer_period_ms(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames_per_buffer as f32 * 1000.0 / self.sample_rate as f32
    }
}

/// One fixed-capacity block of 16-bit PCM
///
/// `capacity` is fixed at allocation. `filled_size` is the number of valid
/// bytes: zero when the buffer sits in the free pool, `capacity` once a
/// capture completes.
#[derive(Debug)]
pub struct SampleBuffer {
    id: usize,
    data: Box<[i16]>,
    capacity: usize,
    filled_size: usize,
}

impl SampleBuffer {
    fn with_storage(id: usize, data: Box<[i16]>, capacity: usize) -> Self {
        Self {
            id,
            data,
            capacity,
            filled_size: 0,
        }
    }

    /// Pool-assigned identity, stable for the buffer's lifetime
    pub fn id(&self) -> usize {
        self.id
    }

    /// Capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Valid bytes
    pub fn filled_size(&self) -> usize {
        self.filled_size
    }

    pub fn is_empty(&self) -> bool {
        self.filled_size == 0
    }

    pub fn is_full(&self) -> bool {
        self.filled_size == self.capacity
    }

    /// Mark the whole capacity as valid (a device completed the capture)
    pub fn mark_full(&mut self) {
        self.filled_size = self.capacity;
    }

    /// Record partial progress, clamped to capacity
    pub fn set_filled_size(&mut self, bytes: usize) {
        self.filled_size = bytes.min(self.capacity);
    }

    /// Forget the contents; storage is kept
    pub fn clear(&mut self) {
        self.filled_size = 0;
    }

    /// Number of samples that fit in the buffer
    pub fn sample_capacity(&self) -> usize {
        self.capacity / 2
    }

    /// All sample slots, valid or not
    pub fn samples(&self) -> &[i16] {
        &self.data[..self.sample_capacity()]
    }

    pub fn samples_mut(&mut self) -> &mut [i16] {
        let n = self.sample_capacity();
        &mut self.data[..n]
    }

    /// Only the samples covered by `filled_size`
    pub fn filled_samples(&self) -> &[i16] {
        &self.data[..self.filled_size / 2]
    }

    pub fn filled_samples_mut(&mut self) -> &mut [i16] {
        let n = self.filled_size / 2;
        &mut self.data[..n]
    }
}

/// Owner of the engine's fixed buffer budget
///
/// The pool hands out every buffer exactly once at startup and takes them
/// all back at teardown. There is no resize operation.
#[derive(Debug)]
pub struct SampleBufferPool {
    count: usize,
    buffer_size: usize,
    unclaimed: Vec<SampleBuffer>,
}

impl SampleBufferPool {
    /// Allocate `count` zeroed buffers of exactly `buffer_size` bytes
    ///
    /// Allocation failure is reported as [`AudioError::PoolAllocation`]; the
    /// engine cannot run without its full budget.
    pub fn allocate(count: usize, buffer_size: usize) -> Result<Self, AudioError> {
        let fail = || AudioError::PoolAllocation {
            count,
            size: buffer_size,
        };
        if count == 0 || buffer_size == 0 {
            return Err(fail());
        }

        let mut unclaimed = Vec::new();
        unclaimed.try_reserve_exact(count).map_err(|_| fail())?;

        let slots = buffer_size.div_ceil(2);
        for id in 0..count {
            let mut storage: Vec<i16> = Vec::new();
            storage.try_reserve_exact(slots).map_err(|_| fail())?;
            storage.resize(slots, 0);
            unclaimed.push(SampleBuffer::with_storage(
                id,
                storage.into_boxed_slice(),
                buffer_size,
            ));
        }

        debug!(
            "Allocated {} sample buffers of {} bytes",
            count, buffer_size
        );
        Ok(Self {
            count,
            buffer_size,
            unclaimed,
        })
    }

    /// Total buffers owned by the pool
    pub fn count(&self) -> usize {
        self.count
    }

    /// Per-buffer capacity in bytes
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Hand out every buffer not yet claimed
    pub fn take_all(&mut self) -> Vec<SampleBuffer> {
        std::mem::take(&mut self.unclaimed)
    }

    /// Free the storage of `returned` buffers
    ///
    /// Must be called once every buffer is back. Returns how many buffers
    /// never came back; duplicates and strangers are logged as defects.
    pub fn release<I>(self, returned: I) -> usize
    where
        I: IntoIterator<Item = SampleBuffer>,
    {
        let mut seen = vec![false; self.count];
        let mut back = 0usize;
        for buf in returned.into_iter().chain(self.unclaimed) {
            match seen.get_mut(buf.id) {
                Some(slot) if !*slot => {
                    *slot = true;
                    back += 1;
                }
                Some(_) => error!("Buffer {} returned twice", buf.id),
                None => error!("Buffer {} does not belong to this pool", buf.id),
            }
        }

        let missing = self.count - back;
        if missing > 0 {
            error!(
                "Released pool with {} of {} buffers missing",
                missing, self.count
            );
        }
        missing
    }
}
