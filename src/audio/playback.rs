//! Playback stage: plays ready buffers and returns them to the free pool

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::buffer::SampleBuffer;
use super::device::{AudioDevice, DeviceEvent, DeviceState};
use super::engine::{EngineMessage, EngineService};
use super::error::AudioError;
use super::queue::BufferQueue;

/// Playback stage state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    /// Device running with nothing to play
    WaitingForData,
    Playing,
}

impl PlaybackState {
    fn to_u8(self) -> u8 {
        match self {
            PlaybackState::Stopped => 0,
            PlaybackState::WaitingForData => 1,
            PlaybackState::Playing => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => PlaybackState::WaitingForData,
            2 => PlaybackState::Playing,
            _ => PlaybackState::Stopped,
        }
    }
}

pub struct PlaybackStage {
    device: Arc<dyn AudioDevice>,
    free: Arc<BufferQueue<SampleBuffer>>,
    ready: Arc<BufferQueue<SampleBuffer>>,
    depth: usize,
    kickstart: usize,
    state: AtomicU8,
    in_flight: AtomicUsize,
    completed: AtomicU64,
    control: Mutex<()>,
    submit: spin::Mutex<()>,
}

impl PlaybackStage {
    pub fn new(
        device: Arc<dyn AudioDevice>,
        free: Arc<BufferQueue<SampleBuffer>>,
        ready: Arc<BufferQueue<SampleBuffer>>,
        depth: usize,
        kickstart: usize,
    ) -> Self {
        Self {
            device,
            free,
            ready,
            depth,
            kickstart: kickstart.min(depth),
            state: AtomicU8::new(PlaybackState::Stopped.to_u8()),
            in_flight: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            control: Mutex::new(()),
            submit: spin::Mutex::new(()),
        }
    }

    /// Reset the device, prime it with ready buffers and run it
    ///
    /// Ends in `Playing` if anything was submitted, `WaitingForData`
    /// otherwise.
    pub fn start(&self) -> Result<(), AudioError> {
        let _control = self.control.lock();
        self.device.set_state(DeviceState::Stopped)?;
        self.reclaim_device();
        self.set_state(PlaybackState::WaitingForData);

        let submitted = self.feed(self.kickstart);

        if let Err(e) = self.device.set_state(DeviceState::Running) {
            self.set_state(PlaybackState::Stopped);
            self.reclaim_device();
            return Err(e);
        }
        debug!("Playback started with {} buffers primed", submitted);
        Ok(())
    }

    /// Halt the device and reclaim everything it holds into the free pool
    ///
    /// Calling `stop` on a stopped stage is a no-op.
    pub fn stop(&self) -> Result<(), AudioError> {
        let _control = self.control.lock();
        let previous = self.swap_state(PlaybackState::Stopped);
        if previous == PlaybackState::Stopped && self.device.state() == DeviceState::Stopped {
            return Ok(());
        }

        self.device.set_state(DeviceState::Stopped)?;
        let reclaimed = self.reclaim_device();
        info!("Playback stopped, {} buffers reclaimed", reclaimed);
        Ok(())
    }

    /// Recorded audio was queued; start playing if idle
    pub fn on_data_ready(&self) {
        if self.state() == PlaybackState::WaitingForData {
            self.feed(self.kickstart);
        }
    }

    /// Handle one event from the playback device
    pub fn handle_event(&self, event: DeviceEvent, service: &dyn EngineService) {
        match event {
            DeviceEvent::BufferCompleted(buffer) => self.on_buffer_played(buffer, service),
            DeviceEvent::Disconnected => warn!("Playback device disconnected"),
            DeviceEvent::StreamError(msg) => error!("Playback stream error: {}", msg),
        }
    }

    fn on_buffer_played(&self, mut buffer: SampleBuffer, service: &dyn EngineService) {
        buffer.clear();
        self.completed.fetch_add(1, Ordering::Relaxed);
        if let Err(buffer) = self.free.push(buffer) {
            error!("Free pool full, buffer {} lost", buffer.id());
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        service.dispatch(EngineMessage::PlaybackBufferReleased);

        if self.state() == PlaybackState::Stopped {
            return;
        }
        self.feed(usize::MAX);

        if self.in_flight.load(Ordering::SeqCst) == 0
            && self
                .state
                .compare_exchange(
                    PlaybackState::Playing.to_u8(),
                    PlaybackState::WaitingForData.to_u8(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
        {
            debug!("Playback waiting for data");
            // Data queued while we were switching would otherwise wait for the
            // next capture completion
            if !self.ready.is_empty() {
                self.feed(self.kickstart);
            }
        }
    }

    /// Move ready buffers into the device, at most `limit` of them
    fn feed(&self, limit: usize) -> usize {
        let _submit = self.submit.lock();
        let mut submitted = 0;
        while submitted < limit
            && self.state() != PlaybackState::Stopped
            && self.in_flight.load(Ordering::SeqCst) < self.depth
        {
            let Some(buffer) = self.ready.pop() else {
                break;
            };

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            if let Err(mut buffer) = self.device.enqueue(buffer) {
                // The in-flight bound keeps the device queue from filling up.
                // Requeueing at the tail would reorder audio, so the buffer
                // is dropped from playback instead.
                let held = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
                debug_assert!(
                    held >= self.depth,
                    "playback device rejected buffer {} with {} in flight",
                    buffer.id(),
                    held
                );
                error!("Playback device queue full, buffer {} skipped", buffer.id());
                buffer.clear();
                if let Err(buffer) = self.free.push(buffer) {
                    error!("Free pool full, buffer {} lost", buffer.id());
                }
                break;
            }
            submitted += 1;
        }

        if self.in_flight.load(Ordering::SeqCst) > 0 {
            let _ = self.state.compare_exchange(
                PlaybackState::WaitingForData.to_u8(),
                PlaybackState::Playing.to_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
        submitted
    }

    fn reclaim_device(&self) -> usize {
        let _submit = self.submit.lock();
        let free = &self.free;
        let reclaimed = self.device.clear(&mut |mut buffer| {
            buffer.clear();
            if let Err(buffer) = free.push(buffer) {
                error!("Free pool full, buffer {} lost", buffer.id());
            }
        });
        self.in_flight.fetch_sub(reclaimed, Ordering::SeqCst);
        reclaimed
    }

    fn set_state(&self, state: PlaybackState) {
        self.state.store(state.to_u8(), Ordering::SeqCst);
    }

    fn swap_state(&self, state: PlaybackState) -> PlaybackState {
        PlaybackState::from_u8(self.state.swap(state.to_u8(), Ordering::SeqCst))
    }

    pub fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Buffers held by the device or awaiting handling
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Buffers played since creation
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn device(&self) -> &Arc<dyn AudioDevice> {
        &self.device
    }
}
