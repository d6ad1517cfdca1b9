//! Capture stage: keeps the recording device supplied with empty buffers
//!
//! Empty buffers come from the free pool; filled buffers go through the
//! engine's message dispatch (effect processing) and into the ready queue.
//! When the free pool runs dry and the last in-flight buffer completes, the
//! stage stops its device and waits for a buffer to come back.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::buffer::SampleBuffer;
use super::device::{AudioDevice, DeviceEvent, DeviceState};
use super::engine::{EngineMessage, EngineService};
use super::error::AudioError;
use super::queue::BufferQueue;

/// Capture stage state, as seen through its device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Stopped,
    Recording,
}

pub struct CaptureStage {
    device: Arc<dyn AudioDevice>,
    free: Arc<BufferQueue<SampleBuffer>>,
    ready: Arc<BufferQueue<SampleBuffer>>,
    depth: usize,
    kickstart: usize,
    // Buffers held by the device or waiting in its event channel
    in_flight: AtomicUsize,
    active: AtomicBool,
    stalled: AtomicBool,
    completed: AtomicU64,
    control: Mutex<()>,
    submit: spin::Mutex<()>,
}

impl CaptureStage {
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
            in_flight: AtomicUsize::new(0),
            active: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            control: Mutex::new(()),
            submit: spin::Mutex::new(()),
        }
    }

    /// Reset the device and start recording into free buffers
    ///
    /// A free pool holding fewer than the kickstart count is logged, not
    /// fatal. Device failures are returned and leave the stage stopped.
    pub fn start(&self) -> Result<(), AudioError> {
        let _control = self.control.lock();
        self.start_locked()
    }

    fn start_locked(&self) -> Result<(), AudioError> {
        self.stalled.store(false, Ordering::SeqCst);
        self.device.set_state(DeviceState::Stopped)?;
        self.reclaim_device();
        self.active.store(true, Ordering::SeqCst);

        let submitted = self.refill(self.kickstart);
        if submitted < self.kickstart {
            warn!(
                "Capture kickstart short: {} of {} buffers available",
                submitted, self.kickstart
            );
        }

        if submitted == 0 {
            // Nothing to record into: the device stays stopped until a
            // buffer is released
            self.stalled.store(true, Ordering::SeqCst);
            if self.free.is_empty()
                || self
                    .stalled
                    .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
            {
                debug!("Capture stalled at start: free pool empty");
                return Ok(());
            }
            return self.start_locked();
        }

        if let Err(e) = self.device.set_state(DeviceState::Running) {
            self.active.store(false, Ordering::SeqCst);
            self.reclaim_device();
            return Err(e);
        }
        debug!("Capture started with {} buffers in flight", submitted);
        Ok(())
    }

    /// Halt the device and reclaim everything it holds into the free pool
    ///
    /// Calling `stop` on a stopped stage moves no buffers. A device that
    /// stopped on its own (disconnect) still has its buffers reclaimed.
    pub fn stop(&self) -> Result<(), AudioError> {
        let _control = self.control.lock();
        self.active.store(false, Ordering::SeqCst);
        self.stalled.store(false, Ordering::SeqCst);
        let was_running = self.device.state() == DeviceState::Running;
        if was_running {
            self.device.set_state(DeviceState::Stopped)?;
        }

        let reclaimed = self.reclaim_device();
        if was_running || reclaimed > 0 {
            info!("Capture stopped, {} buffers reclaimed", reclaimed);
        }
        Ok(())
    }

    /// Restart a stage that stopped itself for lack of free buffers
    ///
    /// Returns `Ok(true)` if the stage was restarted.
    pub fn resume(&self) -> Result<bool, AudioError> {
        if self
            .stalled
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }

        let _control = self.control.lock();
        if !self.active.load(Ordering::SeqCst) {
            return Ok(false);
        }
        debug!("Capture resuming after backpressure stall");
        self.start_locked()?;
        Ok(true)
    }

    /// Handle one event from the capture device
    pub fn handle_event(&self, event: DeviceEvent, service: &dyn EngineService) {
        match event {
            DeviceEvent::BufferCompleted(buffer) => self.on_buffer_filled(buffer, service),
            DeviceEvent::Disconnected => warn!("Capture device disconnected"),
            DeviceEvent::StreamError(msg) => error!("Capture stream error: {}", msg),
        }
    }

    fn on_buffer_filled(&self, mut buffer: SampleBuffer, service: &dyn EngineService) {
        if !self.active.load(Ordering::SeqCst) {
            debug!("Stray capture completion for buffer {}", buffer.id());
            buffer.clear();
            self.return_to_free(buffer);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        buffer.mark_full();
        service.dispatch(EngineMessage::RecordedAudioAvailable(&mut buffer));
        self.completed.fetch_add(1, Ordering::Relaxed);

        match self.ready.push(buffer) {
            Ok(()) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                service.dispatch(EngineMessage::RecordedAudioQueued);
            }
            Err(mut buffer) => {
                error!("Ready queue full, dropping captured buffer {}", buffer.id());
                buffer.clear();
                self.return_to_free(buffer);
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        }

        self.refill(usize::MAX);
        if self.in_flight.load(Ordering::SeqCst) == 0 {
            self.stall();
        }
    }

    fn stall(&self) {
        {
            let _control = self.control.lock();
            if !self.active.load(Ordering::SeqCst) || self.in_flight.load(Ordering::SeqCst) != 0 {
                return;
            }
            if let Err(e) = self.device.set_state(DeviceState::Stopped) {
                error!("Failed to stop stalled capture device: {}", e);
            }
            self.stalled.store(true, Ordering::SeqCst);
            debug!("Capture stalled: free pool empty");
        }

        // A buffer may have been released between the refill and the stall
        if !self.free.is_empty() {
            if let Err(e) = self.resume() {
                error!("Failed to resume capture: {}", e);
            }
        }
    }

    /// Move free buffers into the device, at most `limit` of them
    fn refill(&self, limit: usize) -> usize {
        let _submit = self.submit.lock();
        let mut submitted = 0;
        while submitted < limit
            && self.active.load(Ordering::SeqCst)
            && self.in_flight.load(Ordering::SeqCst) < self.depth
        {
            let Some(buffer) = self.free.pop() else {
                break;
            };
            debug_assert!(buffer.is_empty(), "free buffer {} holds data", buffer.id());

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            if let Err(buffer) = self.device.enqueue(buffer) {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                warn!("Capture device queue full, buffer {} stays free", buffer.id());
                self.return_to_free(buffer);
                break;
            }
            submitted += 1;
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

    fn return_to_free(&self, buffer: SampleBuffer) {
        if let Err(buffer) = self.free.push(buffer) {
            error!("Free pool full, buffer {} lost", buffer.id());
        }
    }

    pub fn state(&self) -> CaptureState {
        match self.device.state() {
            DeviceState::Running => CaptureState::Recording,
            DeviceState::Stopped => CaptureState::Stopped,
        }
    }

    /// True while stopped by backpressure rather than by `stop`
    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }

    /// Buffers held by the device or awaiting handling
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Buffers recorded since creation
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn device(&self) -> &Arc<dyn AudioDevice> {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::{SampleBufferPool, SampleFormat};
    use crate::audio::device::{event_channel, DeviceRequest, EventReceiver};
    use crate::audio::virtual_device::VirtualDevice;

    /// Records every message and forwards nothing
    #[derive(Default)]
    struct RecordingService {
        messages: spin::Mutex<Vec<&'static str>>,
    }

    impl EngineService for RecordingService {
        fn dispatch(&self, message: EngineMessage<'_>) -> bool {
            let name = match message {
                EngineMessage::RecordedAudioAvailable(buffer) => {
                    assert!(buffer.is_full());
                    "available"
                }
                EngineMessage::RecordedAudioQueued => "queued",
                EngineMessage::PlaybackBufferReleased => "released",
            };
            self.messages.lock().push(name);
            true
        }
    }

    struct Fixture {
        stage: CaptureStage,
        device: Arc<VirtualDevice>,
        events: EventReceiver,
        free: Arc<BufferQueue<SampleBuffer>>,
        ready: Arc<BufferQueue<SampleBuffer>>,
    }

    fn fixture(buffers: usize, depth: usize, kickstart: usize) -> Fixture {
        let (tx, events) = event_channel(buffers);
        let request = DeviceRequest {
            format: SampleFormat::new(8000, 1, 4),
            queue_depth: depth,
            device_name: None,
            echo_cancellation: false,
            noise_suppression: false,
            events: tx,
        };
        let device = Arc::new(VirtualDevice::new("mic", &request));
        let free = Arc::new(BufferQueue::new(buffers));
        let ready = Arc::new(BufferQueue::new(buffers));
        for buf in SampleBufferPool::allocate(buffers, 8).unwrap().take_all() {
            free.push(buf).unwrap();
        }
        let stage = CaptureStage::new(device.clone(), free.clone(), ready.clone(), depth, kickstart);
        Fixture {
            stage,
            device,
            events,
            free,
            ready,
        }
    }

    fn deliver(f: &Fixture, service: &dyn EngineService) {
        while let Ok(event) = f.events.try_recv() {
            f.stage.handle_event(event, service);
        }
    }

    #[test]
    fn test_start_submits_kickstart_buffers() {
        let f = fixture(6, 4, 2);
        f.stage.start().unwrap();

        assert_eq!(f.stage.state(), CaptureState::Recording);
        assert_eq!(f.device.queued(), 2);
        assert_eq!(f.stage.in_flight(), 2);
        assert_eq!(f.free.len(), 4);
    }

    #[test]
    fn test_completion_flows_to_ready_and_refills() {
        let f = fixture(6, 4, 2);
        let service = RecordingService::default();
        f.stage.start().unwrap();

        assert!(f.device.complete_next(|buf| buf.samples_mut().fill(3)));
        deliver(&f, &service);

        assert_eq!(*service.messages.lock(), vec!["available", "queued"]);
        assert_eq!(f.ready.len(), 1);
        assert_eq!(f.ready.front(|b| b.filled_samples().to_vec()), Some(vec![3; 4]));
        // Refilled up to the in-flight depth
        assert_eq!(f.stage.in_flight(), 4);
        assert_eq!(f.free.len() + f.stage.in_flight() + f.ready.len(), 6);
        assert_eq!(f.stage.completed(), 1);
    }

    #[test]
    fn test_stalls_when_free_pool_is_exhausted() {
        let f = fixture(3, 2, 2);
        let service = RecordingService::default();
        f.stage.start().unwrap();

        while f.device.complete_next(|_| {}) {
            deliver(&f, &service);
        }

        assert_eq!(f.ready.len(), 3);
        assert_eq!(f.stage.in_flight(), 0);
        assert!(f.stage.is_stalled());
        assert_eq!(f.stage.state(), CaptureState::Stopped);

        // A returned buffer restarts recording
        let mut buf = f.ready.pop().unwrap();
        buf.clear();
        f.free.push(buf).unwrap();
        assert!(f.stage.resume().unwrap());
        assert_eq!(f.stage.state(), CaptureState::Recording);
        assert_eq!(f.stage.in_flight(), 1);
        assert!(!f.stage.resume().unwrap());
    }

    #[test]
    fn test_stop_is_idempotent_and_reclaims() {
        let f = fixture(4, 4, 2);
        f.stage.start().unwrap();

        f.stage.stop().unwrap();
        assert_eq!(f.stage.state(), CaptureState::Stopped);
        assert_eq!(f.free.len(), 4);
        assert_eq!(f.stage.in_flight(), 0);

        f.stage.stop().unwrap();
        assert_eq!(f.free.len(), 4);
        assert!(!f.stage.resume().unwrap());
    }

    #[test]
    fn test_stray_completion_returns_to_free() {
        let f = fixture(4, 4, 2);
        let service = RecordingService::default();
        f.stage.start().unwrap();
        assert!(f.device.complete_next(|buf| buf.samples_mut().fill(1)));

        f.stage.stop().unwrap();
        assert_eq!(f.stage.in_flight(), 1);
        deliver(&f, &service);

        assert!(service.messages.lock().is_empty());
        assert_eq!(f.free.len(), 4);
        assert_eq!(f.stage.in_flight(), 0);
        assert!(f.ready.is_empty());
    }

    #[test]
    fn test_device_start_failure_leaves_stage_stopped() {
        let f = fixture(4, 4, 2);
        f.device.fail_next_start();

        assert!(f.stage.start().is_err());
        assert_eq!(f.stage.state(), CaptureState::Stopped);
        assert_eq!(f.free.len(), 4);
        assert_eq!(f.stage.in_flight(), 0);
    }

    #[test]
    fn test_kickstart_shortfall_is_not_fatal() {
        let f = fixture(1, 1, 1);
        let held = f.free.pop().unwrap();

        f.stage.start().unwrap();
        assert_eq!(f.stage.in_flight(), 0);
        assert!(f.stage.is_stalled());
        assert_eq!(f.stage.state(), CaptureState::Stopped);
        assert_eq!(f.device.state(), DeviceState::Stopped);

        f.free.push(held).unwrap();
        assert!(f.stage.resume().unwrap());
        assert_eq!(f.stage.state(), CaptureState::Recording);
        assert_eq!(f.stage.in_flight(), 1);
    }
}
