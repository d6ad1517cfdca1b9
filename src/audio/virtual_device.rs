//! Virtual devices driven by the caller
//!
//! A [`VirtualDevice`] behaves like a platform buffer-queue device, except that
//! buffers complete only when the owner calls [`VirtualDevice::complete_next`].
//! Used by the simulator and by tests that need deterministic completions.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::TrySendError;
use std::sync::Arc;

use tracing::{debug, error, warn};

use super::buffer::SampleBuffer;
use super::device::{
    AudioBackend, AudioDevice, DeviceEvent, DeviceRequest, DeviceState, EventSender,
    PreprocessingControl, Preprocessor,
};
use super::error::AudioError;
use super::queue::BufferQueue;

/// Preprocessing switch with no processing behind it
#[derive(Debug, Default)]
pub struct VirtualPreprocessor {
    enabled: AtomicBool,
}

impl PreprocessingControl for VirtualPreprocessor {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

/// Manually clocked buffer-queue device
pub struct VirtualDevice {
    name: String,
    queue: BufferQueue<SampleBuffer>,
    state: AtomicU8,
    events: EventSender,
    samples_per_buffer: usize,
    completed: AtomicU64,
    xruns: AtomicU64,
    fail_next_start: AtomicBool,
    echo_cancellation: Option<VirtualPreprocessor>,
    noise_suppression: Option<VirtualPreprocessor>,
}

impl VirtualDevice {
    pub fn new(name: impl Into<String>, request: &DeviceRequest) -> Self {
        Self {
            name: name.into(),
            queue: BufferQueue::new(request.queue_depth),
            state: AtomicU8::new(DeviceState::Stopped.to_u8()),
            events: request.events.clone(),
            samples_per_buffer: request.format.samples_per_buffer(),
            completed: AtomicU64::new(0),
            xruns: AtomicU64::new(0),
            fail_next_start: AtomicBool::new(false),
            echo_cancellation: None,
            noise_suppression: None,
        }
    }

    /// Expose a preprocessing capability, initially set to `enabled`
    pub fn with_preprocessor(mut self, kind: Preprocessor, enabled: bool) -> Self {
        let control = VirtualPreprocessor {
            enabled: AtomicBool::new(enabled),
        };
        match kind {
            Preprocessor::EchoCancellation => self.echo_cancellation = Some(control),
            Preprocessor::NoiseSuppression => self.noise_suppression = Some(control),
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Complete the oldest queued buffer
    ///
    /// `io` plays the hardware: it writes captured samples or reads the
    /// samples being played. Returns false when the device is stopped or has
    /// nothing queued; a running device with nothing queued counts one
    /// buffer of xruns.
    pub fn complete_next(&self, io: impl FnOnce(&mut SampleBuffer)) -> bool {
        if self.state() != DeviceState::Running {
            return false;
        }
        let Some(mut buffer) = self.queue.pop() else {
            self.xruns
                .fetch_add(self.samples_per_buffer as u64, Ordering::Relaxed);
            return false;
        };

        io(&mut buffer);
        self.completed.fetch_add(1, Ordering::Relaxed);
        match self.events.try_send(DeviceEvent::BufferCompleted(buffer)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                error!("{}: event channel full, completion lost", self.name);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("{}: stage gone, completion dropped", self.name);
                false
            }
        }
    }

    /// Buffers currently held by the device
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Id of the buffer that will complete next
    pub fn next_buffer_id(&self) -> Option<usize> {
        self.queue.front(SampleBuffer::id)
    }

    /// Buffers completed since creation
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Make the next transition to `Running` fail
    pub fn fail_next_start(&self) {
        self.fail_next_start.store(true, Ordering::SeqCst);
    }

    /// Report the device as gone; queued buffers stay until cleared
    pub fn disconnect(&self) {
        self.state
            .store(DeviceState::Stopped.to_u8(), Ordering::SeqCst);
        if self.events.try_send(DeviceEvent::Disconnected).is_err() {
            warn!("{}: disconnect not delivered", self.name);
        }
    }

    /// Report a stream error without stopping
    pub fn report_error(&self, message: impl Into<String>) {
        if self
            .events
            .try_send(DeviceEvent::StreamError(message.into()))
            .is_err()
        {
            warn!("{}: stream error not delivered", self.name);
        }
    }
}

impl AudioDevice for VirtualDevice {
    fn enqueue(&self, buffer: SampleBuffer) -> Result<(), SampleBuffer> {
        self.queue.push(buffer)
    }

    fn set_state(&self, state: DeviceState) -> Result<(), AudioError> {
        if state == DeviceState::Running && self.fail_next_start.swap(false, Ordering::SeqCst) {
            return Err(AudioError::DeviceStateFailed(format!(
                "{} refused to start",
                self.name
            )));
        }
        self.state.store(state.to_u8(), Ordering::SeqCst);
        Ok(())
    }

    fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn clear(&self, reclaim: &mut dyn FnMut(SampleBuffer)) -> usize {
        self.queue.drain(reclaim)
    }

    fn xruns(&self) -> u64 {
        self.xruns.load(Ordering::Relaxed)
    }

    fn preprocessing(&self, kind: Preprocessor) -> Option<&dyn PreprocessingControl> {
        let control = match kind {
            Preprocessor::EchoCancellation => self.echo_cancellation.as_ref(),
            Preprocessor::NoiseSuppression => self.noise_suppression.as_ref(),
        };
        control.map(|c| c as &dyn PreprocessingControl)
    }
}

/// Backend that opens [`VirtualDevice`]s and keeps handles for the driver
#[derive(Default)]
pub struct VirtualBackend {
    echo_cancellation_supported: bool,
    noise_suppression_supported: bool,
    capture: spin::Mutex<Option<Arc<VirtualDevice>>>,
    playback: spin::Mutex<Option<Arc<VirtualDevice>>>,
}

impl VirtualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give opened capture devices the listed preprocessing capabilities
    pub fn with_preprocessing(mut self, echo_cancellation: bool, noise_suppression: bool) -> Self {
        self.echo_cancellation_supported = echo_cancellation;
        self.noise_suppression_supported = noise_suppression;
        self
    }

    /// The most recently opened capture device
    pub fn capture_device(&self) -> Option<Arc<VirtualDevice>> {
        self.capture.lock().clone()
    }

    /// The most recently opened playback device
    pub fn playback_device(&self) -> Option<Arc<VirtualDevice>> {
        self.playback.lock().clone()
    }
}

impl AudioBackend for VirtualBackend {
    fn open_capture(&self, request: DeviceRequest) -> Result<Arc<dyn AudioDevice>, AudioError> {
        let name = request
            .device_name
            .clone()
            .unwrap_or_else(|| "virtual-capture".to_string());
        let mut device = VirtualDevice::new(name, &request);
        if self.echo_cancellation_supported {
            device = device.with_preprocessor(Preprocessor::EchoCancellation, request.echo_cancellation);
        }
        if self.noise_suppression_supported {
            device = device.with_preprocessor(Preprocessor::NoiseSuppression, request.noise_suppression);
        }

        let device = Arc::new(device);
        *self.capture.lock() = Some(device.clone());
        Ok(device)
    }

    fn open_playback(&self, request: DeviceRequest) -> Result<Arc<dyn AudioDevice>, AudioError> {
        let name = request
            .device_name
            .clone()
            .unwrap_or_else(|| "virtual-playback".to_string());
        let device = Arc::new(VirtualDevice::new(name, &request));
        *self.playback.lock() = Some(device.clone());
        Ok(device)
    }
}
