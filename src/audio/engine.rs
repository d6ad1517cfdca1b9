//! Echo engine: owns the buffer budget, both stages and the delay effect

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::buffer::{SampleBuffer, SampleBufferPool, SampleFormat};
use super::capture::{CaptureStage, CaptureState};
use super::device::{
    event_channel, AudioBackend, AudioDevice, DeviceEvent, DeviceRequest, EventReceiver,
    Preprocessor,
};
use super::effects::DelayEffect;
use super::error::AudioError;
use super::playback::{PlaybackStage, PlaybackState};
use super::queue::BufferQueue;
use crate::config::{DispatchMode, EchoConfig};

/// How long a stage worker waits for an event before checking for shutdown
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Events that are not buffer completions (disconnect, stream errors)
const CONTROL_EVENT_SLACK: usize = 4;

/// Messages the stages send to the engine
#[derive(Debug)]
pub enum EngineMessage<'a> {
    /// A capture completed; the buffer may be processed in place
    RecordedAudioAvailable(&'a mut SampleBuffer),
    /// A buffer entered the ready queue
    RecordedAudioQueued,
    /// A played buffer returned to the free pool
    PlaybackBufferReleased,
}

/// Receiver of stage messages
pub trait EngineService: Send + Sync {
    /// Handle `message`; returns false if it could not be acted on
    fn dispatch(&self, message: EngineMessage<'_>) -> bool;
}

/// Routes stage messages to the effect and the opposite stage
pub struct EngineRouter {
    capture: Arc<CaptureStage>,
    playback: Arc<PlaybackStage>,
    effect: Mutex<DelayEffect>,
    channels: usize,
    frames: AtomicU64,
    skipped: AtomicU64,
}

impl EngineService for EngineRouter {
    fn dispatch(&self, message: EngineMessage<'_>) -> bool {
        match message {
            EngineMessage::RecordedAudioAvailable(buffer) => {
                let samples = buffer.filled_samples_mut();
                let frames = samples.len() / self.channels;
                // Never wait on a reconfiguration from the audio path
                match self.effect.try_lock() {
                    Some(mut effect) => effect.process(samples, frames),
                    None => {
                        self.skipped.fetch_add(1, Ordering::Relaxed);
                        debug!("Effect busy, buffer {} passed through", buffer.id());
                    }
                }
                self.frames.fetch_add(frames as u64, Ordering::Relaxed);
                true
            }
            EngineMessage::RecordedAudioQueued => {
                self.playback.on_data_ready();
                true
            }
            EngineMessage::PlaybackBufferReleased => match self.capture.resume() {
                Ok(_) => true,
                Err(e) => {
                    error!("Failed to resume capture: {}", e);
                    false
                }
            },
        }
    }
}

/// Where every buffer is at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDistribution {
    pub free: usize,
    pub capture_in_flight: usize,
    pub ready: usize,
    pub playback_in_flight: usize,
}

impl BufferDistribution {
    pub fn total(&self) -> usize {
        self.free + self.capture_in_flight + self.ready + self.playback_in_flight
    }
}

impl fmt::Display for BufferDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "playback={} capture={} free={} ready={}",
            self.playback_in_flight, self.capture_in_flight, self.free, self.ready
        )
    }
}

enum Dispatch {
    /// Events wait in the channels until `pump`
    Inline {
        capture_events: EventReceiver,
        playback_events: EventReceiver,
    },
    Threaded {
        shutdown: Arc<AtomicBool>,
        workers: Vec<JoinHandle<EventReceiver>>,
    },
    Finished,
}

/// Full-duplex echo pipeline over one capture and one playback device
pub struct EchoEngine {
    format: SampleFormat,
    buffer_count: usize,
    pool: Option<SampleBufferPool>,
    free: Arc<BufferQueue<SampleBuffer>>,
    ready: Arc<BufferQueue<SampleBuffer>>,
    capture: Arc<CaptureStage>,
    playback: Arc<PlaybackStage>,
    router: Arc<EngineRouter>,
    dispatch: Dispatch,
}

impl EchoEngine {
    /// Allocate the buffer budget, open both devices and wire the stages
    pub fn initialize(config: &EchoConfig, backend: &dyn AudioBackend) -> Result<Self, AudioError> {
        config.validate().map_err(AudioError::UnsupportedConfig)?;

        let format = config.sample_format();
        let buffer_count = config.buffer_count;
        let mut pool = SampleBufferPool::allocate(buffer_count, format.buffer_bytes())?;

        let free = Arc::new(BufferQueue::new(buffer_count));
        let ready = Arc::new(BufferQueue::new(buffer_count));
        for buffer in pool.take_all() {
            if free.push(buffer).is_err() {
                return Err(AudioError::PoolAllocation {
                    count: buffer_count,
                    size: format.buffer_bytes(),
                });
            }
        }

        let (capture_tx, capture_events) = event_channel(buffer_count + CONTROL_EVENT_SLACK);
        let (playback_tx, playback_events) = event_channel(buffer_count + CONTROL_EVENT_SLACK);

        let capture_device = backend.open_capture(DeviceRequest {
            format,
            queue_depth: config.device_queue_depth,
            device_name: config.input_device.clone(),
            echo_cancellation: config.echo_cancellation,
            noise_suppression: config.noise_suppression,
            events: capture_tx,
        })?;
        let playback_device = backend.open_playback(DeviceRequest {
            format,
            queue_depth: config.device_queue_depth,
            device_name: config.output_device.clone(),
            echo_cancellation: false,
            noise_suppression: false,
            events: playback_tx,
        })?;

        for (kind, requested) in [
            (Preprocessor::EchoCancellation, config.echo_cancellation),
            (Preprocessor::NoiseSuppression, config.noise_suppression),
        ] {
            if requested && capture_device.preprocessing(kind).is_none() {
                warn!("{:?} requested but not supported by the capture device", kind);
            }
        }

        let capture = Arc::new(CaptureStage::new(
            capture_device,
            free.clone(),
            ready.clone(),
            config.device_queue_depth,
            config.capture_kickstart,
        ));
        let playback = Arc::new(PlaybackStage::new(
            playback_device,
            free.clone(),
            ready.clone(),
            config.device_queue_depth,
            config.playback_kickstart,
        ));
        let router = Arc::new(EngineRouter {
            capture: capture.clone(),
            playback: playback.clone(),
            effect: Mutex::new(DelayEffect::new(
                format.sample_rate,
                format.channels,
                config.delay_ms,
                config.decay,
            )?),
            channels: format.channels as usize,
            frames: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        });

        let dispatch = match config.dispatch {
            DispatchMode::Inline => Dispatch::Inline {
                capture_events,
                playback_events,
            },
            DispatchMode::Threaded => {
                let shutdown = Arc::new(AtomicBool::new(false));
                let capture_worker = {
                    let stage = capture.clone();
                    let router = router.clone();
                    spawn_worker("echoloop-capture", capture_events, shutdown.clone(), move |ev| {
                        stage.handle_event(ev, router.as_ref())
                    })?
                };
                let playback_worker = {
                    let stage = playback.clone();
                    let router = router.clone();
                    spawn_worker("echoloop-playback", playback_events, shutdown.clone(), move |ev| {
                        stage.handle_event(ev, router.as_ref())
                    })
                };
                let playback_worker = match playback_worker {
                    Ok(worker) => worker,
                    Err(e) => {
                        shutdown.store(true, Ordering::SeqCst);
                        let _ = capture_worker.join();
                        return Err(e);
                    }
                };
                Dispatch::Threaded {
                    shutdown,
                    workers: vec![capture_worker, playback_worker],
                }
            }
        };

        info!(
            "Echo engine initialized: {} buffers of {} bytes, {} Hz, {} ch, delay {} ms, decay {}",
            buffer_count,
            format.buffer_bytes(),
            format.sample_rate,
            format.channels,
            config.delay_ms,
            config.decay
        );

        Ok(Self {
            format,
            buffer_count,
            pool: Some(pool),
            free,
            ready,
            capture,
            playback,
            router,
            dispatch,
        })
    }

    /// Start playback, then capture
    ///
    /// If capture fails to start, playback is stopped again.
    pub fn start(&self) -> Result<(), AudioError> {
        if self.pool.is_none() {
            return Err(AudioError::NotInitialized);
        }
        self.router.frames.store(0, Ordering::Relaxed);

        self.playback.start()?;
        if let Err(e) = self.capture.start() {
            if let Err(stop_err) = self.playback.stop() {
                error!("Failed to stop playback after capture failure: {}", stop_err);
            }
            return Err(e);
        }
        info!("Echo engine started");
        Ok(())
    }

    /// Stop capture, then playback; both are attempted
    pub fn stop(&self) -> Result<(), AudioError> {
        let capture = self.capture.stop();
        let playback = self.playback.stop();
        capture?;
        playback?;
        debug!("Echo engine stopped");
        Ok(())
    }

    /// Change the echo delay and decay weight
    ///
    /// A new delay length resets the delay line. The decay applies from the
    /// next processed sample. A rejected delay leaves both settings as they
    /// were.
    pub fn configure_echo(&self, delay_ms: u32, decay: f32) -> Result<(), AudioError> {
        let mut effect = self.router.effect.lock();
        effect.set_delay_time(delay_ms)?;
        effect.set_decay_weight(decay);
        info!(
            "Echo set to {} ms, decay {}",
            effect.delay_ms(),
            effect.decay_weight()
        );
        Ok(())
    }

    /// Current echo delay (ms) and decay weight
    pub fn echo_settings(&self) -> (u32, f32) {
        let effect = self.router.effect.lock();
        (effect.delay_ms(), effect.decay_weight())
    }

    /// Handle every pending device event on the calling thread
    ///
    /// Only does work in inline dispatch mode; returns the number of events
    /// handled.
    pub fn pump(&self) -> usize {
        let Dispatch::Inline {
            capture_events,
            playback_events,
        } = &self.dispatch
        else {
            return 0;
        };

        let mut handled = 0;
        loop {
            let mut progressed = false;
            if let Ok(event) = capture_events.try_recv() {
                self.capture.handle_event(event, self.router.as_ref());
                progressed = true;
                handled += 1;
            }
            if let Ok(event) = playback_events.try_recv() {
                self.playback.handle_event(event, self.router.as_ref());
                progressed = true;
                handled += 1;
            }
            if !progressed {
                return handled;
            }
        }
    }

    /// Stop everything, take every buffer back and free the pool
    ///
    /// Returns the number of buffers that could not be accounted for.
    pub fn teardown(mut self) -> usize {
        let missing = self.shutdown();
        debug_assert_eq!(missing, 0, "buffers leaked at teardown");
        missing
    }

    fn shutdown(&mut self) -> usize {
        let Some(pool) = self.pool.take() else {
            return 0;
        };
        if let Err(e) = self.stop() {
            error!("Failed to stop engine during teardown: {}", e);
        }

        let receivers = match std::mem::replace(&mut self.dispatch, Dispatch::Finished) {
            Dispatch::Inline {
                capture_events,
                playback_events,
            } => vec![capture_events, playback_events],
            Dispatch::Threaded { shutdown, workers } => {
                shutdown.store(true, Ordering::SeqCst);
                workers
                    .into_iter()
                    .filter_map(|worker| match worker.join() {
                        Ok(receiver) => Some(receiver),
                        Err(_) => {
                            error!("Stage worker panicked");
                            None
                        }
                    })
                    .collect()
            }
            Dispatch::Finished => Vec::new(),
        };

        let mut returned = Vec::with_capacity(self.buffer_count);
        for receiver in &receivers {
            while let Ok(event) = receiver.try_recv() {
                if let DeviceEvent::BufferCompleted(buffer) = event {
                    returned.push(buffer);
                }
            }
        }
        for device in [self.capture.device(), self.playback.device()] {
            device.clear(&mut |buffer| returned.push(buffer));
        }
        self.ready.drain(|buffer| returned.push(buffer));
        self.free.drain(|buffer| returned.push(buffer));

        let back = returned.len();
        let missing = pool.release(returned);
        info!("Echo engine torn down, {} buffers released", back);
        missing
    }

    /// Instantaneous location of every buffer
    pub fn distribution(&self) -> BufferDistribution {
        BufferDistribution {
            free: self.free.len(),
            capture_in_flight: self.capture.in_flight(),
            ready: self.ready.len(),
            playback_in_flight: self.playback.in_flight(),
        }
    }

    /// Count buffers across all owners and log where they are
    ///
    /// A total that differs from the allocated count is logged as an error;
    /// while devices are running the snapshot may be off by buffers in
    /// transit.
    pub fn buffer_count(&self) -> usize {
        let distribution = self.distribution();
        let total = distribution.total();
        if total == self.buffer_count {
            debug!("Buffers: {} total={}", distribution, total);
        } else {
            error!(
                "Buffer count mismatch: {} total={} expected={}",
                distribution, total, self.buffer_count
            );
        }
        total
    }

    /// Buffers allocated at initialization
    pub fn allocated_buffers(&self) -> usize {
        self.buffer_count
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn capture(&self) -> &CaptureStage {
        &self.capture
    }

    pub fn playback(&self) -> &PlaybackStage {
        &self.playback
    }

    pub fn capture_state(&self) -> CaptureState {
        self.capture.state()
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.playback.state()
    }

    /// Frames captured since the last `start`
    pub fn frames_processed(&self) -> u64 {
        self.router.frames.load(Ordering::Relaxed)
    }

    /// Samples the capture device dropped for lack of a buffer
    pub fn capture_xruns(&self) -> u64 {
        self.capture.device().xruns()
    }

    /// Samples of silence the playback device played for lack of a buffer
    pub fn playback_xruns(&self) -> u64 {
        self.playback.device().xruns()
    }

    /// Captured buffers that bypassed the effect during a reconfiguration
    pub fn effect_skips(&self) -> u64 {
        self.router.skipped.load(Ordering::Relaxed)
    }

    pub fn is_echo_cancellation_supported(&self) -> bool {
        self.preprocessing_supported(Preprocessor::EchoCancellation)
    }

    pub fn is_echo_cancellation_enabled(&self) -> bool {
        self.preprocessing_enabled(Preprocessor::EchoCancellation)
    }

    pub fn set_echo_cancellation_enabled(&self, enabled: bool) -> Result<(), AudioError> {
        self.set_preprocessing(Preprocessor::EchoCancellation, enabled)
    }

    pub fn is_noise_suppression_supported(&self) -> bool {
        self.preprocessing_supported(Preprocessor::NoiseSuppression)
    }

    pub fn is_noise_suppression_enabled(&self) -> bool {
        self.preprocessing_enabled(Preprocessor::NoiseSuppression)
    }

    pub fn set_noise_suppression_enabled(&self, enabled: bool) -> Result<(), AudioError> {
        self.set_preprocessing(Preprocessor::NoiseSuppression, enabled)
    }

    fn capture_device(&self) -> &dyn AudioDevice {
        self.capture.device().as_ref()
    }

    fn preprocessing_supported(&self, kind: Preprocessor) -> bool {
        self.capture_device().preprocessing(kind).is_some()
    }

    fn preprocessing_enabled(&self, kind: Preprocessor) -> bool {
        self.capture_device()
            .preprocessing(kind)
            .is_some_and(|control| control.is_enabled())
    }

    fn set_preprocessing(&self, kind: Preprocessor, enabled: bool) -> Result<(), AudioError> {
        let control = self.capture_device().preprocessing(kind).ok_or_else(|| {
            AudioError::UnsupportedConfig(format!("{:?} is not supported by the capture device", kind))
        })?;
        control.set_enabled(enabled);
        info!(
            "{:?}: {}",
            kind,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }
}

impl Drop for EchoEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run `handler` for each event on a dedicated thread until `shutdown`
///
/// The thread hands its receiver back on join so pending events can be
/// drained.
fn spawn_worker<F>(
    name: &str,
    events: EventReceiver,
    shutdown: Arc<AtomicBool>,
    handler: F,
) -> Result<JoinHandle<EventReceiver>, AudioError>
where
    F: Fn(DeviceEvent) + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            debug!("Stage worker started");
            while !shutdown.load(Ordering::SeqCst) {
                match events.recv_timeout(WORKER_POLL_INTERVAL) {
                    Ok(event) => handler(event),
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("Stage worker stopped");
            events
        })
        .map_err(|e| AudioError::StreamError(format!("Failed to spawn {}: {}", name, e)))
}
