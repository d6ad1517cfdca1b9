//! Buffer-queue devices on top of cpal streams
//!
//! cpal::Stream is not Send, so each device runs its stream on a dedicated
//! thread and drives it through a command channel. The stream callbacks
//! copy between cpal's f32 frames and the head buffer of the device queue,
//! and hand each buffer back to the stage once it is full (capture) or fully
//! played (playback).

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::buffer::{SampleBuffer, SampleFormat};
use super::device::{
    AudioBackend, AudioDevice, DeviceEvent, DeviceRequest, DeviceState, EventSender,
};
use super::error::AudioError;
use super::queue::BufferQueue;

/// How long to wait for the stream thread to answer a command
const STREAM_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Capture,
    Playback,
}

/// Commands sent to the stream thread
#[derive(Debug)]
enum StreamCommand {
    Play,
    Pause,
    Shutdown,
}

/// Buffer being recorded or played by the callback
struct Inflight {
    buffer: SampleBuffer,
    cursor: usize,
}

/// State shared between the device handle and the stream callback
struct Lane {
    queue: BufferQueue<SampleBuffer>,
    current: spin::Mutex<Option<Inflight>>,
    state: AtomicU8,
    events: EventSender,
    xruns: AtomicU64,
}

impl Lane {
    fn new(queue_depth: usize, events: EventSender) -> Self {
        Self {
            queue: BufferQueue::new(queue_depth),
            current: spin::Mutex::new(None),
            state: AtomicU8::new(DeviceState::Stopped.to_u8()),
            events,
            xruns: AtomicU64::new(0),
        }
    }

    fn is_running(&self) -> bool {
        DeviceState::from_u8(self.state.load(Ordering::SeqCst)) == DeviceState::Running
    }

    /// Input callback body: convert `data` into queued buffers
    fn record(&self, data: &[f32]) {
        if !self.is_running() {
            return;
        }

        let mut current = self.current.lock();
        let mut offset = 0;
        loop {
            if current.is_none() {
                *current = self.queue.pop().map(|buffer| Inflight { buffer, cursor: 0 });
            }
            let Some(inflight) = current.as_mut() else {
                // No buffer to record into: the frames are lost
                self.xruns
                    .fetch_add((data.len() - offset) as u64, Ordering::Relaxed);
                return;
            };

            let cursor = inflight.cursor;
            let slots = inflight.buffer.sample_capacity();
            let n = (slots - cursor).min(data.len() - offset);
            for (dst, &src) in inflight.buffer.samples_mut()[cursor..cursor + n]
                .iter_mut()
                .zip(&data[offset..offset + n])
            {
                *dst = f32_to_i16(src);
            }
            inflight.cursor += n;
            inflight.buffer.set_filled_size(inflight.cursor * 2);
            offset += n;

            if inflight.cursor >= slots && !self.complete_current(&mut *current) {
                self.xruns
                    .fetch_add((data.len() - offset) as u64, Ordering::Relaxed);
                return;
            }
            if offset >= data.len() {
                return;
            }
        }
    }

    /// Output callback body: play queued buffers into `data`
    fn play(&self, data: &mut [f32]) {
        if !self.is_running() {
            data.fill(0.0);
            return;
        }

        let mut current = self.current.lock();
        let mut offset = 0;
        loop {
            if current.is_none() {
                *current = self.queue.pop().map(|buffer| Inflight { buffer, cursor: 0 });
            }
            let Some(inflight) = current.as_mut() else {
                self.xruns
                    .fetch_add((data.len() - offset) as u64, Ordering::Relaxed);
                data[offset..].fill(0.0);
                return;
            };

            let cursor = inflight.cursor;
            let filled = inflight.buffer.filled_samples();
            let n = (filled.len() - cursor).min(data.len() - offset);
            for (dst, &src) in data[offset..offset + n]
                .iter_mut()
                .zip(&filled[cursor..cursor + n])
            {
                *dst = i16_to_f32(src);
            }
            inflight.cursor += n;
            offset += n;

            let done = inflight.cursor >= filled.len();
            if done && !self.complete_current(&mut *current) {
                self.xruns
                    .fetch_add((data.len() - offset) as u64, Ordering::Relaxed);
                data[offset..].fill(0.0);
                return;
            }
            if offset >= data.len() {
                return;
            }
        }
    }

    /// Hand the finished head buffer to the stage
    ///
    /// If the event channel is full the buffer stays in `current` and is
    /// handed over again on the next callback. Returns false in that case.
    fn complete_current(&self, current: &mut Option<Inflight>) -> bool {
        let Some(finished) = current.take() else {
            return true;
        };
        let cursor = finished.cursor;
        match self
            .events
            .try_send(DeviceEvent::BufferCompleted(finished.buffer))
        {
            Ok(()) => true,
            Err(TrySendError::Full(DeviceEvent::BufferCompleted(buffer))) => {
                warn!("Event channel full, buffer {} held for retry", buffer.id());
                *current = Some(Inflight { buffer, cursor });
                false
            }
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => {
                debug!("Stage gone, completion dropped");
                true
            }
        }
    }

    fn clear(&self, reclaim: &mut dyn FnMut(SampleBuffer)) -> usize {
        let mut reclaimed = 0;
        let current = self.current.lock().take();
        if let Some(inflight) = current {
            reclaim(inflight.buffer);
            reclaimed += 1;
        }
        reclaimed + self.queue.drain(reclaim)
    }
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}

/// Command channel to a stream thread
struct StreamControl {
    commands: Sender<StreamCommand>,
    replies: Receiver<Result<(), AudioError>>,
}

impl StreamControl {
    fn request(&self, command: StreamCommand) -> Result<(), AudioError> {
        self.commands
            .send(command)
            .map_err(|e| AudioError::StreamError(format!("Failed to send stream command: {}", e)))?;
        match self.replies.recv_timeout(STREAM_REPLY_TIMEOUT) {
            Ok(result) => result,
            Err(e) => Err(AudioError::StreamError(format!(
                "Stream thread did not respond: {}",
                e
            ))),
        }
    }
}

/// cpal input or output stream exposed as a buffer-queue device
pub struct CpalDevice {
    name: String,
    lane: Arc<Lane>,
    control: Mutex<StreamControl>,
    thread: Option<JoinHandle<()>>,
}

impl CpalDevice {
    fn open(direction: Direction, request: DeviceRequest) -> Result<Self, AudioError> {
        let lane = Arc::new(Lane::new(request.queue_depth, request.events.clone()));
        let (cmd_tx, cmd_rx) = mpsc::channel::<StreamCommand>();
        let (reply_tx, reply_rx) = mpsc::channel::<Result<(), AudioError>>();

        let name = request
            .device_name
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let thread_lane = lane.clone();
        let format = request.format;
        let device_name = request.device_name.clone();
        let events = request.events;
        let thread = thread::Builder::new()
            .name(format!("echoloop-{:?}-stream", direction).to_lowercase())
            .spawn(move || {
                stream_thread_main(
                    direction,
                    device_name,
                    format,
                    thread_lane,
                    events,
                    cmd_rx,
                    reply_tx,
                )
            })
            .map_err(|e| AudioError::StreamError(format!("Failed to spawn stream thread: {}", e)))?;

        // First reply reports whether the stream could be built
        match reply_rx.recv_timeout(STREAM_REPLY_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(e) => {
                let _ = cmd_tx.send(StreamCommand::Shutdown);
                return Err(AudioError::StreamError(format!(
                    "Stream thread did not report: {}",
                    e
                )));
            }
        }

        info!("Opened {:?} device: {}", direction, name);
        Ok(Self {
            name,
            lane,
            control: Mutex::new(StreamControl {
                commands: cmd_tx,
                replies: reply_rx,
            }),
            thread: Some(thread),
        })
    }

}

impl AudioDevice for CpalDevice {
    fn enqueue(&self, buffer: SampleBuffer) -> Result<(), SampleBuffer> {
        self.lane.queue.push(buffer)
    }

    fn set_state(&self, state: DeviceState) -> Result<(), AudioError> {
        let control = self.control.lock();
        match state {
            DeviceState::Running => {
                control.request(StreamCommand::Play)?;
                self.lane.state.store(state.to_u8(), Ordering::SeqCst);
            }
            DeviceState::Stopped => {
                self.lane.state.store(state.to_u8(), Ordering::SeqCst);
                control.request(StreamCommand::Pause)?;
            }
        }
        Ok(())
    }

    fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.lane.state.load(Ordering::SeqCst))
    }

    fn clear(&self, reclaim: &mut dyn FnMut(SampleBuffer)) -> usize {
        self.lane.clear(reclaim)
    }

    fn xruns(&self) -> u64 {
        self.lane.xruns.load(Ordering::Relaxed)
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        debug!("Closing device {}", self.name);
        self.lane
            .state
            .store(DeviceState::Stopped.to_u8(), Ordering::SeqCst);
        let _ = self.control.lock().commands.send(StreamCommand::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Owns the stream for its whole life
fn stream_thread_main(
    direction: Direction,
    device_name: Option<String>,
    format: SampleFormat,
    lane: Arc<Lane>,
    events: EventSender,
    commands: Receiver<StreamCommand>,
    replies: Sender<Result<(), AudioError>>,
) {
    let stream = match build_stream(direction, device_name.as_deref(), format, lane, events) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = replies.send(Err(e));
            return;
        }
    };
    // Some hosts start streams immediately
    if let Err(e) = stream.pause() {
        debug!("Initial pause not supported: {}", e);
    }
    let _ = replies.send(Ok(()));

    loop {
        match commands.recv() {
            Ok(StreamCommand::Play) => {
                let result = stream
                    .play()
                    .map_err(|e| AudioError::StreamError(e.to_string()));
                let _ = replies.send(result);
            }
            Ok(StreamCommand::Pause) => {
                let result = stream
                    .pause()
                    .map_err(|e| AudioError::StreamError(e.to_string()));
                let _ = replies.send(result);
            }
            Ok(StreamCommand::Shutdown) | Err(_) => break,
        }
    }
    debug!("{:?} stream thread exiting", direction);
}

fn find_device(direction: Direction, name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match (direction, name) {
        (Direction::Capture, Some(name)) => host
            .input_devices()
            .map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .ok_or_else(|| AudioError::DeviceNotFound(name.to_string())),
        (Direction::Capture, None) => host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default input device".into())),
        (Direction::Playback, Some(name)) => host
            .output_devices()
            .map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .ok_or_else(|| AudioError::DeviceNotFound(name.to_string())),
        (Direction::Playback, None) => host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".into())),
    }
}

fn build_stream(
    direction: Direction,
    device_name: Option<&str>,
    format: SampleFormat,
    lane: Arc<Lane>,
    events: EventSender,
) -> Result<Stream, AudioError> {
    let device = find_device(direction, device_name)?;
    debug!(
        "Building {:?} stream on {}",
        direction,
        device.name().unwrap_or_default()
    );

    let stream_config = StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Fixed(format.frames_per_buffer),
    };

    // Error callback with device disconnection detection
    let err_fn = move |err: cpal::StreamError| {
        error!("{:?} stream error: {:?}", direction, err);
        let event = match err {
            cpal::StreamError::DeviceNotAvailable => {
                warn!("{:?} device disconnected", direction);
                DeviceEvent::Disconnected
            }
            other => DeviceEvent::StreamError(other.to_string()),
        };
        let _ = events.try_send(event);
    };

    let stream = match direction {
        Direction::Capture => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| lane.record(data),
            err_fn,
            None,
        ),
        Direction::Playback => device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| lane.play(data),
            err_fn,
            None,
        ),
    };
    stream.map_err(|e| AudioError::StreamError(e.to_string()))
}

/// Opens the system's capture and playback devices through cpal
///
/// Platform echo cancellation and noise suppression are not available.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_capture(&self, request: DeviceRequest) -> Result<Arc<dyn AudioDevice>, AudioError> {
        Ok(Arc::new(CpalDevice::open(Direction::Capture, request)?))
    }

    fn open_playback(&self, request: DeviceRequest) -> Result<Arc<dyn AudioDevice>, AudioError> {
        Ok(Arc::new(CpalDevice::open(Direction::Playback, request)?))
    }
}
