//! Audio pipeline module
//!
//! Buffer pool, stage queues, capture and playback stages, the delay effect,
//! device backends and the engine that ties them together.

mod buffer;
mod capture;
mod cpal_backend;
mod device;
mod effects;
mod engine;
mod error;
mod playback;
mod queue;
mod recording;
mod virtual_device;

pub use buffer::{SampleBuffer, SampleBufferPool, SampleFormat, BITS_PER_SAMPLE};
pub use capture::{CaptureStage, CaptureState};
pub use cpal_backend::{CpalBackend, CpalDevice};
pub use device::{
    event_channel, list_input_devices, list_output_devices, AudioBackend, AudioDevice,
    DeviceEvent, DeviceInfo, DeviceRequest, DeviceState, EventReceiver, EventSender,
    PreprocessingControl, Preprocessor,
};
pub use effects::{DelayEffect, MAX_DELAY_MS};
pub use engine::{BufferDistribution, EchoEngine, EngineMessage, EngineRouter, EngineService};
pub use error::AudioError;
pub use playback::{PlaybackStage, PlaybackState};
pub use queue::BufferQueue;
pub use recording::{Recorder, RecordingInfo};
pub use virtual_device::{VirtualBackend, VirtualDevice, VirtualPreprocessor};
