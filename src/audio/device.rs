//! Device seam between the pipeline and a platform audio API
//!
//! A device is a boundary actor. The stage hands it empty (capture) or full
//! (playback) buffers with [`AudioDevice::enqueue`]; the device owns them while
//! they are in flight and returns each one, by value, in a
//! [`DeviceEvent::BufferCompleted`] on the stage's event channel.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait};

use super::buffer::{SampleBuffer, SampleFormat};
use super::error::AudioError;

/// Run state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Stopped,
    Running,
}

impl DeviceState {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            DeviceState::Stopped => 0,
            DeviceState::Running => 1,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => DeviceState::Running,
            _ => DeviceState::Stopped,
        }
    }
}

/// Notifications a device sends to its stage
#[derive(Debug)]
pub enum DeviceEvent {
    /// A buffer finished recording or playing and is handed back
    BufferCompleted(SampleBuffer),
    /// The device went away
    Disconnected,
    /// Stream error reported by the platform
    StreamError(String),
}

/// Sending half of a stage's event channel
pub type EventSender = SyncSender<DeviceEvent>;

/// Receiving half of a stage's event channel
pub type EventReceiver = Receiver<DeviceEvent>;

/// Create an event channel that holds `capacity` events without blocking
///
/// Every buffer-carrying event holds one buffer, so a capacity of the total
/// buffer count means completions never wait on the stage.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    sync_channel(capacity)
}

/// Platform preprocessing effects on the capture path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preprocessor {
    EchoCancellation,
    NoiseSuppression,
}

/// Toggle for a platform-provided preprocessing effect
pub trait PreprocessingControl: Send + Sync {
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
}

/// Buffer-queue device primitives consumed by the stages
///
/// All methods take `&self`: a device is shared between the control thread
/// and the thread that handles its completions.
pub trait AudioDevice: Send + Sync {
    /// Hand a buffer to the device, or get it back if the device queue is full
    fn enqueue(&self, buffer: SampleBuffer) -> Result<(), SampleBuffer>;

    fn set_state(&self, state: DeviceState) -> Result<(), AudioError>;

    fn state(&self) -> DeviceState;

    /// Drop everything the device holds, handing each buffer to `reclaim`
    ///
    /// Returns the number of buffers reclaimed.
    fn clear(&self, reclaim: &mut dyn FnMut(SampleBuffer)) -> usize;

    /// Samples lost because the device had no buffer to record into or play
    fn xruns(&self) -> u64 {
        0
    }

    /// Platform preprocessing capability, if the device has it
    fn preprocessing(&self, _kind: Preprocessor) -> Option<&dyn PreprocessingControl> {
        None
    }
}

/// Parameters for opening one device
#[derive(Debug, Clone)]
pub struct DeviceRequest {
    /// PCM layout
    pub format: SampleFormat,
    /// Maximum buffers the device holds at once
    pub queue_depth: usize,
    /// Device name (None = system default)
    pub device_name: Option<String>,
    /// Ask for platform echo cancellation (capture only)
    pub echo_cancellation: bool,
    /// Ask for platform noise suppression (capture only)
    pub noise_suppression: bool,
    /// Where completions are delivered
    pub events: EventSender,
}

/// Opens capture and playback devices on some platform
pub trait AudioBackend {
    fn open_capture(&self, request: DeviceRequest) -> Result<Arc<dyn AudioDevice>, AudioError>;

    fn open_playback(&self, request: DeviceRequest) -> Result<Arc<dyn AudioDevice>, AudioError>;
}

/// Information about a system audio device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Display name, also used to select the device
    pub name: String,
    /// Supported sample rates (Hz)
    pub supported_sample_rates: Vec<u32>,
    /// Supported channel counts
    pub supported_channels: Vec<u16>,
    /// Whether this is the default device
    pub is_default: bool,
}

/// List available input (capture) devices
pub fn list_input_devices() -> Result<Vec<DeviceInfo>, AudioError> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let devices = host
        .input_devices()
        .map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))?;
    Ok(collect_devices(devices, default_name))
}

/// List available output (playback) devices
pub fn list_output_devices() -> Result<Vec<DeviceInfo>, AudioError> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    let devices = host
        .output_devices()
        .map_err(|e| AudioError::DeviceOpenFailed(e.to_string()))?;
    Ok(collect_devices(devices, default_name))
}

fn collect_devices(
    devices: impl Iterator<Item = cpal::Device>,
    default_name: Option<String>,
) -> Vec<DeviceInfo> {
    devices
        .filter_map(|device| {
            let name = device.name().ok()?;
            let is_default = default_name.as_ref() == Some(&name);
            let (supported_sample_rates, supported_channels) = get_device_capabilities(&device);
            Some(DeviceInfo {
                name,
                supported_sample_rates,
                supported_channels,
                is_default,
            })
        })
        .collect()
}

/// Get supported sample rates and channel counts for a device
fn get_device_capabilities(device: &cpal::Device) -> (Vec<u32>, Vec<u16>) {
    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();

    let configs: Vec<_> = device
        .supported_input_configs()
        .into_iter()
        .flatten()
        .chain(device.supported_output_configs().into_iter().flatten())
        .collect();

    for config in configs {
        for rate in &[16000u32, 44100, 48000, 96000] {
            if *rate >= config.min_sample_rate().0
                && *rate <= config.max_sample_rate().0
                && !sample_rates.contains(rate)
            {
                sample_rates.push(*rate);
            }
        }
        let ch = config.channels();
        if !channels.contains(&ch) {
            channels.push(ch);
        }
    }

    sample_rates.sort();
    channels.sort();

    (sample_rates, channels)
}
