//! WAV capture of played audio
//!
//! Writes 16-bit PCM as it leaves the playback stage, so a simulated session
//! can be listened to afterwards.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use hound::{SampleFormat as WavSampleFormat, WavSpec, WavWriter};
use tracing::{info, warn};

use super::buffer::{SampleFormat, BITS_PER_SAMPLE};
use super::error::AudioError;

/// Recorder for saving played buffers to a WAV file
pub struct Recorder {
    spec: WavSpec,
    writer: Option<WavWriter<BufWriter<File>>>,
    samples_written: u64,
    file_path: Option<PathBuf>,
}

impl Recorder {
    pub fn new(format: SampleFormat) -> Self {
        Self {
            spec: WavSpec {
                channels: format.channels,
                sample_rate: format.sample_rate,
                bits_per_sample: BITS_PER_SAMPLE,
                sample_format: WavSampleFormat::Int,
            },
            writer: None,
            samples_written: 0,
            file_path: None,
        }
    }

    /// Start recording to a file
    pub fn start<P: AsRef<Path>>(&mut self, path: P) -> Result<(), AudioError> {
        if self.writer.is_some() {
            return Err(AudioError::RecordingError("Already recording".to_string()));
        }

        let path = path.as_ref().to_path_buf();
        let writer = WavWriter::create(&path, self.spec)
            .map_err(|e| AudioError::RecordingError(format!("Failed to create file: {}", e)))?;

        self.writer = Some(writer);
        self.samples_written = 0;
        info!("Recording started: {}", path.display());
        self.file_path = Some(path);
        Ok(())
    }

    /// Append interleaved samples; ignored when not recording
    pub fn write_samples(&mut self, samples: &[i16]) -> Result<(), AudioError> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };

        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| AudioError::RecordingError(format!("Write failed: {}", e)))?;
        }
        self.samples_written += samples.len() as u64;
        Ok(())
    }

    /// Stop recording and finalize the file
    pub fn stop(&mut self) -> Result<RecordingInfo, AudioError> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| AudioError::RecordingError("Not recording".to_string()))?;
        writer
            .finalize()
            .map_err(|e| AudioError::RecordingError(format!("Failed to finalize: {}", e)))?;

        let path = self.file_path.take().unwrap_or_default();
        let duration_secs = self.duration_secs();
        info!(
            "Recording stopped: {} ({:.2}s)",
            path.display(),
            duration_secs
        );

        Ok(RecordingInfo {
            path,
            samples: self.samples_written,
            duration_secs,
        })
    }

    pub fn is_recording(&self) -> bool {
        self.writer.is_some()
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    /// Recording duration in seconds
    pub fn duration_secs(&self) -> f64 {
        self.samples_written as f64 / (self.spec.sample_rate as f64 * self.spec.channels as f64)
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.is_recording() {
            if let Err(e) = self.stop() {
                warn!("Failed to stop recording on drop: {}", e);
            }
        }
    }
}

/// Information about a completed recording
#[derive(Debug, Clone)]
pub struct RecordingInfo {
    pub path: PathBuf,
    pub samples: u64,
    pub duration_secs: f64,
}
