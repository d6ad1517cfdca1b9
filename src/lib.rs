//! echoloop - Real-time microphone echo over a fixed buffer pool
//!
//! Captured buffers pass through a feedback delay and are played back,
//! circulating between a free pool, the capture device, a ready queue and the
//! playback device without any allocation on the audio path.

pub mod audio;
pub mod config;

pub use audio::{AudioError, EchoEngine};
pub use config::EchoConfig;
