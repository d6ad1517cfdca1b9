//! Pipeline tests driving the echo engine through virtual devices
//!
//! Every test runs in inline dispatch mode, so device completions are handled
//! only when the test calls `pump`.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use echoloop::audio::{
    AudioError, CaptureState, EchoEngine, PlaybackState, VirtualBackend, VirtualDevice,
    MAX_DELAY_MS,
};
use echoloop::config::{DispatchMode, EchoConfig};

fn config(buffers: usize, depth: usize) -> EchoConfig {
    EchoConfig {
        sample_rate: 48000,
        frames_per_buffer: 160,
        channels: 2,
        buffer_count: buffers,
        device_queue_depth: depth,
        capture_kickstart: 2.min(depth),
        playback_kickstart: 3.min(depth),
        delay_ms: 50,
        decay: 0.5,
        dispatch: DispatchMode::Inline,
        ..Default::default()
    }
}

fn open(config: &EchoConfig) -> (EchoEngine, Arc<VirtualDevice>, Arc<VirtualDevice>, VirtualBackend) {
    let backend = VirtualBackend::new();
    let engine = EchoEngine::initialize(config, &backend).unwrap();
    let mic = backend.capture_device().unwrap();
    let speaker = backend.playback_device().unwrap();
    (engine, mic, speaker, backend)
}

fn assert_conserved(engine: &EchoEngine) {
    assert_eq!(
        engine.distribution().total(),
        engine.allocated_buffers(),
        "distribution {}",
        engine.distribution()
    );
}

/// Test: Captured audio is echoed and played back
/// Given 4 buffers of 640 bytes at 48 kHz with a 50 ms delay and decay 0.5
/// When an impulse is captured and the loop runs for 16 buffer periods
/// Then each captured buffer is played in the same period
/// And the impulse returns at half amplitude 50 ms later
#[test]
fn test_end_to_end_echo() {
    let config = config(4, 4);
    let (engine, mic, speaker, _backend) = open(&config);
    assert_eq!(engine.format().buffer_bytes(), 640);
    assert_eq!(engine.distribution().free, 4);

    engine.start().unwrap();
    assert_eq!(engine.playback_state(), PlaybackState::WaitingForData);
    assert_eq!(engine.capture_state(), CaptureState::Recording);
    assert_conserved(&engine);

    let mut played = Vec::new();
    for tick in 0..16 {
        let captured_id = mic.next_buffer_id().unwrap();
        assert!(mic.complete_next(|buf| {
            buf.samples_mut().fill(0);
            if tick == 0 {
                buf.samples_mut()[0] = 10000;
                buf.samples_mut()[1] = 10000;
            }
        }));
        engine.pump();
        assert_conserved(&engine);

        // The processed capture is the next buffer the speaker plays
        assert_eq!(speaker.next_buffer_id(), Some(captured_id));
        assert!(speaker.complete_next(|buf| {
            assert_eq!(buf.filled_size(), 640);
            played.push(buf.filled_samples().to_vec());
        }));
        engine.pump();
        assert_conserved(&engine);
        assert_eq!(engine.distribution().playback_in_flight, 0);
        assert_eq!(engine.distribution().free, 1);
    }

    // 50 ms at 48 kHz stereo = 4800 samples = 15 buffers of 320 samples
    assert_eq!(&played[0][..2], &[10000, 10000]);
    assert!(played[0][2..].iter().all(|&s| s == 0));
    for buffer in &played[1..15] {
        assert!(buffer.iter().all(|&s| s == 0));
    }
    assert_eq!(&played[15][..2], &[5000, 5000]);
    assert!(played[15][2..].iter().all(|&s| s == 0));

    assert_eq!(engine.frames_processed(), 16 * 160);
    assert_eq!(engine.capture().completed(), 16);
    assert_eq!(engine.playback().completed(), 16);
    assert_eq!(engine.teardown(), 0);
}

/// Test: Capture stops itself when nothing is played
/// Given playback is never started
/// When the capture device keeps completing buffers
/// Then capture stops once the free pool and in-flight set are exhausted
/// And releasing a played buffer restarts capture
#[test]
fn test_backpressure_and_resume() {
    let config = EchoConfig {
        playback_kickstart: 2,
        ..config(4, 2)
    };
    let (engine, mic, speaker, _backend) = open(&config);

    engine.capture().start().unwrap();
    let mut captured = 0;
    while mic.complete_next(|buf| buf.samples_mut().fill(1)) {
        captured += 1;
        engine.pump();
        assert_conserved(&engine);
        assert!(engine.distribution().ready <= 4);
    }

    assert_eq!(captured, 4);
    assert_eq!(engine.distribution().ready, 4);
    assert_eq!(engine.capture_state(), CaptureState::Stopped);
    assert!(engine.capture().is_stalled());
    assert_eq!(engine.playback_state(), PlaybackState::Stopped);

    engine.playback().start().unwrap();
    assert_eq!(engine.playback_state(), PlaybackState::Playing);
    assert_eq!(engine.distribution().playback_in_flight, 2);

    assert!(speaker.complete_next(|_| {}));
    engine.pump();
    assert_eq!(engine.capture_state(), CaptureState::Recording);
    assert!(!engine.capture().is_stalled());
    assert_eq!(engine.distribution().capture_in_flight, 1);
    assert_conserved(&engine);

    assert_eq!(engine.teardown(), 0);
}

/// Test: Stopping twice is harmless
/// Given a running engine with buffers in every stage
/// When stop is called twice
/// Then the second call succeeds and moves no buffers
#[test]
fn test_stop_twice() {
    let (engine, mic, _speaker, _backend) = open(&config(4, 4));
    engine.start().unwrap();
    assert!(mic.complete_next(|_| {}));
    engine.pump();

    engine.stop().unwrap();
    let after_first = engine.distribution();
    assert_eq!(after_first.capture_in_flight, 0);
    assert_eq!(after_first.playback_in_flight, 0);
    assert_eq!(after_first.total(), 4);
    assert_eq!(engine.capture_state(), CaptureState::Stopped);
    assert_eq!(engine.playback_state(), PlaybackState::Stopped);

    engine.stop().unwrap();
    assert_eq!(engine.distribution(), after_first);
    assert_eq!(engine.teardown(), 0);
}

/// Test: A completion racing stop goes back to the free pool
/// Given a capture completion that has not been handled yet
/// When the engine is stopped and the completion is then delivered
/// Then the buffer lands in the free pool, not the ready queue
#[test]
fn test_stray_completion_after_stop() {
    let (engine, mic, _speaker, _backend) = open(&config(4, 4));
    engine.start().unwrap();
    assert!(mic.complete_next(|buf| buf.samples_mut().fill(7)));

    engine.stop().unwrap();
    assert_eq!(engine.distribution().capture_in_flight, 1);
    assert_conserved(&engine);

    assert_eq!(engine.pump(), 1);
    let distribution = engine.distribution();
    assert_eq!(distribution.free, 4);
    assert_eq!(distribution.ready, 0);
    assert_eq!(distribution.capture_in_flight, 0);
    assert_eq!(engine.capture().completed(), 0);
    assert_eq!(engine.teardown(), 0);
}

/// Test: Restart after stop
/// Given a stopped engine
/// When it is started again
/// Then capture resumes from the free pool and the frame counter resets
#[test]
fn test_restart_after_stop() {
    let (engine, mic, speaker, _backend) = open(&config(4, 4));
    engine.start().unwrap();
    assert!(mic.complete_next(|_| {}));
    engine.pump();
    assert_eq!(engine.frames_processed(), 160);
    engine.stop().unwrap();

    engine.start().unwrap();
    assert_eq!(engine.frames_processed(), 0);
    assert_eq!(engine.capture_state(), CaptureState::Recording);
    // Stop reclaimed the buffer the speaker held
    assert_eq!(engine.playback_state(), PlaybackState::WaitingForData);
    assert_eq!(speaker.queued(), 0);
    assert_eq!(engine.distribution().capture_in_flight, 2);
    assert_conserved(&engine);
    assert_eq!(engine.teardown(), 0);
}

/// Test: Device failure on start
/// Given a playback device that refuses to run
/// When the engine is started
/// Then start fails and capture is never started
#[test]
fn test_playback_start_failure() {
    let (engine, _mic, speaker, _backend) = open(&config(4, 4));
    speaker.fail_next_start();

    assert!(matches!(engine.start(), Err(AudioError::DeviceStateFailed(_))));
    assert_eq!(engine.capture_state(), CaptureState::Stopped);
    assert_eq!(engine.playback_state(), PlaybackState::Stopped);
    assert_eq!(engine.distribution().free, 4);

    // The failure is not sticky
    engine.start().unwrap();
    assert_eq!(engine.capture_state(), CaptureState::Recording);
    assert_eq!(engine.teardown(), 0);
}

/// Test: Platform preprocessing pass-through
/// Given a capture device with echo cancellation but no noise suppression
/// Then echo cancellation can be queried and toggled
/// And noise suppression reports unsupported and disabled
#[test]
fn test_preprocessing_pass_through() {
    let backend = VirtualBackend::new().with_preprocessing(true, false);
    let config = EchoConfig {
        echo_cancellation: true,
        noise_suppression: true,
        ..config(4, 4)
    };
    let engine = EchoEngine::initialize(&config, &backend).unwrap();

    assert!(engine.is_echo_cancellation_supported());
    assert!(engine.is_echo_cancellation_enabled());
    engine.set_echo_cancellation_enabled(false).unwrap();
    assert!(!engine.is_echo_cancellation_enabled());

    assert!(!engine.is_noise_suppression_supported());
    assert!(!engine.is_noise_suppression_enabled());
    assert!(matches!(
        engine.set_noise_suppression_enabled(true),
        Err(AudioError::UnsupportedConfig(_))
    ));
    assert!(!engine.is_noise_suppression_enabled());
}

/// Test: Echo reconfiguration while running
/// Given a running engine
/// When the decay is set to zero
/// Then captured audio plays back unchanged
#[test]
fn test_configure_echo_while_running() {
    let config = EchoConfig {
        delay_ms: 1,
        ..config(4, 4)
    };
    let (engine, mic, speaker, _backend) = open(&config);
    engine.start().unwrap();
    engine.configure_echo(1, 0.0).unwrap();

    for _ in 0..3 {
        assert!(mic.complete_next(|buf| buf.samples_mut().fill(1234)));
        engine.pump();
        assert!(speaker.complete_next(|buf| {
            assert!(buf.filled_samples().iter().all(|&s| s == 1234));
        }));
        engine.pump();
    }
    assert_eq!(engine.effect_skips(), 0);
    assert_eq!(engine.teardown(), 0);
}

/// Test: Threaded dispatch returns every buffer
/// Given worker threads handling completions
/// When devices complete buffers concurrently with the control thread
/// Then teardown accounts for every buffer
#[test]
fn test_threaded_dispatch_conserves_buffers() {
    let config = EchoConfig {
        dispatch: DispatchMode::Threaded,
        ..config(8, 4)
    };
    let (engine, mic, speaker, _backend) = open(&config);
    engine.start().unwrap();

    let driver = {
        let mic = mic.clone();
        let speaker = speaker.clone();
        thread::spawn(move || {
            for _ in 0..500 {
                mic.complete_next(|buf| buf.samples_mut().fill(3));
                speaker.complete_next(|_| {});
                thread::sleep(Duration::from_micros(200));
            }
        })
    };
    driver.join().unwrap();

    assert!(engine.capture().completed() > 0);
    engine.stop().unwrap();
    assert_eq!(engine.teardown(), 0);
}

/// Test: Devices disconnect mid-run
/// Given a running engine with buffers held by both devices
/// When both devices report a stream error and disconnect
/// Then every buffer is still accounted for
/// And stop reclaims what the dead devices held
#[test]
fn test_disconnect_keeps_buffers_conserved() {
    let (engine, mic, speaker, _backend) = open(&config(4, 4));
    engine.start().unwrap();
    assert!(mic.complete_next(|buf| buf.samples_mut().fill(2)));
    engine.pump();
    assert_eq!(speaker.queued(), 1);

    mic.report_error("overrun storm");
    mic.disconnect();
    speaker.disconnect();
    assert_eq!(engine.pump(), 3);

    assert_eq!(engine.buffer_count(), 4);
    assert!(!mic.complete_next(|_| {}));
    assert!(!speaker.complete_next(|_| {}));

    engine.stop().unwrap();
    let distribution = engine.distribution();
    assert_eq!(distribution.free, 4);
    assert_eq!(distribution.capture_in_flight, 0);
    assert_eq!(distribution.playback_in_flight, 0);
    assert_eq!(mic.queued() + speaker.queued(), 0);

    engine.stop().unwrap();
    assert_eq!(engine.distribution(), distribution);
    assert_eq!(engine.teardown(), 0);
}

/// Test: Oversized echo delay
/// Given a delay beyond the supported maximum
/// When the engine is initialized or reconfigured with it
/// Then the request is rejected and nothing is allocated for it
#[test]
fn test_oversized_delay_is_rejected() {
    let backend = VirtualBackend::new();
    let oversized = EchoConfig {
        delay_ms: u32::MAX,
        ..config(4, 4)
    };
    assert!(matches!(
        EchoEngine::initialize(&oversized, &backend),
        Err(AudioError::UnsupportedConfig(_))
    ));

    let (engine, _mic, _speaker, _backend) = open(&config(4, 4));
    assert!(engine.configure_echo(MAX_DELAY_MS + 1, 0.5).is_err());
    assert_eq!(engine.echo_settings(), (50, 0.5));
    engine.configure_echo(MAX_DELAY_MS, 0.5).unwrap();
    assert_eq!(engine.echo_settings(), (MAX_DELAY_MS, 0.5));
}

/// Test: Xrun reporting
/// Given a running engine whose speaker has nothing queued
/// When the speaker asks for a buffer
/// Then the playback xrun count grows by one buffer of samples
#[test]
fn test_xruns_are_reported() {
    let (engine, _mic, speaker, _backend) = open(&config(4, 4));
    engine.start().unwrap();
    assert_eq!(engine.playback_xruns(), 0);

    assert!(!speaker.complete_next(|_| {}));
    assert_eq!(engine.playback_xruns(), 320);
    assert_eq!(engine.capture_xruns(), 0);
    assert_eq!(engine.teardown(), 0);
}
