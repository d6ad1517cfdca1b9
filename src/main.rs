//! echoloop - Real-time microphone echo

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use echoloop::audio::{
    list_input_devices, list_output_devices, CpalBackend, EchoEngine, Recorder, VirtualBackend,
};
use echoloop::config::{
    default_config_path, load_or_default, save_config, DispatchMode, EchoConfig,
};

/// Amplitude of the synthetic clicks fed to simulated sessions
const IMPULSE_AMPLITUDE: i16 = 16000;

#[derive(Parser)]
#[command(name = "echoloop")]
#[command(about = "Real-time microphone echo with a fixed buffer pool")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "ECHOLOOP_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List available audio devices
    Devices {
        #[command(subcommand)]
        action: DevicesAction,
    },

    /// Echo the microphone to the speakers
    Run {
        #[command(flatten)]
        overrides: EchoOverrides,

        /// Stop after this many seconds (default: until Enter or EOF)
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Drive the pipeline with virtual devices and a synthetic click train
    Simulate {
        #[command(flatten)]
        overrides: EchoOverrides,

        /// Simulated seconds to run
        #[arg(long, default_value = "3")]
        seconds: u64,

        /// Milliseconds between clicks
        #[arg(long, default_value = "500")]
        click_interval_ms: u32,

        /// Write the played audio to a WAV file
        #[arg(long)]
        wav: Option<PathBuf>,

        /// Pace the simulation at the buffer period instead of running flat out
        #[arg(long)]
        realtime: bool,
    },

    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum DevicesAction {
    /// List all devices
    List,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the default configuration file path
    Path,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Command-line values that take precedence over the configuration file
#[derive(Args, Debug, Default)]
struct EchoOverrides {
    /// Sample rate in Hz
    #[arg(long)]
    sample_rate: Option<u32>,

    /// Frames per device buffer
    #[arg(long)]
    frames_per_buffer: Option<u32>,

    /// Channel count
    #[arg(long)]
    channels: Option<u16>,

    /// Buffers in the pool
    #[arg(long)]
    buffer_count: Option<usize>,

    /// Echo delay in milliseconds
    #[arg(long)]
    delay_ms: Option<u32>,

    /// Echo decay weight (0.0 - 1.0)
    #[arg(long)]
    decay: Option<f32>,

    /// Input device name (use 'devices list' to see available devices)
    #[arg(long)]
    input_device: Option<String>,

    /// Output device name (use 'devices list' to see available devices)
    #[arg(long)]
    output_device: Option<String>,

    /// Request platform echo cancellation
    #[arg(long)]
    aec: bool,

    /// Request platform noise suppression
    #[arg(long)]
    ns: bool,
}

impl EchoOverrides {
    fn apply(&self, config: &mut EchoConfig) {
        if let Some(v) = self.sample_rate {
            config.sample_rate = v;
        }
        if let Some(v) = self.frames_per_buffer {
            config.frames_per_buffer = v;
        }
        if let Some(v) = self.channels {
            config.channels = v;
        }
        if let Some(v) = self.buffer_count {
            config.buffer_count = v;
        }
        if let Some(v) = self.delay_ms {
            config.delay_ms = v;
        }
        if let Some(v) = self.decay {
            config.decay = v;
        }
        if self.input_device.is_some() {
            config.input_device = self.input_device.clone();
        }
        if self.output_device.is_some() {
            config.output_device = self.output_device.clone();
        }
        config.echo_cancellation |= self.aec;
        config.noise_suppression |= self.ns;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Devices { action } => match action {
            DevicesAction::List => list_devices(),
        },
        Commands::Run {
            overrides,
            duration,
        } => {
            let config = effective_config(cli.config.as_deref(), &overrides)?;
            run_echo(config, duration).await?;
        }
        Commands::Simulate {
            overrides,
            seconds,
            click_interval_ms,
            wav,
            realtime,
        } => {
            let config = effective_config(cli.config.as_deref(), &overrides)?;
            simulate(config, seconds, click_interval_ms, wav, realtime)?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let config = effective_config(cli.config.as_deref(), &EchoOverrides::default())?;
                print!("{}", toml::to_string_pretty(&config)?);
            }
            ConfigAction::Path => match cli.config.or_else(default_config_path) {
                Some(path) => println!("{}", path.display()),
                None => bail!("Could not determine the configuration directory"),
            },
            ConfigAction::Init { force } => {
                let path = cli
                    .config
                    .or_else(default_config_path)
                    .context("Could not determine the configuration directory")?;
                if path.exists() && !force {
                    bail!("{} already exists (use --force to overwrite)", path.display());
                }
                save_config(&EchoConfig::default(), &path).map_err(anyhow::Error::msg)?;
                println!("Wrote {}", path.display());
            }
        },
    }

    Ok(())
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

fn effective_config(path: Option<&Path>, overrides: &EchoOverrides) -> Result<EchoConfig> {
    let mut config = load_or_default(path).map_err(anyhow::Error::msg)?;
    overrides.apply(&mut config);
    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}

fn list_devices() {
    println!("Input devices:");
    match list_input_devices() {
        Ok(devices) => {
            for device in devices {
                let default_marker = if device.is_default { " (default)" } else { "" };
                println!(
                    "  - {}{} rates={:?} channels={:?}",
                    device.name,
                    default_marker,
                    device.supported_sample_rates,
                    device.supported_channels
                );
            }
        }
        Err(e) => {
            println!("  Error: {}", e);
        }
    }

    println!("\nOutput devices:");
    match list_output_devices() {
        Ok(devices) => {
            for device in devices {
                let default_marker = if device.is_default { " (default)" } else { "" };
                println!(
                    "  - {}{} rates={:?} channels={:?}",
                    device.name,
                    default_marker,
                    device.supported_sample_rates,
                    device.supported_channels
                );
            }
        }
        Err(e) => {
            println!("  Error: {}", e);
        }
    }
}

fn print_stats(engine: &EchoEngine) {
    let (delay_ms, decay) = engine.echo_settings();
    let distribution = engine.distribution();
    println!("\n Echo:      {} ms, decay {:.2}", delay_ms, decay);
    println!(
        " Capture:   {:?}, {} buffers recorded",
        engine.capture_state(),
        engine.capture().completed()
    );
    println!(
        " Playback:  {:?}, {} buffers played",
        engine.playback_state(),
        engine.playback().completed()
    );
    println!(" Frames:    {}", engine.frames_processed());
    println!(
        " Xruns:     capture {} / playback {} samples",
        engine.capture_xruns(),
        engine.playback_xruns()
    );
    println!(" Skipped:   {} buffers bypassed the effect", engine.effect_skips());
    println!(
        " Buffers:   {} (total {}/{})",
        distribution,
        engine.buffer_count(),
        engine.allocated_buffers()
    );
    println!(
        " AEC:       {}",
        preprocessing_label(
            engine.is_echo_cancellation_supported(),
            engine.is_echo_cancellation_enabled()
        )
    );
    println!(
        " NS:        {}\n",
        preprocessing_label(
            engine.is_noise_suppression_supported(),
            engine.is_noise_suppression_enabled()
        )
    );
}

fn preprocessing_label(supported: bool, enabled: bool) -> &'static str {
    match (supported, enabled) {
        (false, _) => "unsupported",
        (true, true) => "on",
        (true, false) => "off",
    }
}

/// Apply one interactive command; returns false to quit
fn handle_command(engine: &EchoEngine, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (None, _, _) | (Some("quit"), _, _) | (Some("q"), _, _) => return false,
        (Some("stats"), _, _) => print_stats(engine),
        (Some("echo"), Some(delay), Some(decay)) => {
            match (delay.parse::<u32>(), decay.parse::<f32>()) {
                (Ok(delay), Ok(decay)) => {
                    if let Err(e) = engine.configure_echo(delay, decay) {
                        println!("{}", e);
                    }
                }
                _ => println!("Usage: echo <delay_ms> <decay>"),
            }
        }
        (Some("aec"), Some(state), _) | (Some("ns"), Some(state), _) => {
            let enabled = match state {
                "on" => true,
                "off" => false,
                _ => {
                    println!("Usage: aec|ns on|off");
                    return true;
                }
            };
            let result = if line.starts_with("aec") {
                engine.set_echo_cancellation_enabled(enabled)
            } else {
                engine.set_noise_suppression_enabled(enabled)
            };
            if let Err(e) = result {
                println!("{}", e);
            }
        }
        _ => println!("Commands: echo <ms> <decay> | aec on|off | ns on|off | stats | quit"),
    }
    true
}

async fn run_echo(config: EchoConfig, duration: Option<u64>) -> Result<()> {
    let engine = EchoEngine::initialize(&config, &CpalBackend)
        .context("Failed to initialize echo engine")?;
    engine.start().context("Failed to start echo")?;

    println!("Echo running. Press Enter to stop.");
    println!("Commands: echo <ms> <decay> | aec on|off | ns on|off | stats | quit");

    let deadline = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let stdin = tokio::io::stdin();
    let mut stdin_reader = BufReader::new(stdin).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            _ = &mut deadline => {
                info!("Duration elapsed");
                break;
            }
            line_result = stdin_reader.next_line() => {
                match line_result {
                    Ok(Some(line)) => {
                        if !handle_command(&engine, line.trim()) {
                            break;
                        }
                    }
                    Ok(None) => {
                        info!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        warn!("stdin error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    print_stats(&engine);
    let missing = engine.teardown();
    if missing > 0 {
        bail!("{} buffers were not returned", missing);
    }
    Ok(())
}

fn simulate(
    mut config: EchoConfig,
    seconds: u64,
    click_interval_ms: u32,
    wav: Option<PathBuf>,
    realtime: bool,
) -> Result<()> {
    config.dispatch = DispatchMode::Inline;
    let backend = VirtualBackend::new().with_preprocessing(true, true);
    let engine =
        EchoEngine::initialize(&config, &backend).context("Failed to initialize echo engine")?;
    let mic = backend
        .capture_device()
        .context("Capture device was not opened")?;
    let speaker = backend
        .playback_device()
        .context("Playback device was not opened")?;

    let format = engine.format();
    let mut recorder = Recorder::new(format);
    if let Some(path) = wav {
        recorder.start(path)?;
    }

    let frames_per_buffer = format.frames_per_buffer as u64;
    let channels = format.channels as usize;
    let click_every = (click_interval_ms as u64 * format.sample_rate as u64 / 1000).max(1);
    let buffers_per_second = (format.sample_rate as u64 / frames_per_buffer).max(1);
    let total_buffers = seconds * buffers_per_second;
    let period = Duration::from_secs_f32(format.buffer_period_ms() / 1000.0);

    engine.start().context("Failed to start echo")?;
    info!(
        "Simulating {} s: {} buffers of {} frames, click every {} ms",
        seconds, total_buffers, frames_per_buffer, click_interval_ms
    );

    let mut frame = 0u64;
    for tick in 1..=total_buffers {
        mic.complete_next(|buf| {
            for (i, slot) in buf.samples_mut().chunks_mut(channels).enumerate() {
                let value = if (frame + i as u64) % click_every == 0 {
                    IMPULSE_AMPLITUDE
                } else {
                    0
                };
                slot.fill(value);
            }
        });
        frame += frames_per_buffer;
        engine.pump();

        let mut written = Ok(());
        speaker.complete_next(|buf| written = recorder.write_samples(buf.filled_samples()));
        written?;
        engine.pump();

        if tick % buffers_per_second == 0 {
            println!("[{:>3}s] {}", tick / buffers_per_second, engine.distribution());
            engine.buffer_count();
        }
        if realtime {
            std::thread::sleep(period);
        }
    }

    engine.stop().context("Failed to stop echo")?;
    if recorder.is_recording() {
        let info = recorder.stop()?;
        println!(
            "Wrote {} ({} samples, {:.2}s)",
            info.path.display(),
            info.samples,
            info.duration_secs
        );
    }

    print_stats(&engine);
    let missing = engine.teardown();
    if missing > 0 {
        bail!("{} buffers were not returned", missing);
    }
    Ok(())
}
