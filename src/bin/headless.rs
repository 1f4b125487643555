use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use cathode8_core::audio::NullAudioSink;
use cathode8_core::config::EmulatorConfig;
use cathode8_core::nes::System;
use cathode8_core::nes::cartridge::Cartridge;
use cathode8_core::nes::cpu::TRACE_TARGET;
use cathode8_core::video::FrameBuffer;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, Clone)]
struct Args {
    rom: PathBuf,
    frames: u32,
    trace: bool,
    config: Option<PathBuf>,
}

fn parse_args() -> Result<Args> {
    let mut rom = None;
    let mut frames = 60;
    let mut trace = false;
    let mut config = None;
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--frames" => {
                let value = args
                    .next()
                    .context("--frames requires an integer, e.g. --frames 600")?;
                frames = value
                    .parse::<u32>()
                    .with_context(|| format!("invalid --frames value: {value}"))?;
            }
            "--trace" => trace = true,
            "--config" => {
                let value = args
                    .next()
                    .context("--config requires a path to a JSON file")?;
                config = Some(PathBuf::from(value));
            }
            "--help" | "-h" => {
                println!(
                    "cathode8_headless\n\n\
Usage:\n\
  cathode8_headless [options] <rom.nes>\n\n\
Options:\n\
  --frames <n>          Frames to run (default 60)\n\
  --trace               Log every CPU instruction at trace level\n\
  --config <path>       Emulator config as JSON\n\
  -h, --help            Show this help\n"
                );
                std::process::exit(0);
            }
            other if other.starts_with("--") => anyhow::bail!("unknown argument: {other}"),
            other => rom = Some(PathBuf::from(other)),
        }
    }

    Ok(Args {
        rom: rom.context("missing ROM path; see --help")?,
        frames,
        trace,
        config,
    })
}

fn init_tracing(trace: bool) {
    let default = if trace {
        format!("info,{TRACE_TARGET}=trace")
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("tracing subscriber already installed");
    }
}

fn main() -> Result<()> {
    let args = parse_args()?;
    init_tracing(args.trace);

    let mut config = match &args.config {
        Some(path) => EmulatorConfig::from_json_file(path)?,
        None => EmulatorConfig::default(),
    };
    config.trace_cpu |= args.trace;

    let cartridge = Cartridge::from_file(&args.rom)
        .with_context(|| format!("failed to load ROM {}", args.rom.display()))?;
    info!(
        mapper = cartridge.mapper_name(),
        battery = cartridge.has_battery(),
        "loaded {}",
        args.rom.display()
    );

    let display = FrameBuffer::new();
    let frames = display.handle();
    let audio = NullAudioSink::new(config.sample_rate, config.audio_channels);
    let mut system = System::new(cartridge, &config, Box::new(display), Box::new(audio));

    let start = Instant::now();
    for _ in 0..args.frames {
        system.frame_step()?;
    }
    let elapsed = start.elapsed().as_secs_f32();

    let hash = frames.sha1_hex();
    info!(
        frames = system.frame_number(),
        elapsed = %format!("{elapsed:.2}s"),
        "run complete"
    );
    println!("{hash}");
    Ok(())
}
