use std::fs::File;
use std::io::Write;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use castrelay::capture::{
    run_capture, PixelFormat, Resolution, SessionConfig, SessionStats, VideoFormat,
};
use castrelay::encode::{BridgeConfig, BridgeStats, EncodeBridge};
use castrelay::service::{CaptureHost, HostConfig, Transport};
use castrelay::RelayError;

/// Log level for the relay
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// castrelay command line arguments
#[derive(Parser, Debug)]
#[command(name = "castrelay")]
#[command(version, about = "Screen capture to H.264 relay", long_about = None)]
struct CliArgs {
    /// Inherited capture service handle
    #[arg(
        long,
        value_name = "FD",
        required_unless_present = "loopback",
        conflicts_with = "loopback"
    )]
    fd: Option<i32>,

    /// Capture node to connect to
    #[arg(short = 'n', long, value_name = "ID", default_value_t = 0)]
    node: u32,

    /// Target framerate offered during negotiation
    #[arg(short = 'f', long, value_name = "FPS", default_value_t = 30)]
    framerate: u32,

    /// Encoder bitrate in bits per second
    #[arg(short = 'b', long, value_name = "BPS", default_value_t = 4_000_000)]
    bitrate: u32,

    /// Write the Annex B stream to this file
    #[arg(short = 'o', long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Serve frames from an in-process capture host instead of an
    /// inherited handle
    #[arg(long)]
    loopback: bool,

    /// Frames the loopback host feeds before stopping
    #[arg(long, value_name = "COUNT", default_value_t = 120)]
    frames: u32,

    /// Loopback frame size
    #[arg(long, value_name = "WxH", default_value = "640x480")]
    size: Resolution,

    /// Loopback pixel format (RGB, RGBA, RGBx, BGRx, YUY2, I420)
    #[arg(long, value_name = "FORMAT", default_value = "BGRx")]
    pixel_format: PixelFormat,

    /// Print a JSON stats summary at exit
    #[arg(long)]
    stats: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// End-of-run summary printed with --stats
#[derive(Serialize)]
struct RunReport {
    session: SessionStats,
    bridge: BridgeStats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting castrelay v{}", env!("CARGO_PKG_VERSION"));

    let code = run(args).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn run(args: CliArgs) -> anyhow::Result<i32> {
    let transport = Transport::new();

    // Resolve the capture handle: inherited fd, or an in-process loopback
    // host serving synthetic frames.
    let (fd, host) = if args.loopback {
        let config = HostConfig::default()
            .with_node_id(args.node)
            .with_format(args.pixel_format)
            .with_size(args.size)
            .with_fps(args.framerate);
        let host = Arc::new(CaptureHost::new(&transport, config)?);
        let fd = host.remote_fd()?;
        tracing::info!(
            "loopback capture host on node {}: {} {} @ {} fps",
            args.node,
            args.pixel_format,
            args.size,
            args.framerate
        );
        (fd, Some(host))
    } else {
        let raw = args
            .fd
            .ok_or_else(|| anyhow::anyhow!("--fd is required without --loopback"))?;
        // The supervisor hands over exclusive ownership of this descriptor
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        (fd, None)
    };

    let mut writer = open_output(args.output.as_ref())?;
    let bridge_config = BridgeConfig::default().with_bitrate(args.bitrate);
    let session_config = SessionConfig::default()
        .with_node_id(args.node)
        .with_framerate(args.framerate);

    let session_transport = transport.clone();
    let mut session = tokio::task::spawn_blocking(move || {
        let mut bridge = EncodeBridge::new(bridge_config, move |_context, unit| {
            if let Some(w) = writer.as_mut() {
                if let Err(e) = w.write_all(&unit.payload) {
                    tracing::warn!("cannot write encoded unit: {}", e);
                }
            }
        });
        let stats = run_capture(&session_transport, fd, session_config, &mut bridge)?;
        Ok::<(SessionStats, BridgeStats), RelayError>((stats, *bridge.stats()))
    });

    let feeder = host.as_ref().map(|host| {
        let host = host.clone();
        let frames = args.frames;
        tokio::spawn(async move {
            feed_loopback(host, frames).await;
        })
    });

    let joined = tokio::select! {
        joined = &mut session => joined,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            match host.as_ref() {
                Some(host) => host.disconnect(),
                // No host in this process to stop; give up right away
                None => std::process::exit(130),
            }
            (&mut session).await
        }
    };

    if let Some(feeder) = feeder {
        feeder.abort();
    }

    let (session_stats, bridge_stats) = match joined {
        Ok(Ok(stats)) => stats,
        Ok(Err(e)) => {
            tracing::error!("capture session failed: {}", e);
            return Ok(e.exit_code());
        }
        Err(e) => return Err(anyhow::anyhow!("capture session panicked: {}", e)),
    };

    tracing::info!(
        "relay finished: {} frames forwarded, {} encoded, {} units ({} bytes)",
        session_stats.exchange.forwarded,
        bridge_stats.frames_encoded,
        bridge_stats.units_relayed,
        bridge_stats.bytes_relayed
    );

    if args.stats {
        let report = RunReport {
            session: session_stats,
            bridge: bridge_stats,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    Ok(0)
}

/// Feed synthetic frames through the loopback host, then hang up
async fn feed_loopback(host: Arc<CaptureHost>, frames: u32) {
    // Wait for the session to finish connecting its stream
    for _ in 0..500 {
        if host.is_stream_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let Some(format) = host.negotiated_format() else {
        tracing::warn!("loopback stream never negotiated, stopping host");
        host.disconnect();
        return;
    };

    let fps = if format.framerate.num > 0 && format.framerate.denom > 0 {
        format.framerate.num / format.framerate.denom
    } else {
        30
    };
    let interval = Duration::from_millis(1000 / u64::from(fps.max(1)));

    for index in 0..frames {
        match host.feed_frame_bytes(synthetic_frame(&format, index)) {
            Ok(true) => {}
            Ok(false) => tracing::debug!("loopback pool exhausted, dropping frame {}", index),
            Err(e) => {
                tracing::debug!("loopback feeding stopped: {}", e);
                break;
            }
        }
        tokio::time::sleep(interval).await;
    }
    host.disconnect();
}

/// Moving-gradient test frame in the given format
fn synthetic_frame(format: &VideoFormat, index: u32) -> Bytes {
    let w = format.size.width as usize;
    let h = format.size.height as usize;
    let phase = (index as usize) * 3;
    let mut data = vec![0u8; format.frame_size()];

    match format.pixel_format {
        PixelFormat::I420 => {
            for row in 0..h {
                for col in 0..w {
                    data[row * w + col] = ((row + col + phase) % 256) as u8;
                }
            }
            for byte in data[w * h..].iter_mut() {
                *byte = 128;
            }
        }
        PixelFormat::Yuy2 => {
            for (i, group) in data.chunks_exact_mut(4).enumerate() {
                let luma = ((i * 2 + phase) % 256) as u8;
                group[0] = luma;
                group[1] = 128;
                group[2] = luma;
                group[3] = 128;
            }
        }
        _ => {
            // Channel order does not matter for a synthetic gradient
            let bpp = format.pixel_format.bytes_per_pixel().unwrap_or(4);
            for row in 0..h {
                for col in 0..w {
                    let idx = (row * w + col) * bpp;
                    data[idx] = ((col * 255 / w.max(1) + phase) % 256) as u8;
                    data[idx + 1] = (row * 255 / h.max(1)) as u8;
                    data[idx + 2] = (phase % 256) as u8;
                    if bpp == 4 {
                        data[idx + 3] = 0xFF;
                    }
                }
            }
        }
    }
    Bytes::from(data)
}

fn open_output(path: Option<&PathBuf>) -> anyhow::Result<Option<File>> {
    use anyhow::Context;

    match path {
        Some(p) => {
            let file =
                File::create(p).with_context(|| format!("cannot create {}", p.display()))?;
            tracing::info!("writing Annex B stream to {}", p.display());
            Ok(Some(file))
        }
        None => Ok(None),
    }
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "castrelay=error",
        LogLevel::Warn => "castrelay=warn",
        LogLevel::Info => "castrelay=info",
        LogLevel::Verbose => "castrelay=debug",
        LogLevel::Debug => "castrelay=debug,openh264=debug",
        LogLevel::Trace => "castrelay=trace,openh264=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
