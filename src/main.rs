use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use showlight::artnet::ArtNetSender;
use showlight::canvas::Canvas;
use showlight::config::{parse_endpoint, probe_track_length};
use showlight::console::Console;
use showlight::dmx_types::FixtureMap;
use showlight::playback::{PlaybackClock, PlaybackHandle, PlaybackLoop, PlaybackSettings};
use showlight::render::RenderEngine;
use showlight::show::{PresetLibrary, ShowFile};
use showlight::sync::SyncBridge;

#[derive(Parser, Debug)]
#[command(name = "showlight", version, about = "Plays a pre-rendered DMX show over Art-Net")]
struct Cli {
    /// Show document (JSON).
    show: PathBuf,

    /// Art-Net destination, overrides the show config.
    #[arg(long)]
    destination: Option<String>,

    /// Art-Net universe, overrides the show config.
    #[arg(long)]
    universe: Option<u16>,

    /// Playback sync listen address, overrides the show config.
    #[arg(long)]
    sync_listen: Option<String>,

    /// Do not listen for playback reports.
    #[arg(long)]
    no_sync: bool,

    /// Start the clock immediately instead of waiting for a report or `play`.
    #[arg(long)]
    autoplay: bool,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut show = ShowFile::load(&cli.show)?;
    if let Some(destination) = cli.destination {
        show.config.destination = destination;
    }
    if let Some(universe) = cli.universe {
        show.config.universe = universe;
    }
    if let Some(sync_listen) = cli.sync_listen {
        show.config.sync_listen = sync_listen;
    }
    show.config.validate().context("invalid show config")?;
    let config = show.config.clone();

    let track_length = show.duration.or_else(|| {
        show.audio
            .as_deref()
            .and_then(|audio| probe_track_length(&cli.show.with_file_name(audio)))
    });
    let canvas = Arc::new(Canvas::new(
        config.canvas_duration(track_length),
        config.frame_rate,
    ));

    let fixtures: FixtureMap = show.fixtures.iter().cloned().collect();
    let (presets, preset_issues) = PresetLibrary::from_json(&show.presets);
    let (cues, cue_issues) = show.parse_cues();
    for issue in preset_issues.iter().chain(&cue_issues) {
        tracing::warn!(%issue, "show entry ignored");
    }

    let report = RenderEngine::new(&fixtures, &presets, show.bpm)
        .with_render_rate(config.render_rate)
        .render_into(&cues, &canvas);
    tracing::info!(
        fixtures = fixtures.len(),
        presets = presets.len(),
        rendered = report.rendered.len(),
        skipped = report.skipped.len(),
        duration = canvas.duration(),
        frames = canvas.num_frames(),
        "show rendered"
    );

    let clock = PlaybackHandle::new(PlaybackClock::new(config.drift_tolerance));
    if cli.autoplay {
        clock.play();
    }
    let sender = ArtNetSender::new(config.destination_addr()?, config.max_send_rate);
    let playback = PlaybackLoop::spawn(
        canvas.clone(),
        clock.clone(),
        sender,
        PlaybackSettings {
            frame_interval: config.frame_interval(),
            universe: config.universe,
            blackout_when_stopped: config.blackout_when_stopped,
        },
    )
    .context("failed to start playback thread")?;

    let bridge = if cli.no_sync {
        None
    } else {
        let address = parse_endpoint(&config.sync_listen)?;
        Some(
            SyncBridge::bind(address, clock.clone())
                .await
                .with_context(|| format!("failed to listen on {address}"))?,
        )
    };

    let mut console = Console::new(&clock, &canvas, &fixtures);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match console.execute(&line) {
                    Ok(output) => println!("{output}"),
                    Err(e) => println!("{e}"),
                },
                // stdin closed: keep running until interrupted
                Ok(None) => {
                    tokio::signal::ctrl_c().await?;
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "console input failed");
                    tokio::signal::ctrl_c().await?;
                    break;
                }
            },
        }
    }

    tracing::info!("shutting down");
    if let Some(bridge) = bridge {
        bridge.shutdown().await;
    }
    playback.shutdown();
    Ok(())
}
