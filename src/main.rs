use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use logplay::config::PlayerConfig;
use logplay::core::{Subscription, Time};
use logplay::input::open_source;
use logplay::playback::{Player, PlayerPresence, PlayerState};

/// Play recorded logs as one timeline, printing each player snapshot as a
/// JSON line on stdout
#[derive(Debug, Parser)]
#[command(name = "logplay", version)]
struct Args {
    /// Log files (CSV or JSON lines)
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Topic to subscribe to with block caching. Defaults to every topic.
    #[arg(long = "topic", value_name = "TOPIC")]
    topics: Vec<String>,

    /// Topic to read only during playback
    #[arg(long = "partial", value_name = "TOPIC")]
    partial: Vec<String>,

    /// Playback speed multiplier
    #[arg(long, default_value_t = 1.0)]
    speed: f64,

    /// Log time (seconds) to start playing from
    #[arg(long, value_name = "SECS")]
    seek: Option<Time>,

    /// Log time (seconds) to stop at
    #[arg(long, value_name = "SECS")]
    until: Option<Time>,

    /// Player config file (JSON)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print one summary line at the end instead of every snapshot
    #[arg(long)]
    summary: bool,
}

impl Args {
    fn subscriptions(&self) -> Vec<Subscription> {
        self.topics
            .iter()
            .map(Subscription::full)
            .chain(self.partial.iter().map(Subscription::partial))
            .collect()
    }
}

#[derive(Default)]
struct Totals {
    snapshots: u64,
    messages_by_topic: BTreeMap<String, u64>,
    last_time: Option<Time>,
}

impl Totals {
    fn record(&mut self, state: &PlayerState) {
        self.snapshots += 1;
        for msg in state.messages() {
            *self.messages_by_topic.entry(msg.topic.clone()).or_default() += 1;
        }
        if let Some(time) = state.current_time() {
            self.last_time = Some(time);
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = match &args.config {
        Some(path) => PlayerConfig::from_path(path)?,
        None => PlayerConfig::load(),
    };

    let mut sources = Vec::with_capacity(args.files.len());
    for file in &args.files {
        sources.push(open_source(file).with_context(|| format!("Failed to load {:?}", file))?);
    }

    let name = args
        .files
        .iter()
        .map(|f| f.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let player = Player::new(sources, config)?.with_name(name);
    player.set_playback_speed(args.speed)?;

    let explicit = args.subscriptions();
    let subscribe_all = explicit.is_empty();
    if !subscribe_all {
        player.set_subscriptions(explicit);
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    player.set_listener(tx)?;

    let mut totals = Totals::default();
    let mut started = false;
    let mut seen_playing = false;
    let mut code = ExitCode::SUCCESS;

    loop {
        let state = tokio::select! {
            state = rx.recv() => state,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        };
        let Some(state) = state else {
            warn!("Player stopped without finishing");
            break;
        };

        totals.record(&state);
        if !args.summary {
            println!("{}", serde_json::to_string(&state)?);
        }

        if state.presence == PlayerPresence::Error {
            for problem in &state.problems {
                error!("{}{}", problem.message, problem.error.as_deref().map(|e| format!(": {}", e)).unwrap_or_default());
            }
            code = ExitCode::FAILURE;
            break;
        }

        let Some(active) = state.active_data.as_ref() else {
            continue;
        };
        if !started {
            started = true;
            if subscribe_all {
                player.set_subscriptions(active.topics.iter().map(|t| Subscription::full(&t.name)).collect());
            }
            if let Some(seek) = args.seek {
                player.seek_playback(seek)?;
            }
            match args.until {
                Some(until) => player.play_until(until)?,
                None => player.start_playback(),
            }
            continue;
        }

        if active.is_playing {
            seen_playing = true;
        } else if seen_playing {
            info!("Playback finished at {}", active.current_time);
            break;
        }
    }

    player.close().await;

    if args.summary {
        let summary = json!({
            "snapshots": totals.snapshots,
            "messages": totals.messages_by_topic.values().sum::<u64>(),
            "messages_by_topic": totals.messages_by_topic,
            "last_time": totals.last_time,
        });
        println!("{}", summary);
    }
    Ok(code)
}
