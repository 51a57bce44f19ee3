use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hitline::{Analytics, Config, ErrorReport, Tracker};

#[derive(Parser)]
#[command(name = "hitline")]
#[command(about = "Queue analytics hits and deliver them to a collector", long_about = None)]
struct Cli {
    /// Configuration file (TOML/JSON); defaults to HITLINE_* environment variables
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a hit
    Send {
        /// Tracking id, e.g. UA-12345-1
        tracking_id: String,
        /// Application name attached to the hit
        #[arg(long, default_value = "hitline")]
        app_name: String,
        /// Deliver right after queueing
        #[arg(long)]
        dispatch: bool,
        #[command(subcommand)]
        hit: HitCommand,
    },
    /// Deliver every queued hit now
    Dispatch,
    /// Number of queued hits
    Pending {
        #[arg(long)]
        tracking_id: Option<String>,
    },
    /// Print this installation's client id
    ClientId,
}

#[derive(Subcommand)]
enum HitCommand {
    View {
        screen: String,
    },
    Event {
        category: String,
        action: String,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        value: Option<i64>,
    },
    Timing {
        category: String,
        /// Interval in milliseconds
        millis: u64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        label: Option<String>,
    },
    Exception {
        description: String,
        #[arg(long)]
        fatal: bool,
    },
    Social {
        network: String,
        action: String,
        #[arg(long)]
        target: Option<String>,
    },
}

fn send_hit(tracker: &Tracker, hit: &HitCommand) -> bool {
    match hit {
        HitCommand::View { screen } => tracker.send_view(Some(screen)),
        HitCommand::Event {
            category,
            action,
            label,
            value,
        } => tracker.send_event(category, action, label.as_deref(), *value),
        HitCommand::Timing {
            category,
            millis,
            name,
            label,
        } => tracker.send_timing(
            category,
            Duration::from_millis(*millis),
            name.as_deref(),
            label.as_deref(),
        ),
        HitCommand::Exception { description, fatal } => tracker.send_exception(*fatal, description),
        HitCommand::Social {
            network,
            action,
            target,
        } => tracker.send_social(network, action, target.as_deref()),
    }
}

fn print_errors(errors: &mut broadcast::Receiver<ErrorReport>) {
    while let Ok(report) = errors.try_recv() {
        eprintln!(
            "⚠ {:?} (code {}): {}{}",
            report.kind,
            report.kind.code(),
            report.message,
            if report.dropped_hits > 0 {
                format!(" [{} hits dropped]", report.dropped_hits)
            } else {
                String::new()
            }
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match cli.config.as_deref() {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    let default_filter = if config.debug { "hitline=debug" } else { "hitline=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    // One-shot process: only deliver when asked
    config.dispatch.interval_secs = -1.0;

    info!("Using queue database: {}", config.storage.url);
    let analytics = Analytics::new(config)
        .await
        .context("failed to open analytics queue")?;
    let mut errors = analytics.subscribe_errors();

    match cli.command {
        Commands::Send {
            tracking_id,
            app_name,
            dispatch,
            hit,
        } => {
            let tracker = analytics.get_or_create(&tracking_id)?;
            tracker.set_app_name(&app_name);
            if !send_hit(&tracker, &hit) {
                analytics.shutdown().await?;
                bail!("hit was not queued");
            }
            if dispatch {
                analytics.dispatch();
            }
            analytics.sync().await?;
            println!("✓ Queued hit for '{}'", tracking_id);
        }
        Commands::Dispatch => {
            let before = analytics.pending_hits(None).await?;
            analytics.dispatch();
            analytics.sync().await?;
            let after = analytics.pending_hits(None).await?;
            println!("✓ Delivered {} of {} queued hits", before.saturating_sub(after), before);
        }
        Commands::Pending { tracking_id } => {
            let pending = analytics.pending_hits(tracking_id.as_deref()).await?;
            println!("{}", pending);
        }
        Commands::ClientId => {
            println!("{}", analytics.client_id());
        }
    }

    print_errors(&mut errors);
    analytics.shutdown().await?;
    Ok(())
}
