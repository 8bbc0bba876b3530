//! epg-guide - XMLTV program guide tool
//! Loads, refreshes and queries a cached XMLTV guide from the command line

// Use mimalloc for faster memory allocation (Linux, macOS)
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use epg_guide::epg::{
    format_datetime, format_time, resolve_all, DownloadOutcome, GuideEvent, GuideParser, ParseFailure,
    RefreshCoordinator,
};
use epg_guide::{GuideConfig, Program};

#[derive(Parser)]
#[command(name = "epg-guide")]
#[command(version)]
#[command(about = "Download, cache and query XMLTV program guides")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Guide URL (overrides config file)
    #[arg(short, long, value_name = "URL")]
    url: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show what is cached, without touching the network
    Status,
    /// Download the guide now, even if it is fresh
    Refresh,
    /// Show the current and next programme for channel names
    Now {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Show which guide channel each name resolves to
    Match {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Parse a local XMLTV file (plain or gzip) and report counts
    Parse { file: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("epg_guide={}", cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Command::Parse { file } = &cli.command {
        return parse_file(file);
    }

    let mut config = match &cli.config {
        Some(path) => GuideConfig::load_from(path),
        None => GuideConfig::load(),
    };
    if let Some(url) = cli.url {
        config.guide_url = url;
    }
    info!(storage = %config.storage_dir().display(), "epg-guide v{}", env!("CARGO_PKG_VERSION"));

    let coordinator = RefreshCoordinator::from_config(config);
    match cli.command {
        Command::Status => {
            join(coordinator.load_cached());
            print_status(&coordinator);
        }
        Command::Refresh => {
            join(coordinator.load_cached());
            if !coordinator.config().has_source() {
                bail!("no guide URL configured (use --url or set guide_url in the config file)");
            }
            let events = coordinator.subscribe();
            let handle = coordinator.refresh_now();
            follow(handle, &events);
            print_status(&coordinator);
            if let DownloadOutcome::Failed(reason) = coordinator.status().download.last_outcome {
                bail!("refresh failed: {}", reason);
            }
        }
        Command::Now { names } => {
            join(coordinator.start());
            let now = Utc::now();
            for name in &names {
                match coordinator.lookup(name, now) {
                    Some(found) => {
                        println!("{} -> {} [{}]", name, found.display_name, found.tier.label());
                        println!("  now:  {}", describe(found.current.as_ref()));
                        println!("  next: {}", describe(found.next.as_ref()));
                    }
                    None => println!("{}: no guide data", name),
                }
            }
        }
        Command::Match { names } => {
            join(coordinator.load_cached());
            let store = coordinator.store();
            for (name, found) in resolve_all(&names, &store) {
                match found {
                    Some(m) => println!(
                        "{} -> {} [{}, {} programmes]",
                        name,
                        m.key,
                        m.tier.label(),
                        m.programs.len()
                    ),
                    None => println!("{}: no guide data", name),
                }
            }
        }
        Command::Parse { .. } => {}
    }

    Ok(())
}

fn parse_file(path: &Path) -> Result<()> {
    match GuideParser::parse_file(path) {
        Ok(parsed) => {
            println!("Channels:   {}", parsed.catalog.len());
            println!("Programmes: {}", parsed.programs.len());
            println!("Dropped:    {}", parsed.dropped_programmes);
            Ok(())
        }
        Err(ParseFailure { error, partial }) => {
            eprintln!(
                "Stopped early; read {} channels and {} programmes before the error",
                partial.catalog.len(),
                partial.programs.len()
            );
            Err(error).with_context(|| format!("failed to parse {}", path.display()))
        }
    }
}

fn join(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        let _ = handle.join();
    }
}

/// Print progress until the worker finishes
fn follow(handle: Option<JoinHandle<()>>, events: &std::sync::mpsc::Receiver<GuideEvent>) {
    let Some(handle) = handle else {
        eprintln!("A refresh is already running");
        return;
    };
    let mut drawn = false;
    while !handle.is_finished() {
        for event in events.try_iter() {
            if let GuideEvent::Progress(progress) = event {
                eprint!("\r{}        ", progress);
                let _ = std::io::stderr().flush();
                drawn = true;
            }
        }
        thread::sleep(Duration::from_millis(100));
    }
    if drawn {
        eprintln!();
    }
    join(Some(handle));
}

fn print_status(coordinator: &RefreshCoordinator) {
    let status = coordinator.status();
    println!("Phase:      {}", status.phase.label());
    println!("Channels:   {}", status.channel_count);
    println!("Programmes: {}", status.program_count);
    match status.last_updated {
        Some(ts) => println!("Updated:    {}", format_datetime(ts)),
        None => println!("Updated:    never"),
    }
    if let Some(message) = status.last_message {
        println!("Message:    {}", message);
    }
    if let Some(path) = coordinator.store().source_path() {
        println!("Source:     {}", path.display());
    }
}

fn describe(program: Option<&Program>) -> String {
    match program {
        Some(p) => format!("{}-{} {}", format_time(p.start()), format_time(p.end()), p.title()),
        None => "-".to_string(),
    }
}
