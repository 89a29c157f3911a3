// SPDX-License-Identifier: GPL-2.0
//
// Service entry point: loads the configuration, wires the control core
// together and hosts it until shutdown. The RPC transport that feeds the
// session API lives outside this daemon.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use uclampd::config::{Config, ProfileStore};
use uclampd::hints::{HintSink, PlatformHintSink};
use uclampd::interaction::InteractionHandler;
use uclampd::manager::{dispatch_timer_event, SessionManager};
use uclampd::timer::TimerThread;
use uclampd::uclamp::SyscallFloorSetter;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "uclampd",
    version,
    about = "Deadline-aware uclamp boost daemon for performance hint sessions."
)]
struct Opts {
    /// Path to the daemon configuration file.
    #[clap(short = 'c', long, default_value = "/etc/uclampd/config.json")]
    config: PathBuf,

    /// Start with built-in defaults when the configuration file is missing
    /// instead of failing.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    allow_missing_config: bool,

    /// Print the live session dump at the given interval in seconds.
    #[clap(long)]
    stats: Option<f64>,

    /// Enable verbose output.
    #[clap(short = 'v', long, action = clap::ArgAction::SetTrue)]
    verbose: bool,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let loglevel = if opts.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let config = match Config::load(&opts.config) {
        Ok(config) => config,
        Err(e) if opts.allow_missing_config => {
            warn!("{:#}; continuing with built-in defaults", e);
            Config::default()
        }
        Err(e) => return Err(e).context("configuration unavailable"),
    };

    let profiles = Arc::new(ProfileStore::from_config(&config));
    let hints: Arc<dyn HintSink> = Arc::new(PlatformHintSink::from_config(&config));
    let timer = TimerThread::spawn("hint-timer", dispatch_timer_event)?;
    let manager = SessionManager::new(
        Arc::new(SyscallFloorSetter),
        Arc::clone(&hints),
        profiles,
        timer.handle(),
        config.disable_boost_hint.clone(),
    );

    let mut interaction = InteractionHandler::new(config.interaction.clone(), hints);
    if !interaction.init() {
        info!("display idle detection unavailable, interaction boosts run timed");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    info!("uclampd started ({} sessions)", manager.session_count());

    let stats_interval = opts.stats.map(Duration::from_secs_f64);
    let mut last_dump = std::time::Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        if let Some(interval) = stats_interval {
            if last_dump.elapsed() >= interval {
                print!("{}", manager.dump());
                last_dump = std::time::Instant::now();
            }
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("shutting down");
    interaction.exit();
    timer.shutdown();
    Ok(())
}
