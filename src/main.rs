//! fc-token - FileCentipede activation code helper
//!
//! Prints the currently valid activation code, lists upcoming ones and keeps the
//! local cache fresh, either once per invocation or continuously with `watch`.

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use fc_token::cache::CodeCache;
use fc_token::cli::{parse_interval_arg, parse_mode_arg, Cli, Command};
use fc_token::config::Settings;
use fc_token::data::ReqwestFetcher;
use fc_token::refresh::{RefreshHandle, RefreshMessage};
use fc_token::scheduler::{RefreshMode, Scheduler};
use fc_token::time::{format_duration, format_local, SystemClock};

/// Installs the stderr log subscriber; stdout is reserved for command output
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("fc_token=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fc_token=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// "in 2h" for future instants, "now" otherwise
fn describe_due(next_due: DateTime<Utc>, now: DateTime<Utc>) -> String {
    if next_due <= now {
        "now".to_string()
    } else {
        format!("in {}", format_duration(next_due - now))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn Error>> {
    let command = cli.command();

    let settings_path = cli.config_file.clone().or_else(Settings::default_path);
    let mut settings = settings_path
        .as_deref()
        .map(Settings::load)
        .unwrap_or_default();

    // --url applies to this invocation only and is never written back.
    let mut config = settings.scheduler_config();
    if let Some(url) = &cli.url {
        config.url = url.clone();
    }

    let cache_path: PathBuf = cli
        .cache_file
        .clone()
        .or_else(CodeCache::default_path)
        .ok_or("cannot determine a cache location")?;
    let loaded = CodeCache::load(cache_path.clone());

    let shutdown = CancellationToken::new();
    let scheduler = Arc::new(
        Scheduler::new(
            config,
            loaded.cache,
            Arc::new(ReqwestFetcher::new()),
            Arc::new(SystemClock),
        )
        .with_cancellation(shutdown.clone()),
    );

    match command {
        Command::Current => current(&scheduler).await,
        Command::Future => {
            future(&scheduler);
            Ok(ExitCode::SUCCESS)
        }
        Command::Refresh => refresh(&scheduler).await,
        Command::Purge => {
            scheduler.purge().await?;
            println!("Cache cleared: {}", cache_path.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Mode { mode, interval } => {
            let mode = parse_mode_arg(&mode)?;
            let interval = interval.as_deref().map(parse_interval_arg).transpose()?;

            settings.mode = mode;
            if let Some(interval) = interval {
                settings.interval_minutes = interval.num_minutes();
            }
            let path = settings_path.ok_or("cannot determine a settings location")?;
            settings.save(&path)?;

            let now = scheduler.now();
            let next_due = scheduler.set_mode(mode, interval);
            let snapshot = scheduler.snapshot();
            println!("Mode: {}", mode);
            println!("Interval: {}", format_duration(snapshot.interval));
            match mode {
                // Fixed schedules count from the last fetch, which a new process has not made.
                RefreshMode::Fixed => println!(
                    "Refreshes on start, then every {}",
                    format_duration(snapshot.interval)
                ),
                RefreshMode::Auto => println!(
                    "Next refresh: {} ({})",
                    format_local(next_due),
                    describe_due(next_due, now)
                ),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Watch => {
            watch(scheduler, &settings, shutdown).await;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn current(scheduler: &Scheduler) -> Result<ExitCode, Box<dyn Error>> {
    let mut entry = scheduler.current(scheduler.now());
    if entry.is_none() {
        let outcome = scheduler.refresh_now().await;
        if let Some(error) = &outcome.error {
            eprintln!("Refresh failed: {}", error);
        }
        entry = scheduler.current(scheduler.now());
    }

    match entry {
        Some(entry) => {
            println!("{}", entry.code());
            Ok(ExitCode::SUCCESS)
        }
        None => {
            eprintln!("No activation code is valid right now");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn future(scheduler: &Scheduler) {
    let now = scheduler.now();
    let entries = scheduler.future(now);
    if entries.is_empty() {
        println!("No cached codes");
        return;
    }

    for entry in entries {
        let marker = if entry.is_current(now) { '*' } else { ' ' };
        println!(
            "{} {} - {}  {}",
            marker,
            format_local(entry.valid_from()),
            format_local(entry.valid_until()),
            entry.code()
        );
    }
}

async fn refresh(scheduler: &Scheduler) -> Result<ExitCode, Box<dyn Error>> {
    let outcome = scheduler.refresh_now().await;
    let now = scheduler.now();
    let next_due = scheduler.next_due();

    if let Some(error) = &outcome.error {
        eprintln!("Refresh failed: {}", error);
        eprintln!("Next attempt {}", describe_due(next_due, now));
        return Ok(ExitCode::FAILURE);
    }

    if let Some(stats) = &outcome.stats {
        println!(
            "Parsed {} codes ({} bytes as {})",
            stats.parsed, stats.bytes, stats.identity
        );
    }
    if let Some(merge) = &outcome.merge {
        println!("{} new, {} expired removed", merge.added, merge.pruned);
    }
    match scheduler.current(now) {
        Some(entry) => println!("Current: {}", entry.code()),
        None => println!("Current: none"),
    }
    println!("Next refresh {}", describe_due(next_due, now));
    Ok(ExitCode::SUCCESS)
}

fn print_message(message: RefreshMessage, now: DateTime<Utc>) {
    match message {
        RefreshMessage::CodeChanged(event) => match event.current {
            Some(entry) => println!(
                "[{}] New code: {} (valid until {})",
                format_local(now),
                entry.code(),
                format_local(entry.valid_until())
            ),
            None => println!("[{}] No code is valid right now", format_local(now)),
        },
        RefreshMessage::RefreshCompleted(outcome) => {
            let parsed = outcome.stats.map(|s| s.parsed).unwrap_or(0);
            let added = outcome.merge.map(|m| m.added).unwrap_or(0);
            println!(
                "[{}] Refreshed: {} codes parsed, {} new",
                format_local(now),
                parsed,
                added
            );
        }
        RefreshMessage::RefreshError(error) => {
            eprintln!("[{}] Refresh failed: {}", format_local(now), error);
        }
    }
}

async fn watch(scheduler: Arc<Scheduler>, settings: &Settings, shutdown: CancellationToken) {
    let refresh_config = settings.refresh_config();
    if !refresh_config.enabled {
        println!("Automatic refresh is disabled in the settings; nothing will be fetched");
    }

    let now = scheduler.now();
    match scheduler.current(now) {
        Some(entry) => println!(
            "Current code: {} (valid for {})",
            entry.code(),
            format_duration(entry.valid_until() - now)
        ),
        None => println!("No cached code is valid right now"),
    }

    let mut handle = RefreshHandle::spawn(scheduler.clone(), refresh_config, shutdown);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            message = handle.receiver.recv() => match message {
                Some(message) => print_message(message, scheduler.now()),
                None => break,
            },
        }
    }

    handle.shutdown().await;
    let next_due = scheduler.next_due();
    println!(
        "Stopped; next refresh would have been {}",
        describe_due(next_due, scheduler.now())
    );
}
