// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;

use multitimer::{Clock, Idle, MonotonicClock, RunStats, Scheduler, SimClock};

mod config;
mod device;

use crate::config::Config;
use crate::device::{DeviceAction, Devices};

#[derive(Debug, Parser)]
#[clap(
    max_term_width = 80,
    about = "run periodic device tasks from a TOML description"
)]
struct Args {
    /// Path to the task description
    cfg: PathBuf,

    /// Log more (repeat for more still)
    #[clap(short, long, parse(from_occurrences))]
    verbose: usize,

    /// Don't open any devices; writes are dropped and reads return zeros
    #[clap(long)]
    dry_run: bool,

    /// Run on a simulated clock that skips straight to each deadline.
    /// Needs a duration, and implies --dry-run.
    #[clap(long)]
    simulate: bool,

    /// Stop after this many milliseconds (overrides the config file)
    #[clap(long)]
    duration_ms: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(level),
    )
    .init();

    let cfg = Config::from_file(&args.cfg)?;
    let devices = devices(&args, &cfg)?;

    let duration = args.duration_ms.or(cfg.run.duration_ms);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed))
            .context("installing Ctrl-C handler")?;
    }

    let stats = if args.simulate {
        if duration.is_none() {
            bail!("--simulate needs --duration-ms or a [run] duration-ms");
        }
        // A simulated clock only moves when slept on, so the loop must
        // sleep, and it may as well sleep all the way to the next deadline.
        let idle = Idle::Sleep { max_ms: u64::MAX };
        drive(&cfg, &devices, &SimClock::new(0), idle, duration, &stop)?
    } else {
        let idle = cfg.run.idle();
        drive(&cfg, &devices, &MonotonicClock::new(), idle, duration, &stop)?
    };

    log::info!(
        "{}: {} firings over {} sweeps ({} idle)",
        cfg.name,
        stats.fired,
        stats.sweeps,
        stats.idle_waits,
    );
    Ok(())
}

/// Simulated time runs far faster than real time, so a simulated run never
/// touches real devices.
fn devices(args: &Args, cfg: &Config) -> Result<Devices> {
    if args.dry_run || args.simulate {
        if !args.dry_run {
            log::info!("simulating; devices will not be opened");
        }
        Ok(Devices::dry_run(cfg))
    } else {
        Devices::open(cfg)
    }
}

/// Adds every configured task to a fresh scheduler, with offsets measured
/// from `start`.
fn schedule(
    cfg: &Config,
    devices: &Devices,
    start: u64,
) -> Result<Scheduler<'static>> {
    let mut sched = Scheduler::new();
    for (label, task) in &cfg.tasks {
        let port = devices.get(&task.device).with_context(|| {
            format!("task {label}: no device {}", task.device)
        })?;
        let action = DeviceAction::new(&task.device, port, task.action.clone());
        sched.add_with_rearm(
            label.as_str(),
            start.saturating_add(task.offset_ms),
            task.interval_ms,
            task.rearm.into(),
            action,
        )?;
    }
    Ok(sched)
}

/// Runs the configured tasks against `clock` until `stop` is set or
/// `duration_ms` has passed. Tasks due exactly at the end still fire; the
/// run stops as soon as nothing else is due before the end.
fn drive<C: Clock>(
    cfg: &Config,
    devices: &Devices,
    clock: &C,
    idle: Idle,
    duration_ms: Option<u64>,
    stop: &AtomicBool,
) -> Result<RunStats> {
    let start = clock.now_ms();
    let mut sched = schedule(cfg, devices, start)?;
    let end = duration_ms.map(|d| start.saturating_add(d));

    log::info!(
        "{}: running {} tasks{}",
        cfg.name,
        sched.len(),
        match end {
            Some(end) => format!(" for {} ms", end - start),
            None => String::new(),
        },
    );

    let stats = sched.run(clock, idle, |sweep| {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        match (end, sweep.next_expiry) {
            (None, _) => true,
            (Some(end), Some(next)) => sweep.now < end && next <= end,
            (Some(_), None) => false,
        }
    })?;
    Ok(stats)
}
