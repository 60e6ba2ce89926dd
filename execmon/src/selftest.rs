//! Runs the whole pipeline in-process: named producer threads fire the exec
//! hook of a local backend while a consumer thread drains the ring.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use execmon_common::ExecEvent;
use log::info;

use crate::{
    consumer::ConsumerLoop,
    probes::{
        EntryPoint,
        handler::CurrentTask,
        local::{LocalBackend, LocalEntryPoints},
    },
    session,
};

#[derive(Debug, Clone)]
pub struct SelftestConfig {
    pub producers: usize,
    pub events_per_producer: u64,
    pub slots: usize,
    pub poll_timeout: Duration,
}

impl Default for SelftestConfig {
    fn default() -> Self {
        Self {
            producers: 4,
            events_per_producer: 10_000,
            slots: 1024,
            poll_timeout: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelftestReport {
    pub entry: EntryPoint,
    pub attempted: u64,
    pub emitted: u64,
    /// Refused because the ring was full.
    pub dropped: u64,
    pub delivered: u64,
    /// Delivered records not carrying this process's pid.
    pub foreign: u64,
    pub worst_producer_latency: Duration,
}

impl SelftestReport {
    /// Every emitted record was delivered and every attempt is accounted for.
    pub fn lossless(&self) -> bool {
        self.delivered == self.emitted
            && self.emitted + self.dropped == self.attempted
            && self.foreign == 0
    }
}

/// Raises the consumer's stop flag when dropped, so every way out of the
/// thread scope lets the consumer thread finish.
struct StopOnExit(Arc<AtomicBool>);

impl Drop for StopOnExit {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

pub fn run(config: &SelftestConfig) -> Result<SelftestReport> {
    let exec = EntryPoint::tracepoint("syscalls", "sys_enter_execve");
    let table = LocalEntryPoints::new(vec![exec.clone()]);
    let session = session::attach(
        LocalBackend::new(table.clone(), config.slots),
        std::slice::from_ref(&exec),
    )?;
    let stop = Arc::new(AtomicBool::new(false));
    let me = std::process::id();

    let (session, stats, mut foreign, worst) = thread::scope(|s| -> Result<_> {
        let consumer = thread::Builder::new()
            .name("selftest-consumer".into())
            .spawn_scoped(s, {
                let stop = stop.clone();
                let mut session = session;
                move || {
                    let mut foreign = 0u64;
                    let mut handler = |e: &ExecEvent| {
                        if e.pid != me {
                            foreign += 1;
                        }
                    };
                    let stats = ConsumerLoop::new(config.poll_timeout, stop)
                        .run(session.source_mut(), &mut handler);
                    (session, stats, foreign)
                }
            })
            .context("Failed to spawn consumer thread")?;
        let _stop_on_exit = StopOnExit(stop.clone());

        let producers = (0..config.producers)
            .map(|i| {
                thread::Builder::new()
                    .name(format!("exec-{i}"))
                    .spawn_scoped(s, || {
                        let mut worst = Duration::ZERO;
                        for _ in 0..config.events_per_producer {
                            let started = Instant::now();
                            table.fire(&exec, &CurrentTask);
                            worst = worst.max(started.elapsed());
                        }
                        worst
                    })
            })
            .collect::<std::io::Result<Vec<_>>>()
            .context("Failed to spawn producer thread")?;

        let mut worst = Duration::ZERO;
        for producer in producers {
            let latency = producer
                .join()
                .map_err(|_| anyhow!("producer thread panicked"))?;
            worst = worst.max(latency);
        }

        stop.store(true, Ordering::Relaxed);
        let (session, stats, foreign) = consumer
            .join()
            .map_err(|_| anyhow!("consumer thread panicked"))?;
        Ok((session, stats, foreign, worst))
    })?;
    let stats = stats?;

    let emitted = session.link().handler().emitted();
    let dropped = session.link().handler().dropped();
    let detached = session.detach(&mut |e: &ExecEvent| {
        if e.pid != me {
            foreign += 1;
        }
    })?;

    let report = SelftestReport {
        entry: detached.entry,
        attempted: config.producers as u64 * config.events_per_producer,
        emitted,
        dropped,
        delivered: stats.delivered + detached.drained as u64,
        foreign,
        worst_producer_latency: worst,
    };
    info!("selftest finished: {report:?}");
    Ok(report)
}
