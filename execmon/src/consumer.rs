use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use execmon_common::ExecEvent;
use log::{debug, warn};

use crate::{error::PollError, telemetry};

/// Default bound on records handled per drain pass before the shutdown flag
/// is looked at again.
pub const DEFAULT_MAX_BATCH: usize = 1024;

/// Consumer side of an event channel.
pub trait EventSource {
    /// Waits up to `timeout` for records. `Ok(0)` is a plain timeout.
    fn poll(&mut self, timeout: Duration) -> Result<usize, PollError>;

    /// Hands up to `limit` ready records to `sink`, oldest first, consuming
    /// each one after `sink` returns. Never waits.
    fn drain(
        &mut self,
        limit: usize,
        sink: &mut dyn FnMut(&[u8]) -> Result<(), PollError>,
    ) -> Result<usize, PollError>;

    /// Records the producers had to drop so far, when the channel counts them.
    fn dropped_events(&self) -> Option<u64> {
        None
    }
}

pub trait EventHandler {
    fn handle(&mut self, event: &ExecEvent);
}

impl<F: FnMut(&ExecEvent)> EventHandler for F {
    fn handle(&mut self, event: &ExecEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Polling,
    Draining,
    Stopped,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub polls: u64,
    pub delivered: u64,
    pub interrupted: u64,
    /// Last value read from the channel's drop counter.
    pub dropped: u64,
}

/// Decodes up to `limit` records from `source` into `handler`.
///
/// A record shorter than [`ExecEvent::SIZE`] means the two sides disagree on
/// the wire format and is reported as corruption.
pub fn drain_into<S, H>(source: &mut S, handler: &mut H, limit: usize) -> Result<usize, PollError>
where
    S: EventSource + ?Sized,
    H: EventHandler + ?Sized,
{
    source.drain(limit, &mut |bytes| {
        let event = ExecEvent::from_bytes(bytes).ok_or_else(|| {
            PollError::Corrupted(format!(
                "{}-byte record, expected {}",
                bytes.len(),
                ExecEvent::SIZE
            ))
        })?;
        handler.handle(&event);
        Ok(())
    })
}

pub struct ConsumerLoop {
    poll_timeout: Duration,
    max_batch: usize,
    drop_report_interval: Option<Duration>,
    shutdown: Arc<AtomicBool>,
    state: LoopState,
    stats: LoopStats,
}

impl ConsumerLoop {
    pub fn new(poll_timeout: Duration, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            poll_timeout,
            max_batch: DEFAULT_MAX_BATCH,
            drop_report_interval: None,
            shutdown,
            state: LoopState::Idle,
            stats: LoopStats::default(),
        }
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    pub fn with_drop_report_interval(mut self, interval: Option<Duration>) -> Self {
        self.drop_report_interval = interval;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Runs until the shutdown flag is set or the channel fails.
    ///
    /// The flag is checked once per iteration, so the worst-case stop
    /// latency is one poll timeout plus one batch. Records still in the
    /// channel when the flag is seen are drained before returning.
    pub fn run<S, H>(&mut self, source: &mut S, handler: &mut H) -> Result<LoopStats, PollError>
    where
        S: EventSource + ?Sized,
        H: EventHandler + ?Sized,
    {
        let mut last_report = Instant::now();

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                self.state = LoopState::Stopped;
                let drained = drain_into(source, handler, usize::MAX)?;
                self.stats.delivered += drained as u64;
                debug!("consumer stopping, {drained} records in final drain");
                self.report_drops(source);
                return Ok(self.stats);
            }

            self.state = LoopState::Polling;
            self.stats.polls += 1;
            match source.poll(self.poll_timeout) {
                Ok(0) => self.state = LoopState::Idle,
                Ok(_) => {
                    self.state = LoopState::Draining;
                    let drained = drain_into(source, handler, self.max_batch).inspect_err(|_| {
                        self.state = LoopState::Stopped;
                    })?;
                    self.stats.delivered += drained as u64;
                }
                Err(e) if e.is_transient() => {
                    self.stats.interrupted += 1;
                    debug!("poll interrupted, retrying");
                }
                Err(e) => {
                    self.state = LoopState::Stopped;
                    return Err(e);
                }
            }

            if let Some(interval) = self.drop_report_interval {
                if last_report.elapsed() >= interval {
                    self.report_drops(source);
                    last_report = Instant::now();
                }
            }
        }
    }

    fn report_drops<S: EventSource + ?Sized>(&mut self, source: &S) {
        let Some(total) = source.dropped_events() else {
            return;
        };
        if total > self.stats.dropped {
            let new = total - self.stats.dropped;
            warn!("ring full: dropped {new} exec events ({total} total)");
            telemetry::record_dropped_events(new);
            self.stats.dropped = total;
        }
    }
}
