pub mod consumer;
pub mod error;
pub mod output;
pub mod probes;
pub mod ring;
pub mod selftest;
pub mod session;
pub mod settings;
pub mod telemetry;

use anyhow::{Context, Result, anyhow};
use log::{error, info, warn};
use tokio::signal::unix::{SignalKind, signal};

use crate::{
    consumer::ConsumerLoop,
    error::AttachError,
    probes::{kernel::KernelBackend, request_shutdown, shutdown_flag},
    settings::Settings,
};

pub struct ExecMonitor {
    pub settings: Settings,
}

impl ExecMonitor {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Attaches the kernel probe and reports exec events until SIGINT or
    /// SIGTERM, then drains and detaches.
    pub async fn run(self, bytecode: &[u8]) -> Result<()> {
        let candidates = self.settings.entry_points()?;
        let backend = KernelBackend::load(bytecode, self.settings.ring_byte_size()?)
            .map_err(|e| AttachError::Load(e.into()))?;
        let mut session = session::attach(backend, &candidates)?;

        let mut handler = output::handler_for(&self.settings.output);
        let mut consumer = ConsumerLoop::new(self.settings.poll_timeout(), shutdown_flag())
            .with_max_batch(self.settings.max_batch())
            .with_drop_report_interval(self.settings.drop_report_interval());

        let mut worker = tokio::task::spawn_blocking(move || {
            let stats = consumer.run(session.source_mut(), handler.as_mut());
            let report = session.detach(handler.as_mut());
            (stats, report)
        });

        info!("Monitoring active. Press Ctrl-C to exit.");
        let mut sigterm = signal(SignalKind::terminate())?;
        let finished = tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                None
            }
            _ = sigterm.recv() => None,
            res = &mut worker => Some(res),
        };

        let (stats, report) = match finished {
            Some(res) => res,
            None => {
                info!("Exiting...");
                request_shutdown();
                worker.await
            }
        }
        .map_err(|e| anyhow!("consumer task failed: {e}"))?;

        let stats = stats.context("Consumer loop failed")?;
        match report {
            Ok(report) => info!(
                "Detached from {}: {} events delivered, {} in final drain, {} dropped",
                report.entry,
                stats.delivered,
                report.drained,
                report.dropped.unwrap_or(stats.dropped)
            ),
            Err(e) => {
                error!("Detach failed: {e}");
                return Err(e.into());
            }
        }
        Ok(())
    }
}

/// Resolves every candidate entry point against the running kernel.
pub fn probe_entry_points(settings: &Settings) -> Result<Vec<(probes::EntryPoint, bool)>> {
    let candidates = settings.entry_points()?;
    if candidates.is_empty() {
        warn!("No entry points configured");
    }
    Ok(candidates
        .into_iter()
        .map(|entry| {
            let present = probes::kernel::entry_point_resolves(&entry);
            (entry, present)
        })
        .collect())
}
