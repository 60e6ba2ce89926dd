use log::{debug, info, warn};

use crate::{
    consumer::{EventHandler, EventSource, drain_into},
    error::{AttachError, BoxError, DetachError},
    probes::{EntryPoint, ProbeBackend},
    telemetry,
};

/// An installed probe plus its channel.
///
/// Field order is teardown order: when a session is dropped without
/// [`Session::detach`] the probe goes first, then the channel.
pub struct Session<B: ProbeBackend> {
    link: B::Link,
    source: B::Source,
    backend: B,
    entry: EntryPoint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachReport {
    pub entry: EntryPoint,
    /// Records delivered by the final drain.
    pub drained: usize,
    pub dropped: Option<u64>,
}

/// Creates the channel, then installs the probe on the first candidate that
/// resolves and accepts it.
///
/// Unresolved candidates are skipped. A candidate that resolves but fails
/// to install is logged and the next one is tried. If nothing could be
/// installed the channel is torn down before returning.
pub fn attach<B: ProbeBackend>(
    mut backend: B,
    candidates: &[EntryPoint],
) -> Result<Session<B>, AttachError> {
    let source = backend
        .open_channel()
        .map_err(|e| AttachError::Channel(e.into()))?;

    let mut last_failure: Option<(EntryPoint, BoxError)> = None;
    for entry in candidates {
        if !backend.resolve(entry) {
            debug!("{entry} not present, skipping");
            continue;
        }
        match backend.install(entry) {
            Ok(link) => {
                info!("exec probe installed at {entry}");
                telemetry::record_active_probe(&entry.to_string(), 1);
                return Ok(Session {
                    link,
                    source,
                    backend,
                    entry: entry.clone(),
                });
            }
            Err(e) => {
                warn!("failed to install exec probe at {entry}: {e:#}");
                last_failure = Some((entry.clone(), e.into()));
            }
        }
    }

    drop(source);
    backend.close_channel();

    Err(match last_failure {
        Some((entry, source)) => AttachError::ProbeInstall { entry, source },
        None => AttachError::NoSuitableEntryPoint {
            tried: candidates.to_vec(),
        },
    })
}

impl<B: ProbeBackend> Session<B> {
    pub fn entry_point(&self) -> &EntryPoint {
        &self.entry
    }

    pub fn source_mut(&mut self) -> &mut B::Source {
        &mut self.source
    }

    pub fn link(&self) -> &B::Link {
        &self.link
    }

    pub fn dropped_events(&self) -> Option<u64> {
        self.source.dropped_events()
    }

    /// Uninstalls the probe, hands every record still in the channel to
    /// `handler`, then destroys the channel.
    ///
    /// Once the probe is gone nothing can be committed any more, so the
    /// final drain leaves the channel empty.
    pub fn detach<H>(self, handler: &mut H) -> Result<DetachReport, DetachError>
    where
        H: EventHandler + ?Sized,
    {
        let Self {
            link,
            mut source,
            mut backend,
            entry,
        } = self;

        let uninstalled = backend.uninstall(link);
        telemetry::record_active_probe(&entry.to_string(), 0);
        if let Err(e) = uninstalled {
            drop(source);
            backend.close_channel();
            return Err(DetachError::Uninstall {
                entry,
                source: e.into(),
            });
        }

        let drained = drain_into(&mut source, handler, usize::MAX);
        let dropped = source.dropped_events();
        drop(source);
        backend.close_channel();

        let drained = drained?;
        info!("exec probe detached from {entry}, {drained} records in final drain");
        Ok(DetachReport {
            entry,
            drained,
            dropped,
        })
    }
}
