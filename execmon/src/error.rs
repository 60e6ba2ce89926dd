use thiserror::Error;

use crate::probes::EntryPoint;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Startup failures. All of them are fatal.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("failed to load probe programs")]
    Load(#[source] BoxError),

    #[error("failed to create event channel")]
    Channel(#[source] BoxError),

    #[error("no suitable process-creation entry point (tried: {})", list(.tried))]
    NoSuitableEntryPoint { tried: Vec<EntryPoint> },

    #[error("failed to install probe at {entry}")]
    ProbeInstall {
        entry: EntryPoint,
        #[source]
        source: BoxError,
    },
}

#[derive(Debug, Error)]
pub enum DetachError {
    #[error("failed to uninstall probe at {entry}")]
    Uninstall {
        entry: EntryPoint,
        #[source]
        source: BoxError,
    },

    #[error("final drain failed")]
    Drain(#[from] PollError),
}

/// Consumer-side failures.
#[derive(Debug, Error)]
pub enum PollError {
    /// The wait was interrupted by a signal. Retried by the consumer loop.
    #[error("wait for ring data was interrupted")]
    Interrupted,

    #[error("event channel corrupted: {0}")]
    Corrupted(String),

    #[error("event channel unreadable")]
    Io(#[from] std::io::Error),
}

impl PollError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

fn list(entries: &[EntryPoint]) -> String {
    entries
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
