use std::{
    fmt,
    path::Path,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use thiserror::Error;

use crate::consumer::EventSource;

pub mod handler;
pub mod kernel;
pub mod local;

static SHUTDOWN: once_cell::sync::Lazy<Arc<AtomicBool>> =
    once_cell::sync::Lazy::new(|| Arc::new(AtomicBool::new(false)));

pub fn shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN.clone()
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

/// Process-creation entry points tried in order when none are configured.
pub const DEFAULT_ENTRY_POINTS: [&str; 4] = [
    "tracepoint:syscalls/sys_enter_execve",
    "kprobe:__x64_sys_execve",
    "kprobe:__x64_sys_execveat",
    "kprobe:do_execveat_common",
];

pub fn default_entry_points() -> Vec<EntryPoint> {
    DEFAULT_ENTRY_POINTS
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect()
}

/// A named place a probe can be installed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryPoint {
    Tracepoint { category: String, name: String },
    Kprobe { symbol: String },
}

impl EntryPoint {
    pub fn tracepoint(category: &str, name: &str) -> Self {
        Self::Tracepoint {
            category: category.to_owned(),
            name: name.to_owned(),
        }
    }

    pub fn kprobe(symbol: &str) -> Self {
        Self::Kprobe {
            symbol: symbol.to_owned(),
        }
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tracepoint { category, name } => write!(f, "tracepoint:{category}/{name}"),
            Self::Kprobe { symbol } => write!(f, "kprobe:{symbol}"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid entry point {input:?}: {reason}")]
pub struct ParseEntryPointError {
    input: String,
    reason: &'static str,
}

impl FromStr for EntryPoint {
    type Err = ParseEntryPointError;

    /// Accepts `tracepoint:<category>/<name>`, `kprobe:<symbol>` or a bare
    /// symbol, which is taken as a kprobe.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = |reason| ParseEntryPointError {
            input: s.to_owned(),
            reason,
        };

        let (kind, target) = s.split_once(':').unwrap_or(("kprobe", s));
        match kind {
            "tracepoint" => {
                let (category, name) = target
                    .split_once('/')
                    .ok_or_else(|| invalid("expected <category>/<name>"))?;
                if category.is_empty() || name.is_empty() || name.contains('/') {
                    return Err(invalid("expected <category>/<name>"));
                }
                Ok(Self::tracepoint(category, name))
            }
            "kprobe" => {
                if target.is_empty() || target.contains(char::is_whitespace) {
                    return Err(invalid("expected a kernel symbol"));
                }
                Ok(Self::kprobe(target))
            }
            _ => Err(invalid("kind must be tracepoint or kprobe")),
        }
    }
}

/// A registration surface able to carry the exec probe and its channel.
///
/// `attach` in [`crate::session`] drives it: open the channel, then try
/// entry points in order. Links returned by `install` must uninstall
/// themselves when dropped.
pub trait ProbeBackend {
    type Link;
    type Source: EventSource;

    fn open_channel(&mut self) -> anyhow::Result<Self::Source>;

    /// Whether `entry` exists on this system. Cheap, no side effects.
    fn resolve(&self, entry: &EntryPoint) -> bool;

    fn install(&mut self, entry: &EntryPoint) -> anyhow::Result<Self::Link>;

    fn uninstall(&mut self, link: Self::Link) -> anyhow::Result<()>;

    /// Called after the source has been dropped.
    fn close_channel(&mut self) {}
}

pub(crate) fn tracepoint_exists(category: &str, name: &str) -> bool {
    const TRACEFS_MOUNT_POINTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

    TRACEFS_MOUNT_POINTS.iter().any(|base| {
        Path::new(base)
            .join("events")
            .join(category)
            .join(name)
            .exists()
    })
}
