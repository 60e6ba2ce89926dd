//! In-process registration surface: a table of named hooks that the host
//! fires itself. Used by `selftest` and by the tests.

use std::sync::{
    Arc, RwLock, TryLockError,
    atomic::{AtomicU64, Ordering},
};

use anyhow::{Context, bail};
use execmon_common::ExecEvent;
use log::debug;

use crate::{
    probes::{
        EntryPoint, ProbeBackend,
        handler::{ProbeHandler, ProbeOutcome, TaskInfo},
    },
    ring::{self, Consumer},
};

type Installed = Arc<[(EntryPoint, Arc<ProbeHandler>)]>;

/// Named hook points. Firing one runs every handler installed on it.
///
/// Install and uninstall swap in a new handler list; firing only clones the
/// current one, so handlers never run under the lock.
pub struct LocalEntryPoints {
    available: Vec<EntryPoint>,
    installed: RwLock<Installed>,
    missed: AtomicU64,
}

impl LocalEntryPoints {
    pub fn new(available: Vec<EntryPoint>) -> Arc<Self> {
        Arc::new(Self {
            available,
            installed: RwLock::new(Arc::from([])),
            missed: AtomicU64::new(0),
        })
    }

    pub fn resolves(&self, entry: &EntryPoint) -> bool {
        self.available.contains(entry)
    }

    /// Simulates `task` entering exec through `entry`. Returns `None` when
    /// nothing is installed there.
    ///
    /// Never waits: if an install or uninstall holds the table, the exec is
    /// missed, counted in [`missed`](Self::missed), and `None` is returned.
    pub fn fire(&self, entry: &EntryPoint, task: &dyn TaskInfo) -> Option<ProbeOutcome> {
        let installed = match self.installed.try_read() {
            Ok(guard) => Installed::clone(&guard),
            Err(TryLockError::Poisoned(poisoned)) => Installed::clone(&poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {
                self.missed.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        installed
            .iter()
            .filter(|(at, _)| at == entry)
            .map(|(_, handler)| handler.on_exec(task))
            .last()
    }

    pub fn installed_count(&self) -> usize {
        self.installed.read().map(|v| v.len()).unwrap_or(0)
    }

    /// Execs fired while the hook table was being changed.
    pub fn missed(&self) -> u64 {
        self.missed.load(Ordering::Relaxed)
    }

    fn update(&self, change: impl FnOnce(&mut Vec<(EntryPoint, Arc<ProbeHandler>)>)) {
        let mut installed = match self.installed.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = installed.to_vec();
        change(&mut next);
        *installed = next.into();
    }

    fn remove(&self, handler: &Arc<ProbeHandler>) {
        self.update(|installed| installed.retain(|(_, h)| !Arc::ptr_eq(h, handler)));
    }
}

/// Removes its handler from the table when dropped.
pub struct LocalLink {
    entry_points: Arc<LocalEntryPoints>,
    handler: Arc<ProbeHandler>,
}

impl LocalLink {
    pub fn handler(&self) -> &ProbeHandler {
        &self.handler
    }
}

impl Drop for LocalLink {
    fn drop(&mut self) {
        self.entry_points.remove(&self.handler);
    }
}

pub struct LocalBackend {
    entry_points: Arc<LocalEntryPoints>,
    slots: usize,
    producer: Option<ring::Producer>,
}

impl LocalBackend {
    pub fn new(entry_points: Arc<LocalEntryPoints>, slots: usize) -> Self {
        Self {
            entry_points,
            slots,
            producer: None,
        }
    }
}

impl ProbeBackend for LocalBackend {
    type Link = LocalLink;
    type Source = Consumer;

    fn open_channel(&mut self) -> anyhow::Result<Consumer> {
        let (producer, consumer) = ring::channel(self.slots, ExecEvent::SIZE)
            .with_context(|| format!("Failed to create a {}-slot ring", self.slots))?;
        self.producer = Some(producer);
        Ok(consumer)
    }

    fn resolve(&self, entry: &EntryPoint) -> bool {
        self.entry_points.resolves(entry)
    }

    fn install(&mut self, entry: &EntryPoint) -> anyhow::Result<LocalLink> {
        let Some(producer) = self.producer.clone() else {
            bail!("channel not open");
        };
        if !self.resolve(entry) {
            bail!("no hook named {entry}");
        }
        let handler = Arc::new(ProbeHandler::new(producer));
        self.entry_points
            .update(|installed| installed.push((entry.clone(), handler.clone())));
        debug!("installed local hook at {entry}");
        Ok(LocalLink {
            entry_points: self.entry_points.clone(),
            handler,
        })
    }

    fn uninstall(&mut self, link: LocalLink) -> anyhow::Result<()> {
        drop(link);
        Ok(())
    }

    fn close_channel(&mut self) {
        self.producer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::handler::CurrentTask;

    #[test]
    fn fire_reaches_installed_handler_until_link_dropped() {
        let exec = EntryPoint::kprobe("exec");
        let table = LocalEntryPoints::new(vec![exec.clone()]);
        let mut backend = LocalBackend::new(table.clone(), 4);
        let mut consumer = backend.open_channel().unwrap();

        assert_eq!(table.fire(&exec, &CurrentTask), None);

        let link = backend.install(&exec).unwrap();
        assert_eq!(table.fire(&exec, &CurrentTask), Some(ProbeOutcome::Emitted));
        assert_eq!(link.handler().emitted(), 1);

        backend.uninstall(link).unwrap();
        assert_eq!(table.installed_count(), 0);
        assert_eq!(table.fire(&exec, &CurrentTask), None);
        assert_eq!(consumer.ready().unwrap(), 1);
        assert!(consumer.next_ready().unwrap().is_some());
    }

    #[test]
    fn fire_does_not_wait_for_a_table_update() {
        let exec = EntryPoint::kprobe("exec");
        let table = LocalEntryPoints::new(vec![exec.clone()]);
        let mut backend = LocalBackend::new(table.clone(), 4);
        let consumer = backend.open_channel().unwrap();
        let _link = backend.install(&exec).unwrap();

        let updating = table.installed.write().unwrap();
        let started = std::time::Instant::now();
        assert_eq!(table.fire(&exec, &CurrentTask), None);
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        drop(updating);

        assert_eq!(table.missed(), 1);
        assert_eq!(table.fire(&exec, &CurrentTask), Some(ProbeOutcome::Emitted));
        assert_eq!(consumer.ready().unwrap(), 1);
    }

    #[test]
    fn unknown_hook_does_not_install() {
        let table = LocalEntryPoints::new(vec![]);
        let mut backend = LocalBackend::new(table, 4);
        backend.open_channel().unwrap();
        assert!(backend.install(&EntryPoint::kprobe("missing")).is_err());
    }
}
