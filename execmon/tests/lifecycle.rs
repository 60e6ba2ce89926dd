use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use execmon::{
    consumer::EventSource,
    error::{AttachError, PollError},
    probes::{EntryPoint, ProbeBackend},
    ring::{self, Producer},
    session::attach,
};
use execmon_common::ExecEvent;

type Journal = Arc<Mutex<Vec<String>>>;

fn note(journal: &Journal, what: impl Into<String>) {
    journal.lock().unwrap().push(what.into());
}

/// Registration surface with scripted outcomes that journals every call.
#[derive(Default)]
struct ScriptedBackend {
    resolvable: Vec<EntryPoint>,
    refuses: Vec<EntryPoint>,
    channel_fails: bool,
    journal: Journal,
    producer: Arc<Mutex<Option<Producer>>>,
}

struct ScriptedLink {
    entry: EntryPoint,
    journal: Journal,
}

impl Drop for ScriptedLink {
    fn drop(&mut self) {
        note(&self.journal, format!("link dropped {}", self.entry));
    }
}

struct ScriptedSource {
    inner: ring::Consumer,
    journal: Journal,
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        note(&self.journal, "channel dropped");
    }
}

impl EventSource for ScriptedSource {
    fn poll(&mut self, timeout: Duration) -> Result<usize, PollError> {
        self.inner.poll(timeout)
    }

    fn drain(
        &mut self,
        limit: usize,
        sink: &mut dyn FnMut(&[u8]) -> Result<(), PollError>,
    ) -> Result<usize, PollError> {
        let n = EventSource::drain(&mut self.inner, limit, sink)?;
        note(&self.journal, format!("drained {n}"));
        Ok(n)
    }

    fn dropped_events(&self) -> Option<u64> {
        self.inner.dropped_events()
    }
}

impl ProbeBackend for ScriptedBackend {
    type Link = ScriptedLink;
    type Source = ScriptedSource;

    fn open_channel(&mut self) -> anyhow::Result<ScriptedSource> {
        if self.channel_fails {
            bail!("out of memory");
        }
        let (producer, consumer) = ring::channel(4, ExecEvent::SIZE)?;
        *self.producer.lock().unwrap() = Some(producer);
        note(&self.journal, "channel opened");
        Ok(ScriptedSource {
            inner: consumer,
            journal: self.journal.clone(),
        })
    }

    fn resolve(&self, entry: &EntryPoint) -> bool {
        note(&self.journal, format!("resolve {entry}"));
        self.resolvable.contains(entry)
    }

    fn install(&mut self, entry: &EntryPoint) -> anyhow::Result<ScriptedLink> {
        note(&self.journal, format!("install {entry}"));
        if self.refuses.contains(entry) {
            bail!("permission denied");
        }
        Ok(ScriptedLink {
            entry: entry.clone(),
            journal: self.journal.clone(),
        })
    }

    fn uninstall(&mut self, link: ScriptedLink) -> anyhow::Result<()> {
        note(&self.journal, format!("uninstall {}", link.entry));
        Ok(())
    }

    fn close_channel(&mut self) {
        self.producer.lock().unwrap().take();
        note(&self.journal, "channel closed");
    }
}

fn entries(list: &[&str]) -> Vec<EntryPoint> {
    list.iter().map(|s| s.parse().unwrap()).collect()
}

fn journal_of(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

#[test]
fn first_installable_candidate_wins() {
    let candidates = entries(&[
        "tracepoint:syscalls/sys_enter_execve",
        "kprobe:__x64_sys_execve",
        "kprobe:__x64_sys_execveat",
        "kprobe:do_execveat_common",
    ]);
    let backend = ScriptedBackend {
        resolvable: candidates[1..].to_vec(),
        refuses: vec![candidates[1].clone()],
        ..Default::default()
    };
    let journal = backend.journal.clone();

    let session = attach(backend, &candidates).unwrap();
    assert_eq!(session.entry_point(), &candidates[2]);

    let calls = journal_of(&journal);
    assert_eq!(
        calls,
        vec![
            "channel opened",
            "resolve tracepoint:syscalls/sys_enter_execve",
            "resolve kprobe:__x64_sys_execve",
            "install kprobe:__x64_sys_execve",
            "resolve kprobe:__x64_sys_execveat",
            "install kprobe:__x64_sys_execveat",
        ]
    );
}

#[test]
fn nothing_resolves() {
    let candidates = entries(&["kprobe:a", "kprobe:b"]);
    let backend = ScriptedBackend::default();
    let journal = backend.journal.clone();

    let err = attach(backend, &candidates).err().unwrap();
    match err {
        AttachError::NoSuitableEntryPoint { tried } => assert_eq!(tried, candidates),
        other => panic!("unexpected error: {other}"),
    }

    let calls = journal_of(&journal);
    assert!(!calls.iter().any(|c| c.starts_with("install")));
    assert_eq!(calls[calls.len() - 2..], ["channel dropped", "channel closed"]);
}

#[test]
fn every_install_fails() {
    let candidates = entries(&["kprobe:a", "kprobe:b"]);
    let backend = ScriptedBackend {
        resolvable: candidates.clone(),
        refuses: candidates.clone(),
        ..Default::default()
    };
    let journal = backend.journal.clone();

    match attach(backend, &candidates).err().unwrap() {
        AttachError::ProbeInstall { entry, .. } => assert_eq!(entry, candidates[1]),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(journal_of(&journal).last().unwrap(), "channel closed");
}

#[test]
fn channel_failure_installs_nothing() {
    let backend = ScriptedBackend {
        channel_fails: true,
        resolvable: entries(&["kprobe:a"]),
        ..Default::default()
    };
    let journal = backend.journal.clone();

    let err = attach(backend, &entries(&["kprobe:a"])).err().unwrap();
    assert!(matches!(err, AttachError::Channel(_)));
    assert!(journal_of(&journal).is_empty());
}

#[test]
fn detach_uninstalls_then_drains_then_closes() {
    let candidates = entries(&["kprobe:a"]);
    let backend = ScriptedBackend {
        resolvable: candidates.clone(),
        ..Default::default()
    };
    let journal = backend.journal.clone();
    let producer = backend.producer.clone();

    let session = attach(backend, &candidates).unwrap();
    {
        let guard = producer.lock().unwrap();
        let producer = guard.as_ref().unwrap();
        for pid in [1, 2, 3] {
            producer.output(&ExecEvent::new(pid, pid, b"sh")).unwrap();
        }
    }
    journal.lock().unwrap().clear();

    let mut seen = Vec::new();
    let report = session.detach(&mut |e: &ExecEvent| seen.push(e.pid)).unwrap();

    assert_eq!(report.drained, 3);
    assert_eq!(report.dropped, Some(0));
    assert_eq!(seen, vec![1, 2, 3]);
    assert_eq!(
        journal_of(&journal),
        vec![
            "uninstall kprobe:a",
            "link dropped kprobe:a",
            "drained 3",
            "channel dropped",
            "channel closed",
        ]
    );
}

#[test]
fn dropping_a_session_removes_the_probe_first() {
    let candidates = entries(&["kprobe:a"]);
    let backend = ScriptedBackend {
        resolvable: candidates.clone(),
        ..Default::default()
    };
    let journal = backend.journal.clone();

    let session = attach(backend, &candidates).unwrap();
    journal.lock().unwrap().clear();
    drop(session);

    assert_eq!(
        journal_of(&journal),
        vec!["link dropped kprobe:a", "channel dropped"]
    );
}
