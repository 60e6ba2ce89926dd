//! In-process exec probe: builds the record for the calling task and pushes
//! it into the ring.

use std::sync::atomic::{AtomicU64, Ordering};

use execmon_common::{ExecEvent, TASK_COMM_LEN};

use crate::ring::Producer;

/// What the probe can learn about the task entering exec.
pub trait TaskInfo {
    /// Process id in the high half, thread id in the low half.
    fn pid_tgid(&self) -> u64;
    fn comm(&self) -> [u8; TASK_COMM_LEN];
}

/// The calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentTask;

impl TaskInfo for CurrentTask {
    fn pid_tgid(&self) -> u64 {
        let tgid = unsafe { libc::getpid() } as u32;
        let tid = unsafe { libc::gettid() } as u32;
        (u64::from(tgid) << 32) | u64::from(tid)
    }

    fn comm(&self) -> [u8; TASK_COMM_LEN] {
        let mut comm = [0u8; TASK_COMM_LEN];
        // PR_GET_NAME writes at most 16 bytes including the NUL.
        let ret = unsafe { libc::prctl(libc::PR_GET_NAME, comm.as_mut_ptr(), 0, 0, 0) };
        if ret != 0 {
            comm = [0u8; TASK_COMM_LEN];
        }
        comm
    }
}

/// A synthetic task, for tests and load generation.
#[derive(Debug, Clone, Copy)]
pub struct FixedTask {
    pub pid_tgid: u64,
    pub comm: [u8; TASK_COMM_LEN],
}

impl TaskInfo for FixedTask {
    fn pid_tgid(&self) -> u64 {
        self.pid_tgid
    }

    fn comm(&self) -> [u8; TASK_COMM_LEN] {
        self.comm
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Emitted,
    Dropped,
}

pub struct ProbeHandler {
    producer: Producer,
    emitted: AtomicU64,
    dropped: AtomicU64,
}

impl ProbeHandler {
    pub fn new(producer: Producer) -> Self {
        Self {
            producer,
            emitted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Runs on every exec entry, in the caller's context. Never blocks and
    /// never allocates; a full ring drops the record.
    pub fn on_exec<T: TaskInfo + ?Sized>(&self, task: &T) -> ProbeOutcome {
        let event = ExecEvent::from_pid_tgid(task.pid_tgid(), task.comm());
        match self.producer.output(&event) {
            Ok(()) => {
                self.emitted.fetch_add(1, Ordering::Relaxed);
                ProbeOutcome::Emitted
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                ProbeOutcome::Dropped
            }
        }
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
