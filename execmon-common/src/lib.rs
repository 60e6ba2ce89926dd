#![no_std]

use core::mem::size_of;

/// Length of the kernel's `task_struct::comm`, including room for the NUL.
pub const TASK_COMM_LEN: usize = 16;

/// Default byte size of the kernel ring buffer map (must be a power of two
/// and a multiple of the page size).
pub const EVENTS_RING_BYTES: u32 = 256 * 1024;

/// Name of the ring buffer map carrying [`ExecEvent`] records.
pub const EVENTS_MAP: &str = "EVENTS";

/// Name of the per-CPU array counting records dropped because the ring was full.
pub const DROPS_MAP: &str = "DROPS";

/// Program attached when the entry point is a tracepoint.
pub const TRACEPOINT_PROGRAM: &str = "execmon_enter_execve";

/// Program attached when the entry point is a kernel symbol.
pub const KPROBE_PROGRAM: &str = "execmon_kprobe_exec";

/// One process-creation event, exactly as written into the ring.
///
/// Layout is fixed: `pid` at 0, `ppid` at 4, `comm` at 8, 24 bytes total,
/// native byte order, no padding.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecEvent {
    pub pid: u32,
    /// Best-effort hint only: the low half of the kernel pid/tgid pair,
    /// i.e. the calling thread id, not the parent process id.
    pub ppid: u32,
    pub comm: [u8; TASK_COMM_LEN],
}

const _: () = assert!(size_of::<ExecEvent>() == 24);

impl ExecEvent {
    pub const SIZE: usize = size_of::<Self>();

    /// Builds a record from a name, truncating it to [`TASK_COMM_LEN`] bytes.
    pub fn new(pid: u32, ppid: u32, name: &[u8]) -> Self {
        let mut comm = [0u8; TASK_COMM_LEN];
        let len = name.len().min(TASK_COMM_LEN);
        comm[..len].copy_from_slice(&name[..len]);
        Self { pid, ppid, comm }
    }

    /// Splits a `bpf_get_current_pid_tgid()` style value the way the probe does.
    pub const fn from_pid_tgid(pid_tgid: u64, comm: [u8; TASK_COMM_LEN]) -> Self {
        Self {
            pid: (pid_tgid >> 32) as u32,
            ppid: pid_tgid as u32,
            comm,
        }
    }

    /// Command name up to the first NUL, or all 16 bytes if there is none.
    pub fn comm_bytes(&self) -> &[u8] {
        let end = self
            .comm
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(TASK_COMM_LEN);
        &self.comm[..end]
    }

    /// Writes the wire representation into `out`, which must hold at least
    /// [`Self::SIZE`] bytes. Returns `false` without writing otherwise.
    pub fn write_to(&self, out: &mut [u8]) -> bool {
        if out.len() < Self::SIZE {
            return false;
        }
        out[0..4].copy_from_slice(&self.pid.to_ne_bytes());
        out[4..8].copy_from_slice(&self.ppid.to_ne_bytes());
        out[8..Self::SIZE].copy_from_slice(&self.comm);
        true
    }

    /// Decodes a record from the front of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let mut pid = [0u8; 4];
        let mut ppid = [0u8; 4];
        let mut comm = [0u8; TASK_COMM_LEN];
        pid.copy_from_slice(&bytes[0..4]);
        ppid.copy_from_slice(&bytes[4..8]);
        comm.copy_from_slice(&bytes[8..Self::SIZE]);
        Some(Self {
            pid: u32::from_ne_bytes(pid),
            ppid: u32::from_ne_bytes(ppid),
            comm,
        })
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for ExecEvent {}
