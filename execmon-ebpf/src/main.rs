#![no_std]
#![no_main]

use aya_ebpf::{
    EbpfContext,
    helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid},
    macros::{kprobe, map, tracepoint},
    maps::{PerCpuArray, RingBuf},
    programs::{ProbeContext, TracePointContext},
};
use aya_log_ebpf::debug;
use execmon_common::{EVENTS_RING_BYTES, ExecEvent, TASK_COMM_LEN};

#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(EVENTS_RING_BYTES, 0);

#[map]
static DROPS: PerCpuArray<u64> = PerCpuArray::with_max_entries(1, 0);

/// syscalls/sys_enter_execve: preferred entry point.
#[tracepoint]
pub fn execmon_enter_execve(ctx: TracePointContext) -> u32 {
    record_exec(&ctx)
}

/// Fallback for kernels without the syscall tracepoints; attached to the
/// first exec symbol that resolves.
#[kprobe]
pub fn execmon_kprobe_exec(ctx: ProbeContext) -> u32 {
    record_exec(&ctx)
}

// Always returns 0: the traced call proceeds whatever happens here.
#[inline(always)]
fn record_exec<C: EbpfContext>(ctx: &C) -> u32 {
    let pid_tgid = bpf_get_current_pid_tgid();
    // Entry fires before the image switch, so this is the caller's name.
    let comm = bpf_get_current_comm().unwrap_or([0u8; TASK_COMM_LEN]);
    let event = ExecEvent::from_pid_tgid(pid_tgid, comm);

    match EVENTS.reserve::<ExecEvent>(0) {
        Some(mut slot) => {
            slot.write(event);
            slot.submit(0);
        }
        None => {
            count_drop();
            debug!(ctx, "ring full, dropped exec event for pid {}", event.pid);
        }
    }
    0
}

#[inline(always)]
fn count_drop() {
    if let Some(counter) = DROPS.get_ptr_mut(0) {
        // Per-CPU slot, so no other program instance touches it concurrently.
        unsafe { *counter += 1 };
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
