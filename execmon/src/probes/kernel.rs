//! eBPF registration surface: the programs in `execmon-ebpf`, attached with
//! aya to a syscall tracepoint or a kernel symbol.

use std::{
    collections::HashSet,
    fs, io,
    os::fd::AsRawFd,
    time::Duration,
};

use anyhow::{Context, Result};
use aya::{
    Ebpf, EbpfLoader,
    maps::{MapData, PerCpuArray, RingBuf},
    programs::{
        KProbe, TracePoint,
        kprobe::KProbeLink,
        links::Link,
        trace_point::TracePointLink,
    },
};
use aya_log::EbpfLogger;
use execmon_common::{DROPS_MAP, EVENTS_MAP, KPROBE_PROGRAM, TRACEPOINT_PROGRAM};
use log::{debug, info, warn};

use crate::{
    consumer::EventSource,
    error::PollError,
    probes::{EntryPoint, ProbeBackend, tracepoint_exists},
};

const KALLSYMS: &str = "/proc/kallsyms";

pub struct KernelBackend {
    bpf: Ebpf,
    loaded: HashSet<&'static str>,
}

impl KernelBackend {
    /// Loads the object with the event ring sized to `ring_bytes`.
    pub fn load(bytecode: &[u8], ring_bytes: u32) -> Result<Self> {
        bump_memlock_rlimit()?;
        let mut bpf = EbpfLoader::new()
            .set_max_entries(EVENTS_MAP, ring_bytes)
            .load(bytecode)
            .context("Failed to load eBPF object")?;
        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("Failed to initialize eBPF logger: {}", e);
        }
        Ok(Self {
            bpf,
            loaded: HashSet::new(),
        })
    }

    fn load_program(&mut self, name: &'static str) -> Result<()> {
        if self.loaded.contains(name) {
            return Ok(());
        }
        info!("Loading program {}", name);
        match self.bpf.program_mut(name) {
            Some(aya::programs::Program::TracePoint(p)) => p.load()?,
            Some(aya::programs::Program::KProbe(p)) => p.load()?,
            Some(_) => anyhow::bail!("{name} has an unexpected program type"),
            None => anyhow::bail!("Failed to find {name} program"),
        }
        self.loaded.insert(name);
        Ok(())
    }
}

pub enum KernelLink {
    Tracepoint(TracePointLink),
    Kprobe(KProbeLink),
}

impl ProbeBackend for KernelBackend {
    type Link = KernelLink;
    type Source = KernelRing;

    fn open_channel(&mut self) -> Result<KernelRing> {
        let ring = RingBuf::try_from(
            self.bpf
                .take_map(EVENTS_MAP)
                .context("Failed to get EVENTS map")?,
        )?;
        let drops = match self.bpf.take_map(DROPS_MAP) {
            Some(map) => Some(PerCpuArray::try_from(map)?),
            None => {
                warn!("{DROPS_MAP} map missing; kernel-side drops will not be reported");
                None
            }
        };
        Ok(KernelRing { ring, drops })
    }

    fn resolve(&self, entry: &EntryPoint) -> bool {
        entry_point_resolves(entry)
    }

    fn install(&mut self, entry: &EntryPoint) -> Result<KernelLink> {
        match entry {
            EntryPoint::Tracepoint { category, name } => {
                self.load_program(TRACEPOINT_PROGRAM)?;
                let program: &mut TracePoint = self
                    .bpf
                    .program_mut(TRACEPOINT_PROGRAM)
                    .context("Failed to find tracepoint program")?
                    .try_into()?;
                let id = program
                    .attach(category, name)
                    .with_context(|| format!("Failed to attach {category}:{name}"))?;
                Ok(KernelLink::Tracepoint(program.take_link(id)?))
            }
            EntryPoint::Kprobe { symbol } => {
                self.load_program(KPROBE_PROGRAM)?;
                let program: &mut KProbe = self
                    .bpf
                    .program_mut(KPROBE_PROGRAM)
                    .context("Failed to find kprobe program")?
                    .try_into()
                    .context("Program is not a KProbe")?;
                let id = program
                    .attach(symbol, 0)
                    .with_context(|| format!("Failed to attach kprobe to {symbol}"))?;
                Ok(KernelLink::Kprobe(program.take_link(id)?))
            }
        }
    }

    fn uninstall(&mut self, link: KernelLink) -> Result<()> {
        match link {
            KernelLink::Tracepoint(link) => link.detach()?,
            KernelLink::Kprobe(link) => link.detach()?,
        }
        Ok(())
    }
}

/// Whether `entry` exists on the running kernel.
///
/// Kernel symbols are looked up in `/proc/kallsyms`; when that file is
/// unreadable the symbol is assumed present and the attach decides.
pub fn entry_point_resolves(entry: &EntryPoint) -> bool {
    match entry {
        EntryPoint::Tracepoint { category, name } => tracepoint_exists(category, name),
        EntryPoint::Kprobe { symbol } => match fs::read_to_string(KALLSYMS) {
            Ok(table) => kallsyms_contains(&table, symbol),
            Err(e) => {
                debug!("{KALLSYMS} unreadable ({e}); assuming {symbol} exists");
                true
            }
        },
    }
}

fn kallsyms_contains(table: &str, symbol: &str) -> bool {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(2))
        .any(|name| name == symbol)
}

/// Userspace end of the kernel ring buffer map.
pub struct KernelRing {
    ring: RingBuf<MapData>,
    drops: Option<PerCpuArray<MapData, u64>>,
}

impl EventSource for KernelRing {
    fn poll(&mut self, timeout: Duration) -> Result<usize, PollError> {
        let mut fds = [libc::pollfd {
            fd: self.ring.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EINTR) => PollError::Interrupted,
                _ => PollError::Io(err),
            });
        }
        if ret == 0 {
            return Ok(0);
        }

        let revents = fds[0].revents;
        if revents & libc::POLLNVAL != 0 {
            return Err(PollError::Io(io::Error::from_raw_os_error(libc::EBADF)));
        }
        if revents & libc::POLLERR != 0 {
            return Err(PollError::Corrupted("ring buffer fd reported POLLERR".into()));
        }
        // The kernel does not say how many; at least one record is there.
        Ok(1)
    }

    fn drain(
        &mut self,
        limit: usize,
        sink: &mut dyn FnMut(&[u8]) -> Result<(), PollError>,
    ) -> Result<usize, PollError> {
        let mut n = 0;
        while n < limit {
            let Some(item) = self.ring.next() else {
                break;
            };
            sink(&*item)?;
            n += 1;
        }
        Ok(n)
    }

    fn dropped_events(&self) -> Option<u64> {
        let values = self.drops.as_ref()?.get(&0, 0).ok()?;
        Some(values.iter().sum())
    }
}

fn bump_memlock_rlimit() -> Result<()> {
    // Map memory is locked; kernels before 5.11 charge it against RLIMIT_MEMLOCK.
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase rlimit");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
ffffffff81000000 T _stext
ffffffff812b4d10 T do_execveat_common.isra.0
ffffffff812b5a40 T __x64_sys_execve
ffffffffc0a01000 t helper_fn\t[some_module]
";

    #[test]
    fn kallsyms_lookup_matches_whole_names() {
        assert!(kallsyms_contains(SAMPLE, "__x64_sys_execve"));
        assert!(kallsyms_contains(SAMPLE, "helper_fn"));
        assert!(!kallsyms_contains(SAMPLE, "do_execveat_common"));
        assert!(!kallsyms_contains(SAMPLE, "__x64_sys_execveat"));
    }

    #[test]
    fn missing_tracepoint_does_not_resolve() {
        let entry = EntryPoint::tracepoint("execmon_no_such_category", "nothing");
        assert!(!entry_point_resolves(&entry));
    }
}
