use std::io::{self, Write};

use chrono::{SecondsFormat, Utc};
use execmon_common::ExecEvent;
use log::warn;
use procfs::process::Process;
use serde::Serialize;

use crate::{
    consumer::EventHandler,
    settings::{OutputFormat, OutputSettings},
    telemetry,
};

/// Real parent of `pid`, read from `/proc/<pid>/stat`. `None` once the
/// process is gone.
pub fn parent_of(pid: u32) -> Option<u32> {
    let pid = i32::try_from(pid).ok()?;
    let stat = Process::new(pid).ok()?.stat().ok()?;
    u32::try_from(stat.ppid).ok()
}

fn comm_lossy(event: &ExecEvent) -> String {
    String::from_utf8_lossy(event.comm_bytes()).into_owned()
}

/// `[PID <pid>] Executed: <comm>`, one line per event.
pub struct LineHandler<W: Write> {
    out: W,
    resolve_parent: bool,
    write_failed: bool,
}

impl<W: Write> LineHandler<W> {
    pub fn new(out: W, resolve_parent: bool) -> Self {
        Self {
            out,
            resolve_parent,
            write_failed: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> EventHandler for LineHandler<W> {
    fn handle(&mut self, event: &ExecEvent) {
        telemetry::record_exec_event();
        let comm = comm_lossy(event);
        let parent = if self.resolve_parent {
            parent_of(event.pid)
        } else {
            None
        };
        let res = match parent {
            Some(ppid) => writeln!(
                self.out,
                "[PID {}] Executed: {} (parent {})",
                event.pid, comm, ppid
            ),
            None => writeln!(self.out, "[PID {}] Executed: {}", event.pid, comm),
        };
        report_write(res, &mut self.write_failed);
    }
}

#[derive(Debug, Serialize)]
struct JsonEvent<'a> {
    timestamp: String,
    pid: u32,
    /// Thread id of the caller, kept under the record's field name.
    ppid: u32,
    comm: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_pid: Option<u32>,
}

/// One JSON object per line.
pub struct JsonHandler<W: Write> {
    out: W,
    resolve_parent: bool,
    write_failed: bool,
}

impl<W: Write> JsonHandler<W> {
    pub fn new(out: W, resolve_parent: bool) -> Self {
        Self {
            out,
            resolve_parent,
            write_failed: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> EventHandler for JsonHandler<W> {
    fn handle(&mut self, event: &ExecEvent) {
        telemetry::record_exec_event();
        let comm = comm_lossy(event);
        let record = JsonEvent {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            pid: event.pid,
            ppid: event.ppid,
            comm: &comm,
            parent_pid: if self.resolve_parent {
                parent_of(event.pid)
            } else {
                None
            },
        };
        let res = serde_json::to_writer(&mut self.out, &record)
            .map_err(io::Error::from)
            .and_then(|()| self.out.write_all(b"\n"));
        report_write(res, &mut self.write_failed);
    }
}

fn report_write(res: io::Result<()>, already_failed: &mut bool) {
    if let Err(e) = res {
        if !*already_failed {
            warn!("Failed to write event: {}", e);
            *already_failed = true;
        }
    }
}

/// Handler writing to stdout in the configured format.
pub fn handler_for(settings: &OutputSettings) -> Box<dyn EventHandler + Send> {
    let resolve_parent = settings.resolve_parent.unwrap_or(false);
    match settings.format {
        OutputFormat::Line => Box::new(LineHandler::new(io::stdout(), resolve_parent)),
        OutputFormat::Json => Box::new(JsonHandler::new(io::stdout(), resolve_parent)),
    }
}
