//! Append-only event log (spec §3 "Event-log record", §6 line format).
//! Never read by the kernel — used only for the scheduling-ratio property
//! in spec §8 scenario 4 and for human-readable trace output.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use crate::pcb::{Pid, Priority, ProcessState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Schedule,
    Blocked,
    Unblocked,
    Stopped,
    Continued,
    Orphan,
    Waited,
    Exited,
    Nice,
}

impl EventKind {
    fn name(self) -> &'static str {
        match self {
            EventKind::Schedule => "SCHEDULE",
            EventKind::Blocked => "BLOCKED",
            EventKind::Unblocked => "UNBLOCKED",
            EventKind::Stopped => "STOPPED",
            EventKind::Continued => "CONTINUED",
            EventKind::Orphan => "ORPHAN",
            EventKind::Waited => "WAITED",
            EventKind::Exited => "EXITED",
            EventKind::Nice => "NICE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventRecord {
    pub tick: u64,
    pub kind: EventKind,
    pub pid: Pid,
    pub ppid: Pid,
    pub state: ProcessState,
    pub priority: Priority,
    pub command: String,
    /// Only populated for `EventKind::Nice`.
    pub nice_old: Option<u8>,
    pub nice_new: Option<u8>,
}

impl EventRecord {
    /// Renders the §6 text format:
    /// `[ <tick:5> ] <event:10> <pid:5> <prio:4> <cmd>` (NICE adds old/new).
    pub fn render(&self) -> String {
        let base = format!(
            "[{tick:>5}] {event:<10} {pid:>5} {prio:>4} {cmd}",
            tick = self.tick,
            event = self.kind.name(),
            pid = self.pid,
            prio = self.priority.index(),
            cmd = self.command,
        );
        if let (Some(old), Some(new)) = (self.nice_old, self.nice_new) {
            format!("{base} {old}->{new}")
        } else {
            base
        }
    }
}

/// In-memory ring buffer plus an optional file sink. An I/O failure writing
/// to the sink is logged via `tracing::warn!` and otherwise swallowed — the
/// log must never be allowed to perturb scheduling (spec §3).
pub struct EventLog {
    records: Vec<EventRecord>,
    capacity: usize,
    sink_path: Option<PathBuf>,
}

impl EventLog {
    pub fn new(capacity: usize, sink_path: Option<PathBuf>) -> EventLog {
        EventLog {
            records: Vec::new(),
            capacity,
            sink_path,
        }
    }

    pub fn record(&mut self, record: EventRecord) {
        if let Some(path) = &self.sink_path {
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(mut file) => {
                    if let Err(err) = writeln!(file, "{}", record.render()) {
                        tracing::warn!(error = %err, "event log sink write failed");
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "event log sink open failed");
                }
            }
        }
        if self.records.len() >= self.capacity {
            self.records.remove(0);
        }
        self.records.push(record);
    }

    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.records.iter().filter(|r| r.kind == kind).count()
    }

    pub fn count_by_priority(&self, kind: EventKind, priority: Priority) -> usize {
        self.records
            .iter()
            .filter(|r| r.kind == kind && r.priority == priority)
            .count()
    }
}
