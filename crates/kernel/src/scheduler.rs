//! The weighted-round-robin scheduler loop (spec §4.5).

use std::time::Duration;

use crate::context::Kernel;
use crate::eventlog::{EventKind, EventRecord};
use crate::pcb::{Priority, ProcessState};
use crate::signals::drain_host_signal;
use crate::syscall::KernelHandle;

/// Outcome of a single [`Scheduler::run_one_slice`] call, useful for tests
/// and the boot loop's shutdown check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceOutcome {
    Ran,
    Idle,
    ShutdownRequested,
}

/// The fixed-length schedule sequence and rotating cursor (spec §4.5
/// "Weighted pick"): built once from `weights`, traversed forever.
pub struct Scheduler {
    schedule: Vec<Priority>,
    cursor: usize,
    tick_period: Duration,
}

impl Scheduler {
    pub fn new(weights: [u32; 3], tick_period: Duration) -> Scheduler {
        let mut schedule = Vec::new();
        for (index, &count) in weights.iter().enumerate() {
            let priority = Priority::from_u8(index as u8).expect("weights has exactly 3 entries");
            for _ in 0..count {
                schedule.push(priority);
            }
        }
        Scheduler {
            schedule,
            cursor: 0,
            tick_period,
        }
    }

    /// Advances the cursor until it names a non-empty ready sequence;
    /// `None` if every sequence is empty (spec §4.5).
    fn pick(&mut self, kernel: &Kernel) -> Option<Priority> {
        if self.schedule.is_empty() {
            return None;
        }
        for _ in 0..self.schedule.len() {
            let priority = self.schedule[self.cursor];
            self.cursor = (self.cursor + 1) % self.schedule.len();
            if kernel.queues.ready_len(priority) > 0 {
                return Some(priority);
            }
        }
        None
    }

    /// Runs exactly one scheduler transition (spec §4.5 "Run-one-slice").
    pub async fn run_one_slice(&mut self, kernel: &mut Kernel) -> SliceOutcome {
        drain_host_signal(kernel)
            .await
            .unwrap_or_else(|err| tracing::warn!(error = %err, "host signal delivery failed"));

        if kernel.shutdown {
            return SliceOutcome::ShutdownRequested;
        }

        let priority = match self.pick(kernel) {
            Some(priority) => priority,
            None => {
                // Idle: nothing ready. Suspend for one tick, wake sleepers,
                // advance the clock, and let the caller try again.
                tokio::time::sleep(self.tick_period).await;
                kernel
                    .queues
                    .tick_sleep_check(&mut kernel.pcb_table, &mut kernel.event_log, kernel.tick);
                kernel.tick += 1;
                return SliceOutcome::Idle;
            }
        };

        let pid = match kernel.queues.dequeue(priority) {
            Some(pid) => pid,
            None => return SliceOutcome::Idle,
        };

        if let Some(pcb) = kernel.pcb_table.get_mut(pid) {
            pcb.state = ProcessState::Running;
        }
        kernel.current_pid = Some(pid);

        {
            let pcb = kernel.pcb_table.get(pid).expect("just dequeued pid must exist");
            let record = EventRecord {
                tick: kernel.tick,
                kind: EventKind::Schedule,
                pid,
                ppid: pcb.parent_pid.unwrap_or(0),
                state: pcb.state,
                priority: pcb.priority,
                command: pcb.command.clone(),
                nice_old: None,
                nice_new: None,
            };
            kernel.event_log.record(record);
        }

        if let Some(pcb) = kernel.pcb_table.get(pid) {
            if let Some(thread) = &pcb.thread {
                thread.continue_one_slice();
            }
        }

        // Suspend the kernel's own execution until the tick arrives. The
        // user thread suspends itself by awaiting its next permit inside
        // `ThreadControl::checkpoint` — no separate "stop the task" call is
        // needed (spec §9 Design Note: task-plus-channel).
        tokio::time::sleep(self.tick_period).await;

        kernel
            .queues
            .tick_sleep_check(&mut kernel.pcb_table, &mut kernel.event_log, kernel.tick);

        let still_running = kernel
            .pcb_table
            .get(pid)
            .map(|p| p.state == ProcessState::Running)
            .unwrap_or(false);
        if still_running {
            if let Some(pcb) = kernel.pcb_table.get_mut(pid) {
                pcb.state = ProcessState::Ready;
            }
            kernel.queues.enqueue(&kernel.pcb_table, pid);
        }

        kernel.current_pid = None;
        kernel.tick += 1;
        SliceOutcome::Ran
    }

    /// Equivalent to [`Scheduler::run_one_slice`], but for a [`Kernel`]
    /// shared with the spawned user-thread task bodies behind
    /// `Arc<tokio::sync::Mutex<Kernel>>` (spec §9 Design Note; SPEC_FULL.md
    /// §4.11). Locks the kernel only for the bookkeeping either side of the
    /// slice-sleep, and releases it for the sleep itself — a continued
    /// thread acquires the lock for its own syscalls during that window,
    /// which is the only way it can ever observe the effects of running
    /// (block, stop, exit) before the next slice's bookkeeping runs.
    pub async fn run_one_slice_shared(&mut self, kernel: &KernelHandle) -> SliceOutcome {
        {
            let mut k = kernel.lock().await;
            drain_host_signal(&mut k)
                .await
                .unwrap_or_else(|err| tracing::warn!(error = %err, "host signal delivery failed"));
            if k.shutdown {
                return SliceOutcome::ShutdownRequested;
            }
        }

        let priority = {
            let k = kernel.lock().await;
            self.pick(&k)
        };
        let priority = match priority {
            Some(priority) => priority,
            None => {
                tokio::time::sleep(self.tick_period).await;
                let mut k = kernel.lock().await;
                let tick = k.tick;
                k.queues.tick_sleep_check(&mut k.pcb_table, &mut k.event_log, tick);
                k.tick += 1;
                return SliceOutcome::Idle;
            }
        };

        let pid = {
            let mut k = kernel.lock().await;
            let pid = match k.queues.dequeue(priority) {
                Some(pid) => pid,
                None => return SliceOutcome::Idle,
            };
            if let Some(pcb) = k.pcb_table.get_mut(pid) {
                pcb.state = ProcessState::Running;
            }
            k.current_pid = Some(pid);
            {
                let pcb = k.pcb_table.get(pid).expect("just dequeued pid must exist");
                let record = EventRecord {
                    tick: k.tick,
                    kind: EventKind::Schedule,
                    pid,
                    ppid: pcb.parent_pid.unwrap_or(0),
                    state: pcb.state,
                    priority: pcb.priority,
                    command: pcb.command.clone(),
                    nice_old: None,
                    nice_new: None,
                };
                k.event_log.record(record);
            }
            if let Some(pcb) = k.pcb_table.get(pid) {
                if let Some(thread) = &pcb.thread {
                    thread.continue_one_slice();
                }
            }
            pid
        };

        // The lock is released for the sleep: this is the window in which
        // the continued thread's task body actually runs and makes
        // syscalls against `kernel`.
        tokio::time::sleep(self.tick_period).await;

        let mut k = kernel.lock().await;
        let tick = k.tick;
        k.queues.tick_sleep_check(&mut k.pcb_table, &mut k.event_log, tick);

        let still_running = k
            .pcb_table
            .get(pid)
            .map(|p| p.state == ProcessState::Running)
            .unwrap_or(false);
        if still_running {
            if let Some(pcb) = k.pcb_table.get_mut(pid) {
                pcb.state = ProcessState::Ready;
            }
            k.queues.enqueue(&k.pcb_table, pid);
        }

        k.current_pid = None;
        k.tick += 1;
        SliceOutcome::Ran
    }
}
