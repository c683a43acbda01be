//! Per-priority ready sequences and the blocked sequence (spec §4.1).
//! Every operation here is single-threaded: the scheduler is the only
//! caller, and only while the previously-running user thread is suspended
//! (spec §5), so none of this needs locking.

use crate::eventlog::{EventKind, EventLog, EventRecord};
use crate::pcb::{Pid, Priority, ProcessState};
use crate::pcb_table::PcbTable;
use crate::sequence::DynamicSequence;

pub struct Queues {
    ready: [DynamicSequence<Pid>; 3],
    blocked: DynamicSequence<Pid>,
}

impl Queues {
    pub fn new() -> Queues {
        Queues {
            ready: [
                DynamicSequence::new(),
                DynamicSequence::new(),
                DynamicSequence::new(),
            ],
            blocked: DynamicSequence::new(),
        }
    }

    pub fn ready_len(&self, priority: Priority) -> usize {
        self.ready[priority.index()].len()
    }

    pub fn blocked_len(&self) -> usize {
        self.blocked.len()
    }

    fn event(&self, table: &PcbTable, pid: Pid, tick: u64, kind: EventKind) -> EventRecord {
        let pcb = table.get(pid).expect("pid must exist for queue event");
        EventRecord {
            tick,
            kind,
            pid,
            ppid: pcb.parent_pid.unwrap_or(0),
            state: pcb.state,
            priority: pcb.priority,
            command: pcb.command.clone(),
            nice_old: None,
            nice_new: None,
        }
    }

    /// `enqueue(p)`: no-op unless p is READY; append to the ready sequence
    /// for its priority.
    pub fn enqueue(&mut self, table: &PcbTable, pid: Pid) {
        if let Some(pcb) = table.get(pid) {
            if pcb.state == ProcessState::Ready {
                self.ready[pcb.priority.index()].push(pid);
            }
        }
    }

    /// `dequeue(priority)`: pop the head of that ready sequence.
    pub fn dequeue(&mut self, priority: Priority) -> Option<Pid> {
        self.ready[priority.index()].pop_front()
    }

    /// `block(p)`: BLOCKED, removed from its ready sequence if present,
    /// appended to the blocked sequence.
    pub fn block(&mut self, table: &mut PcbTable, log: &mut EventLog, tick: u64, pid: Pid) {
        let priority = match table.get(pid) {
            Some(pcb) => pcb.priority,
            None => return,
        };
        self.ready[priority.index()].remove_first(&pid);
        self.blocked.remove_first(&pid);
        self.blocked.push(pid);
        if let Some(pcb) = table.get_mut(pid) {
            pcb.state = ProcessState::Blocked;
        }
        let record = self.event(table, pid, tick, EventKind::Blocked);
        log.record(record);
    }

    /// `unblock(p)`: remove from blocked sequence, READY, enqueue.
    pub fn unblock(&mut self, table: &mut PcbTable, log: &mut EventLog, tick: u64, pid: Pid) {
        if !self.blocked.remove_first(&pid) {
            return;
        }
        if let Some(pcb) = table.get_mut(pid) {
            pcb.state = ProcessState::Ready;
        }
        self.enqueue(table, pid);
        let record = self.event(table, pid, tick, EventKind::Unblocked);
        log.record(record);
    }

    /// `stop(p)`: STOPPED, cleared stopped-reported, removed from ready and
    /// blocked; if parent is BLOCKED with wake-tick=0, unblock it so `wait`
    /// observes the state change.
    pub fn stop(&mut self, table: &mut PcbTable, log: &mut EventLog, tick: u64, pid: Pid) {
        let (priority, parent_pid) = match table.get(pid) {
            Some(pcb) => (pcb.priority, pcb.parent_pid),
            None => return,
        };
        self.ready[priority.index()].remove_first(&pid);
        self.blocked.remove_first(&pid);
        if let Some(pcb) = table.get_mut(pid) {
            pcb.state = ProcessState::Stopped;
            pcb.stopped_reported = false;
        }
        let record = self.event(table, pid, tick, EventKind::Stopped);
        log.record(record);

        if let Some(parent) = parent_pid {
            let should_unblock = table
                .get(parent)
                .map(|p| p.state == ProcessState::Blocked && p.wake_tick == 0)
                .unwrap_or(false);
            if should_unblock {
                self.unblock(table, log, tick, parent);
            }
        }
    }

    /// `continue(p)`: only from STOPPED; READY, enqueue.
    pub fn continue_process(&mut self, table: &mut PcbTable, log: &mut EventLog, tick: u64, pid: Pid) {
        let is_stopped = table.get(pid).map(|p| p.state == ProcessState::Stopped).unwrap_or(false);
        if !is_stopped {
            return;
        }
        if let Some(pcb) = table.get_mut(pid) {
            pcb.state = ProcessState::Ready;
        }
        self.enqueue(table, pid);
        let record = self.event(table, pid, tick, EventKind::Continued);
        log.record(record);
    }

    /// `tick_sleep_check(now)`: wake every blocked entry whose wake-tick is
    /// due. Scans the blocked sequence by PID snapshot since `unblock`
    /// mutates it in place.
    pub fn tick_sleep_check(&mut self, table: &mut PcbTable, log: &mut EventLog, now: u64) {
        let due: Vec<Pid> = self
            .blocked
            .iter()
            .copied()
            .filter(|&pid| {
                table
                    .get(pid)
                    .map(|p| p.wake_tick != 0 && p.wake_tick <= now)
                    .unwrap_or(false)
            })
            .collect();
        for pid in due {
            if let Some(pcb) = table.get_mut(pid) {
                pcb.wake_tick = 0;
            }
            self.unblock(table, log, now, pid);
        }
    }

    /// `set_priority(p, new)`: re-home a READY process between ready
    /// sequences and log NICE with old/new.
    pub fn set_priority(
        &mut self,
        table: &mut PcbTable,
        log: &mut EventLog,
        tick: u64,
        pid: Pid,
        new: Priority,
    ) {
        let old = match table.get(pid) {
            Some(pcb) => pcb.priority,
            None => return,
        };
        let was_ready = table.get(pid).map(|p| p.state == ProcessState::Ready).unwrap_or(false);
        if was_ready {
            self.ready[old.index()].remove_first(&pid);
        }
        if let Some(pcb) = table.get_mut(pid) {
            pcb.priority = new;
        }
        if was_ready {
            self.ready[new.index()].push(pid);
        }
        let mut record = self.event(table, pid, tick, EventKind::Nice);
        record.nice_old = Some(old as u8);
        record.nice_new = Some(new as u8);
        log.record(record);
    }

    /// `remove_from_queues(p)`: used when a process is about to become
    /// ZOMBIE.
    pub fn remove_from_queues(&mut self, table: &PcbTable, pid: Pid) {
        if let Some(pcb) = table.get(pid) {
            self.ready[pcb.priority.index()].remove_first(&pid);
        } else {
            for queue in &mut self.ready {
                queue.remove_first(&pid);
            }
        }
        self.blocked.remove_first(&pid);
    }
}

impl Default for Queues {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcb::Pcb;

    fn fresh(capacity: usize) -> (PcbTable, EventLog, Queues) {
        (PcbTable::new(capacity), EventLog::new(100, None), Queues::new())
    }

    #[test]
    fn enqueue_dequeue_respects_priority_buckets() {
        let (mut table, _log, mut queues) = fresh(4);
        let pid = table.reserve_pid().unwrap();
        let mut pcb = Pcb::new(pid, None, "p".into(), vec![]);
        pcb.priority = Priority::Low;
        table.insert(pcb);
        queues.enqueue(&table, pid);
        assert_eq!(queues.ready_len(Priority::Low), 1);
        assert_eq!(queues.dequeue(Priority::Low), Some(pid));
        assert_eq!(queues.dequeue(Priority::Low), None);
    }

    #[test]
    fn block_then_stop_removes_from_ready_invariant() {
        let (mut table, mut log, mut queues) = fresh(4);
        let pid = table.reserve_pid().unwrap();
        table.insert(Pcb::new(pid, None, "p".into(), vec![]));
        queues.enqueue(&table, pid);
        queues.block(&mut table, &mut log, 1, pid);
        assert_eq!(queues.ready_len(Priority::Normal), 0);
        assert_eq!(queues.blocked_len(), 1);
        queues.unblock(&mut table, &mut log, 2, pid);
        assert_eq!(queues.blocked_len(), 0);
        assert_eq!(queues.ready_len(Priority::Normal), 1);
    }

    #[test]
    fn stop_unblocks_waiting_parent() {
        let (mut table, mut log, mut queues) = fresh(4);
        let parent = table.reserve_pid().unwrap();
        table.insert(Pcb::new(parent, None, "parent".into(), vec![]));
        let child = table.reserve_pid().unwrap();
        table.insert(Pcb::new(child, Some(parent), "child".into(), vec![]));

        queues.block(&mut table, &mut log, 1, parent);
        queues.enqueue(&table, child);

        queues.stop(&mut table, &mut log, 2, child);
        assert_eq!(table.get(child).unwrap().state, ProcessState::Stopped);
        assert_eq!(table.get(parent).unwrap().state, ProcessState::Ready);
    }

    #[test]
    fn tick_sleep_check_wakes_only_due_sleepers() {
        let (mut table, mut log, mut queues) = fresh(4);
        let a = table.reserve_pid().unwrap();
        table.insert(Pcb::new(a, None, "a".into(), vec![]));
        let b = table.reserve_pid().unwrap();
        table.insert(Pcb::new(b, None, "b".into(), vec![]));

        table.get_mut(a).unwrap().wake_tick = 10;
        table.get_mut(b).unwrap().wake_tick = 100;
        queues.block(&mut table, &mut log, 1, a);
        queues.block(&mut table, &mut log, 1, b);

        queues.tick_sleep_check(&mut table, &mut log, 10);
        assert_eq!(table.get(a).unwrap().state, ProcessState::Ready);
        assert_eq!(table.get(b).unwrap().state, ProcessState::Blocked);
    }

    #[test]
    fn set_priority_rehomes_ready_process() {
        let (mut table, mut log, mut queues) = fresh(4);
        let pid = table.reserve_pid().unwrap();
        table.insert(Pcb::new(pid, None, "p".into(), vec![]));
        queues.enqueue(&table, pid);
        queues.set_priority(&mut table, &mut log, 1, pid, Priority::High);
        assert_eq!(queues.ready_len(Priority::Normal), 0);
        assert_eq!(queues.ready_len(Priority::High), 1);
        assert_eq!(log.count(EventKind::Nice), 1);
    }
}
