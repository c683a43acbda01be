//! Fixed-capacity PID → PCB mapping and PID allocator (spec §4.2).

use crate::error::KernelErrorKind;
use crate::pcb::{Pcb, Pid};

/// Owns every live PCB. Indexed directly by PID (index 0 is never used,
/// since PID 0 is reserved as "invalid" — spec §3).
pub struct PcbTable {
    slots: Vec<Option<Pcb>>,
    next_pid: Pid,
    capacity: usize,
}

impl PcbTable {
    pub fn new(capacity: usize) -> PcbTable {
        let mut slots = Vec::with_capacity(capacity + 1);
        slots.resize_with(capacity + 1, || None);
        PcbTable {
            slots,
            next_pid: 1,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Allocate a fresh PID and insert `pcb` (whose `pid` field must equal
    /// the returned PID — callers should build the PCB with
    /// [`PcbTable::reserve_pid`] first).
    pub fn reserve_pid(&mut self) -> Result<Pid, KernelErrorKind> {
        // PIDs are monotonically increasing and never reused within a
        // kernel lifetime (SPEC_FULL.md §3 supplement) — find the next free
        // slot at or after next_pid, scanning at most `capacity` slots.
        for _ in 0..=self.capacity {
            let candidate = self.next_pid;
            if candidate as usize > self.capacity {
                return Err(KernelErrorKind::TableFull);
            }
            self.next_pid = self.next_pid.wrapping_add(1);
            if self.next_pid == 0 {
                self.next_pid = 1;
            }
            if self.slots[candidate as usize].is_none() {
                return Ok(candidate);
            }
        }
        Err(KernelErrorKind::TableFull)
    }

    pub fn insert(&mut self, pcb: Pcb) {
        let pid = pcb.pid;
        self.slots[pid as usize] = Some(pcb);
    }

    pub fn get(&self, pid: Pid) -> Option<&Pcb> {
        self.slots.get(pid as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.slots.get_mut(pid as usize)?.as_mut()
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Pcb> {
        self.slots.get_mut(pid as usize)?.take()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.slots.get(pid as usize).map(|s| s.is_some()).unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pcb> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Pcb> {
        self.slots.iter_mut().filter_map(|slot| slot.as_mut())
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.iter().map(|p| p.pid).collect()
    }
}
