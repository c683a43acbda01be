//! The process control block (spec §3 "PCB").

use crate::sequence::DynamicSequence;
use crate::thread::SuspendableThread;

/// PID 0 is reserved as "invalid" (spec §3). PIDs are otherwise assigned
/// 1..=N by [`crate::pcb_table::PcbTable`]'s monotonic counter.
pub type Pid = u32;
pub const INVALID_PID: Pid = 0;
pub const INIT_PID: Pid = 1;

pub const FD_TABLE_SIZE: usize = 32;
pub const MAX_COMMAND_LEN: usize = 64;
pub const MAX_ARGC: usize = 64;
pub const MAX_ARG_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    High = 0,
    Normal = 1,
    Low = 2,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn from_u8(value: u8) -> Option<Priority> {
        match value {
            0 => Some(Priority::High),
            1 => Some(Priority::Normal),
            2 => Some(Priority::Low),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    Ready,
    Running,
    Blocked,
    Stopped,
    Zombie,
}

/// spec §3: "exit status ∈ {NONE, EXITED, SIGNALED, STOPPED}". `Stopped`
/// here is the *exit*-status sense used by the wait status word (§6), not
/// the process-state `Stopped` above — a STOPPED process is not a zombie
/// and is never reaped, but `wait` still reports it once via this field's
/// STOPPED bit together with the state machine's stopped-reported flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitStatus {
    None,
    Exited,
    Signaled,
    Stopped,
}

/// Per §6 "Wait status word": bit 0 = EXITED, bit 1 = SIGNALED, bit 2 = STOPPED.
pub const WAIT_BIT_EXITED: i32 = 1 << 0;
pub const WAIT_BIT_SIGNALED: i32 = 1 << 1;
pub const WAIT_BIT_STOPPED: i32 = 1 << 2;

impl ExitStatus {
    pub fn wait_bit(self) -> i32 {
        match self {
            ExitStatus::None => 0,
            ExitStatus::Exited => WAIT_BIT_EXITED,
            ExitStatus::Signaled => WAIT_BIT_SIGNALED,
            ExitStatus::Stopped => WAIT_BIT_STOPPED,
        }
    }
}

/// A slot in the per-process FD table: either empty, or a key into the GDT.
/// The GDT key type is generic at this layer (`usize`) to avoid a module
/// cycle between `pcb` and `gdt`; [`crate::gdt::GdtKey`] is a transparent
/// newtype over the same representation.
pub type FdSlot = Option<usize>;

#[derive(Debug)]
pub struct Pcb {
    pub pid: Pid,
    pub parent_pid: Option<Pid>,
    pub state: ProcessState,
    pub priority: Priority,
    /// 0 = not sleeping; nonzero = absolute tick at which to wake (spec §3).
    pub wake_tick: u64,
    /// One-shot edge consumed by `wait` the first time it observes this
    /// process STOPPED (spec §4.8 `wait`).
    pub stopped_reported: bool,
    pub exit_status: ExitStatus,
    pub command: String,
    pub argv: Vec<String>,
    /// Non-owning back-references to children; the PCB table is the sole
    /// owner (spec §9).
    pub children: DynamicSequence<Pid>,
    pub fd_table: [FdSlot; FD_TABLE_SIZE],
    pub thread: Option<SuspendableThread>,
}

impl Pcb {
    pub fn new(pid: Pid, parent_pid: Option<Pid>, command: String, argv: Vec<String>) -> Pcb {
        Pcb {
            pid,
            parent_pid,
            state: ProcessState::Ready,
            priority: Priority::Normal,
            wake_tick: 0,
            stopped_reported: false,
            exit_status: ExitStatus::None,
            command,
            argv,
            children: DynamicSequence::new(),
            fd_table: [None; FD_TABLE_SIZE],
            thread: None,
        }
    }

    pub fn is_sleeping(&self) -> bool {
        self.wake_tick != 0
    }
}

/// Validates and truncates-or-rejects a command name / argv pair against
/// the bounds introduced in SPEC_FULL.md §3 ("Supplement — command-name and
/// argv bounds").
pub fn validate_command(
    command: &str,
    argv: &[String],
) -> Result<(), crate::error::KernelErrorKind> {
    use crate::error::KernelErrorKind;
    if command.len() > MAX_COMMAND_LEN {
        return Err(KernelErrorKind::NameTooLong);
    }
    if argv.len() > MAX_ARGC || argv.iter().any(|a| a.len() > MAX_ARG_LEN) {
        return Err(KernelErrorKind::ArgumentListTooLong);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_round_trips_through_u8() {
        for p in Priority::ALL {
            assert_eq!(Priority::from_u8(p as u8), Some(p));
        }
        assert_eq!(Priority::from_u8(3), None);
    }

    #[test]
    fn exit_status_wait_bits_are_disjoint() {
        assert_eq!(ExitStatus::Exited.wait_bit(), WAIT_BIT_EXITED);
        assert_eq!(ExitStatus::Signaled.wait_bit(), WAIT_BIT_SIGNALED);
        assert_eq!(ExitStatus::Stopped.wait_bit(), WAIT_BIT_STOPPED);
    }

    #[test]
    fn validate_command_rejects_oversized_name() {
        let long_name = "x".repeat(MAX_COMMAND_LEN + 1);
        assert!(validate_command(&long_name, &[]).is_err());
        assert!(validate_command("ok", &[]).is_ok());
    }

    #[test]
    fn validate_command_rejects_oversized_argv() {
        let argv: Vec<String> = (0..MAX_ARGC + 1).map(|i| i.to_string()).collect();
        assert!(validate_command("ok", &argv).is_err());
    }
}
