//! The kernel context (spec §9 Design Note: "represent it as a kernel
//! context value threaded through syscalls rather than as process-wide
//! state") plus the process-lifecycle operations that need the FAT, GDT,
//! PCB table, queues, and event log together (spec §4.2).

use std::path::{Path, PathBuf};

use crate::eventlog::{EventKind, EventLog, EventRecord};
use crate::error::{KernelErrorKind, KernelResult};
use crate::fat::core::FatFilesystem;
use crate::fileops;
use crate::gdt::Gdt;
use crate::pcb::{validate_command, Pcb, Pid, ProcessState, FD_TABLE_SIZE, INIT_PID};
use crate::pcb_table::PcbTable;
use crate::queues::Queues;

/// Overridable kernel parameters (SPEC_FULL.md §1 ambient-stack addendum),
/// read from the environment the way the teacher's daemon reads
/// `SISCTL_BIND`-style overrides.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub pcb_capacity: usize,
    pub gdt_capacity: usize,
    pub tick_ms: u64,
    /// Per-priority occurrence counts in the weighted schedule sequence
    /// (spec §4.5; default realizes the 9:6:4 ratio).
    pub schedule_weights: [u32; 3],
    pub fs_image_path: PathBuf,
    pub event_log_capacity: usize,
    pub event_log_sink: Option<PathBuf>,
}

impl Default for KernelConfig {
    fn default() -> KernelConfig {
        KernelConfig {
            pcb_capacity: 256,
            gdt_capacity: 256,
            tick_ms: 100,
            schedule_weights: [9, 6, 4],
            fs_image_path: PathBuf::from("pennsim.img"),
            event_log_capacity: 4096,
            event_log_sink: None,
        }
    }
}

impl KernelConfig {
    /// Applies `PENNSIM_TICK_MS`, `PENNSIM_PCB_CAPACITY`, `PENNSIM_FS_IMAGE`
    /// on top of [`KernelConfig::default`]. Unparseable values are ignored
    /// and logged, matching the teacher's tolerant env-override parsing.
    pub fn from_env() -> KernelConfig {
        let mut config = KernelConfig::default();
        if let Ok(raw) = std::env::var("PENNSIM_TICK_MS") {
            match raw.parse() {
                Ok(ms) => config.tick_ms = ms,
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid PENNSIM_TICK_MS"),
            }
        }
        if let Ok(raw) = std::env::var("PENNSIM_PCB_CAPACITY") {
            match raw.parse() {
                Ok(cap) => config.pcb_capacity = cap,
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid PENNSIM_PCB_CAPACITY"),
            }
        }
        if let Ok(raw) = std::env::var("PENNSIM_FS_IMAGE") {
            config.fs_image_path = PathBuf::from(raw);
        }
        config
    }
}

/// Bundles every piece of global mutable kernel state (spec §9 Design
/// Note). Owned by `crates/shell::main` and threaded as `&mut Kernel` (or
/// `Arc<tokio::sync::Mutex<Kernel>>` across the host-signal relay task,
/// the one genuine concurrency boundary — see SPEC_FULL.md §5) into every
/// syscall.
pub struct Kernel {
    pub fs: Option<FatFilesystem>,
    pub gdt: Gdt,
    pub pcb_table: PcbTable,
    pub queues: Queues,
    pub event_log: EventLog,
    pub tick: u64,
    pub shutdown: bool,
    pub foreground_pid: Option<Pid>,
    /// The PCB the scheduler is currently running a slice of (spec §4.5
    /// step 4's "current" pointer), `None` between slices.
    pub current_pid: Option<Pid>,
    pub config: KernelConfig,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Kernel {
        Kernel {
            fs: None,
            gdt: Gdt::new(config.gdt_capacity),
            pcb_table: PcbTable::new(config.pcb_capacity),
            queues: Queues::new(),
            event_log: EventLog::new(config.event_log_capacity, config.event_log_sink.clone()),
            tick: 0,
            shutdown: false,
            foreground_pid: None,
            current_pid: None,
            config,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.fs.is_some()
    }

    /// `mount(path)` (spec §4.3).
    pub fn mount(&mut self, path: &Path) -> KernelResult<()> {
        if self.fs.is_some() {
            return Err(KernelErrorKind::Exists);
        }
        let fs = FatFilesystem::mount(path)?;
        self.fs = Some(fs);
        self.gdt.install_standard_streams();
        tracing::info!(path = %path.display(), "filesystem mounted");
        Ok(())
    }

    /// `unmount` (spec §4.3).
    pub fn unmount(&mut self) -> KernelResult<()> {
        let fs = self.fs.take().ok_or(KernelErrorKind::NotMounted)?;
        self.gdt.clear();
        fs.unmount()?;
        tracing::info!("filesystem unmounted");
        Ok(())
    }

    fn lifecycle_event(&self, pid: Pid, kind: EventKind) -> EventRecord {
        let pcb = self
            .pcb_table
            .get(pid)
            .expect("pid must exist for lifecycle event");
        EventRecord {
            tick: self.tick,
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

    /// `create(parent)` (spec §4.2): allocates a READY (not yet enqueued)
    /// PCB, copies the parent's FD table, and appends a back-reference to
    /// the parent's child sequence. `parent` may be absent (init only).
    pub fn create(
        &mut self,
        parent: Option<Pid>,
        command: String,
        argv: Vec<String>,
    ) -> KernelResult<Pid> {
        validate_command(&command, &argv)?;
        let pid = self.pcb_table.reserve_pid()?;
        let mut pcb = Pcb::new(pid, parent, command, argv);

        if let Some(parent_pid) = parent {
            let parent_pcb = self
                .pcb_table
                .get(parent_pid)
                .ok_or(KernelErrorKind::NoSuchProcess)?;
            pcb.fd_table = parent_pcb.fd_table;
        } else {
            for i in 0..3 {
                pcb.fd_table[i] = Some(i);
            }
        }

        self.pcb_table.insert(pcb);
        if let Some(parent_pid) = parent {
            if let Some(parent_pcb) = self.pcb_table.get_mut(parent_pid) {
                parent_pcb.children.push(pid);
            }
        }
        tracing::debug!(pid, parent = ?parent, "process created");
        Ok(pid)
    }

    /// `terminate(p)` (spec §4.2). Idempotent past ZOMBIE.
    pub async fn terminate(&mut self, pid: Pid) -> KernelResult<()> {
        let already_zombie = self
            .pcb_table
            .get(pid)
            .map(|p| p.state == ProcessState::Zombie)
            .unwrap_or(true);
        if already_zombie {
            return Ok(());
        }

        let signaled = self
            .pcb_table
            .get(pid)
            .map(|p| p.exit_status == crate::pcb::ExitStatus::Signaled)
            .unwrap_or(false);
        if signaled {
            if let Some(pcb) = self.pcb_table.get(pid) {
                if let Some(thread) = &pcb.thread {
                    thread.cancel();
                }
            }
        }

        self.queues.remove_from_queues(&self.pcb_table, pid);
        if let Some(pcb) = self.pcb_table.get_mut(pid) {
            pcb.state = ProcessState::Zombie;
        }

        self.close_fds_from(pid, 3).await;

        let (parent_pid, children) = {
            let pcb = self.pcb_table.get(pid).expect("pid must still exist");
            (pcb.parent_pid, pcb.children.iter().copied().collect::<Vec<_>>())
        };

        let mut init_gained_zombie_child = false;
        for child_pid in children {
            if let Some(child) = self.pcb_table.get_mut(child_pid) {
                child.parent_pid = Some(INIT_PID);
            }
            if let Some(init) = self.pcb_table.get_mut(INIT_PID) {
                init.children.push(child_pid);
            }
            let record = self.lifecycle_event(child_pid, EventKind::Orphan);
            self.event_log.record(record);
            if self
                .pcb_table
                .get(child_pid)
                .map(|c| c.state == ProcessState::Zombie)
                .unwrap_or(false)
            {
                init_gained_zombie_child = true;
            }
        }

        if init_gained_zombie_child {
            let init_blocked_indefinitely = self
                .pcb_table
                .get(INIT_PID)
                .map(|p| p.state == ProcessState::Blocked && p.wake_tick == 0)
                .unwrap_or(false);
            if init_blocked_indefinitely {
                self.queues
                    .unblock(&mut self.pcb_table, &mut self.event_log, self.tick, INIT_PID);
            }
        }

        if let Some(parent_pid) = parent_pid {
            let parent_blocked_indefinitely = self
                .pcb_table
                .get(parent_pid)
                .map(|p| p.state == ProcessState::Blocked && p.wake_tick == 0)
                .unwrap_or(false);
            if parent_blocked_indefinitely {
                self.queues.unblock(
                    &mut self.pcb_table,
                    &mut self.event_log,
                    self.tick,
                    parent_pid,
                );
            }
        }

        tracing::info!(pid, "process terminated");
        Ok(())
    }

    /// Closes every FD at index `>= from` in `pid`'s table (spec §4.2's
    /// critical cross-component contract: this is what makes FD leakage
    /// across exits structurally impossible).
    async fn close_fds_from(&mut self, pid: Pid, from: usize) {
        let keys: Vec<(usize, usize)> = match self.pcb_table.get(pid) {
            Some(pcb) => pcb
                .fd_table
                .iter()
                .enumerate()
                .skip(from)
                .filter_map(|(i, slot)| slot.map(|key| (i, key)))
                .collect(),
            None => return,
        };

        for (fd_index, gdt_index) in keys {
            if let Some(fs) = self.fs.as_mut() {
                if let Err(err) = fileops::close(fs, &mut self.gdt, crate::gdt::GdtKey(gdt_index)) {
                    tracing::warn!(pid, fd_index, error = %err, "fd close failed during terminate");
                }
            } else {
                self.gdt.free(crate::gdt::GdtKey(gdt_index));
            }
            if let Some(pcb) = self.pcb_table.get_mut(pid) {
                pcb.fd_table[fd_index] = None;
            }
        }
    }

    /// `reap_zombie(parent, child_pid)` (spec §4.2).
    pub async fn reap_zombie(&mut self, parent: Pid, child_pid: Pid) -> KernelResult<()> {
        let is_zombie_child_of_parent = self
            .pcb_table
            .get(parent)
            .map(|p| p.children.iter().any(|&c| c == child_pid))
            .unwrap_or(false)
            && self
                .pcb_table
                .get(child_pid)
                .map(|c| c.state == ProcessState::Zombie)
                .unwrap_or(false);
        if !is_zombie_child_of_parent {
            return Err(KernelErrorKind::NoSuchProcess);
        }

        if let Some(parent_pcb) = self.pcb_table.get_mut(parent) {
            parent_pcb.children.remove_first(&child_pid);
        }
        let record = self.lifecycle_event(child_pid, EventKind::Waited);
        self.event_log.record(record);

        if let Some(mut pcb) = self.pcb_table.remove(child_pid) {
            if let Some(mut thread) = pcb.thread.take() {
                thread.join().await;
            }
        }
        Ok(())
    }

    /// `kill_all` (spec §4.2): used only at shutdown.
    pub async fn kill_all(&mut self) {
        let pids = self.pcb_table.pids();
        for pid in &pids {
            if let Some(pcb) = self.pcb_table.get(*pid) {
                if let Some(thread) = &pcb.thread {
                    thread.cancel();
                }
            }
        }
        for pid in &pids {
            if let Some(pcb) = self.pcb_table.get_mut(*pid) {
                pcb.parent_pid = None;
                pcb.children = crate::sequence::DynamicSequence::new();
            }
        }
        for pid in pids {
            if let Some(mut pcb) = self.pcb_table.remove(pid) {
                if let Some(mut thread) = pcb.thread.take() {
                    thread.join().await;
                }
            }
        }
        tracing::info!("kill_all: all processes freed");
    }
}

pub const STANDARD_FD_COUNT: usize = 3;
const _: () = assert!(STANDARD_FD_COUNT <= FD_TABLE_SIZE);

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn mounted_kernel() -> (NamedTempFile, Kernel) {
        let tmp = NamedTempFile::new().unwrap();
        crate::fat::core::mkfs(tmp.path(), 1, 0).unwrap();
        let mut kernel = Kernel::new(KernelConfig::default());
        kernel.mount(tmp.path()).unwrap();
        (tmp, kernel)
    }

    #[test]
    fn create_without_parent_seeds_standard_streams() {
        let (_tmp, mut kernel) = mounted_kernel();
        let pid = kernel.create(None, "init".into(), vec![]).unwrap();
        let pcb = kernel.pcb_table.get(pid).unwrap();
        assert_eq!(pcb.fd_table[0], Some(0));
        assert_eq!(pcb.fd_table[1], Some(1));
        assert_eq!(pcb.fd_table[2], Some(2));
    }

    #[test]
    fn create_with_parent_inherits_fd_table_and_registers_child() {
        let (_tmp, mut kernel) = mounted_kernel();
        let parent = kernel.create(None, "init".into(), vec![]).unwrap();
        let child = kernel.create(Some(parent), "sh".into(), vec![]).unwrap();
        assert_eq!(
            kernel.pcb_table.get(child).unwrap().fd_table,
            kernel.pcb_table.get(parent).unwrap().fd_table
        );
        assert!(kernel
            .pcb_table
            .get(parent)
            .unwrap()
            .children
            .iter()
            .any(|&c| c == child));
    }

    #[tokio::test]
    async fn terminate_reparents_children_to_init() {
        let (_tmp, mut kernel) = mounted_kernel();
        let init = kernel.create(None, "init".into(), vec![]).unwrap();
        assert_eq!(init, INIT_PID);
        let mid = kernel.create(Some(init), "mid".into(), vec![]).unwrap();
        let grandchild = kernel.create(Some(mid), "gc".into(), vec![]).unwrap();

        kernel.terminate(mid).await.unwrap();
        assert_eq!(
            kernel.pcb_table.get(grandchild).unwrap().parent_pid,
            Some(init)
        );
        assert!(kernel
            .pcb_table
            .get(init)
            .unwrap()
            .children
            .iter()
            .any(|&c| c == grandchild));
    }

    #[tokio::test]
    async fn terminate_closes_fds_above_two() {
        let (_tmp, mut kernel) = mounted_kernel();
        let pid = kernel.create(None, "p".into(), vec![]).unwrap();
        let key = fileops::open(
            kernel.fs.as_mut().unwrap(),
            &mut kernel.gdt,
            "a",
            crate::gdt::AccessMode::Write,
        )
        .unwrap();
        kernel.pcb_table.get_mut(pid).unwrap().fd_table[3] = Some(key.0);

        kernel.terminate(pid).await.unwrap();
        assert!(kernel.gdt.get(key).is_none());
        assert_eq!(kernel.pcb_table.get(pid).unwrap().fd_table[3], None);
    }

    #[tokio::test]
    async fn reap_zombie_removes_from_child_sequence() {
        let (_tmp, mut kernel) = mounted_kernel();
        let parent = kernel.create(None, "init".into(), vec![]).unwrap();
        let child = kernel.create(Some(parent), "c".into(), vec![]).unwrap();
        kernel.terminate(child).await.unwrap();
        kernel.reap_zombie(parent, child).await.unwrap();
        assert!(!kernel.pcb_table.contains(child));
        assert!(!kernel
            .pcb_table
            .get(parent)
            .unwrap()
            .children
            .iter()
            .any(|&c| c == child));
    }
}
