//! The syscall surface (spec §4.8): per-process FD table ↔ GDT mapping,
//! `spawn` with its redirection wrapper, `wait`, `kill`, `exit`, `nice`,
//! `sleep`, `shutdown`.
//!
//! Every function here takes a [`KernelHandle`] (`Arc<tokio::sync::Mutex<Kernel>>`)
//! rather than a bare `&mut Kernel`: syscalls that can block (`wait`,
//! `sleep`) are called from inside a spawned user thread's own task body,
//! which must release the lock before calling back into
//! [`crate::thread::ThreadControl::checkpoint`] to actually suspend itself
//! (spec §9 Design Note, SPEC_FULL.md §5).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::context::Kernel;
use crate::error::{KernelErrorKind, KernelResult};
use crate::eventlog::{EventKind, EventRecord};
use crate::fileops;
use crate::gdt::{AccessMode, GdtKey};
use crate::pcb::{ExitStatus, Pid, Priority, ProcessState, INIT_PID};
use crate::signals::{self, KernelSignal};
use crate::thread::{BoxedEntry, Checkpoint, SuspendableThread, ThreadControl};

pub type KernelHandle = Arc<Mutex<Kernel>>;

/// A process's body, constructed by the caller of [`spawn`]. Receives its
/// own [`ThreadControl`] (to checkpoint between units of work) plus the
/// shared kernel handle and its own PID (to make further syscalls).
pub type UserBody = Box<
    dyn FnOnce(ThreadControl, KernelHandle, Pid) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send,
>;

/// Whether a blocking syscall completed or observed cancellation mid-wait
/// (spec §4.5 "Cancellation"). A task body seeing `Cancelled` must treat it
/// as an exit point and return, not retry the call.
#[derive(Debug)]
pub enum Awaited<T> {
    Done(T),
    Cancelled,
}

/// Adapts a `Result<i64, _>` outcome to the C-shell sentinel convention
/// (spec §7: "every syscall returns a sentinel ... on failure").
pub fn as_sentinel(result: KernelResult<i64>) -> i64 {
    result.unwrap_or(-1)
}

fn fd_to_gdt_key(kernel: &Kernel, pid: Pid, fd: usize) -> KernelResult<GdtKey> {
    let pcb = kernel.pcb_table.get(pid).ok_or(KernelErrorKind::NoSuchProcess)?;
    let slot = pcb
        .fd_table
        .get(fd)
        .copied()
        .flatten()
        .ok_or(KernelErrorKind::BadFd)?;
    Ok(GdtKey(slot))
}

fn first_free_fd_slot(kernel: &Kernel, pid: Pid) -> KernelResult<usize> {
    let pcb = kernel.pcb_table.get(pid).ok_or(KernelErrorKind::NoSuchProcess)?;
    pcb.fd_table
        .iter()
        .enumerate()
        .skip(3)
        .find(|(_, slot)| slot.is_none())
        .map(|(index, _)| index)
        .ok_or(KernelErrorKind::TooManyOpenFiles)
}

/// `open` (spec §4.4/§4.8): resolves a free FD slot in `pid`'s table, opens
/// the file via [`fileops::open`], and records the GDT key in that slot.
pub fn open(kernel: &mut Kernel, pid: Pid, name: &str, access: AccessMode) -> KernelResult<usize> {
    let result: KernelResult<usize> = (|| {
        let fd = first_free_fd_slot(kernel, pid)?;
        let fs = kernel.fs.as_mut().ok_or(KernelErrorKind::NotMounted)?;
        let key = fileops::open(fs, &mut kernel.gdt, name, access)?;
        kernel.pcb_table.get_mut(pid).expect("validated above").fd_table[fd] = Some(key.0);
        Ok(fd)
    })();
    match &result {
        Ok(fd) => tracing::trace!(pid, name, ?access, fd, "open"),
        Err(err) => tracing::warn!(pid, name, ?access, error = %err, "open failed"),
    }
    result
}

pub fn read(kernel: &mut Kernel, pid: Pid, fd: usize, n: usize) -> KernelResult<Vec<u8>> {
    let key = fd_to_gdt_key(kernel, pid, fd)?;
    let fs = kernel.fs.as_ref().ok_or(KernelErrorKind::NotMounted)?;
    let result = fileops::read(fs, &mut kernel.gdt, key, n);
    match &result {
        Ok(buf) => tracing::trace!(pid, fd, requested = n, got = buf.len(), "read"),
        Err(err) => tracing::warn!(pid, fd, error = %err, "read failed"),
    }
    result
}

pub fn write(kernel: &mut Kernel, pid: Pid, fd: usize, bytes: &[u8]) -> KernelResult<usize> {
    let key = fd_to_gdt_key(kernel, pid, fd)?;
    let fs = kernel.fs.as_mut().ok_or(KernelErrorKind::NotMounted)?;
    let result = fileops::write(fs, &mut kernel.gdt, key, bytes);
    match &result {
        Ok(written) => tracing::trace!(pid, fd, written, "write"),
        Err(err) => tracing::warn!(pid, fd, error = %err, "write failed"),
    }
    result
}

pub fn close(kernel: &mut Kernel, pid: Pid, fd: usize) -> KernelResult<()> {
    let key = fd_to_gdt_key(kernel, pid, fd)?;
    let fs = kernel.fs.as_mut().ok_or(KernelErrorKind::NotMounted)?;
    let result = fileops::close(fs, &mut kernel.gdt, key);
    if result.is_ok() {
        kernel.pcb_table.get_mut(pid).expect("validated above").fd_table[fd] = None;
        tracing::trace!(pid, fd, "close");
    } else if let Err(err) = &result {
        tracing::warn!(pid, fd, error = %err, "close failed");
    }
    result
}

pub fn seek(
    kernel: &mut Kernel,
    pid: Pid,
    fd: usize,
    offset: i64,
    whence: fileops::Whence,
) -> KernelResult<u32> {
    let key = fd_to_gdt_key(kernel, pid, fd)?;
    fileops::seek(&mut kernel.gdt, key, offset, whence)
}

pub fn unlink(kernel: &mut Kernel, name: &str) -> KernelResult<()> {
    let fs = kernel.fs.as_mut().ok_or(KernelErrorKind::NotMounted)?;
    let result = fileops::unlink(fs, &mut kernel.gdt, name);
    match &result {
        Ok(()) => tracing::debug!(name, "unlink"),
        Err(err) => tracing::warn!(name, error = %err, "unlink failed"),
    }
    result
}

pub fn chmod(kernel: &mut Kernel, name: &str, mode_word: u8) -> KernelResult<()> {
    let fs = kernel.fs.as_mut().ok_or(KernelErrorKind::NotMounted)?;
    let result = fileops::chmod(fs, name, mode_word);
    match &result {
        Ok(()) => tracing::debug!(name, mode_word, "chmod"),
        Err(err) => tracing::warn!(name, error = %err, "chmod failed"),
    }
    result
}

pub fn rename(kernel: &mut Kernel, src: &str, dst: &str) -> KernelResult<()> {
    let fs = kernel.fs.as_mut().ok_or(KernelErrorKind::NotMounted)?;
    let result = fileops::rename(fs, &mut kernel.gdt, src, dst);
    match &result {
        Ok(()) => tracing::debug!(src, dst, "rename"),
        Err(err) => tracing::warn!(src, dst, error = %err, "rename failed"),
    }
    result
}

/// Redirection request for [`spawn`] (spec §4.8 step 2).
#[derive(Debug, Clone, Default)]
pub struct SpawnRedirect {
    pub stdin_path: Option<String>,
    pub stdout_path: Option<String>,
    pub append: bool,
}

struct SavedStreams {
    stdin: Option<usize>,
    stdout: Option<usize>,
}

async fn apply_redirection(
    kernel: &KernelHandle,
    pid: Pid,
    redirect: &SpawnRedirect,
) -> KernelResult<SavedStreams> {
    let mut k = kernel.lock().await;
    let saved = SavedStreams {
        stdin: k.pcb_table.get(pid).expect("child pid must exist").fd_table[0],
        stdout: k.pcb_table.get(pid).expect("child pid must exist").fd_table[1],
    };

    if let Some(path) = &redirect.stdout_path {
        let access = if redirect.append { AccessMode::Append } else { AccessMode::Write };
        let fs = k.fs.as_mut().ok_or(KernelErrorKind::NotMounted)?;
        let key = fileops::open(fs, &mut k.gdt, path, access)?;
        k.pcb_table.get_mut(pid).expect("child pid must exist").fd_table[1] = Some(key.0);
    }
    if let Some(path) = &redirect.stdin_path {
        let fs = k.fs.as_mut().ok_or(KernelErrorKind::NotMounted)?;
        let key = fileops::open(fs, &mut k.gdt, path, AccessMode::Read)?;
        k.pcb_table.get_mut(pid).expect("child pid must exist").fd_table[0] = Some(key.0);
    }
    Ok(saved)
}

/// Restores the saved stdin/stdout slots, closing whatever redirection
/// [`apply_redirection`] installed first (spec §4.8: "the wrapper registers
/// a cleanup hook that restores the saved slots on any exit path").
async fn restore_redirection(kernel: &KernelHandle, pid: Pid, saved: SavedStreams) {
    let mut k = kernel.lock().await;
    let current_stdin = k.pcb_table.get(pid).map(|p| p.fd_table[0]).unwrap_or(None);
    let current_stdout = k.pcb_table.get(pid).map(|p| p.fd_table[1]).unwrap_or(None);

    if current_stdin != saved.stdin {
        if let Some(gdt_index) = current_stdin {
            if let Some(fs) = k.fs.as_mut() {
                let _ = fileops::close(fs, &mut k.gdt, GdtKey(gdt_index));
            }
        }
    }
    if current_stdout != saved.stdout {
        if let Some(gdt_index) = current_stdout {
            if let Some(fs) = k.fs.as_mut() {
                let _ = fileops::close(fs, &mut k.gdt, GdtKey(gdt_index));
            }
        }
    }

    if let Some(pcb) = k.pcb_table.get_mut(pid) {
        pcb.fd_table[0] = saved.stdin;
        pcb.fd_table[1] = saved.stdout;
    }
}

/// `spawn(func, argv, stdin_path?, stdout_path?, append?)` (spec §4.8).
pub async fn spawn(
    kernel: &KernelHandle,
    parent: Pid,
    command: String,
    argv: Vec<String>,
    body: UserBody,
    redirect: Option<SpawnRedirect>,
) -> KernelResult<Pid> {
    if let Some(r) = &redirect {
        if r.append && r.stdin_path.is_some() && r.stdout_path.is_some() && r.stdin_path == r.stdout_path {
            return Err(KernelErrorKind::InvalidArgument);
        }
    }

    let child_pid = {
        let mut k = kernel.lock().await;
        k.create(Some(parent), command.clone(), argv)?
    };
    tracing::debug!(parent, child = child_pid, command, "spawn");

    let kernel_for_task = Arc::clone(kernel);
    let entry: BoxedEntry = Box::new(move |ctl: ThreadControl| {
        Box::pin(async move {
            match redirect {
                None => body(ctl, kernel_for_task, child_pid).await,
                Some(redirect) => {
                    match apply_redirection(&kernel_for_task, child_pid, &redirect).await {
                        Ok(saved) => {
                            body(ctl, Arc::clone(&kernel_for_task), child_pid).await;
                            restore_redirection(&kernel_for_task, child_pid, saved).await;
                        }
                        Err(_) => {
                            let mut k = kernel_for_task.lock().await;
                            if let Some(pcb) = k.pcb_table.get_mut(child_pid) {
                                pcb.exit_status = ExitStatus::Exited;
                            }
                            let _ = k.terminate(child_pid).await;
                        }
                    }
                }
            }
        })
    });

    {
        let mut k = kernel.lock().await;
        k.pcb_table.get_mut(child_pid).expect("just created").thread =
            Some(SuspendableThread::spawn(entry));
        k.queues.enqueue(&k.pcb_table, child_pid);
    }

    Ok(child_pid)
}

async fn try_wait_once(
    kernel: &mut Kernel,
    caller: Pid,
    target: Option<Pid>,
) -> KernelResult<Option<(Pid, i32)>> {
    let children: Vec<Pid> = kernel
        .pcb_table
        .get(caller)
        .ok_or(KernelErrorKind::NoSuchProcess)?
        .children
        .iter()
        .copied()
        .collect();
    if children.is_empty() {
        return Err(KernelErrorKind::NoChild);
    }
    if let Some(target_pid) = target {
        if !children.contains(&target_pid) {
            return Err(KernelErrorKind::NoSuchProcess);
        }
    }
    let candidates: Vec<Pid> = match target {
        Some(pid) => vec![pid],
        None => children,
    };

    for pid in &candidates {
        let is_zombie = kernel
            .pcb_table
            .get(*pid)
            .map(|p| p.state == ProcessState::Zombie)
            .unwrap_or(false);
        if is_zombie {
            let status = kernel.pcb_table.get(*pid).unwrap().exit_status.wait_bit();
            kernel.reap_zombie(caller, *pid).await?;
            return Ok(Some((*pid, status)));
        }
    }

    for pid in &candidates {
        let unreported_stop = kernel
            .pcb_table
            .get(*pid)
            .map(|p| p.state == ProcessState::Stopped && !p.stopped_reported)
            .unwrap_or(false);
        if unreported_stop {
            if let Some(pcb) = kernel.pcb_table.get_mut(*pid) {
                pcb.stopped_reported = true;
            }
            return Ok(Some((*pid, ExitStatus::Stopped.wait_bit())));
        }
    }

    Ok(None)
}

/// `wait(pid, nohang)` (spec §4.8). `target = None` matches any child.
pub async fn wait(
    kernel: &KernelHandle,
    ctl: &mut ThreadControl,
    caller: Pid,
    target: Option<Pid>,
    nohang: bool,
) -> Awaited<KernelResult<(Pid, i32)>> {
    tracing::trace!(caller, target = ?target, nohang, "wait");
    loop {
        let outcome = {
            let mut k = kernel.lock().await;
            try_wait_once(&mut k, caller, target).await
        };
        match outcome {
            Err(err) => return Awaited::Done(Err(err)),
            Ok(Some(result)) => return Awaited::Done(Ok(result)),
            Ok(None) => {
                if nohang {
                    return Awaited::Done(Ok((0, 0)));
                }
                {
                    let mut k = kernel.lock().await;
                    if let Some(pcb) = k.pcb_table.get_mut(caller) {
                        pcb.wake_tick = 0;
                    }
                    let tick = k.tick;
                    k.queues.block(&mut k.pcb_table, &mut k.event_log, tick, caller);
                }
                if ctl.checkpoint().await == Checkpoint::Cancelled {
                    return Awaited::Cancelled;
                }
            }
        }
    }
}

/// `sleep(ticks)` (spec §4.8). A no-op for `ticks == 0`.
pub async fn sleep(
    kernel: &KernelHandle,
    ctl: &mut ThreadControl,
    caller: Pid,
    ticks: u64,
) -> Awaited<KernelResult<()>> {
    tracing::trace!(caller, ticks, "sleep");
    if ticks == 0 {
        return Awaited::Done(Ok(()));
    }
    let wake_at = {
        let k = kernel.lock().await;
        k.tick + ticks
    };
    loop {
        {
            let mut k = kernel.lock().await;
            if let Some(pcb) = k.pcb_table.get_mut(caller) {
                pcb.wake_tick = wake_at;
            }
            let tick = k.tick;
            k.queues.block(&mut k.pcb_table, &mut k.event_log, tick, caller);
        }
        if ctl.checkpoint().await == Checkpoint::Cancelled {
            return Awaited::Cancelled;
        }
        let woke_naturally = {
            let k = kernel.lock().await;
            k.pcb_table.get(caller).map(|p| p.wake_tick == 0).unwrap_or(true)
        };
        if woke_naturally {
            return Awaited::Done(Ok(()));
        }
    }
}

/// `kill(pid, signal)` (spec §4.8): 0 = term, 1 = stop, 2 = cont. Init is
/// unkillable.
pub async fn kill(kernel: &KernelHandle, pid: Pid, signal: i32) -> KernelResult<()> {
    if pid == INIT_PID {
        return Err(KernelErrorKind::NotPermitted);
    }
    let kernel_signal = match signal {
        0 => KernelSignal::Term,
        1 => KernelSignal::Stop,
        2 => KernelSignal::Cont,
        _ => return Err(KernelErrorKind::InvalidArgument),
    };
    tracing::debug!(pid, signal, "kill");
    let mut k = kernel.lock().await;
    signals::deliver(&mut k, pid, kernel_signal).await
}

/// `exit` (spec §4.8): sets EXITED, logs it, terminates the caller. Because
/// `terminate` closes FDs >= 3, leakage across exits is structurally
/// impossible. The caller's task body must return immediately afterward.
pub async fn exit(kernel: &KernelHandle, pid: Pid) -> KernelResult<()> {
    tracing::debug!(pid, "exit");
    let mut k = kernel.lock().await;
    if let Some(pcb) = k.pcb_table.get_mut(pid) {
        pcb.exit_status = ExitStatus::Exited;
    }
    let record = {
        let pcb = k.pcb_table.get(pid).ok_or(KernelErrorKind::NoSuchProcess)?;
        EventRecord {
            tick: k.tick,
            kind: EventKind::Exited,
            pid,
            ppid: pcb.parent_pid.unwrap_or(0),
            state: pcb.state,
            priority: pcb.priority,
            command: pcb.command.clone(),
            nice_old: None,
            nice_new: None,
        }
    };
    k.event_log.record(record);
    k.terminate(pid).await
}

/// `nice(pid, prio)` (spec §4.8).
pub async fn nice(kernel: &KernelHandle, pid: Pid, prio: u8) -> KernelResult<()> {
    let priority = Priority::from_u8(prio).ok_or(KernelErrorKind::InvalidArgument)?;
    tracing::debug!(pid, prio, "nice");
    let mut k = kernel.lock().await;
    let tick = k.tick;
    k.queues.set_priority(&mut k.pcb_table, &mut k.event_log, tick, pid, priority);
    Ok(())
}

/// `shutdown` (spec §4.8).
pub async fn shutdown(kernel: &KernelHandle) {
    tracing::info!("shutdown requested");
    let mut k = kernel.lock().await;
    k.shutdown = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::KernelConfig;
    use tempfile::NamedTempFile;

    async fn mounted_handle() -> (NamedTempFile, KernelHandle) {
        let tmp = NamedTempFile::new().unwrap();
        crate::fat::core::mkfs(tmp.path(), 1, 0).unwrap();
        let mut kernel = Kernel::new(KernelConfig::default());
        kernel.mount(tmp.path()).unwrap();
        let init = kernel.create(None, "init".into(), vec![]).unwrap();
        assert_eq!(init, INIT_PID);
        (tmp, Arc::new(Mutex::new(kernel)))
    }

    #[tokio::test]
    async fn open_write_close_then_reopen_read_round_trips() {
        let (_tmp, handle) = mounted_handle().await;
        let mut k = handle.lock().await;
        let pid = INIT_PID;
        let fd = open(&mut k, pid, "a", AccessMode::Write).unwrap();
        write(&mut k, pid, fd, b"hello").unwrap();
        close(&mut k, pid, fd).unwrap();

        let fd = open(&mut k, pid, "a", AccessMode::Read).unwrap();
        let buf = read(&mut k, pid, fd, 16).unwrap();
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn kill_init_is_not_permitted() {
        let (_tmp, handle) = mounted_handle().await;
        let result = kill(&handle, INIT_PID, 0).await;
        assert_eq!(result, Err(KernelErrorKind::NotPermitted));
    }

    #[tokio::test]
    async fn spawn_then_exit_then_wait_reports_exited() {
        let (_tmp, handle) = mounted_handle().await;
        // This body never calls `ctl.checkpoint()`: it has no slice-sized
        // units of work, it just exits as soon as tokio schedules it.
        let body: UserBody = Box::new(|_ctl, kernel, pid| {
            Box::pin(async move {
                exit(&kernel, pid).await.unwrap();
            })
        });
        let child = spawn(&handle, INIT_PID, "c".into(), vec![], body, None)
            .await
            .unwrap();

        // Poll wait with nohang until the child's task has actually run and
        // reached ZOMBIE (it shares this runtime with the test itself).
        let mut attempts = 0;
        loop {
            let mut k = handle.lock().await;
            match try_wait_once(&mut k, INIT_PID, Some(child)).await.unwrap() {
                Some((pid, status)) => {
                    assert_eq!(pid, child);
                    assert_eq!(status & crate::pcb::WAIT_BIT_EXITED, crate::pcb::WAIT_BIT_EXITED);
                    break;
                }
                None => {
                    drop(k);
                    attempts += 1;
                    assert!(attempts < 50, "child never reached zombie");
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
            }
        }
    }

    #[test]
    fn as_sentinel_maps_error_to_negative_one() {
        assert_eq!(as_sentinel(Ok(7)), 7);
        assert_eq!(as_sentinel(Err(KernelErrorKind::BadFd)), -1);
    }
}
