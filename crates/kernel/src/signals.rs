//! Kernel signals (spec §4.6) and the host-signal relay (spec §4.7).

use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::context::Kernel;
use crate::error::KernelResult;
use crate::pcb::{Pid, ProcessState};

/// The four kernel signals (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelSignal {
    Term,
    Stop,
    Cont,
    ChildStateChange,
}

/// Delivers `signal` to `pid` (spec §4.6). A missing PID is a silent no-op:
/// the target may have already been reaped by the time delivery runs.
pub async fn deliver(kernel: &mut Kernel, pid: Pid, signal: KernelSignal) -> KernelResult<()> {
    let state = match kernel.pcb_table.get(pid) {
        Some(pcb) => pcb.state,
        None => return Ok(()),
    };

    match signal {
        KernelSignal::Term => {
            if state != ProcessState::Zombie {
                if let Some(pcb) = kernel.pcb_table.get_mut(pid) {
                    pcb.exit_status = crate::pcb::ExitStatus::Signaled;
                }
                kernel.terminate(pid).await?;
            }
        }
        KernelSignal::Stop => {
            if state != ProcessState::Zombie {
                kernel
                    .queues
                    .stop(&mut kernel.pcb_table, &mut kernel.event_log, kernel.tick, pid);
            }
        }
        KernelSignal::Cont => {
            if state == ProcessState::Stopped {
                kernel.queues.continue_process(
                    &mut kernel.pcb_table,
                    &mut kernel.event_log,
                    kernel.tick,
                    pid,
                );
            }
        }
        KernelSignal::ChildStateChange => {
            // No direct action: surfaced through `wait` polling child state
            // (spec §4.6).
        }
    }
    Ok(())
}

/// Raw slot written by the host signal handlers below. A real Unix signal
/// handler may run at any instant on any host thread, so this is the one
/// piece of state in the whole kernel that isn't threaded through
/// [`Kernel`] — spec §4.7 describes it as "a volatile slot" for exactly
/// this reason.
static LAST_HOST_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_host_signal(raw: libc::c_int) {
    LAST_HOST_SIGNAL.store(raw, Ordering::SeqCst);
}

/// Installs handlers for SIGINT, SIGTSTP, and SIGQUIT that merely record
/// the signal number (spec §4.7). Call once at boot.
pub fn install_host_signal_handlers() -> KernelResult<()> {
    let action = SigAction::new(
        SigHandler::Handler(record_host_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTSTP, Signal::SIGQUIT] {
        unsafe { sigaction(signal, &action) }.map_err(|_| crate::error::KernelErrorKind::Io)?;
    }
    Ok(())
}

fn take_last_host_signal() -> Option<i32> {
    let raw = LAST_HOST_SIGNAL.swap(0, Ordering::SeqCst);
    if raw == 0 {
        None
    } else {
        Some(raw)
    }
}

fn map_host_signal(raw: i32) -> Option<KernelSignal> {
    let signal = Signal::try_from(raw).ok()?;
    match signal {
        Signal::SIGINT => Some(KernelSignal::Term),
        Signal::SIGTSTP => Some(KernelSignal::Stop),
        Signal::SIGQUIT => Some(KernelSignal::Term),
        _ => None,
    }
}

/// Drains the host-signal slot once (spec §4.7: "the scheduler loop drains
/// this slot once per iteration"). Ignored if the foreground id is invalid
/// or is init.
pub async fn drain_host_signal(kernel: &mut Kernel) -> KernelResult<()> {
    let Some(raw) = take_last_host_signal() else {
        return Ok(());
    };
    let Some(kernel_signal) = map_host_signal(raw) else {
        return Ok(());
    };
    let Some(foreground) = kernel.foreground_pid else {
        return Ok(());
    };
    if foreground == crate::pcb::INIT_PID {
        return Ok(());
    }
    deliver(kernel, foreground, kernel_signal).await
}
