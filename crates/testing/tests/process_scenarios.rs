//! Process-kernel scenarios (spec §8): spawn/wait/sleep/kill driven through
//! the real scheduler loop, the same way `crates/shell::boot` drives it.

use std::sync::Arc;
use std::time::Duration;

use pennsim_kernel::gdt::AccessMode;
use pennsim_kernel::pcb::{ProcessState, INIT_PID, WAIT_BIT_EXITED};
use pennsim_kernel::scheduler::{Scheduler, SliceOutcome};
use pennsim_kernel::syscall::{self, Awaited, KernelHandle, UserBody};
use pennsim_testing::{attach_thread, mounted_kernel_handle};
use tokio::sync::Mutex as AsyncMutex;

async fn drive_until<F>(kernel: &KernelHandle, scheduler: &mut Scheduler, max_slices: usize, mut done: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..max_slices {
        if done() {
            return true;
        }
        if scheduler.run_one_slice_shared(kernel).await == SliceOutcome::ShutdownRequested {
            return done();
        }
    }
    done()
}

/// Scenario 3: a child sleeps 5 ticks then exits; the parent's `wait`
/// (called with `target = Some(child)`, `nohang = false`) does not return
/// until the child reaches ZOMBIE and reports EXITED. Mid-sleep, both
/// parent and child are BLOCKED.
#[tokio::test(start_paused = true)]
async fn scenario_3_parent_blocks_on_sleeping_child() {
    let (_tmp, kernel) = mounted_kernel_handle(1, 0);
    let parent = {
        let mut k = kernel.lock().await;
        k.create(None, "init".into(), vec![]).unwrap()
    };
    assert_eq!(parent, INIT_PID);

    let wait_result: Arc<AsyncMutex<Option<(u32, i32)>>> = Arc::new(AsyncMutex::new(None));
    let wait_result_task = Arc::clone(&wait_result);
    let kernel_for_parent = Arc::clone(&kernel);
    attach_thread(&kernel, parent, move |mut ctl| async move {
        if let Awaited::Done(Ok(result)) = syscall::wait(&kernel_for_parent, &mut ctl, parent, None, false).await {
            *wait_result_task.lock().await = Some(result);
        }
    })
    .await;

    let child_body: UserBody = Box::new(|mut ctl, kernel, pid| {
        Box::pin(async move {
            if let Awaited::Done(Ok(())) = syscall::sleep(&kernel, &mut ctl, pid, 5).await {
                let _ = syscall::exit(&kernel, pid).await;
            }
        })
    });
    let child = syscall::spawn(&kernel, parent, "c".into(), vec![], child_body, None)
        .await
        .unwrap();

    let mut scheduler = Scheduler::new([9, 6, 4], Duration::from_millis(1));

    // Drive a couple of slices: enough for the child to reach `sleep` and
    // the parent to reach `wait`, not enough for 5 ticks to elapse.
    for _ in 0..3 {
        scheduler.run_one_slice_shared(&kernel).await;
    }
    {
        let k = kernel.lock().await;
        assert_eq!(k.pcb_table.get(parent).unwrap().state, ProcessState::Blocked);
        assert_eq!(k.pcb_table.get(child).unwrap().state, ProcessState::Blocked);
    }

    let completed = drive_until(&kernel, &mut scheduler, 500, || {
        wait_result.try_lock().map(|g| g.is_some()).unwrap_or(false)
    })
    .await;
    assert!(completed, "parent's wait on the sleeping child never completed");

    let (reported_pid, status) = wait_result.lock().await.unwrap();
    assert_eq!(reported_pid, child);
    assert_eq!(status & WAIT_BIT_EXITED, WAIT_BIT_EXITED);
}

/// Scenario 5: a child opens a file for write, writes to it, and exits
/// without closing it; once the parent reaps the zombie, the file's GDT
/// entry has been released (spec §4.2 "FD closure on terminate"), so a
/// fresh process can open the same name for write immediately.
#[tokio::test(start_paused = true)]
async fn scenario_5_fd_table_closes_on_terminate() {
    let (_tmp, kernel) = mounted_kernel_handle(1, 0);
    let parent = {
        let mut k = kernel.lock().await;
        k.create(None, "init".into(), vec![]).unwrap()
    };

    let reaped: Arc<AsyncMutex<bool>> = Arc::new(AsyncMutex::new(false));
    let reaped_task = Arc::clone(&reaped);
    let kernel_for_parent = Arc::clone(&kernel);
    attach_thread(&kernel, parent, move |mut ctl| async move {
        if let Awaited::Done(Ok(_)) = syscall::wait(&kernel_for_parent, &mut ctl, parent, None, false).await {
            *reaped_task.lock().await = true;
        }
    })
    .await;

    let child_body: UserBody = Box::new(|_ctl, kernel, pid| {
        Box::pin(async move {
            let fd = {
                let mut k = kernel.lock().await;
                syscall::open(&mut k, pid, "log", AccessMode::Write).unwrap()
            };
            {
                let mut k = kernel.lock().await;
                syscall::write(&mut k, pid, fd, b"X").unwrap();
            }
            // Deliberately never closes `fd`; `exit` must clean it up.
            syscall::exit(&kernel, pid).await.unwrap();
        })
    });
    syscall::spawn(&kernel, parent, "w".into(), vec![], child_body, None)
        .await
        .unwrap();

    let mut scheduler = Scheduler::new([9, 6, 4], Duration::from_millis(1));
    let completed = drive_until(&kernel, &mut scheduler, 500, || {
        reaped.try_lock().map(|g| *g).unwrap_or(false)
    })
    .await;
    assert!(completed, "parent never reaped the writer child");

    let mut k = kernel.lock().await;
    let fd = syscall::open(&mut k, parent, "log", AccessMode::Write).unwrap();
    let n = syscall::write(&mut k, parent, fd, b"Y").unwrap();
    assert_eq!(n, 1);
}

/// Scenario 6: `kill(init, term)` is rejected; init is left untouched.
#[tokio::test]
async fn scenario_6_init_is_unkillable() {
    let (_tmp, kernel) = mounted_kernel_handle(1, 0);
    {
        let mut k = kernel.lock().await;
        let pid = k.create(None, "init".into(), vec![]).unwrap();
        assert_eq!(pid, INIT_PID);
    }

    let result = syscall::kill(&kernel, INIT_PID, 0).await;
    assert_eq!(result, Err(pennsim_kernel::KernelErrorKind::NotPermitted));

    let k = kernel.lock().await;
    let state = k.pcb_table.get(INIT_PID).unwrap().state;
    assert!(matches!(state, ProcessState::Ready | ProcessState::Blocked));
}

/// Invariant: after `terminate`, a child's former children are reparented
/// to init rather than left dangling (spec §4.2 orphan reparenting).
#[tokio::test(start_paused = true)]
async fn orphans_are_reparented_to_init() {
    let (_tmp, kernel) = mounted_kernel_handle(1, 0);
    let init = {
        let mut k = kernel.lock().await;
        k.create(None, "init".into(), vec![]).unwrap()
    };
    attach_thread(&kernel, init, |mut ctl| async move {
        loop {
            if ctl.checkpoint().await == pennsim_kernel::thread::Checkpoint::Cancelled {
                return;
            }
        }
    })
    .await;

    let grandchild_pid: Arc<AsyncMutex<Option<u32>>> = Arc::new(AsyncMutex::new(None));
    let grandchild_pid_task = Arc::clone(&grandchild_pid);
    let middle_body: UserBody = Box::new(|mut ctl, kernel, pid| {
        Box::pin(async move {
            let grandchild: UserBody = Box::new(|mut ctl, kernel, pid| {
                Box::pin(async move {
                    loop {
                        if ctl.checkpoint().await == pennsim_kernel::thread::Checkpoint::Cancelled {
                            let _ = syscall::exit(&kernel, pid).await;
                            return;
                        }
                    }
                })
            });
            let grandchild_pid = syscall::spawn(&kernel, pid, "grandchild".into(), vec![], grandchild, None)
                .await
                .unwrap();
            *grandchild_pid_task.lock().await = Some(grandchild_pid);
            let _ = ctl.checkpoint().await;
            syscall::exit(&kernel, pid).await.unwrap();
        })
    });
    syscall::spawn(&kernel, init, "middle".into(), vec![], middle_body, None)
        .await
        .unwrap();

    let mut scheduler = Scheduler::new([9, 6, 4], Duration::from_millis(1));
    for _ in 0..40 {
        scheduler.run_one_slice_shared(&kernel).await;
    }

    let grandchild_pid = grandchild_pid.lock().await.expect("grandchild must have spawned");
    let k = kernel.lock().await;
    let grandchild_pcb = k.pcb_table.get(grandchild_pid).unwrap();
    assert_eq!(grandchild_pcb.parent_pid, Some(init));
    assert!(k.pcb_table.get(init).unwrap().children.contains(&grandchild_pid));
}
