//! The boot sequence (spec §2): mount the filesystem, install host signal
//! handling, create init, have init spawn the shell, then drive the
//! scheduler loop until shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use pennsim_kernel::context::{Kernel, KernelConfig};
use pennsim_kernel::scheduler::{Scheduler, SliceOutcome};
use pennsim_kernel::syscall::{self, Awaited, UserBody};
use pennsim_kernel::thread::{Checkpoint, SuspendableThread};

use crate::builtins::shell_main;

pub async fn run(config: KernelConfig) -> Result<()> {
    let tick_period = std::time::Duration::from_millis(config.tick_ms);
    let schedule_weights = config.schedule_weights;
    let image_path = config.fs_image_path.clone();

    let mut kernel = Kernel::new(config);
    kernel
        .mount(&image_path)
        .with_context(|| format!("failed to mount {} (run pennsim-mkfs first)", image_path.display()))?;
    let kernel = Arc::new(tokio::sync::Mutex::new(kernel));

    pennsim_kernel::signals::install_host_signal_handlers()
        .context("failed to install host signal handlers")?;

    let init_pid = {
        let mut k = kernel.lock().await;
        k.create(None, "init".into(), vec![])?
    };

    let kernel_for_init = Arc::clone(&kernel);
    let init_thread = SuspendableThread::spawn(move |mut ctl| async move {
        let shell_body: UserBody = Box::new(|ctl, kernel, pid| Box::pin(shell_main(ctl, kernel, pid)));
        let shell_pid = match syscall::spawn(&kernel_for_init, init_pid, "sh".into(), vec!["sh".into()], shell_body, None).await {
            Ok(pid) => pid,
            Err(err) => {
                tracing::error!(error = %err, "failed to spawn the shell process");
                return;
            }
        };
        {
            let mut k = kernel_for_init.lock().await;
            k.foreground_pid = Some(shell_pid);
        }

        // Init's whole job from here on is reaping children (spec §4.2
        // orphan reparenting) until the shell itself exits.
        loop {
            match syscall::wait(&kernel_for_init, &mut ctl, init_pid, None, false).await {
                Awaited::Cancelled => break,
                Awaited::Done(Ok((pid, _status))) => {
                    if pid == shell_pid {
                        syscall::shutdown(&kernel_for_init).await;
                        break;
                    }
                }
                Awaited::Done(Err(_)) => {
                    if ctl.checkpoint().await == Checkpoint::Cancelled {
                        break;
                    }
                }
            }
        }
    });

    {
        let mut k = kernel.lock().await;
        k.pcb_table.get_mut(init_pid).expect("just created").thread = Some(init_thread);
        k.queues.enqueue(&k.pcb_table, init_pid);
    }

    let mut scheduler = Scheduler::new(schedule_weights, tick_period);
    loop {
        if scheduler.run_one_slice_shared(&kernel).await == SliceOutcome::ShutdownRequested {
            break;
        }
    }

    let mut k = kernel.lock().await;
    k.kill_all().await;
    Ok(())
}
