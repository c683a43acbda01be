//! Shared fixtures for the integration and property-based test suite (spec
//! §8 "Testable properties"). Everything else lives under `tests/`: each
//! file there exercises the kernel crate the way `crates/shell::boot` does,
//! through the real syscall surface and scheduler rather than through
//! `kernel::context::Kernel`'s internals directly.

use std::sync::Arc;

use pennsim_kernel::context::{Kernel, KernelConfig};
use pennsim_kernel::pcb::Pid;
use pennsim_kernel::syscall::KernelHandle;
use pennsim_kernel::thread::{SuspendableThread, ThreadControl};
use tempfile::NamedTempFile;

/// Formats, mounts, and wraps a fresh kernel behind the one real lock in the
/// system (SPEC_FULL.md §5), the same way `crates/shell::boot::run` does.
pub fn mounted_kernel_handle(fat_blocks: u16, block_size_index: u8) -> (NamedTempFile, KernelHandle) {
    let tmp = NamedTempFile::new().expect("tempfile");
    pennsim_kernel::fat::mkfs(tmp.path(), fat_blocks, block_size_index).expect("mkfs");
    let mut kernel = Kernel::new(KernelConfig::default());
    kernel.mount(tmp.path()).expect("mount");
    (tmp, Arc::new(tokio::sync::Mutex::new(kernel)))
}

/// Attaches `entry` as `pid`'s thread and enqueues it, the way
/// `crates/shell::boot` attaches init's thread to a PCB created directly via
/// [`Kernel::create`] rather than through [`pennsim_kernel::syscall::spawn`]
/// (which always creates its own child PCB).
pub async fn attach_thread<F, Fut>(kernel: &KernelHandle, pid: Pid, entry: F)
where
    F: FnOnce(ThreadControl) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let thread = SuspendableThread::spawn(entry);
    let mut k = kernel.lock().await;
    k.pcb_table.get_mut(pid).expect("pid must exist").thread = Some(thread);
    k.queues.enqueue(&k.pcb_table, pid);
}
