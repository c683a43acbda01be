//! Filesystem-kernel scenarios and round-trip properties (spec §8), driven
//! directly through the `syscall` surface the way `crates/shell::builtins`
//! does, without a running scheduler — these operations never block.

use pennsim_kernel::fat::layout::{CHMOD_OP_ADD, CHMOD_OP_REMOVE, PERM_READ};
use pennsim_kernel::fat::NameStatus;
use pennsim_kernel::gdt::AccessMode;
use pennsim_kernel::pcb::INIT_PID;
use pennsim_kernel::{fileops, syscall, KernelErrorKind};
use pennsim_testing::mounted_kernel_handle;

async fn with_init(kernel: &pennsim_kernel::syscall::KernelHandle) {
    let mut k = kernel.lock().await;
    let pid = k.create(None, "init".into(), vec![]).unwrap();
    assert_eq!(pid, INIT_PID);
}

/// Scenario 1: write "hello" then read it back whole, then hit EOF.
#[tokio::test]
async fn scenario_1_write_then_read_then_eof() {
    let (_tmp, kernel) = mounted_kernel_handle(1, 0);
    with_init(&kernel).await;
    let mut k = kernel.lock().await;

    let fd = syscall::open(&mut k, INIT_PID, "a", AccessMode::Write).unwrap();
    assert_eq!(syscall::write(&mut k, INIT_PID, fd, b"hello").unwrap(), 5);
    syscall::close(&mut k, INIT_PID, fd).unwrap();

    let fd = syscall::open(&mut k, INIT_PID, "a", AccessMode::Read).unwrap();
    let buf = syscall::read(&mut k, INIT_PID, fd, 16).unwrap();
    assert_eq!(buf, b"hello");

    // Past-size reads are EOF (0 bytes), not an error (spec §9 Open Question).
    let buf = syscall::read(&mut k, INIT_PID, fd, 16).unwrap();
    assert!(buf.is_empty());
}

/// Scenario 2: unlink a file that's still open for write (deferred delete);
/// a fresh `open` of the same name succeeds immediately, and once the
/// original writer closes, the directory holds exactly one active "a".
#[tokio::test]
async fn scenario_2_unlink_while_open_then_reopen() {
    let (_tmp, kernel) = mounted_kernel_handle(1, 0);
    with_init(&kernel).await;
    let mut k = kernel.lock().await;

    let fd = syscall::open(&mut k, INIT_PID, "a", AccessMode::Write).unwrap();
    syscall::write(&mut k, INIT_PID, fd, b"hi").unwrap();
    syscall::unlink(&mut k, "a").unwrap();

    let fd2 = syscall::open(&mut k, INIT_PID, "a", AccessMode::Write).unwrap();
    assert_ne!(fd2, fd);

    syscall::close(&mut k, INIT_PID, fd).unwrap();

    let fs = k.fs.as_ref().unwrap();
    let active: Vec<_> = fs
        .list_active_entries()
        .unwrap()
        .into_iter()
        .filter(|e| e.name_str() == "a")
        .collect();
    assert_eq!(active.len(), 1);

    syscall::close(&mut k, INIT_PID, fd2).unwrap();
}

/// Write-then-seek-then-read round-trips for an interior region of a file.
#[tokio::test]
async fn write_then_seek_then_read_round_trips() {
    let (_tmp, kernel) = mounted_kernel_handle(2, 0);
    with_init(&kernel).await;
    let mut k = kernel.lock().await;

    let fd = syscall::open(&mut k, INIT_PID, "b", AccessMode::Write).unwrap();
    syscall::write(&mut k, INIT_PID, fd, b"0123456789").unwrap();
    syscall::close(&mut k, INIT_PID, fd).unwrap();

    let fd = syscall::open(&mut k, INIT_PID, "b", AccessMode::Read).unwrap();
    syscall::seek(&mut k, INIT_PID, fd, 3, fileops::Whence::Set).unwrap();
    let buf = syscall::read(&mut k, INIT_PID, fd, 4).unwrap();
    assert_eq!(buf, b"3456");
}

/// chmod +r then -r round-trips to the original permission word.
#[tokio::test]
async fn chmod_add_then_remove_round_trips() {
    let (_tmp, kernel) = mounted_kernel_handle(1, 0);
    with_init(&kernel).await;
    let mut k = kernel.lock().await;

    let fd = syscall::open(&mut k, INIT_PID, "c", AccessMode::Write).unwrap();
    syscall::close(&mut k, INIT_PID, fd).unwrap();

    let fs = k.fs.as_ref().unwrap();
    let (_found, offset) = fs.find_file("c").unwrap();
    let before = fs.read_entry_at(offset as u64).unwrap().perm;

    syscall::chmod(&mut k, "c", CHMOD_OP_ADD | PERM_READ).unwrap();
    syscall::chmod(&mut k, "c", CHMOD_OP_REMOVE | PERM_READ).unwrap();

    let fs = k.fs.as_ref().unwrap();
    let (_found, offset) = fs.find_file("c").unwrap();
    let after = fs.read_entry_at(offset as u64).unwrap().perm;
    assert_eq!(before, after);
}

/// rename(x, y) then rename(y, x) preserves content and first block.
#[tokio::test]
async fn rename_there_and_back_preserves_content() {
    let (_tmp, kernel) = mounted_kernel_handle(1, 0);
    with_init(&kernel).await;
    let mut k = kernel.lock().await;

    let fd = syscall::open(&mut k, INIT_PID, "d", AccessMode::Write).unwrap();
    syscall::write(&mut k, INIT_PID, fd, b"payload").unwrap();
    syscall::close(&mut k, INIT_PID, fd).unwrap();

    let fs = k.fs.as_ref().unwrap();
    let (_found, offset) = fs.find_file("d").unwrap();
    let before = fs.read_entry_at(offset as u64).unwrap();

    syscall::rename(&mut k, "d", "e").unwrap();
    syscall::rename(&mut k, "e", "d").unwrap();

    let fs = k.fs.as_ref().unwrap();
    let (_found, offset) = fs.find_file("d").unwrap();
    let after = fs.read_entry_at(offset as u64).unwrap();

    assert_eq!(before.first_block, after.first_block);
    let fd = syscall::open(&mut k, INIT_PID, "d", AccessMode::Read).unwrap();
    let buf = syscall::read(&mut k, INIT_PID, fd, 16).unwrap();
    assert_eq!(buf, b"payload");
}

/// Invariant: unlinking a file nobody has open removes it outright — a
/// reopen for read sees `NoSuchFile`, not the old content.
#[tokio::test]
async fn unlink_with_no_open_writers_removes_outright() {
    let (_tmp, kernel) = mounted_kernel_handle(1, 0);
    with_init(&kernel).await;
    let mut k = kernel.lock().await;

    let fd = syscall::open(&mut k, INIT_PID, "f", AccessMode::Write).unwrap();
    syscall::write(&mut k, INIT_PID, fd, b"gone soon").unwrap();
    syscall::close(&mut k, INIT_PID, fd).unwrap();

    syscall::unlink(&mut k, "f").unwrap();

    let err = syscall::open(&mut k, INIT_PID, "f", AccessMode::Read).unwrap_err();
    assert_eq!(err, KernelErrorKind::NoSuchFile);
}

/// Invariant: two writers on the same name can never coexist — the second
/// `open(WRITE)` on an in-use name fails with `FileInUse` rather than
/// silently sharing the first writer's cursor.
#[tokio::test]
async fn second_writer_on_same_name_is_rejected() {
    let (_tmp, kernel) = mounted_kernel_handle(1, 0);
    with_init(&kernel).await;
    let mut k = kernel.lock().await;

    let fd = syscall::open(&mut k, INIT_PID, "g", AccessMode::Write).unwrap();
    let err = syscall::open(&mut k, INIT_PID, "g", AccessMode::Write).unwrap_err();
    assert_eq!(err, KernelErrorKind::FileInUse);

    syscall::close(&mut k, INIT_PID, fd).unwrap();
}

/// Directory-entry invariant: a tombstoned (deferred-delete) slot is never
/// reported by `list_active_entries`, even while a writer still has it open.
#[tokio::test]
async fn tombstoned_entries_are_never_active() {
    let (_tmp, kernel) = mounted_kernel_handle(1, 0);
    with_init(&kernel).await;
    let mut k = kernel.lock().await;

    let fd = syscall::open(&mut k, INIT_PID, "h", AccessMode::Write).unwrap();
    syscall::unlink(&mut k, "h").unwrap();

    let fs = k.fs.as_ref().unwrap();
    for entry in fs.list_active_entries().unwrap() {
        assert_ne!(entry.status(), NameStatus::Tombstoned);
        assert_ne!(entry.name_str(), "h");
    }

    syscall::close(&mut k, INIT_PID, fd).unwrap();
}
