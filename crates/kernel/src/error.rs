//! The kernel-wide error kind enum (spec §7) and the perror-style string
//! table that the shell's `perror` wrapper reads from.
//!
//! Every syscall in [`crate::syscall`] returns `Result<T, KernelErrorKind>`.
//! The shell crate is the one place that turns that back into a C-style
//! sentinel (negative FD/PID, or -1) plus a message printed via
//! [`strerror`], matching spec.md's "single kind-enum ... every syscall
//! returns a sentinel on failure" error policy without forcing sentinel
//! values on every internal caller (the test suite wants real `Result`s).

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelErrorKind {
    #[error("operation not permitted")]
    NotPermitted,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("cannot allocate memory")]
    OutOfMemory,
    #[error("no such process")]
    NoSuchProcess,
    #[error("no child processes")]
    NoChild,
    #[error("bad file descriptor")]
    BadFd,
    #[error("input/output error")]
    Io,
    #[error("no space left on device")]
    NoSpace,
    #[error("read-only file system")]
    ReadOnly,
    #[error("file system not mounted")]
    NotMounted,
    #[error("table is full")]
    TableFull,
    #[error("file is in use")]
    FileInUse,
    #[error("permission denied")]
    PermissionDenied,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("no such file")]
    NoSuchFile,
    #[error("file exists")]
    Exists,
    #[error("is a directory")]
    IsDirectory,
    #[error("name too long")]
    NameTooLong,
    #[error("argument list too long")]
    ArgumentListTooLong,
    #[error("thread creation failed")]
    ThreadCreationFailed,
}

pub type KernelResult<T> = Result<T, KernelErrorKind>;

/// The perror string table (spec.md §1: "out of scope, specified only as
/// collaborator" — but the table itself lives here so both the shell and
/// the kernel's own `tracing` diagnostics speak the same words).
pub fn strerror(kind: KernelErrorKind) -> &'static str {
    match kind {
        KernelErrorKind::NotPermitted => "operation not permitted",
        KernelErrorKind::InvalidArgument => "invalid argument",
        KernelErrorKind::OutOfMemory => "cannot allocate memory",
        KernelErrorKind::NoSuchProcess => "no such process",
        KernelErrorKind::NoChild => "no child processes",
        KernelErrorKind::BadFd => "bad file descriptor",
        KernelErrorKind::Io => "input/output error",
        KernelErrorKind::NoSpace => "no space left on device",
        KernelErrorKind::ReadOnly => "read-only file system",
        KernelErrorKind::NotMounted => "file system not mounted",
        KernelErrorKind::TableFull => "table is full",
        KernelErrorKind::FileInUse => "file is in use",
        KernelErrorKind::PermissionDenied => "permission denied",
        KernelErrorKind::TooManyOpenFiles => "too many open files",
        KernelErrorKind::NoSuchFile => "no such file",
        KernelErrorKind::Exists => "file exists",
        KernelErrorKind::IsDirectory => "is a directory",
        KernelErrorKind::NameTooLong => "name too long",
        KernelErrorKind::ArgumentListTooLong => "argument list too long",
        KernelErrorKind::ThreadCreationFailed => "thread creation failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_a_message() {
        let kinds = [
            KernelErrorKind::NotPermitted,
            KernelErrorKind::InvalidArgument,
            KernelErrorKind::OutOfMemory,
            KernelErrorKind::NoSuchProcess,
            KernelErrorKind::NoChild,
            KernelErrorKind::BadFd,
            KernelErrorKind::Io,
            KernelErrorKind::NoSpace,
            KernelErrorKind::ReadOnly,
            KernelErrorKind::NotMounted,
            KernelErrorKind::TableFull,
            KernelErrorKind::FileInUse,
            KernelErrorKind::PermissionDenied,
            KernelErrorKind::TooManyOpenFiles,
            KernelErrorKind::NoSuchFile,
            KernelErrorKind::Exists,
            KernelErrorKind::IsDirectory,
            KernelErrorKind::NameTooLong,
            KernelErrorKind::ArgumentListTooLong,
            KernelErrorKind::ThreadCreationFailed,
        ];
        for kind in kinds {
            assert!(!strerror(kind).is_empty());
            assert_eq!(strerror(kind), kind.to_string());
        }
    }
}
