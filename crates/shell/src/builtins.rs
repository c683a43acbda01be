//! Built-in command implementations (spec §1: "out of scope, specified
//! only as collaborators... thin wrappers over syscalls"; spec §6 "Shell
//! surface"). Every command here does real work, but none of it is
//! correctness-load-bearing: the hard engineering is in
//! `pennsim_kernel::{syscall, fileops, context}`.

use std::io::Write as _;

use pennsim_kernel::fat::NameStatus;
use pennsim_kernel::gdt::{AccessMode, GdtKey};
use pennsim_kernel::pcb::{Pid, ProcessState, WAIT_BIT_EXITED, WAIT_BIT_SIGNALED, WAIT_BIT_STOPPED};
use pennsim_kernel::syscall::{self, Awaited, KernelHandle, SpawnRedirect, UserBody};
use pennsim_kernel::thread::{Checkpoint, ThreadControl};
use tokio::io::AsyncBufReadExt;
use pennsim_kernel::{fileops, strerror, KernelErrorKind};

use crate::parser::{parse_line, ParsedLine};

/// A backgrounded or recently-foregrounded command, tracked only by the
/// shell process itself (spec §6 `jobs`/`bg`/`fg` — job-control state is a
/// shell concern, not a kernel one).
struct Job {
    id: usize,
    pid: Pid,
    command: String,
}

struct ShellState {
    jobs: Vec<Job>,
    next_job_id: usize,
}

impl ShellState {
    fn new() -> ShellState {
        ShellState { jobs: Vec::new(), next_job_id: 1 }
    }

    fn add(&mut self, pid: Pid, command: String) -> usize {
        let id = self.next_job_id;
        self.next_job_id += 1;
        self.jobs.push(Job { id, pid, command });
        id
    }

    fn remove_by_pid(&mut self, pid: Pid) {
        self.jobs.retain(|j| j.pid != pid);
    }

    fn find(&self, id: Option<usize>) -> Option<&Job> {
        match id {
            Some(id) => self.jobs.iter().find(|j| j.id == id),
            None => self.jobs.last(),
        }
    }
}

/// Static one-line description table (spec §6 `man`: "reads from a static
/// table of one-line descriptions (no man-page files)").
const MAN_TABLE: &[(&str, &str)] = &[
    ("mkfs", "format a new filesystem image"),
    ("mount", "mount the filesystem image"),
    ("unmount", "unmount the filesystem image"),
    ("ls", "list files in the filesystem"),
    ("touch", "create an empty file"),
    ("cat", "print files to stdout, or redirect stdin into a file with -w/-a"),
    ("chmod", "change file permissions"),
    ("rm", "remove a file"),
    ("mv", "rename a file"),
    ("cp", "copy a file; -h copies from the host filesystem"),
    ("ps", "list processes"),
    ("kill", "send a signal to a process: -term, -stop, -cont"),
    ("nice", "spawn a command at a given priority"),
    ("nice_pid", "change the priority of a running process"),
    ("sleep", "block the calling process for a number of ticks"),
    ("busy", "spin forever, yielding at every scheduler checkpoint"),
    ("echo", "print arguments to stdout"),
    ("jobs", "list background jobs"),
    ("bg", "resume a stopped job in the background"),
    ("fg", "resume a stopped job and wait for it"),
    ("logout", "shut down the kernel"),
    ("man", "show the one-line description for a command"),
];

/// The shell process's own task body (spec §2: "Init spawns a shell PCB").
/// Reads lines from the host terminal, parses them, and dispatches.
pub async fn shell_main(mut ctl: ThreadControl, kernel: KernelHandle, pid: Pid) {
    let mut state = ShellState::new();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin());

    loop {
        print!("pennsim$ ");
        let _ = std::io::stdout().flush();

        let mut buf = String::new();
        let n = match lines.read_line(&mut buf).await {
            Ok(n) => n,
            Err(_) => break,
        };
        if n == 0 {
            break; // EOF on stdin: treat as logout.
        }
        let line = buf.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            continue;
        }

        let parsed = match parse_line(line) {
            Ok(parsed) => parsed,
            Err(err) => {
                println!("pennsim: {err}");
                continue;
            }
        };

        if matches!(parsed.argv[0].as_str(), "logout" | "exit") {
            syscall::shutdown(&kernel).await;
            break;
        }

        if dispatch_line(&kernel, &mut ctl, pid, &parsed, &mut state).await == Outcome::Cancelled {
            break;
        }
    }

    let _ = syscall::exit(&kernel, pid).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Continued,
    Cancelled,
}

/// Dispatches one parsed command line. Commands that mutate shell-local
/// state (`jobs`, `bg`, `fg`, `mount`, `unmount`, `man`) run directly in the
/// shell's own task; everything else is spawned as a child (spec §4.8
/// `spawn`), matching a real shell forking off each external command.
async fn dispatch_line(
    kernel: &KernelHandle,
    ctl: &mut ThreadControl,
    shell_pid: Pid,
    parsed: &ParsedLine,
    state: &mut ShellState,
) -> Outcome {
    let cmd = parsed.argv[0].as_str();
    match cmd {
        "man" => {
            let topic = parsed.argv.get(1).map(String::as_str);
            match topic {
                Some(topic) => match MAN_TABLE.iter().find(|(name, _)| *name == topic) {
                    Some((_, desc)) => println!("{topic}: {desc}"),
                    None => println!("man: no entry for {topic}"),
                },
                None => {
                    for (name, desc) in MAN_TABLE {
                        println!("{name:<10} {desc}");
                    }
                }
            }
            Outcome::Continued
        }
        "jobs" => {
            for job in &state.jobs {
                println!("[{}] {} {}", job.id, job.pid, job.command);
            }
            Outcome::Continued
        }
        "bg" | "fg" => {
            let id: Option<usize> = parsed.argv.get(1).and_then(|s| s.parse().ok());
            let target = state.find(id).map(|j| (j.pid, j.command.clone()));
            match target {
                None => println!("{cmd}: no such job"),
                Some((pid, command)) => {
                    if syscall::kill(kernel, pid, 2).await.is_err() {
                        println!("{cmd}: {}", strerror(KernelErrorKind::NoSuchProcess));
                    } else if cmd == "fg" {
                        if wait_for(kernel, ctl, shell_pid, pid).await == Outcome::Cancelled {
                            return Outcome::Cancelled;
                        }
                        state.remove_by_pid(pid);
                    } else {
                        println!("[continuing] {command}");
                    }
                }
            }
            Outcome::Continued
        }
        "mount" => {
            let Some(path) = parsed.argv.get(1) else {
                println!("usage: mount PATH");
                return Outcome::Continued;
            };
            let mut k = kernel.lock().await;
            if let Err(err) = k.mount(std::path::Path::new(path)) {
                println!("mount: {}", strerror(err));
            }
            Outcome::Continued
        }
        "unmount" => {
            let mut k = kernel.lock().await;
            if let Err(err) = k.unmount() {
                println!("unmount: {}", strerror(err));
            }
            Outcome::Continued
        }
        "mkfs" => {
            let (Some(path), Some(fat_blocks), Some(bsi)) = (
                parsed.argv.get(1),
                parsed.argv.get(2).and_then(|s| s.parse::<u16>().ok()),
                parsed.argv.get(3).and_then(|s| s.parse::<u8>().ok()),
            ) else {
                println!("usage: mkfs PATH FAT_BLOCKS BLOCK_SIZE_INDEX");
                return Outcome::Continued;
            };
            if let Err(err) = pennsim_kernel::fat::mkfs(std::path::Path::new(path), fat_blocks, bsi) {
                println!("mkfs: {}", strerror(err));
            }
            Outcome::Continued
        }
        "nice" => {
            let Some(prio) = parsed.argv.get(1).and_then(|s| s.parse::<u8>().ok()) else {
                println!("usage: nice PRIO CMD [ARGS...]");
                return Outcome::Continued;
            };
            if parsed.argv.len() < 3 {
                println!("usage: nice PRIO CMD [ARGS...]");
                return Outcome::Continued;
            }
            let inner = ParsedLine {
                argv: parsed.argv[2..].to_vec(),
                stdin_path: parsed.stdin_path.clone(),
                stdout_path: parsed.stdout_path.clone(),
                append: parsed.append,
                background: parsed.background,
            };
            run_spawned(kernel, ctl, shell_pid, &inner, state, Some(prio)).await
        }
        _ => run_spawned(kernel, ctl, shell_pid, parsed, state, None).await,
    }
}

/// Spawns `parsed` as a child of `shell_pid`, optionally overriding its
/// priority, applies redirection via [`syscall::spawn`]'s wrapper, and
/// either waits for it (foreground) or registers it as a job (`&`).
async fn run_spawned(
    kernel: &KernelHandle,
    ctl: &mut ThreadControl,
    shell_pid: Pid,
    parsed: &ParsedLine,
    state: &mut ShellState,
    priority_override: Option<u8>,
) -> Outcome {
    let argv = parsed.argv.clone();
    let command = argv.join(" ");
    let redirect = if parsed.stdin_path.is_some() || parsed.stdout_path.is_some() {
        Some(SpawnRedirect {
            stdin_path: parsed.stdin_path.clone(),
            stdout_path: parsed.stdout_path.clone(),
            append: parsed.append,
        })
    } else {
        None
    };

    let body: UserBody = Box::new(move |mut ctl, kernel, pid| {
        Box::pin(async move {
            let _ = run_child_command(&kernel, &mut ctl, pid, &argv).await;
            let _ = syscall::exit(&kernel, pid).await;
        })
    });

    let child_pid = match syscall::spawn(kernel, shell_pid, argv[0].clone(), argv.clone(), body, redirect).await {
        Ok(pid) => pid,
        Err(err) => {
            println!("{}: {}", argv[0], strerror(err));
            return Outcome::Continued;
        }
    };

    if let Some(prio) = priority_override {
        let _ = syscall::nice(kernel, child_pid, prio).await;
    }

    if parsed.background {
        let id = state.add(child_pid, command);
        println!("[{id}] {child_pid}");
        Outcome::Continued
    } else {
        wait_for(kernel, ctl, shell_pid, child_pid).await
    }
}

/// Blocks the shell on `target` specifically, printing a STOPPED notice if
/// the child stops rather than exits (spec §4.8 `wait`).
async fn wait_for(kernel: &KernelHandle, ctl: &mut ThreadControl, shell_pid: Pid, target: Pid) -> Outcome {
    loop {
        match syscall::wait(kernel, ctl, shell_pid, Some(target), false).await {
            Awaited::Cancelled => return Outcome::Cancelled,
            Awaited::Done(Err(_)) => return Outcome::Continued,
            Awaited::Done(Ok((pid, status))) => {
                if status & WAIT_BIT_STOPPED != 0 {
                    println!("[{pid}] stopped");
                    return Outcome::Continued;
                }
                if status & (WAIT_BIT_EXITED | WAIT_BIT_SIGNALED) != 0 {
                    return Outcome::Continued;
                }
            }
        }
    }
}

/// The body every spawned external command actually runs (spec §6's
/// per-command thin wrappers, collected here since none of them need a
/// dedicated process type beyond "a function over the syscall surface").
async fn run_child_command(kernel: &KernelHandle, ctl: &mut ThreadControl, pid: Pid, argv: &[String]) -> i64 {
    match argv[0].as_str() {
        "ls" => cmd_ls(kernel).await,
        "touch" => cmd_touch(kernel, pid, argv).await,
        "cat" => cmd_cat(kernel, pid, argv).await,
        "chmod" => cmd_chmod(kernel, argv).await,
        "rm" => cmd_rm(kernel, argv).await,
        "mv" => cmd_mv(kernel, argv).await,
        "cp" => cmd_cp(kernel, pid, argv).await,
        "ps" => cmd_ps(kernel).await,
        "kill" => cmd_kill(kernel, argv).await,
        "nice_pid" => cmd_nice_pid(kernel, argv).await,
        "sleep" => cmd_sleep(kernel, ctl, pid, argv).await,
        "busy" => cmd_busy(ctl).await,
        "echo" => cmd_echo(kernel, pid, argv).await,
        other => {
            println!("{other}: command not found");
            -1
        }
    }
}

async fn cmd_ls(kernel: &KernelHandle) -> i64 {
    let k = kernel.lock().await;
    let Some(fs) = k.fs.as_ref() else {
        println!("ls: {}", strerror(KernelErrorKind::NotMounted));
        return -1;
    };
    match fs.list_active_entries() {
        Ok(entries) => {
            for entry in entries {
                let kind = if entry.status() == NameStatus::Active { "" } else { "?" };
                println!("{:<32} {:>8} {:03o}{kind}", entry.name_str(), entry.size, entry.perm);
            }
            0
        }
        Err(err) => {
            println!("ls: {}", strerror(err));
            -1
        }
    }
}

async fn cmd_touch(kernel: &KernelHandle, pid: Pid, argv: &[String]) -> i64 {
    let Some(name) = argv.get(1) else {
        println!("usage: touch FILE");
        return -1;
    };
    let mut k = kernel.lock().await;
    match syscall::open(&mut k, pid, name, AccessMode::Write) {
        Ok(fd) => {
            let _ = syscall::close(&mut k, pid, fd);
            0
        }
        Err(err) => {
            println!("touch: {}", strerror(err));
            -1
        }
    }
}

async fn cmd_cat(kernel: &KernelHandle, pid: Pid, argv: &[String]) -> i64 {
    // `cat [-w|-a OUT] FILE...`: with -w/-a, concatenate stdin into OUT;
    // otherwise concatenate each FILE to stdout (spec §6).
    if let Some(flag) = argv.get(1).filter(|a| *a == "-w" || *a == "-a") {
        let Some(out) = argv.get(2) else {
            println!("usage: cat {flag} OUT");
            return -1;
        };
        let access = if flag == "-w" { AccessMode::Write } else { AccessMode::Append };
        let mut k = kernel.lock().await;
        let fd = match syscall::open(&mut k, pid, out, access) {
            Ok(fd) => fd,
            Err(err) => {
                println!("cat: {}", strerror(err));
                return -1;
            }
        };
        loop {
            let chunk = match syscall::read(&mut k, pid, 0, 4096) {
                Ok(chunk) => chunk,
                Err(err) => {
                    println!("cat: {}", strerror(err));
                    break;
                }
            };
            if chunk.is_empty() {
                break;
            }
            if syscall::write(&mut k, pid, fd, &chunk).is_err() {
                break;
            }
        }
        let _ = syscall::close(&mut k, pid, fd);
        return 0;
    }

    let mut k = kernel.lock().await;
    for name in &argv[1..] {
        let fd = match syscall::open(&mut k, pid, name, AccessMode::Read) {
            Ok(fd) => fd,
            Err(err) => {
                println!("cat: {name}: {}", strerror(err));
                continue;
            }
        };
        loop {
            let chunk = match syscall::read(&mut k, pid, fd, 4096) {
                Ok(chunk) => chunk,
                Err(err) => {
                    println!("cat: {name}: {}", strerror(err));
                    break;
                }
            };
            if chunk.is_empty() {
                break;
            }
            print!("{}", String::from_utf8_lossy(&chunk));
        }
        let _ = syscall::close(&mut k, pid, fd);
    }
    let _ = std::io::stdout().flush();
    0
}

/// Parses `chmod`'s mode word: a leading `+`/`-`/`=` (add/remove/assign)
/// followed by any of `r`, `w`, `x` (spec §6 chmod operation flags).
fn parse_chmod_mode(spec: &str) -> Option<u8> {
    let mut chars = spec.chars();
    let op = match chars.next()? {
        '+' => pennsim_kernel::fat::layout::CHMOD_OP_ADD,
        '-' => pennsim_kernel::fat::layout::CHMOD_OP_REMOVE,
        '=' => pennsim_kernel::fat::layout::CHMOD_OP_ASSIGN,
        _ => return None,
    };
    let mut mask = 0u8;
    for c in chars {
        mask |= match c {
            'r' => pennsim_kernel::fat::layout::PERM_READ,
            'w' => pennsim_kernel::fat::layout::PERM_WRITE,
            'x' => pennsim_kernel::fat::layout::PERM_EXEC,
            _ => return None,
        };
    }
    Some(op | mask)
}

async fn cmd_chmod(kernel: &KernelHandle, argv: &[String]) -> i64 {
    let (Some(mode_spec), Some(name)) = (argv.get(1), argv.get(2)) else {
        println!("usage: chmod MODE FILE");
        return -1;
    };
    let Some(mode_word) = parse_chmod_mode(mode_spec) else {
        println!("chmod: invalid mode {mode_spec}");
        return -1;
    };
    let mut k = kernel.lock().await;
    match syscall::chmod(&mut k, name, mode_word) {
        Ok(()) => 0,
        Err(err) => {
            println!("chmod: {}", strerror(err));
            -1
        }
    }
}

async fn cmd_rm(kernel: &KernelHandle, argv: &[String]) -> i64 {
    let Some(name) = argv.get(1) else {
        println!("usage: rm FILE");
        return -1;
    };
    let mut k = kernel.lock().await;
    match syscall::unlink(&mut k, name) {
        Ok(()) => 0,
        Err(err) => {
            println!("rm: {}", strerror(err));
            -1
        }
    }
}

async fn cmd_mv(kernel: &KernelHandle, argv: &[String]) -> i64 {
    let (Some(src), Some(dst)) = (argv.get(1), argv.get(2)) else {
        println!("usage: mv SRC DST");
        return -1;
    };
    let mut k = kernel.lock().await;
    match syscall::rename(&mut k, src, dst) {
        Ok(()) => 0,
        Err(err) => {
            println!("mv: {}", strerror(err));
            -1
        }
    }
}

async fn cmd_cp(kernel: &KernelHandle, pid: Pid, argv: &[String]) -> i64 {
    let host_mode = argv.get(1).map(String::as_str) == Some("-h");
    let rest = if host_mode { &argv[2..] } else { &argv[1..] };
    let (Some(src), Some(dst)) = (rest.first(), rest.get(1)) else {
        println!("usage: cp [-h] SRC DST");
        return -1;
    };

    let data = if host_mode {
        match std::fs::read(src) {
            Ok(data) => data,
            Err(err) => {
                println!("cp: {src}: {err}");
                return -1;
            }
        }
    } else {
        let mut k = kernel.lock().await;
        let fd = match syscall::open(&mut k, pid, src, AccessMode::Read) {
            Ok(fd) => fd,
            Err(err) => {
                println!("cp: {src}: {}", strerror(err));
                return -1;
            }
        };
        let mut buf = Vec::new();
        loop {
            match syscall::read(&mut k, pid, fd, 4096) {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => buf.extend(chunk),
                Err(err) => {
                    println!("cp: {src}: {}", strerror(err));
                    let _ = syscall::close(&mut k, pid, fd);
                    return -1;
                }
            }
        }
        let _ = syscall::close(&mut k, pid, fd);
        buf
    };

    let mut k = kernel.lock().await;
    let fd = match syscall::open(&mut k, pid, dst, AccessMode::Write) {
        Ok(fd) => fd,
        Err(err) => {
            println!("cp: {dst}: {}", strerror(err));
            return -1;
        }
    };
    let result = syscall::write(&mut k, pid, fd, &data);
    let _ = syscall::close(&mut k, pid, fd);
    match result {
        Ok(_) => 0,
        Err(err) => {
            println!("cp: {dst}: {}", strerror(err));
            -1
        }
    }
}

async fn cmd_ps(kernel: &KernelHandle) -> i64 {
    let k = kernel.lock().await;
    println!("{:>5} {:>5} {:<8} {:>4} {}", "PID", "PPID", "STATE", "PRIO", "CMD");
    for pcb in k.pcb_table.iter() {
        let state = match pcb.state {
            ProcessState::Ready => "READY",
            ProcessState::Running => "RUNNING",
            ProcessState::Blocked => "BLOCKED",
            ProcessState::Stopped => "STOPPED",
            ProcessState::Zombie => "ZOMBIE",
        };
        println!(
            "{:>5} {:>5} {:<8} {:>4} {}",
            pcb.pid,
            pcb.parent_pid.unwrap_or(0),
            state,
            pcb.priority.index(),
            pcb.command
        );
    }
    0
}

async fn cmd_kill(kernel: &KernelHandle, argv: &[String]) -> i64 {
    let mut signal = 0i32;
    let mut rest = &argv[1..];
    if let Some(flag) = rest.first() {
        match flag.as_str() {
            "-term" => signal = 0,
            "-stop" => signal = 1,
            "-cont" => signal = 2,
            _ => {}
        }
        if flag.starts_with('-') {
            rest = &rest[1..];
        }
    }
    let Some(pid) = rest.first().and_then(|s| s.parse::<Pid>().ok()) else {
        println!("usage: kill [-term|-stop|-cont] PID");
        return -1;
    };
    match syscall::kill(kernel, pid, signal).await {
        Ok(()) => 0,
        Err(err) => {
            println!("kill: {}", strerror(err));
            -1
        }
    }
}

async fn cmd_nice_pid(kernel: &KernelHandle, argv: &[String]) -> i64 {
    let (Some(prio), Some(pid)) = (
        argv.get(1).and_then(|s| s.parse::<u8>().ok()),
        argv.get(2).and_then(|s| s.parse::<Pid>().ok()),
    ) else {
        println!("usage: nice_pid PRIO PID");
        return -1;
    };
    match syscall::nice(kernel, pid, prio).await {
        Ok(()) => 0,
        Err(err) => {
            println!("nice_pid: {}", strerror(err));
            -1
        }
    }
}

async fn cmd_sleep(kernel: &KernelHandle, ctl: &mut ThreadControl, pid: Pid, argv: &[String]) -> i64 {
    let Some(ticks) = argv.get(1).and_then(|s| s.parse::<u64>().ok()) else {
        println!("usage: sleep TICKS");
        return -1;
    };
    match syscall::sleep(kernel, ctl, pid, ticks).await {
        Awaited::Done(Ok(())) => 0,
        Awaited::Done(Err(_)) | Awaited::Cancelled => -1,
    }
}

/// Spins at every scheduler checkpoint forever (spec §6 `busy`: a
/// CPU-bound workload used to exercise the scheduler's weighting).
async fn cmd_busy(ctl: &mut ThreadControl) -> i64 {
    loop {
        if ctl.checkpoint().await == Checkpoint::Cancelled {
            return -1;
        }
    }
}

async fn cmd_echo(kernel: &KernelHandle, pid: Pid, argv: &[String]) -> i64 {
    let text = format!("{}\n", argv[1..].join(" "));
    let mut k = kernel.lock().await;
    let fd1 = k.pcb_table.get(pid).and_then(|p| p.fd_table[1]);
    match fd1 {
        Some(key) if key >= 3 => {
            if let Some(fs) = k.fs.as_mut() {
                let _ = fileops::write(fs, &mut k.gdt, GdtKey(key), text.as_bytes());
            }
        }
        _ => {
            drop(k);
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
    }
    0
}
