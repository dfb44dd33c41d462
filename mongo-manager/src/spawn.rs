// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Launching and signalling detached server processes
//!
//! Servers are spawned as session leaders with stdout/stderr appended to a
//! per-process log file, and they outlive us: the lifecycle is tracked
//! through pid files, not child handles.  The server writes its own pid file
//! (`--pidfilepath` is part of every planned argv) before it does any
//! relevant work, so [`spawn()`] waits for that file to appear the same way
//! the startup of any slow-to-listen database has to be waited for: by
//! polling, while watching for an early exit.

use crate::error::Error;
use crate::poll;
use camino::{Utf8Path, Utf8PathBuf};
use std::process::Stdio;
use std::time::Duration;

/// How long a spawned server may take to write its pid file
pub const SPAWN_TIMEOUT: Duration = Duration::from_secs(30);

/// How many trailing log lines to attach to errors
const LOG_TAIL_LINES: usize = 50;

const PID_POLL_INTERVAL: Duration = Duration::from_millis(20);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Terminate,
    Kill,
}

impl Signal {
    fn name(&self) -> &'static str {
        match self {
            Signal::Terminate => "SIGTERM",
            Signal::Kill => "SIGKILL",
        }
    }
}

impl From<Signal> for libc::c_int {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

// Failure modes observed while waiting for the pid file.
#[derive(Debug)]
enum PidFileWaitError {
    Exited(std::process::ExitStatus),
    Check(std::io::Error),
}

/// Spawns `argv[0]` with the remaining arguments as a detached server
///
/// The child becomes a session leader with no controlling terminal, stdin
/// from `/dev/null`, and stdout/stderr appended to `log_path`.  Returns the
/// pid read from `pid_path` once the file is present and the child is still
/// alive; fails with [`Error::Spawn`] (carrying the log tail) if the child
/// exits first or `timeout` passes.
pub async fn spawn(
    argv: &[String],
    log_path: &Utf8Path,
    pid_path: &Utf8Path,
    timeout: Duration,
) -> Result<u32, Error> {
    let Some(binary) = argv.first() else {
        return Err(Error::Spawn {
            label: String::new(),
            reason: String::from("empty command line"),
            log_path: log_path.to_owned(),
            log_tail: String::new(),
        });
    };
    let label = binary.clone();

    // A stale pid file from an earlier run of the same directory would
    // satisfy the wait below before the new server has started.
    match std::fs::remove_file(pid_path) {
        Ok(()) => (),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
        Err(e) => return Err(Error::io(pid_path, e)),
    }

    let stdout = open_log(log_path)?;
    let stderr = stdout.try_clone().map_err(|e| Error::io(log_path, e))?;

    let mut cmd = tokio::process::Command::new(binary);
    cmd.args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|e| {
        spawn_error(
            &label,
            format!("running {:?} (is the binary installed and on your PATH?): {}", label, e),
            log_path,
        )
    })?;

    let wait_result = poll::wait_for_condition(
        || {
            // try_wait() cannot be used inside the async block (it needs the
            // mutable borrow of `child`), so check it before building the
            // future, as of the start of this poll iteration.
            let exited = child_exit_status(&mut child);
            let pid_path = pid_path.to_owned();
            async move {
                if let Some(status) = exited {
                    return Err(poll::CondCheckError::Failed(
                        PidFileWaitError::Exited(status),
                    ));
                }
                match tokio::fs::read_to_string(&pid_path).await {
                    // The server's write is not necessarily atomic; an
                    // unparseable number means it isn't finished.
                    Ok(contents) => match contents.trim().parse::<u32>() {
                        Ok(pid) => Ok(pid),
                        Err(_) => Err(poll::CondCheckError::NotYet),
                    },
                    Err(e)
                        if e.kind() == std::io::ErrorKind::NotFound =>
                    {
                        Err(poll::CondCheckError::NotYet)
                    }
                    Err(e) => Err(poll::CondCheckError::Failed(
                        PidFileWaitError::Check(e),
                    )),
                }
            }
        },
        &PID_POLL_INTERVAL,
        &timeout,
    )
    .await;

    // The server is a direct child of this process.  While this process
    // lives, an exited child would linger as a zombie and still answer
    // `kill(pid, 0)`, so hand the handle to a task that reaps it whenever it
    // exits.  (wait() returns the cached status if try_wait() above already
    // reaped it.)
    tokio::spawn(async move {
        let _ = child.wait().await;
    });

    match wait_result {
        Ok(pid) => Ok(pid),
        Err(poll::Error::TimedOut(waited)) => Err(spawn_error(
            &label,
            format!(
                "did not write pid file {} within {:?}",
                pid_path, waited
            ),
            log_path,
        )),
        Err(poll::Error::PermanentError(PidFileWaitError::Exited(status))) => {
            Err(spawn_error(
                &label,
                format!("exited with {} before writing its pid file", status),
                log_path,
            ))
        }
        Err(poll::Error::PermanentError(PidFileWaitError::Check(e))) => {
            Err(spawn_error(
                &label,
                format!("checking pid file {}: {}", pid_path, e),
                log_path,
            ))
        }
    }
}

/// Sends `signal` to `pid`
///
/// Returns `Ok(false)` when the process no longer exists, which callers use
/// to skip the subsequent exit wait.
pub fn signal(pid: u32, signal: Signal) -> Result<bool, Error> {
    if 0 == unsafe { libc::kill(pid as libc::pid_t, signal.into()) } {
        return Ok(true);
    }
    let e = std::io::Error::last_os_error();
    if e.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(Error::Signal { pid, signal: signal.name(), source: e })
    }
}

/// Returns whether the given process is currently running
///
/// `kill(pid, 0)` semantics: a recycled pid is indistinguishable from the
/// original process.
pub fn process_running(pid: u32) -> bool {
    0 == (unsafe { libc::kill(pid as libc::pid_t, 0) })
}

/// Polls until `pid` no longer exists, up to `timeout`
///
/// On timeout, fails with [`Error::StopTimeout`] carrying the tail of
/// `log_path`.
pub async fn wait_for_exit(
    pid: u32,
    timeout: Duration,
    label: &str,
    log_path: &Utf8Path,
) -> Result<(), Error> {
    let result = poll::wait_for_condition::<(), std::convert::Infallible, _, _>(
        || async move {
            if process_running(pid) {
                Err(poll::CondCheckError::NotYet)
            } else {
                Ok(())
            }
        },
        &EXIT_POLL_INTERVAL,
        &timeout,
    )
    .await;
    match result {
        Ok(()) => Ok(()),
        Err(poll::Error::TimedOut(_)) => Err(Error::StopTimeout {
            label: label.to_string(),
            pid,
            timeout,
            log_path: log_path.to_owned(),
            log_tail: log_tail(log_path, LOG_TAIL_LINES),
        }),
        Err(poll::Error::PermanentError(never)) => match never {},
    }
}

/// Returns the last `max_lines` lines of the file at `path`
pub fn log_tail(path: &Utf8Path, max_lines: usize) -> String {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let lines: Vec<&str> = contents.lines().collect();
            let start = lines.len().saturating_sub(max_lines);
            lines[start..].join("\n")
        }
        Err(e) => format!("(could not read {}: {})", path, e),
    }
}

/// Collects the tail of every `*.log` file under `dir` (recursively, sorted
/// by path), formatted for appending to an error message
pub fn collect_log_tails(dir: &Utf8Path) -> String {
    let mut logs = Vec::new();
    gather_logs(dir, &mut logs);
    logs.sort();
    let mut out = String::new();
    for path in logs {
        out.push_str(&format!(
            "--- {} ---\n{}\n",
            path,
            log_tail(&path, LOG_TAIL_LINES)
        ));
    }
    out
}

fn gather_logs(dir: &Utf8Path, out: &mut Vec<Utf8PathBuf>) {
    let Ok(entries) = dir.read_dir_utf8() else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            gather_logs(path, out);
        } else if path.extension() == Some("log") {
            out.push(path.to_owned());
        }
    }
}

fn open_log(log_path: &Utf8Path) -> Result<std::fs::File, Error> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| Error::io(log_path, e))
}

fn spawn_error(label: &str, reason: String, log_path: &Utf8Path) -> Error {
    Error::Spawn {
        label: label.to_string(),
        reason,
        log_path: log_path.to_owned(),
        log_tail: log_tail(log_path, LOG_TAIL_LINES),
    }
}

// Wrapper around try_wait(): a transient error checking the exit status is
// treated as "still running" and the next poll iteration retries.
fn child_exit_status(
    child: &mut tokio::process::Child,
) -> Option<std::process::ExitStatus> {
    child.try_wait().ok().flatten()
}

// These are more integration tests than unit tests: they drive real
// processes, with bash standing in for the server binary.
#[cfg(test)]
mod test {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    fn bash_argv(script: String) -> Vec<String> {
        vec![String::from("/bin/bash"), String::from("-c"), script]
    }

    struct FakeServer {
        dir: Utf8TempDir,
    }

    impl FakeServer {
        fn new() -> FakeServer {
            FakeServer { dir: camino_tempfile::tempdir().unwrap() }
        }

        fn log_path(&self) -> Utf8PathBuf {
            self.dir.path().join("bash.log")
        }

        fn pid_path(&self) -> Utf8PathBuf {
            self.dir.path().join("bash.pid")
        }
    }

    #[tokio::test]
    async fn test_spawn_and_stop() {
        let server = FakeServer::new();
        let argv = bash_argv(format!(
            "echo $$ > {}; exec sleep 60",
            server.pid_path()
        ));
        let pid = spawn(
            &argv,
            &server.log_path(),
            &server.pid_path(),
            SPAWN_TIMEOUT,
        )
        .await
        .expect("failed to spawn fake server");
        assert!(process_running(pid));

        assert!(signal(pid, Signal::Terminate).unwrap());
        wait_for_exit(pid, Duration::from_secs(10), "bash", &server.log_path())
            .await
            .expect("fake server did not exit");
        assert!(!process_running(pid));

        // The pid file is still present; signalling the dead pid reports
        // that there was no process to signal.
        assert!(server.pid_path().exists());
        assert!(!signal(pid, Signal::Terminate).unwrap());
    }

    #[tokio::test]
    async fn test_spawn_removes_stale_pid_file() {
        let server = FakeServer::new();
        std::fs::write(server.pid_path(), "999999\n").unwrap();
        let argv = bash_argv(format!(
            "echo $$ > {}; exec sleep 60",
            server.pid_path()
        ));
        let pid = spawn(
            &argv,
            &server.log_path(),
            &server.pid_path(),
            SPAWN_TIMEOUT,
        )
        .await
        .unwrap();
        assert_ne!(pid, 999999);
        assert!(process_running(pid));
        signal(pid, Signal::Kill).unwrap();
        wait_for_exit(pid, Duration::from_secs(10), "bash", &server.log_path())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_spawn_child_exits_early() {
        let server = FakeServer::new();
        let argv =
            bash_argv(String::from("echo server refused to start >&2; exit 3"));
        let error = spawn(
            &argv,
            &server.log_path(),
            &server.pid_path(),
            SPAWN_TIMEOUT,
        )
        .await
        .expect_err("early-exiting child unexpectedly spawned");
        let Error::Spawn { reason, log_tail, .. } = &error else {
            panic!("expected Error::Spawn, got {:?}", error);
        };
        assert!(reason.contains("before writing its pid file"));
        assert!(
            log_tail.contains("server refused to start"),
            "log tail was: {:?}",
            log_tail
        );
    }

    #[tokio::test]
    async fn test_spawn_bad_binary() {
        let server = FakeServer::new();
        let argv = vec![String::from("/nonexistent/mongod")];
        let error = spawn(
            &argv,
            &server.log_path(),
            &server.pid_path(),
            SPAWN_TIMEOUT,
        )
        .await
        .expect_err("nonexistent binary unexpectedly spawned");
        assert!(matches!(error, Error::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_spawn_pid_file_timeout() {
        let server = FakeServer::new();
        // The child writes its pid somewhere else, so the spawner's wait can
        // only time out; the stray pid lets the test clean up after itself.
        let stray = server.dir.path().join("elsewhere.pid");
        let argv = bash_argv(format!("echo $$ > {}; exec sleep 60", stray));
        let error = spawn(
            &argv,
            &server.log_path(),
            &server.pid_path(),
            Duration::from_millis(250),
        )
        .await
        .expect_err("spawn unexpectedly found a pid file");
        let Error::Spawn { reason, .. } = &error else {
            panic!("expected Error::Spawn, got {:?}", error);
        };
        assert!(reason.contains("did not write pid file"));

        // The stray pid file may land just after the spawner gives up.
        let mut contents = String::new();
        for _ in 0..100 {
            if let Ok(c) = std::fs::read_to_string(&stray) {
                contents = c;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let pid: u32 = contents.trim().parse().unwrap();
        signal(pid, Signal::Kill).unwrap();
        wait_for_exit(pid, Duration::from_secs(10), "bash", &server.log_path())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_exit_timeout() {
        let server = FakeServer::new();
        // SIGTERM is ignored, so only the test's final SIGKILL ends it.
        let argv = bash_argv(format!(
            "trap '' TERM; echo $$ > {}; sleep 60",
            server.pid_path()
        ));
        let pid = spawn(
            &argv,
            &server.log_path(),
            &server.pid_path(),
            SPAWN_TIMEOUT,
        )
        .await
        .unwrap();
        assert!(signal(pid, Signal::Terminate).unwrap());
        let error = wait_for_exit(
            pid,
            Duration::from_millis(300),
            "bash",
            &server.log_path(),
        )
        .await
        .expect_err("TERM-ignoring process unexpectedly exited");
        assert!(matches!(error, Error::StopTimeout { pid: p, .. } if p == pid));

        signal(pid, Signal::Kill).unwrap();
        wait_for_exit(pid, Duration::from_secs(10), "bash", &server.log_path())
            .await
            .unwrap();
    }

    #[test]
    fn test_log_tail_truncates() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("mongod.log");
        let contents: String =
            (0..100).map(|i| format!("line {}\n", i)).collect();
        std::fs::write(&path, contents).unwrap();
        let tail = log_tail(&path, 50);
        assert!(tail.ends_with("line 99"));
        assert!(tail.starts_with("line 50"));
        assert!(!tail.contains("line 49\n"));
    }

    #[test]
    fn test_collect_log_tails_sorted() {
        let dir = camino_tempfile::tempdir().unwrap();
        for sub in ["shard02", "csrs", "shard01"] {
            let subdir = dir.path().join(sub);
            std::fs::create_dir(&subdir).unwrap();
            std::fs::write(
                subdir.join("mongod.log"),
                format!("output from {}\n", sub),
            )
            .unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "not a log\n").unwrap();

        let tails = collect_log_tails(dir.path());
        let csrs = tails.find("csrs/mongod.log").unwrap();
        let shard01 = tails.find("shard01/mongod.log").unwrap();
        let shard02 = tails.find("shard02/mongod.log").unwrap();
        assert!(csrs < shard01 && shard01 < shard02);
        assert!(tails.contains("output from shard01"));
        assert!(!tails.contains("not a log"));
    }
}
