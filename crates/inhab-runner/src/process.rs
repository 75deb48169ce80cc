use anyhow::{anyhow, Result};
use std::io::{Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Exited {
        /// `None` when the child was terminated by a signal.
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    TimedOut,
}

impl ProcessOutcome {
    pub fn status_label(&self) -> String {
        match self {
            Self::Exited {
                exit_code: Some(code),
                ..
            } => code.to_string(),
            Self::Exited { exit_code: None, .. } => "signal".to_string(),
            Self::TimedOut => "timeout".to_string(),
        }
    }
}

/// Builds a command from an argv vector (program first).
pub fn command_from_argv(argv: &[String]) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("command must not be empty"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// Runs `cmd` to completion or until `timeout`, whichever comes first.
///
/// Output pipes are drained on background threads so a chatty child cannot
/// block on a full pipe while we poll. The child leads its own process group.
/// The deadline covers both the child's exit and the pipes closing: a
/// grandchild that keeps stdout open past it counts as a timeout, and the
/// whole group is killed.
pub fn run_with_timeout(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
) -> Result<ProcessOutcome> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| anyhow!("failed to spawn {:?}: {}", cmd.get_program(), e))?;

    if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
        thread::spawn(move || {
            // A child that exits without reading stdin yields EPIPE; ignore it.
            let _ = pipe.write_all(&bytes);
        });
    }
    let stdout_rx = drain(child.stdout.take());
    let stderr_rx = drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            kill_and_reap(&mut child);
            return Ok(ProcessOutcome::TimedOut);
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = collect(&stdout_rx, deadline);
    let stderr = collect(&stderr_rx, deadline);
    match (stdout, stderr) {
        (Some(stdout), Some(stderr)) => Ok(ProcessOutcome::Exited {
            exit_code: status.code(),
            stdout,
            stderr,
        }),
        _ => {
            kill_group(child.id());
            Ok(ProcessOutcome::TimedOut)
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        let _ = tx.send(buf);
    });
    rx
}

/// `None` when the pipe is still open at `deadline`. A child that exits right
/// at the deadline still gets one poll interval for its pipes to drain.
fn collect(rx: &mpsc::Receiver<Vec<u8>>, deadline: Instant) -> Option<String> {
    let wait = deadline
        .saturating_duration_since(Instant::now())
        .max(POLL_INTERVAL);
    match rx.recv_timeout(wait) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).to_string()),
        Err(mpsc::RecvTimeoutError::Disconnected) => Some(String::new()),
        Err(mpsc::RecvTimeoutError::Timeout) => None,
    }
}

fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid signals the process group we created
    // at spawn; it touches no memory owned by this process.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

fn kill_and_reap(child: &mut Child) {
    kill_group(child.id());
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_stderr_and_exit_code() {
        let outcome = run_with_timeout(
            sh("printf 'out'; printf 'err' >&2; exit 3"),
            None,
            Duration::from_secs(10),
        )
        .expect("process should run");
        assert_eq!(
            outcome,
            ProcessOutcome::Exited {
                exit_code: Some(3),
                stdout: "out".to_string(),
                stderr: "err".to_string(),
            }
        );
        assert_eq!(outcome.status_label(), "3");
    }

    #[test]
    fn feeds_stdin() {
        let outcome = run_with_timeout(sh("cat"), Some(b"hello".to_vec()), Duration::from_secs(10))
            .expect("process should run");
        match outcome {
            ProcessOutcome::Exited { stdout, exit_code, .. } => {
                assert_eq!(stdout, "hello");
                assert_eq!(exit_code, Some(0));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn slow_child_times_out() {
        let started = Instant::now();
        let outcome = run_with_timeout(sh("exec sleep 30"), None, Duration::from_millis(200))
            .expect("process should run");
        assert_eq!(outcome, ProcessOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn grandchild_holding_stdout_does_not_outlive_the_deadline() {
        let started = Instant::now();
        let outcome = run_with_timeout(
            sh("sleep 6 & printf '{}'"),
            None,
            Duration::from_millis(300),
        )
        .expect("process should run");
        assert_eq!(outcome, ProcessOutcome::TimedOut);
        assert_eq!(outcome.status_label(), "timeout");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn empty_argv_and_missing_binary_are_errors() {
        assert!(command_from_argv(&[]).is_err());
        let cmd = command_from_argv(&["/definitely/not/a/binary".to_string()]).expect("command");
        assert!(run_with_timeout(cmd, None, Duration::from_secs(1)).is_err());
    }
}
