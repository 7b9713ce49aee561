//! Child-process executor for dataset administration commands
//!
//! Runs a command line through `sh -e -c` with stdout and stderr
//! joined onto one pipe, waits for completion, and captures a bounded
//! amount of output. When output is optional the read is gated by a
//! `poll(2)` with a millisecond timeout so a silent command does not
//! stall the caller.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::process::{Command, Stdio};

/// Default output capture bound for short property commands.
pub const DEFAULT_OUTPUT_CAP: usize = 256;

/// Classification of a command run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCode {
    /// Exit status zero
    Ok,
    /// The child could not be spawned
    NoStart,
    /// The child exited with a non-zero status
    Fail,
    /// Exit status zero but no output where output was required
    NoOutput,
}

/// Result of running a command.
#[derive(Debug)]
pub struct Outcome {
    /// The command line that was run
    pub command: String,
    /// Captured output, with one trailing newline stripped
    pub output: String,
    /// Exit status of the child, if it ran to completion
    pub exit: Option<i32>,
    /// Classification of the run
    pub code: RunCode,
}

impl Outcome {
    fn no_start(command: &str) -> Self {
        Outcome {
            command: command.to_string(),
            output: String::new(),
            exit: None,
            code: RunCode::NoStart,
        }
    }
}

/// Run `command` through the shell and capture its output.
///
/// `output_cap` bounds how many bytes are read back. With
/// `want_output` set the read blocks until the (already exited) child's
/// pipe drains; without it the read only happens if `poll` reports data
/// within `timeout_ms`.
pub fn run(command: &str, want_output: bool, output_cap: usize, timeout_ms: i32) -> Outcome {
    let mut fds = [-1i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        tracing::error!(
            "cannot create pipe for `{}`: {}",
            command,
            std::io::Error::last_os_error()
        );
        return Outcome::no_start(command);
    }
    // the read end stays ours; both child stdio slots get the write end
    let read_end = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let stderr_fd = unsafe { libc::dup(fds[1]) };
    if stderr_fd < 0 {
        unsafe { libc::close(fds[1]) };
        return Outcome::no_start(command);
    }

    let mut child = match Command::new("sh")
        .arg("-e")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(unsafe { Stdio::from_raw_fd(fds[1]) })
        .stderr(unsafe { Stdio::from_raw_fd(stderr_fd) })
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            tracing::error!("`{}` failed to start: {}", command, e);
            return Outcome::no_start(command);
        }
    };

    let exit = match child.wait() {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::error!("waiting for `{}`: {}", command, e);
            None
        }
    };

    // a failed command gets a longer grace period to flush diagnostics
    let read_timeout = if exit == Some(0) {
        timeout_ms
    } else {
        timeout_ms.max(500)
    };
    let output = read_bounded(&read_end, want_output, output_cap, read_timeout);

    let code = match exit {
        Some(0) if output.is_empty() && want_output => RunCode::NoOutput,
        Some(0) => RunCode::Ok,
        _ => RunCode::Fail,
    };

    Outcome {
        command: command.to_string(),
        output,
        exit,
        code,
    }
}

/// Read up to `cap` bytes from the pipe, optionally gated by `poll`.
fn read_bounded(fd: &OwnedFd, want_output: bool, cap: usize, timeout_ms: i32) -> String {
    let raw = fd.as_raw_fd();
    if !want_output {
        let mut pfd = libc::pollfd {
            fd: raw,
            events: libc::POLLIN,
            revents: 0,
        };
        if unsafe { libc::poll(&mut pfd, 1, timeout_ms) } <= 0 {
            return String::new();
        }
    }

    let mut buf = vec![0u8; cap.max(1)];
    let n = unsafe { libc::read(raw, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n <= 0 {
        return String::new();
    }
    let mut len = n as usize;
    if buf[len - 1] == b'\n' {
        len -= 1;
    }
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captures_output() {
        let outcome = run("echo hello", true, 256, 250);
        assert_eq!(outcome.code, RunCode::Ok);
        assert_eq!(outcome.exit, Some(0));
        assert_eq!(outcome.output, "hello");
    }

    #[test]
    fn test_strips_single_trailing_newline() {
        let outcome = run("printf 'a\\nb\\n'", true, 256, 250);
        assert_eq!(outcome.output, "a\nb");
    }

    #[test]
    fn test_no_output_classification() {
        let outcome = run("true", true, 256, 250);
        assert_eq!(outcome.code, RunCode::NoOutput);
        assert!(outcome.output.is_empty());
    }

    #[test]
    fn test_quiet_success_without_wanting_output() {
        let outcome = run("true", false, 256, 50);
        assert_eq!(outcome.code, RunCode::Ok);
        assert!(outcome.output.is_empty());
    }

    #[test]
    fn test_failure_keeps_diagnostics() {
        let outcome = run("echo broken >&2; exit 3", false, 256, 50);
        assert_eq!(outcome.code, RunCode::Fail);
        assert_eq!(outcome.exit, Some(3));
        assert_eq!(outcome.output, "broken");
    }

    #[test]
    fn test_missing_binary_fails_via_shell() {
        let outcome = run("/no/such/binary-at-all", false, 256, 50);
        assert_eq!(outcome.code, RunCode::Fail);
        assert_ne!(outcome.exit, Some(0));
    }

    #[test]
    fn test_output_capped() {
        let outcome = run("head -c 1024 /dev/zero | tr '\\0' 'x'", true, 16, 250);
        assert!(outcome.output.len() <= 16);
        assert!(!outcome.output.is_empty());
    }

    #[test]
    fn test_stderr_joined_with_stdout() {
        let outcome = run("echo visible >&2", true, 256, 250);
        assert_eq!(outcome.code, RunCode::Ok);
        assert_eq!(outcome.output, "visible");
    }
}
