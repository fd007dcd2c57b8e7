use std::{
    collections::HashMap,
    io::{Read, Write},
    process::{Command, Stdio},
    time::{Duration, Instant},
};

use tracing::debug;

/// Result of handing a message to a process endpoint.
#[derive(Debug)]
pub struct ProcessOutcome {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Run `command`, feed the raw message on stdin, and wait for exit.
/// `timeout_ms == 0` waits forever; otherwise the child is killed when
/// the budget runs out and the outcome reports failure.
pub fn deliver(
    command: &str,
    args: &[String],
    env: Option<&HashMap<String, String>>,
    timeout_ms: u64,
    raw: &str,
) -> std::io::Result<ProcessOutcome> {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(env) = env {
        cmd.env_clear().envs(env);
    }

    let mut child = cmd.spawn()?;

    // Feed the message and close stdin so the child sees EOF.
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(raw.as_bytes());
    }

    let deadline = if timeout_ms > 0 {
        Some(Instant::now() + Duration::from_millis(timeout_ms))
    } else {
        None
    };

    let status = loop {
        match child.try_wait()? {
            Some(status) => break Some(status),
            None => {
                if let Some(d) = deadline {
                    if Instant::now() >= d {
                        debug!(command, "process endpoint timed out, killing");
                        let _ = child.kill();
                        let _ = child.wait();
                        break None;
                    }
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    };

    let mut stdout = String::new();
    let mut stderr = String::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_string(&mut stdout);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_string(&mut stderr);
    }

    Ok(match status {
        Some(status) => ProcessOutcome {
            success: status.success(),
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        },
        None => ProcessOutcome {
            success: false,
            exit_code: -1,
            stdout,
            stderr,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cat_consumes_message() {
        let outcome = deliver("cat", &[], None, 5000, "From: a@b\r\n\r\nhello\r\n").unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.stdout.contains("hello"));
    }

    #[test]
    fn false_reports_failure() {
        let outcome = deliver("false", &[], None, 5000, "msg").unwrap();
        assert!(!outcome.success);
        assert_ne!(outcome.exit_code, 0);
    }

    #[test]
    fn missing_command_errors() {
        assert!(deliver("/nonexistent/binary", &[], None, 1000, "msg").is_err());
    }

    #[test]
    fn timeout_kills_the_child() {
        let start = Instant::now();
        let outcome = deliver("sleep", &["30".to_string()], None, 200, "msg").unwrap();
        assert!(!outcome.success);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
