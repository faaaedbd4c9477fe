//! Direct program execution for the `shell` tool.
//!
//! Blocking; async callers run it on `spawn_blocking`. Both pipes are
//! drained on their own threads while the child runs, so a chatty program
//! cannot stall on a full pipe before the deadline.

use std::io::{self, Read};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// What a finished or killed program left behind.
#[derive(Debug)]
pub struct CommandRun {
    /// `None` when killed by a signal, including our own timeout kill.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Stdout bytes past the limit, read and thrown away.
    pub stdout_dropped: u64,
    pub timed_out: bool,
}

impl CommandRun {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Trimmed stdout, marked when it was cut short.
    pub fn summary(&self) -> String {
        let mut summary = self.stdout.trim_end().to_string();
        if self.stdout_dropped > 0 {
            summary.push_str(&format!("\n[output truncated, {} bytes dropped]", self.stdout_dropped));
        }
        summary
    }
}

/// Run `argv[0]` with the remaining arguments, stdin closed, killing it at
/// `timeout`. At most `output_limit` bytes of each stream are kept.
#[instrument(skip_all, fields(program = argv.first().map(String::as_str), timeout_ms = timeout.as_millis() as u64))]
pub fn run_argv(argv: &[String], timeout: Duration, output_limit: usize) -> Result<CommandRun> {
    let (program, args) = argv.split_first().context("empty command")?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn {program}"))?;

    let stdout = child.stdout.take().context("stdout was not piped")?;
    let stderr = child.stderr.take().context("stderr was not piped")?;
    let limit = output_limit as u64;

    thread::scope(|scope| -> Result<CommandRun> {
        let out = scope.spawn(move || capture(stdout, limit));
        let err = scope.spawn(move || capture(stderr, limit));

        let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
            Some(status) => (status, false),
            None => {
                warn!("command timed out, killing");
                child.kill().context("kill command")?;
                (child.wait().context("reap killed command")?, true)
            }
        };

        let (stdout, stdout_dropped) = out
            .join()
            .map_err(|_| anyhow!("stdout reader panicked"))?
            .context("read stdout")?;
        let (stderr, _) = err
            .join()
            .map_err(|_| anyhow!("stderr reader panicked"))?
            .context("read stderr")?;

        debug!(exit_code = ?status.code(), timed_out, stdout_dropped, "command finished");
        Ok(CommandRun {
            exit_code: status.code(),
            stdout,
            stderr,
            stdout_dropped,
            timed_out,
        })
    })
}

/// Keep the first `limit` bytes, drain and count the rest.
fn capture(mut reader: impl Read, limit: u64) -> io::Result<(String, u64)> {
    let mut kept = Vec::new();
    (&mut reader).take(limit).read_to_end(&mut kept)?;
    let dropped = io::copy(&mut reader, &mut io::sink())?;
    Ok((String::from_utf8_lossy(&kept).into_owned(), dropped))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|part| part.to_string()).collect()
    }

    #[test]
    fn echo_succeeds_with_its_output() {
        let run = run_argv(&argv(&["echo", "hello"]), Duration::from_secs(5), 1024).expect("run");
        assert!(run.succeeded());
        assert_eq!(run.summary(), "hello");
    }

    #[test]
    fn long_output_is_cut_and_marked() {
        let run = run_argv(&argv(&["echo", "abcdefghij"]), Duration::from_secs(5), 4).expect("run");
        assert_eq!(run.stdout, "abcd");
        assert_eq!(run.stdout_dropped, 7);
        assert!(run.summary().contains("7 bytes dropped"));
    }

    #[test]
    fn deadline_kills_the_child() {
        let run = run_argv(&argv(&["sleep", "5"]), Duration::from_millis(100), 1024).expect("run");
        assert!(run.timed_out);
        assert!(!run.succeeded());
    }

    #[test]
    fn missing_program_is_an_error() {
        assert!(run_argv(&argv(&["definitely-not-a-program"]), Duration::from_secs(1), 16).is_err());
        assert!(run_argv(&[], Duration::from_secs(1), 16).is_err());
    }
}
