//! Allow-listed command execution.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::errors::CommandError;
use crate::core::types::{CommandResult, OpEvent, OpKind, OpLog, now};
use crate::io::config::FlowConfig;
use crate::io::process::run_command_with_timeout;

/// Runs only argv vectors that exactly match an allow-list entry.
///
/// The guard never touches run state: callers decide where the returned
/// [`CommandResult`] is recorded.
#[derive(Debug, Clone)]
pub struct CommandGuard {
    allowed: Vec<Vec<String>>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandGuard {
    pub fn new(allowed: Vec<Vec<String>>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            allowed,
            timeout,
            output_limit_bytes,
        }
    }

    pub fn from_config(cfg: &FlowConfig) -> Self {
        Self::new(
            cfg.security.allowed_commands.clone(),
            Duration::from_secs(cfg.runs.timeout_seconds),
            cfg.runs.output_limit_bytes,
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_allowed(&self, argv: &[String]) -> bool {
        self.allowed.iter().any(|entry| entry.as_slice() == argv)
    }

    /// Run `argv` in `cwd`.
    ///
    /// Refusals are returned as [`CommandError`] before anything is spawned.
    /// A timeout is not an error: it yields a result with no exit code.
    #[instrument(skip_all, fields(command = %argv.join(" ")))]
    pub fn run(&self, argv: &[String], cwd: &Path, log: &mut OpLog) -> Result<CommandResult> {
        let started_at = now();
        let target = argv.join(" ");
        let refuse = |log: &mut OpLog, err: CommandError| -> Result<CommandResult> {
            warn!(err = %err, "command refused");
            log.push(OpEvent {
                op: OpKind::Exec,
                target: target.clone(),
                ok: false,
                bytes: 0,
                started_at,
                finished_at: now(),
                error: Some(err.to_string()),
            });
            Err(err.into())
        };
        let Some((program, args)) = argv.split_first() else {
            return refuse(log, CommandError::Empty);
        };
        if !self.is_allowed(argv) {
            return refuse(log, CommandError::NotAllowed(argv.to_vec()));
        }

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(cwd);
        let output = match run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)
        {
            Ok(output) => output,
            Err(err) => {
                log.push(OpEvent {
                    op: OpKind::Exec,
                    target,
                    ok: false,
                    bytes: 0,
                    started_at,
                    finished_at: now(),
                    error: Some(format!("{err:#}")),
                });
                return Err(err);
            }
        };
        let finished_at = now();

        let timeout_seconds = self.timeout.as_secs();
        let mut stderr = output.stderr_text();
        if output.timed_out {
            stderr = format!("command timed out after {timeout_seconds}s");
        }
        let result = CommandResult {
            command: argv.to_vec(),
            started_at,
            finished_at,
            exit_code: output.exit_code(),
            stdout: output.stdout_text(),
            stderr,
            timeout_seconds,
            timed_out: output.timed_out,
        };
        info!(exit_code = ?result.exit_code, timed_out = result.timed_out, "command finished");
        log.push(OpEvent {
            op: OpKind::Exec,
            target,
            ok: result.succeeded(),
            bytes: (output.stdout.len() + output.stderr.len()) as u64,
            started_at,
            finished_at,
            error: (!result.succeeded()).then(|| match result.exit_code {
                Some(code) => format!("exit code {code}"),
                None => result.stderr.clone(),
            }),
        });
        Ok(result)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn guard(allowed: &[&[&str]], timeout: Duration) -> CommandGuard {
        CommandGuard::new(allowed.iter().map(|a| argv(a)).collect(), timeout, 4096)
    }

    #[test]
    fn runs_exact_allow_listed_argv() {
        let temp = tempfile::tempdir().expect("tempdir");
        let g = guard(&[&["sh", "-c", "echo hi"]], Duration::from_secs(10));
        let mut log = OpLog::new();
        let result = g
            .run(&argv(&["sh", "-c", "echo hi"]), temp.path(), &mut log)
            .expect("run");
        assert!(result.succeeded());
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(log.events().len(), 1);
        assert_eq!(log.events()[0].op, OpKind::Exec);
        assert!(log.events()[0].ok);
    }

    #[test]
    fn prefix_or_extended_argv_is_refused_before_spawn() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("spawned");
        let g = guard(&[&["touch", "other"]], Duration::from_secs(10));
        let mut log = OpLog::new();
        let bad = argv(&["touch", marker.to_str().expect("utf8 path")]);
        let err = g.run(&bad, temp.path(), &mut log).expect_err("refused");
        assert_eq!(
            err.downcast_ref::<CommandError>(),
            Some(&CommandError::NotAllowed(bad.clone()))
        );
        assert!(!marker.exists());
        assert!(!log.events()[0].ok);

        let err = g.run(&[], temp.path(), &mut log).expect_err("empty");
        assert_eq!(err.downcast_ref::<CommandError>(), Some(&CommandError::Empty));
    }

    #[test]
    fn timeout_yields_null_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cmd = ["sh", "-c", "exec sleep 5"];
        let g = guard(&[&cmd], Duration::from_secs(1));
        let result = g
            .run(&argv(&cmd), temp.path(), &mut OpLog::new())
            .expect("run");
        assert_eq!(result.exit_code, None);
        assert!(result.timed_out);
        assert_eq!(result.stderr, "command timed out after 1s");
    }

    #[test]
    fn nonzero_exit_is_a_result_not_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cmd = ["sh", "-c", "echo boom >&2; exit 2"];
        let g = guard(&[&cmd], Duration::from_secs(10));
        let mut log = OpLog::new();
        let result = g.run(&argv(&cmd), temp.path(), &mut log).expect("run");
        assert_eq!(result.exit_code, Some(2));
        assert_eq!(result.stderr, "boom\n");
        assert_eq!(log.events()[0].error.as_deref(), Some("exit code 2"));
    }
}
