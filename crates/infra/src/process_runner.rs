//! Bisection runs in fresh OS processes.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::debug;

use leaseq_core::{BisectError, IsolatedRunner, Verdict};

/// Spawns `program args... items...` once per run.
///
/// Exit status 0 means the failing item (the last argument) passed; any other
/// status, including death by signal, means it failed.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    inherit_output: bool,
}

impl ProcessRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            inherit_output: false,
        }
    }

    /// Fixed arguments placed before the item ids.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Let the child write to this process's stdout/stderr.
    pub fn inherit_output(mut self, inherit: bool) -> Self {
        self.inherit_output = inherit;
        self
    }

    fn command(&self, items: &[String]) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(items)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());
        if !self.inherit_output {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        command
    }
}

impl IsolatedRunner for ProcessRunner {
    fn run(&mut self, items: &[String]) -> Result<Verdict, BisectError> {
        let status = self.command(items).status().map_err(|e| {
            BisectError::Runner(format!("failed to spawn {}: {e}", self.program.display()))
        })?;
        debug!(program = %self.program.display(), items = items.len(), ?status, "isolated run finished");
        Ok(if status.success() {
            Verdict::Passed
        } else {
            Verdict::Failed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_program_is_runner_error() {
        let mut runner = ProcessRunner::new("/nonexistent/leaseq-runner");
        let result = runner.run(&["a".to_string()]);
        assert!(matches!(result, Err(BisectError::Runner(_))));
    }

    #[cfg(unix)]
    #[test]
    fn exit_status_maps_to_verdict() {
        // `sh -c script name args...`: $0 is "runner", items follow.
        let script = r#"for item in "$@"; do [ "$item" = "$LEAKY" ] && exit 1; done; exit 0"#;
        let mut runner = ProcessRunner::new("sh")
            .arg("-c")
            .arg(script)
            .arg("runner")
            .env("LEAKY", "t2");

        let clean = vec!["t0".to_string(), "t1".to_string(), "failing".to_string()];
        let leaky = vec!["t2".to_string(), "failing".to_string()];
        assert_eq!(runner.run(&clean).unwrap(), Verdict::Passed);
        assert_eq!(runner.run(&leaky).unwrap(), Verdict::Failed);
    }

    #[cfg(unix)]
    #[test]
    fn bisects_through_real_processes() {
        use leaseq_core::{BisectOutcome, BisectSession, Bisector};

        let script = r#"for item in "$@"; do [ "$item" = "$LEAKY" ] && exit 1; done; exit 0"#;
        let runner = ProcessRunner::new("sh")
            .arg("-c")
            .arg(script)
            .arg("runner")
            .env("LEAKY", "t5");

        let suspects: Vec<String> = (0..9).map(|i| format!("t{i}")).collect();
        let outcome = Bisector::new(runner)
            .run(BisectSession::new(suspects, "failing"))
            .unwrap();
        assert!(matches!(outcome, BisectOutcome::LeakFound { ref culprit, .. } if culprit == "t5"));
    }
}
