use crate::exec::{CommandSpec, ExecError, ExecOutput, Runner};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;

/// One recorded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// The argv vector.
    pub argv: Vec<String>,
    /// Bytes fed to stdin.
    pub input: Option<Vec<u8>>,
    /// Extra environment.
    pub env: Vec<(String, String)>,
    /// Whether the command was spawned detached.
    pub detached: bool,
}

#[derive(Debug, Clone)]
struct Response {
    prefix: Vec<String>,
    output: ExecOutput,
    delay: Option<Duration>,
}

/// A [`Runner`] that replays scripted outputs.
///
/// Responses match on argv prefix; the most recently registered match
/// wins. Unmatched commands succeed with empty output.
#[derive(Debug, Default)]
pub struct FakeRunner {
    responses: Mutex<Vec<Response>>,
    calls: Mutex<Vec<Invocation>>,
}

impl FakeRunner {
    /// Create a runner where every command succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the result of commands starting with `prefix`.
    pub fn respond(&self, prefix: &[&str], exit_code: i32, stdout: &str, stderr: &str) {
        self.push(prefix, exit_code, stdout, stderr, None);
    }

    /// Like [`FakeRunner::respond`] but the command takes `delay` to finish.
    pub fn respond_after(
        &self,
        prefix: &[&str],
        delay: Duration,
        exit_code: i32,
        stdout: &str,
        stderr: &str,
    ) {
        self.push(prefix, exit_code, stdout, stderr, Some(delay));
    }

    fn push(&self, prefix: &[&str], exit_code: i32, stdout: &str, stderr: &str, delay: Option<Duration>) {
        self.responses.lock().push(Response {
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            output: ExecOutput {
                exit_code,
                stdout: stdout.as_bytes().to_vec(),
                stderr: stderr.as_bytes().to_vec(),
                timed_out: false,
            },
            delay,
        });
    }

    /// Every recorded invocation.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.calls.lock().clone()
    }

    /// Argv of every recorded command.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().iter().map(|c| c.argv.clone()).collect()
    }

    /// Stdin of every recorded command.
    pub fn inputs(&self) -> Vec<Option<Vec<u8>>> {
        self.calls.lock().iter().map(|c| c.input.clone()).collect()
    }

    /// Environment of every recorded command.
    pub fn envs(&self) -> Vec<Vec<(String, String)>> {
        self.calls.lock().iter().map(|c| c.env.clone()).collect()
    }

    fn record(&self, spec: &CommandSpec, detached: bool) -> Option<Response> {
        self.calls.lock().push(Invocation {
            argv: spec.argv.clone(),
            input: spec.input.clone(),
            env: spec.env.clone(),
            detached,
        });
        self.responses
            .lock()
            .iter()
            .rev()
            .find(|r| spec.argv.starts_with(&r.prefix))
            .cloned()
    }
}

#[async_trait]
impl Runner for FakeRunner {
    async fn run(&self, spec: CommandSpec) -> Result<ExecOutput, ExecError> {
        if spec.argv.is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        let Some(response) = self.record(&spec, false) else {
            return Ok(ExecOutput::default());
        };
        if let Some(delay) = response.delay {
            match spec.timeout {
                Some(limit) if limit < delay => {
                    tokio::time::sleep(limit).await;
                    return Ok(ExecOutput {
                        exit_code: 128 + libc::SIGTERM,
                        timed_out: true,
                        ..Default::default()
                    });
                }
                _ => tokio::time::sleep(delay).await,
            }
        }
        Ok(response.output)
    }

    fn spawn_detached(&self, spec: CommandSpec) -> Result<(), ExecError> {
        if spec.argv.is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        self.record(&spec, true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_latest_matching_response_wins() {
        let runner = FakeRunner::new();
        runner.respond(&["zpool"], 1, "", "first");
        runner.respond(&["zpool", "export"], 2, "", "second");
        let out = runner.run(CommandSpec::new(["zpool", "export", "tank"])).await.unwrap();
        assert_eq!(out.exit_code, 2);
        let out = runner.run(CommandSpec::new(["zpool", "list"])).await.unwrap();
        assert_eq!(out.exit_code, 1);
        let out = runner.run(CommandSpec::new(["true"])).await.unwrap();
        assert!(out.success());
        assert_eq!(runner.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_respects_timeout() {
        let runner = FakeRunner::new();
        runner.respond_after(&["sleep"], Duration::from_secs(10), 0, "", "");
        let out = runner
            .run(CommandSpec::new(["sleep"]).with_timeout(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(out.timed_out);
    }
}
