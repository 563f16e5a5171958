use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::debug;
use wait_timeout::ChildExt;

use crate::error::ExecutorError;

/// Runs a program on the host and captures its output.
///
/// A non-zero exit is reported through `CommandOutput::exit_code`; only a
/// failure of the execution primitive itself is an `ExecutorError`.
pub trait CommandExecutor: Send + Sync {
    fn execute(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, ExecutorError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub struct SystemCommandExecutor;

impl CommandExecutor for SystemCommandExecutor {
    fn execute(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, ExecutorError> {
        let mut cmd = build_command(program, args, cwd);
        debug!("Executing {}", command_line(program, args));

        let output = cmd.output().map_err(|e| spawn_error(program, e))?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Host executor that kills the child once `timeout` elapses.
pub struct TimeoutCommandExecutor {
    timeout: Duration,
}

impl TimeoutCommandExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CommandExecutor for TimeoutCommandExecutor {
    fn execute(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, ExecutorError> {
        let mut cmd = build_command(program, args, cwd);
        debug!(
            "Executing {} (timeout {:?})",
            command_line(program, args),
            self.timeout
        );

        let mut child = cmd.spawn().map_err(|e| spawn_error(program, e))?;

        // Drain both pipes while waiting so a chatty child never blocks on a full buffer.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_reader = thread::spawn(move || read_pipe(stdout));
        let stderr_reader = thread::spawn(move || read_pipe(stderr));

        let status = child
            .wait_timeout(self.timeout)
            .map_err(|source| ExecutorError::Wait {
                program: program.to_string(),
                source,
            })?;

        let Some(status) = status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ExecutorError::TimedOut {
                command: command_line(program, args),
                timeout: self.timeout,
            });
        };

        Ok(CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: stdout_reader.join().unwrap_or_default(),
            stderr: stderr_reader.join().unwrap_or_default(),
        })
    }
}

fn build_command(program: &str, args: &[String], cwd: Option<&Path>) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd
}

fn spawn_error(program: &str, source: std::io::Error) -> ExecutorError {
    if source.kind() == ErrorKind::NotFound {
        ExecutorError::ToolNotFound {
            program: program.to_string(),
        }
    } else {
        ExecutorError::Spawn {
            program: program.to_string(),
            source,
        }
    }
}

fn read_pipe<R: Read>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).to_string()
}

pub fn shell_escape(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    if arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+".contains(c))
    {
        return arg.to_string();
    }
    let escaped = arg.replace('\'', "'\\''");
    format!("'{}'", escaped)
}

pub fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|a| shell_escape(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Printable form of an invocation, used for logs and error messages.
pub fn command_line(program: &str, args: &[String]) -> String {
    let mut s = program.to_string();
    for a in args {
        s.push(' ');
        s.push_str(&shell_escape(a));
    }
    s
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl RecordedCall {
    pub fn command_line(&self) -> String {
        command_line(&self.program, &self.args)
    }
}

#[derive(Debug, Clone)]
enum ScriptedResponse {
    Output(CommandOutput),
    ToolNotFound,
}

#[derive(Debug, Default)]
struct Script {
    rules: Vec<(String, ScriptedResponse)>,
    fallback: Option<CommandOutput>,
    calls: Vec<RecordedCall>,
}

/// Deterministic command executor used in tests where shelling out is undesirable.
///
/// Responses are keyed by a fragment of the printed command line; the first
/// matching rule wins and unmatched commands succeed with the fallback output.
/// Clones share the same script and call log.
#[derive(Clone, Debug, Default)]
pub struct SimulatedCommandExecutor {
    script: Arc<Mutex<Script>>,
}

impl SimulatedCommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn success(stdout: impl Into<String>) -> Self {
        let executor = Self::new();
        executor.lock().fallback = Some(CommandOutput {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        });
        executor
    }

    pub fn failure(stderr: impl Into<String>) -> Self {
        let executor = Self::new();
        executor.lock().fallback = Some(CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: stderr.into(),
        });
        executor
    }

    pub fn respond(self, fragment: impl Into<String>, output: CommandOutput) -> Self {
        self.lock()
            .rules
            .push((fragment.into(), ScriptedResponse::Output(output)));
        self
    }

    pub fn succeed_with(self, fragment: impl Into<String>, stdout: impl Into<String>) -> Self {
        self.respond(
            fragment,
            CommandOutput {
                exit_code: 0,
                stdout: stdout.into(),
                stderr: String::new(),
            },
        )
    }

    pub fn fail_with(
        self,
        fragment: impl Into<String>,
        exit_code: i32,
        stderr: impl Into<String>,
    ) -> Self {
        self.respond(
            fragment,
            CommandOutput {
                exit_code,
                stdout: String::new(),
                stderr: stderr.into(),
            },
        )
    }

    /// Matching invocations behave as if the program is not installed.
    pub fn tool_missing(self, fragment: impl Into<String>) -> Self {
        self.lock()
            .rules
            .push((fragment.into(), ScriptedResponse::ToolNotFound));
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .map(RecordedCall::command_line)
            .collect()
    }

    pub fn was_called_with(&self, fragment: &str) -> bool {
        self.command_lines().iter().any(|l| l.contains(fragment))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CommandExecutor for SimulatedCommandExecutor {
    fn execute(
        &self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, ExecutorError> {
        let mut script = self.lock();
        let call = RecordedCall {
            program: program.to_string(),
            args: args.to_vec(),
            cwd: cwd.map(Path::to_path_buf),
        };
        let line = call.command_line();
        script.calls.push(call);

        let response = script
            .rules
            .iter()
            .find(|(fragment, _)| line.contains(fragment.as_str()))
            .map(|(_, response)| response.clone());

        match response {
            Some(ScriptedResponse::Output(output)) => Ok(output),
            Some(ScriptedResponse::ToolNotFound) => Err(ExecutorError::ToolNotFound {
                program: program.to_string(),
            }),
            None => Ok(script.fallback.clone().unwrap_or(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })),
        }
    }
}
