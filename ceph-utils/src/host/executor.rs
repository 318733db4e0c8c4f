// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::host::{
    error::output_to_exec_error, error::ExecutionError, input::Input,
    output::Output, output::OutputExt,
};

use itertools::Itertools;
use slog::{debug, error, info, Logger};
use std::io::Read;
use std::process::{Command, Stdio};
use std::str::from_utf8;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How often a command running under a timeout is polled for completion.
const TIMEOUT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn command_to_string(command: &std::process::Command) -> String {
    Input::from(command).to_string()
}

fn to_space_separated_string<T, I>(iter: T) -> String
where
    T: IntoIterator<Item = I>,
    I: std::fmt::Debug,
{
    Itertools::intersperse(
        iter.into_iter().map(|arg| format!("{arg:?}")),
        " ".into(),
    )
    .collect::<String>()
}

pub fn log_input(log: &Logger, id: u64, command: &Command) {
    info!(
        log,
        "running command via executor"; "id" => id, "command" => %Input::from(command)
    );
    debug!(
        log,
        "running command via executor"; "id" => id, "envs" => %to_space_separated_string(command.get_envs())
    );
}

pub fn log_output(log: &Logger, id: u64, output: &Output) {
    info!(
        log,
        "finished running command via executor";
        "id" => id,
        "result" => if output.status.success() { "OK" } else { "ERROR" },
        "status" => output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string()),
    );
    if !output.stdout.is_empty() {
        debug!(
            log,
            "finished command stdout";
            "id" => id,
            "stdout" => from_utf8(&output.stdout).unwrap_or("<Not valid UTF-8>"),
        );
    }
    if !output.stderr.is_empty() {
        debug!(
            log,
            "finished command stderr";
            "id" => id,
            "stderr" => from_utf8(&output.stderr).unwrap_or("<Not valid UTF-8>"),
        );
    }
}

/// Describes the commonly-used "safe-to-reference" type describing the
/// Executor as a trait object.
pub type BoxedExecutor = Arc<dyn Executor>;

/// Describes an "executor", which can run [Command]s and return a response.
///
/// - In production, this is usually simply a [HostExecutor].
/// - Under test, this can be customized, and a [FakeExecutor] may be used.
pub trait Executor: Send + Sync {
    /// Executes a task, waiting for it to complete, and returning output.
    ///
    /// A command which exits unsuccessfully is reported as
    /// [ExecutionError::CommandFailure].
    fn execute(&self, command: &mut Command) -> Result<Output, ExecutionError>;
}

/// Handler called when a fake command is executed.
pub type HandlerFn = dyn FnMut(Input) -> Output + Send + Sync;
pub type BoxedHandlerFn = Box<HandlerFn>;

/// An executor which can expect certain inputs, and respond with specific outputs.
pub struct FakeExecutor {
    log: Logger,
    counter: AtomicU64,
    handler: Mutex<BoxedHandlerFn>,
}

impl FakeExecutor {
    pub fn new(log: Logger) -> Arc<FakeExecutor> {
        Arc::new(Self {
            log,
            counter: AtomicU64::new(0),
            handler: Mutex::new(Box::new(|_input| Output::success())),
        })
    }

    /// Set the request handler to an arbitrary function.
    pub fn set_handler(&self, f: BoxedHandlerFn) {
        *self.handler.lock().unwrap() = f;
    }

    /// Perform some type coercion to access a commonly-used trait object.
    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

impl Executor for FakeExecutor {
    fn execute(&self, command: &mut Command) -> Result<Output, ExecutionError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        log_input(&self.log, id, command);

        let output = self.handler.lock().unwrap()(Input::from(&*command));
        log_output(&self.log, id, &output);

        if !output.status.success() {
            return Err(output_to_exec_error(
                command_to_string(command),
                &output,
            ));
        }
        Ok(output)
    }
}

/// Runs commands on the real host.
pub struct HostExecutor {
    log: slog::Logger,
    counter: std::sync::atomic::AtomicU64,
    timeout: Option<Duration>,
}

impl HostExecutor {
    pub fn new(log: Logger) -> Arc<Self> {
        Arc::new(Self { log, counter: AtomicU64::new(0), timeout: None })
    }

    /// Like [Self::new], but kills any command still running after
    /// `timeout` and reports it as [ExecutionError::Timeout].
    pub fn with_timeout(log: Logger, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            log,
            counter: AtomicU64::new(0),
            timeout: Some(timeout),
        })
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }

    fn prepare(&self, command: &Command) -> u64 {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        log_input(&self.log, id, command);
        id
    }

    fn finalize(
        &self,
        command: &Command,
        id: u64,
        output: Output,
    ) -> Result<Output, ExecutionError> {
        log_output(&self.log, id, &output);
        if !output.status.success() {
            return Err(output_to_exec_error(
                command_to_string(command),
                &output,
            ));
        }
        Ok(output)
    }

    fn output_with_timeout(
        &self,
        id: u64,
        command: &mut Command,
        timeout: Duration,
    ) -> Result<Output, ExecutionError> {
        let command_str = command_to_string(command);
        let start_error = |err: std::io::Error| ExecutionError::ExecutionStart {
            command: command_str.clone(),
            err,
        };
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                error!(self.log, "Could not start program!"; "id" => id);
                err
            })
            .map_err(start_error)?;

        // Drain both pipes while waiting so a chatty child cannot block on a
        // full pipe buffer.
        let stdout = child.stdout.take().map(drain_pipe);
        let stderr = child.stderr.take().map(drain_pipe);

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait().map_err(start_error)? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    error!(
                        self.log,
                        "Command timed out, killing it";
                        "id" => id,
                        "timeout" => ?timeout,
                    );
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ExecutionError::Timeout {
                        command: command_str.clone(),
                        timeout,
                    });
                }
                None => std::thread::sleep(TIMEOUT_POLL_INTERVAL),
            }
        };

        Ok(Output {
            status,
            stdout: join_pipe(stdout),
            stderr: join_pipe(stderr),
        })
    }
}

fn drain_pipe<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn join_pipe(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

impl Executor for HostExecutor {
    fn execute(&self, command: &mut Command) -> Result<Output, ExecutionError> {
        let id = self.prepare(command);
        let output = match self.timeout {
            Some(timeout) => self.output_with_timeout(id, command, timeout)?,
            None => command.output().map_err(|err| {
                error!(self.log, "Could not start program!"; "id" => id);
                ExecutionError::ExecutionStart {
                    command: command_to_string(command),
                    err,
                }
            })?,
        };
        self.finalize(command, id, output)
    }
}

/// A handler that may be used for setting inputs/outputs to the executor
/// when these commands are known ahead-of-time.
///
/// See: [Self::register] for integration with a [FakeExecutor].
pub struct StaticHandler {
    expected: Vec<(Input, Output)>,
    index: usize,
}

impl StaticHandler {
    pub fn new() -> Self {
        Self { expected: Vec::new(), index: 0 }
    }

    /// Convenience function to register the handler with a [FakeExecutor].
    pub fn register(mut self, executor: &FakeExecutor) {
        executor.set_handler(Box::new(move |input| -> Output {
            self.execute(input)
        }));
    }

    /// Expects a static "input" to exactly produce some "output".
    pub fn expect(&mut self, input: Input, output: Output) {
        self.expected.push((input, output));
    }

    /// A helper for [Self::expect] which quietly succeeds.
    pub fn expect_ok<S: AsRef<str>>(&mut self, input: S) {
        self.expect(Input::shell(input), Output::success())
    }

    /// A helper for [Self::expect] which quietly fails.
    pub fn expect_fail<S: AsRef<str>>(&mut self, input: S) {
        self.expect(Input::shell(input), Output::failure())
    }

    /// A helper for [Self::expect] which succeeds with the given stdout.
    pub fn expect_stdout<S: AsRef<str>, O: AsRef<str>>(
        &mut self,
        input: S,
        stdout: O,
    ) {
        self.expect(Input::shell(input), Output::success().set_stdout(stdout))
    }

    fn execute(&mut self, observed_input: Input) -> Output {
        let (input, output) = self
            .expected
            .get(self.index)
            .unwrap_or_else(|| panic!("Unexpected command: {observed_input}"));
        self.index += 1;

        assert_eq!(&observed_input, input, "Unexpected input command");
        output.clone()
    }
}

impl Default for StaticHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StaticHandler {
    fn drop(&mut self) {
        let expected = self.expected.len();
        let actual = self.index;
        if actual < expected {
            let tip = self.expected[actual].0.to_string();
            let errmsg = format!("Only saw {actual} calls, expected {expected}\nNext would have been: {tip}");
            if !std::thread::panicking() {
                assert!(false, "{errmsg}");
            } else {
                eprintln!("{errmsg}");
            }
        }
    }
}

/// A logger for tests, writing through the test harness' captured stdout.
#[cfg(any(test, feature = "testing"))]
pub fn test_log() -> Logger {
    use slog::Drain;

    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, slog::o!())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_static_handler_answers_in_order() {
        let executor = FakeExecutor::new(test_log());
        let mut handler = StaticHandler::new();
        handler.expect_stdout("rados --id mysql lspools", "rbd\nmysql\n");
        handler.expect_fail("rbd showmapped --format=json");
        handler.register(&executor);

        let executor = executor.as_executor();
        let output = executor
            .execute(Command::new("rados").args(["--id", "mysql", "lspools"]))
            .unwrap();
        assert_eq!(output.stdout, b"rbd\nmysql\n");

        let err = executor
            .execute(Command::new("rbd").args(["showmapped", "--format=json"]))
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(1));
    }

    #[test]
    fn test_host_executor_reports_failures() {
        let executor = HostExecutor::new(test_log()).as_executor();
        executor.execute(&mut Command::new("true")).unwrap();

        let err = executor.execute(&mut Command::new("false")).unwrap_err();
        assert!(matches!(err, ExecutionError::CommandFailure(_)), "{err}");

        let err = executor
            .execute(&mut Command::new("/nonexistent/charm-storage-binary"))
            .unwrap_err();
        assert!(matches!(err, ExecutionError::ExecutionStart { .. }), "{err}");
    }

    #[test]
    fn test_host_executor_timeout_kills_command() {
        let executor =
            HostExecutor::with_timeout(test_log(), Duration::from_millis(200))
                .as_executor();
        let err = executor
            .execute(Command::new("sleep").arg("10"))
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout { .. }), "{err}");

        let output = executor
            .execute(Command::new("echo").arg("hello"))
            .unwrap();
        assert_eq!(output.stdout, b"hello\n");
    }
}
