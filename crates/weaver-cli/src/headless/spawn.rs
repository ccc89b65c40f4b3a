//! Fluent construction of a [`BaseProcess`] from provider configuration.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::parser::EventParser;
use super::process::{BaseProcess, InitHook, ProcessError};

/// What the subprocess sees on stdin: closed, or a single prompt blob
/// written then closed.
pub enum StdinMode {
    Closed,
    Prompt(String),
}

/// Test seam: substitutes the command construction without touching the
/// rest of the pipeline.
pub type CommandFactory =
    Box<dyn Fn(&Path, &[String]) -> tokio::process::Command + Send + Sync>;

pub struct SpawnBuilder {
    provider: &'static str,
    executable: Option<PathBuf>,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    parser: Option<Arc<dyn EventParser>>,
    timeout: Option<Duration>,
    stdin: StdinMode,
    capture_stderr: bool,
    on_init: Option<InitHook>,
    command_factory: Option<CommandFactory>,
}

impl SpawnBuilder {
    pub fn new(provider: &'static str) -> Self {
        Self {
            provider,
            executable: None,
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            parser: None,
            timeout: None,
            stdin: StdinMode::Closed,
            capture_stderr: false,
            on_init: None,
            command_factory: None,
        }
    }

    pub fn executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Appended to the inherited environment; never replaces it.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn parser(mut self, parser: Arc<dyn EventParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stdin_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.stdin = StdinMode::Prompt(prompt.into());
        self
    }

    pub fn capture_stderr(mut self, capture: bool) -> Self {
        self.capture_stderr = capture;
        self
    }

    pub fn on_init(mut self, hook: InitHook) -> Self {
        self.on_init = Some(hook);
        self
    }

    pub fn command_factory(mut self, factory: CommandFactory) -> Self {
        self.command_factory = Some(factory);
        self
    }

    /// Validate, spawn, and wire up the process. Everything created before
    /// a failure (token, child, pipes) is torn down before returning.
    pub fn spawn(self) -> Result<Arc<BaseProcess>, ProcessError> {
        let executable = self.executable.ok_or(ProcessError::MissingExecutable)?;
        let parser = self.parser.ok_or(ProcessError::MissingParser)?;

        let cancel_token = CancellationToken::new();
        let working_dir = self
            .working_dir
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        // Created pending; only a successfully spawned child moves it to
        // running.
        let process = BaseProcess::pending(
            self.provider,
            working_dir.clone(),
            self.capture_stderr,
            cancel_token.clone(),
        );

        let mut command = match &self.command_factory {
            Some(factory) => factory(&executable, &self.args),
            None => {
                let mut command = tokio::process::Command::new(&executable);
                command.args(&self.args);
                command
            },
        };
        command
            .current_dir(&working_dir)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match &self.stdin {
            StdinMode::Closed => {
                command.stdin(Stdio::null());
            },
            StdinMode::Prompt(_) => {
                command.stdin(Stdio::piped());
            },
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                cancel_token.cancel();
                return Err(ProcessError::Spawn {
                    executable: executable.display().to_string(),
                    source,
                });
            },
        };

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                cancel_token.cancel();
                let _ = child.start_kill();
                return Err(ProcessError::Stdio("stdout"));
            },
        };
        let stderr = match child.stderr.take() {
            Some(stderr) => stderr,
            None => {
                cancel_token.cancel();
                let _ = child.start_kill();
                return Err(ProcessError::Stdio("stderr"));
            },
        };

        if let StdinMode::Prompt(prompt) = self.stdin {
            let Some(mut stdin) = child.stdin.take() else {
                cancel_token.cancel();
                let _ = child.start_kill();
                return Err(ProcessError::Stdio("stdin"));
            };
            let provider = self.provider;
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
                    debug!(provider, %err, "failed to write prompt to stdin");
                }
                let _ = stdin.shutdown().await;
            });
        }

        process
            .clone()
            .activate(child, stdout, stderr, parser, self.on_init, self.timeout);
        Ok(process)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::headless::event::OutputEventKind;
    use crate::headless::parser::ClaudeParser;
    use crate::headless::process::{HeadlessProcess, ProcessStatus};

    fn sh(script: &str) -> SpawnBuilder {
        SpawnBuilder::new("claude")
            .executable("sh")
            .args(["-c", script])
            .parser(Arc::new(ClaudeParser::default()))
    }

    #[tokio::test]
    async fn test_missing_executable_and_parser_rejected() {
        let err = SpawnBuilder::new("claude")
            .parser(Arc::new(ClaudeParser::default()))
            .spawn()
            .err()
            .unwrap();
        assert!(matches!(err, ProcessError::MissingExecutable));

        let err = SpawnBuilder::new("claude")
            .executable("sh")
            .spawn()
            .err()
            .unwrap();
        assert!(matches!(err, ProcessError::MissingParser));
    }

    #[tokio::test]
    async fn test_events_parsed_and_raw_preserved() {
        let init = r#"{"type":"system","subtype":"init","session_id":"s-1"}"#;
        let result = r#"{"type":"result","subtype":"success"}"#;
        let process = sh(&format!("echo '{init}'; echo '{result}'")).spawn().unwrap();

        let mut events = process.take_events().unwrap();
        let first = events.recv().await.unwrap();
        assert!(first.is_init());
        assert_eq!(first.raw.as_ref(), init.as_bytes());
        let second = events.recv().await.unwrap();
        assert_eq!(second.kind, OutputEventKind::Result);

        assert_eq!(process.wait().await, ProcessStatus::Completed);
        assert!(events.recv().await.is_none());
        assert_eq!(process.session_ref().as_deref(), Some("s-1"));
    }

    #[tokio::test]
    async fn test_first_session_ref_wins() {
        let process = sh(concat!(
            r#"echo '{"type":"system","subtype":"init","session_id":"first"}'; "#,
            r#"echo '{"type":"system","subtype":"init","session_id":"second"}'"#,
        ))
        .spawn()
        .unwrap();
        process.wait().await;
        assert_eq!(process.session_ref().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_with_captured_stderr() {
        let process = sh("echo oops >&2; exit 3").capture_stderr(true).spawn().unwrap();
        let mut errors = process.take_errors().unwrap();

        assert_eq!(process.wait().await, ProcessStatus::Failed);
        match errors.recv().await.unwrap() {
            ProcessError::Exited { code, detail } => {
                assert_eq!(code, 3);
                assert!(detail.contains("oops"));
            },
            other => panic!("unexpected error: {other}"),
        }
        assert!(errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_timeout_resolves_failed() {
        let process = sh("sleep 5")
            .timeout(Duration::from_millis(100))
            .spawn()
            .unwrap();
        let mut errors = process.take_errors().unwrap();

        assert_eq!(process.wait().await, ProcessStatus::Failed);
        assert!(matches!(errors.recv().await.unwrap(), ProcessError::Timeout));
    }

    #[tokio::test]
    async fn test_cancel_is_noop_after_terminal() {
        let process = sh("true").spawn().unwrap();
        assert_eq!(process.wait().await, ProcessStatus::Completed);
        process.cancel();
        assert_eq!(process.status(), ProcessStatus::Completed);
    }

    #[tokio::test]
    async fn test_spawned_process_is_running_until_exit() {
        let process = sh("sleep 5").spawn().unwrap();
        assert_eq!(process.status(), ProcessStatus::Running);
        process.cancel();
        assert_eq!(process.wait().await, ProcessStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_observed_before_token() {
        // An observer woken by the token must never read `running`.
        for _ in 0..100 {
            let process = sh("sleep 5").spawn().unwrap();
            let token = process.cancellation_token();
            let observer = {
                let process = process.clone();
                tokio::spawn(async move {
                    token.cancelled().await;
                    process.status()
                })
            };
            process.cancel();
            assert_eq!(observer.await.unwrap(), ProcessStatus::Cancelled);
            assert_eq!(process.wait().await, ProcessStatus::Cancelled);
        }
    }

    #[tokio::test]
    async fn test_stdin_prompt_blob_written_then_closed() {
        let process = sh(r#"cat > /dev/null; echo '{"type":"result","subtype":"success"}'"#)
            .stdin_prompt("do the thing")
            .spawn()
            .unwrap();
        let mut events = process.take_events().unwrap();
        assert_eq!(events.recv().await.unwrap().kind, OutputEventKind::Result);
        assert_eq!(process.wait().await, ProcessStatus::Completed);
    }

    #[tokio::test]
    async fn test_command_factory_substitutes_command() {
        let process = SpawnBuilder::new("claude")
            .executable("not-a-real-binary")
            .parser(Arc::new(ClaudeParser::default()))
            .command_factory(Box::new(|_, _| {
                let mut command = tokio::process::Command::new("sh");
                command.args(["-c", r#"echo '{"type":"result","subtype":"success"}'"#]);
                command
            }))
            .spawn()
            .unwrap();
        assert_eq!(process.wait().await, ProcessStatus::Completed);
    }

    #[tokio::test]
    async fn test_env_appended_not_replaced() {
        // PATH must survive (sh is resolved through it) while the custom
        // var is visible to the child.
        let process = sh(
            r#"echo "{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"$WEAVER_TEST_MARK\"}""#,
        )
        .env("WEAVER_TEST_MARK", "marked")
        .spawn()
        .unwrap();
        process.wait().await;
        assert_eq!(process.session_ref().as_deref(), Some("marked"));
    }

    #[tokio::test]
    async fn test_on_init_hook_runs_for_init_events() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(String::new()));
        let hook: InitHook = {
            let count = count.clone();
            let seen = seen.clone();
            Arc::new(move |event| {
                count.fetch_add(1, Ordering::SeqCst);
                if let Some(session) = &event.session_ref {
                    *seen.lock().unwrap() = session.clone();
                }
            })
        };
        let process = sh(concat!(
            r#"echo '{"type":"system","subtype":"init","session_id":"h-1"}'; "#,
            r#"echo '{"type":"result","subtype":"success"}'"#,
        ))
        .on_init(hook)
        .spawn()
        .unwrap();
        process.wait().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock().unwrap().as_str(), "h-1");
    }
}
