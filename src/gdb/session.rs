//! Debugger session lifecycle
//!
//! A `Session` ties one GDB process (through its `CommandExecutor`) to one
//! target terminal. The `SessionController` owns at most one session at a
//! time, creates it on first use and replaces it after the debugger dies.

use crate::gdb::error::{SessionError, SessionResult};
use crate::gdb::executor::{lock, BatchEnd, CommandExecutor, Reply, SharedState};
use crate::gdb::terminal::{render_target_bytes, TargetTerminal};
use crate::gdb::types::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Settings applied before the session is handed out
const STARTUP_COMMANDS: &[&str] = &["-gdb-set confirm off", "-gdb-set pagination off"];

const DEAD_CHANNEL_MESSAGE: &str =
    "GDB connection lost, the session was reset. Retry the command to start a new session.";

/// Time given to `-gdb-exit` before the process is killed
const EXIT_TIMEOUT: Duration = Duration::from_secs(1);

/// pwndbg takes a while to load its Python side on first start
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// One debugger process and its target terminal
pub struct Session {
    id: Uuid,
    state: SharedState,
    executor: Arc<CommandExecutor>,
    terminal: Mutex<Option<Arc<TargetTerminal>>>,
    config: GdbConfig,
    closed: AtomicBool,
}

impl Session {
    /// Allocate a terminal, launch GDB on it and apply startup settings
    pub async fn start(config: &GdbConfig) -> SessionResult<Self> {
        let terminal = TargetTerminal::open()?;
        // the process exists and accepts commands from here on
        let state: SharedState = Arc::new(Mutex::new(SessionState::Stopped));
        let executor = CommandExecutor::spawn(config, terminal.slave_path(), state.clone())?;

        let session = Self {
            id: Uuid::new_v4(),
            state,
            executor: Arc::new(executor),
            terminal: Mutex::new(Some(Arc::new(terminal))),
            config: config.clone(),
            closed: AtomicBool::new(false),
        };

        for command in STARTUP_COMMANDS {
            let timeout = config.timeout().max(STARTUP_TIMEOUT);
            let reply = session.executor.execute(command, timeout).await;
            let failure = match reply {
                Ok(reply) if reply.end == BatchEnd::ChannelClosed => {
                    Some(format!("GDB exited while running `{}`", command))
                }
                Ok(reply) => {
                    if let Some(e) = reply.event.error {
                        warn!("Startup command `{}` failed: {}", command, e);
                    }
                    None
                }
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = failure {
                session.close().await;
                return Err(SessionError::Startup(reason));
            }
        }

        info!("Session {} started", session.id);
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Current state, marking the session dead if GDB has exited
    fn check_alive(&self) -> SessionState {
        let state = self.state();
        if state != SessionState::Dead && self.executor.has_exited() {
            self.mark_dead();
            return SessionState::Dead;
        }
        state
    }

    fn mark_dead(&self) {
        let mut state = lock(&self.state);
        if *state != SessionState::Dead {
            warn!("Session {} is dead ({} -> dead)", self.id, *state);
            *state = SessionState::Dead;
        }
    }

    pub fn handle(&self) -> SessionHandle {
        let state = self.state();
        let tty = lock(&self.terminal)
            .as_ref()
            .map(|t| t.slave_path().to_path_buf());
        SessionHandle {
            id: self.id,
            state,
            tty,
            pid: (state != SessionState::Dead).then(|| self.executor.pid()),
        }
    }

    fn terminal(&self) -> SessionResult<Arc<TargetTerminal>> {
        lock(&self.terminal)
            .clone()
            .ok_or(SessionError::Unavailable("target terminal"))
    }

    /// Run one command. See `Execution` for the outcomes.
    pub async fn execute(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> SessionResult<Execution> {
        let mut preamble = String::new();

        match self.state() {
            SessionState::Dead => return Ok(Execution::Closed),
            SessionState::Running => {
                let reply = self.poll(self.config.poll_interval()).await?;
                match reply.state {
                    SessionState::Stopped => preamble = reply.event.text(),
                    SessionState::Running => return Ok(Execution::Busy),
                    SessionState::Dead => return Ok(Execution::Closed),
                }
            }
            SessionState::Stopped => {}
        }

        let timeout = timeout.unwrap_or_else(|| self.config.timeout());
        let reply = match self.executor.execute(command, timeout).await {
            Ok(reply) => reply,
            Err(SessionError::WorkerGone) => {
                self.mark_dead();
                return Ok(Execution::Completed(self.dead_channel(command)));
            }
            Err(e) => return Err(e),
        };

        let mut output = CommandOutput {
            command: command.to_string(),
            output: String::new(),
            error: reply.event.error.clone(),
            state: reply.state,
        };

        match reply.end {
            BatchEnd::NotSent => return Ok(Execution::Busy),
            BatchEnd::ChannelClosed => return Ok(Execution::Completed(self.dead_channel(command))),
            BatchEnd::TimedOut => {
                output.error = Some(format!(
                    "Timed out after {:.1}s waiting for GDB; the command may still complete, \
                     check the session status",
                    timeout.as_secs_f64()
                ));
            }
            BatchEnd::Completed => {}
        }

        output.output = [preamble, reply.event.text()]
            .into_iter()
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        if is_quit_command(command) || reply.event.result == Some(ResultClass::Exit) {
            info!("Quit command issued, closing session {}", self.id);
            self.close().await;
            output.state = SessionState::Dead;
        }

        Ok(Execution::Completed(output))
    }

    fn dead_channel(&self, command: &str) -> CommandOutput {
        CommandOutput {
            command: command.to_string(),
            output: DEAD_CHANNEL_MESSAGE.to_string(),
            error: None,
            state: SessionState::Dead,
        }
    }

    /// Collect pending out-of-band records without sending anything
    async fn poll(&self, wait: Duration) -> SessionResult<Reply> {
        match self.executor.drain(wait).await {
            Ok(reply) => Ok(reply),
            Err(SessionError::WorkerGone) => {
                self.mark_dead();
                Ok(Reply {
                    event: Default::default(),
                    end: BatchEnd::ChannelClosed,
                    state: SessionState::Dead,
                })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn send_to_target(&self, data: Vec<u8>) -> SessionResult<usize> {
        let terminal = self.terminal()?;
        tokio::task::spawn_blocking(move || terminal.send(&data)).await?
    }

    pub async fn read_from_target(
        &self,
        max: usize,
        timeout: Duration,
    ) -> SessionResult<Option<String>> {
        let terminal = self.terminal()?;
        let data = tokio::task::spawn_blocking(move || terminal.read(max, timeout)).await??;
        Ok(data.map(|bytes| render_target_bytes(&bytes)))
    }

    pub async fn interrupt(&self, signal: ControlSignal) -> SessionResult<u8> {
        let terminal = self.terminal()?;
        tokio::task::spawn_blocking(move || terminal.interrupt(signal)).await?
    }

    pub async fn status(&self) -> SessionResult<StatusReport> {
        let mut events = Vec::new();
        if self.check_alive() == SessionState::Running {
            events = self.poll(self.config.poll_interval()).await?.event.lines;
        }
        Ok(StatusReport {
            session: self.handle(),
            events,
        })
    }

    /// Terminate GDB and release the terminal. Safe to call repeatedly.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Session {} already closed", self.id);
            return;
        }

        if self.state() == SessionState::Stopped {
            if let Err(e) = self.executor.execute("-gdb-exit", EXIT_TIMEOUT).await {
                debug!("-gdb-exit: {}", e);
            }
        }
        self.mark_dead();

        let executor = self.executor.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || executor.shutdown()).await {
            warn!("Failed to shut down GDB: {}", e);
        }
        lock(&self.terminal).take();

        info!("Session {} closed", self.id);
    }
}

/// Commands after which GDB is gone
fn is_quit_command(command: &str) -> bool {
    let command = command
        .trim()
        .trim_start_matches(|c: char| c.is_ascii_digit());
    matches!(
        command.split_whitespace().next(),
        Some("quit" | "q" | "exit" | "-gdb-exit")
    )
}

/// Owner of the (at most one) debugger session
pub struct SessionController {
    config: GdbConfig,
    slot: AsyncMutex<Option<Arc<Session>>>,
}

impl SessionController {
    pub fn new(config: GdbConfig) -> Self {
        Self {
            config,
            slot: AsyncMutex::new(None),
        }
    }

    /// Return the live session, creating or replacing it as needed
    async fn ensure_started(&self) -> SessionResult<Arc<Session>> {
        let mut slot = self.slot.lock().await;

        if let Some(session) = slot.as_ref() {
            if session.check_alive() != SessionState::Dead {
                return Ok(session.clone());
            }
            warn!("Session {} is dead, starting a new one", session.id());
            if let Some(dead) = slot.take() {
                dead.close().await;
            }
        }

        let session = Arc::new(Session::start(&self.config).await?);
        *slot = Some(session.clone());
        Ok(session)
    }

    pub async fn start_or_reuse(&self) -> SessionResult<SessionHandle> {
        Ok(self.ensure_started().await?.handle())
    }

    /// State of the current session without starting one
    pub async fn state(&self) -> SessionState {
        match self.slot.lock().await.as_ref() {
            Some(session) => session.check_alive(),
            None => SessionState::Dead,
        }
    }

    pub async fn execute(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> SessionResult<Execution> {
        self.ensure_started()
            .await?
            .execute(command, timeout)
            .await
    }

    pub async fn send_to_target(&self, data: Vec<u8>) -> SessionResult<usize> {
        self.ensure_started().await?.send_to_target(data).await
    }

    pub async fn read_from_target(
        &self,
        max: usize,
        timeout: Duration,
    ) -> SessionResult<Option<String>> {
        self.ensure_started()
            .await?
            .read_from_target(max, timeout)
            .await
    }

    pub async fn interrupt(&self, signal: ControlSignal) -> SessionResult<u8> {
        self.ensure_started().await?.interrupt(signal).await
    }

    pub async fn status(&self) -> SessionResult<StatusReport> {
        self.ensure_started().await?.status().await
    }

    /// Close the current session (if any) and start a fresh one
    pub async fn hard_reset(&self) -> SessionResult<SessionHandle> {
        info!("Hard reset requested");
        self.close().await;
        self.start_or_reuse().await
    }

    pub async fn close(&self) {
        let session = self.slot.lock().await.take();
        if let Some(session) = session {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Instant;

    /// Minimal MI responder standing in for gdb
    const FAKE_GDB: &str = r##"
while IFS= read -r line; do
  token=$(printf '%s' "$line" | sed 's/^\([0-9]*\).*$/\1/')
  cmd=${line#"$token"}
  case "$cmd" in
    -gdb-exit|quit)
      printf '%s^exit\n' "$token"
      exit 0 ;;
    crash)
      exit 3 ;;
    run)
      printf '%s^running\n*running,thread-id="all"\n(gdb)\n' "$token"
      (sleep 0.4; printf '*stopped,reason="breakpoint-hit",bkptno="1"\n(gdb)\n') & ;;
    bad)
      printf '%s^error,msg="Undefined command: \\"bad\\"."\n(gdb)\n' "$token" ;;
    slowbad)
      (sleep 0.3; printf '%s^error,msg="late failure"\n(gdb)\n' "$token") & ;;
    hang)
      ;;
    *)
      printf '~"ab"\n~"cd\\n"\n=cmd-param-changed,param="x",value="y"\n%s^done\n(gdb)\n' "$token" ;;
  esac
done
"##;

    struct FakeGdb {
        script: PathBuf,
    }

    impl FakeGdb {
        fn new() -> Self {
            let script = std::env::temp_dir().join(format!("fake-gdb-{}.sh", Uuid::new_v4()));
            std::fs::write(&script, FAKE_GDB).unwrap();
            Self { script }
        }

        /// Run through `sh` so the script never needs to be executable
        fn config(&self) -> GdbConfig {
            GdbConfig {
                gdb_path: "/bin/sh".to_string(),
                gdb_args: vec![self.script.display().to_string()],
                timeout_ms: 2000,
                poll_interval_ms: 100,
            }
        }
    }

    impl Drop for FakeGdb {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.script);
        }
    }

    fn completed(execution: Execution) -> CommandOutput {
        match execution {
            Execution::Completed(output) => output,
            other => panic!("expected completed execution, got {:?}", other),
        }
    }

    #[test]
    fn test_quit_detection() {
        assert!(is_quit_command("quit"));
        assert!(is_quit_command("  q"));
        assert!(is_quit_command("-gdb-exit"));
        assert!(is_quit_command("12-gdb-exit"));
        assert!(is_quit_command("exit 0"));
        assert!(!is_quit_command("quitter"));
        assert!(!is_quit_command("info registers"));
    }

    #[tokio::test]
    async fn test_execute_merges_console_output() {
        let fake = FakeGdb::new();
        let controller = SessionController::new(fake.config());

        let output = completed(controller.execute("info", None).await.unwrap());
        assert_eq!(output.output, "abcd");
        assert_eq!(output.error, None);
        assert_eq!(output.state, SessionState::Stopped);

        controller.close().await;
    }

    #[tokio::test]
    async fn test_error_result_is_reported_in_output() {
        let fake = FakeGdb::new();
        let controller = SessionController::new(fake.config());

        let output = completed(controller.execute("bad", None).await.unwrap());
        assert_eq!(output.error.as_deref(), Some("Undefined command: \"bad\"."));
        assert_eq!(output.state, SessionState::Stopped);

        controller.close().await;
    }

    #[tokio::test]
    async fn test_running_target_is_busy_until_it_stops() {
        let fake = FakeGdb::new();
        let controller = SessionController::new(fake.config());

        let output = completed(controller.execute("run", None).await.unwrap());
        assert_eq!(output.state, SessionState::Running);

        let start = Instant::now();
        let busy = controller.execute("info", None).await.unwrap();
        assert!(matches!(busy, Execution::Busy));
        assert!(start.elapsed() < Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(600)).await;
        let output = completed(controller.execute("info", None).await.unwrap());
        assert!(output.output.starts_with("*stopped,"));
        assert!(output.output.ends_with("abcd"));
        assert_eq!(output.state, SessionState::Stopped);

        controller.close().await;
    }

    #[tokio::test]
    async fn test_timeout_is_reported_not_raised() {
        let fake = FakeGdb::new();
        let controller = SessionController::new(fake.config());

        let output = completed(
            controller
                .execute("hang", Some(Duration::from_millis(100)))
                .await
                .unwrap(),
        );
        assert!(output.error.unwrap().contains("Timed out"));
        assert_eq!(output.state, SessionState::Stopped);

        controller.close().await;
    }

    #[tokio::test]
    async fn test_late_error_stays_with_its_command() {
        let fake = FakeGdb::new();
        let controller = SessionController::new(fake.config());

        let output = completed(
            controller
                .execute("slowbad", Some(Duration::from_millis(100)))
                .await
                .unwrap(),
        );
        assert!(output.error.unwrap().contains("Timed out"));

        tokio::time::sleep(Duration::from_millis(600)).await;
        let output = completed(controller.execute("info", None).await.unwrap());
        assert_eq!(output.output, "abcd");
        assert_eq!(output.error, None);

        controller.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_are_serialized() {
        let fake = FakeGdb::new();
        let controller = Arc::new(SessionController::new(fake.config()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let controller = controller.clone();
                tokio::spawn(async move { controller.execute("info", None).await })
            })
            .collect();

        for task in tasks {
            let output = completed(task.await.unwrap().unwrap());
            assert_eq!(output.output, "abcd");
            assert_eq!(output.error, None);
        }

        controller.close().await;
    }

    #[tokio::test]
    async fn test_crash_restarts_transparently() {
        let fake = FakeGdb::new();
        let controller = SessionController::new(fake.config());
        let first = controller.start_or_reuse().await.unwrap();

        let output = completed(controller.execute("crash", None).await.unwrap());
        assert_eq!(output.output, DEAD_CHANNEL_MESSAGE);
        assert_eq!(output.state, SessionState::Dead);

        let output = completed(controller.execute("info", None).await.unwrap());
        assert_eq!(output.output, "abcd");
        assert_eq!(output.state, SessionState::Stopped);

        let second = controller.start_or_reuse().await.unwrap();
        assert_ne!(first.id, second.id);

        controller.close().await;
    }

    #[tokio::test]
    async fn test_quit_closes_session() {
        let fake = FakeGdb::new();
        let controller = SessionController::new(fake.config());

        let output = completed(controller.execute("quit", None).await.unwrap());
        assert_eq!(output.state, SessionState::Dead);
        assert_eq!(controller.state().await, SessionState::Dead);

        controller.close().await;
    }

    #[tokio::test]
    async fn test_close_twice_is_noop() {
        let fake = FakeGdb::new();
        let session = Session::start(&fake.config()).await.unwrap();
        assert_eq!(session.state(), SessionState::Stopped);

        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Dead);
        assert!(matches!(
            session.execute("info", None).await.unwrap(),
            Execution::Closed
        ));
        assert!(matches!(
            session.send_to_target(b"x".to_vec()).await,
            Err(SessionError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_hard_reset_replaces_session() {
        let fake = FakeGdb::new();
        let controller = SessionController::new(fake.config());

        let first = controller.start_or_reuse().await.unwrap();
        let again = controller.start_or_reuse().await.unwrap();
        assert_eq!(first.id, again.id);

        let reset = controller.hard_reset().await.unwrap();
        assert_ne!(first.id, reset.id);
        assert_eq!(reset.state, SessionState::Stopped);

        controller.close().await;
        controller.close().await;
    }

    #[tokio::test]
    async fn test_target_io_without_output_is_absent() {
        let fake = FakeGdb::new();
        let controller = SessionController::new(fake.config());

        assert_eq!(controller.send_to_target(b"hi\n".to_vec()).await.unwrap(), 3);
        let read = controller
            .read_from_target(64, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(read, None);

        let status = controller.status().await.unwrap();
        assert_eq!(status.session.state, SessionState::Stopped);
        assert!(status.session.tty.is_some());

        controller.close().await;
    }

    #[test]
    fn test_missing_debugger_is_a_spawn_error() {
        let config = GdbConfig {
            gdb_path: "/nonexistent/gdb".to_string(),
            ..GdbConfig::default()
        };
        let result = tokio_test::block_on(Session::start(&config));
        assert!(matches!(result, Err(SessionError::Spawn { .. })));
    }
}
