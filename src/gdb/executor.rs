//! Command Executor
//!
//! Owns the debugger process. All traffic on its MI channel goes through a
//! single worker thread: each command, and each poll for out-of-band output,
//! is a job on that thread. Callers await the reply over a oneshot channel,
//! so the async runtime never blocks on GDB.

use crate::gdb::classifier::{Classifier, SessionEvent};
use crate::gdb::error::{SessionError, SessionResult};
use crate::gdb::parser::MiParser;
use crate::gdb::types::*;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Quiet period that ends collection once a command's result has arrived
const GRACE: Duration = Duration::from_millis(50);

/// Upper bound on trailing collection after the result record
const TRAILING_LIMIT: Duration = Duration::from_millis(500);

/// State shared between the session and its worker
pub type SharedState = Arc<Mutex<SessionState>>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a batch of records ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEnd {
    /// Result record seen (or poll window elapsed)
    Completed,
    /// No result record before the deadline
    TimedOut,
    /// Debugger stdin or stdout went away
    ChannelClosed,
    /// Target was running when the job was dequeued; nothing was sent
    NotSent,
}

/// Reply to one job
#[derive(Debug, Clone)]
pub struct Reply {
    pub event: SessionEvent,
    pub end: BatchEnd,
    pub state: SessionState,
}

enum Job {
    Execute {
        command: String,
        timeout: Duration,
        reply: oneshot::Sender<Reply>,
    },
    Drain {
        wait: Duration,
        reply: oneshot::Sender<Reply>,
    },
}

/// Debugger process plus the worker thread that talks to it
pub struct CommandExecutor {
    jobs: Mutex<Option<Sender<Job>>>,
    child: Mutex<Option<Child>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pid: u32,
}

impl CommandExecutor {
    /// Launch GDB with the inferior bound to `tty` and start the worker
    pub fn spawn(config: &GdbConfig, tty: &Path, state: SharedState) -> SessionResult<Self> {
        info!("Starting GDB: {} {}", config.gdb_path, config.gdb_args.join(" "));

        let mut cmd = Command::new(&config.gdb_path);
        cmd.args(&config.gdb_args)
            .arg("-ex")
            .arg(format!("set inferior-tty {}", tty.display()))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| SessionError::Spawn {
            path: config.gdb_path.clone(),
            source,
        })?;
        let pid = child.id();

        let (stdin, stdout, stderr) = match (
            child.stdin.take(),
            child.stdout.take(),
            child.stderr.take(),
        ) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SessionError::Unavailable("debugger stdio"));
            }
        };

        let (record_tx, record_rx) = mpsc::channel();
        let stderr_tx = record_tx.clone();

        thread::spawn(move || read_output_loop(stdout, record_tx));
        thread::spawn(move || read_stderr_loop(stderr, stderr_tx));

        let (job_tx, job_rx) = mpsc::channel();
        let worker = Worker {
            stdin,
            records: record_rx,
            state,
            classifier: Classifier::new(),
            next_token: 1,
        };
        let handle = thread::spawn(move || worker.run(job_rx));

        info!("GDB started (pid {})", pid);

        Ok(Self {
            jobs: Mutex::new(Some(job_tx)),
            child: Mutex::new(Some(child)),
            worker: Mutex::new(Some(handle)),
            pid,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Send one command and collect everything up to its result record
    pub async fn execute(&self, command: &str, timeout: Duration) -> SessionResult<Reply> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Execute {
            command: command.to_string(),
            timeout,
            reply,
        })?;
        rx.await.map_err(|_| SessionError::WorkerGone)
    }

    /// Collect out-of-band output for at most `wait`
    pub async fn drain(&self, wait: Duration) -> SessionResult<Reply> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Drain { wait, reply })?;
        rx.await.map_err(|_| SessionError::WorkerGone)
    }

    fn submit(&self, job: Job) -> SessionResult<()> {
        let jobs = lock(&self.jobs);
        let sender = jobs.as_ref().ok_or(SessionError::WorkerGone)?;
        sender.send(job).map_err(|_| SessionError::WorkerGone)
    }

    /// Whether the debugger process has terminated
    pub fn has_exited(&self) -> bool {
        match lock(&self.child).as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => {
                    info!("GDB exited: {}", status);
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    warn!("Failed to query GDB process: {}", e);
                    true
                }
            },
            None => true,
        }
    }

    /// Kill the debugger and wait for the worker to finish. Blocking.
    pub fn shutdown(&self) {
        let (child, worker) = self.stop();
        reap(child, worker);
    }

    /// Close the job queue and kill the process without waiting on either.
    /// The worker exits after the in-flight job once the queue is closed.
    fn stop(&self) -> (Option<Child>, Option<JoinHandle<()>>) {
        lock(&self.jobs).take();
        let mut child = lock(&self.child).take();
        if let Some(child) = child.as_mut() {
            if let Err(e) = child.kill() {
                debug!("Kill GDB: {}", e);
            }
        }
        (child, lock(&self.worker).take())
    }
}

/// Dropping without `shutdown` may happen on an async runtime thread, so the
/// process is killed here and reaped on a separate thread.
impl Drop for CommandExecutor {
    fn drop(&mut self) {
        let (child, worker) = self.stop();
        if child.is_some() || worker.is_some() {
            thread::spawn(move || reap(child, worker));
        }
    }
}

fn reap(child: Option<Child>, worker: Option<JoinHandle<()>>) {
    if let Some(mut child) = child {
        match child.wait() {
            Ok(status) => info!("GDB stopped: {}", status),
            Err(e) => warn!("Failed to reap GDB: {}", e),
        }
    }
    if let Some(handle) = worker {
        if handle.join().is_err() {
            error!("Command worker panicked");
        }
    }
}

/// Worker thread state
struct Worker {
    stdin: ChildStdin,
    records: Receiver<MiOutputRecord>,
    state: SharedState,
    classifier: Classifier,
    next_token: u64,
}

impl Worker {
    fn run(mut self, jobs: Receiver<Job>) {
        for job in jobs {
            match job {
                Job::Execute {
                    command,
                    timeout,
                    reply,
                } => {
                    let result = self.execute(&command, timeout);
                    let _ = reply.send(result);
                }
                Job::Drain { wait, reply } => {
                    let result = self.drain(wait);
                    let _ = reply.send(result);
                }
            }
        }
        debug!("Command worker stopped");
    }

    fn execute(&mut self, command: &str, timeout: Duration) -> Reply {
        // Re-checked here: an earlier job in the queue may have resumed the target
        let state = *lock(&self.state);
        if state != SessionState::Stopped {
            return Reply {
                event: SessionEvent::default(),
                end: BatchEnd::NotSent,
                state,
            };
        }

        let token = self.next_token;
        self.next_token += 1;
        let line = format!("{}{}\n", token, command.trim());
        debug!("Sending command: {}", line.trim_end());

        if let Err(e) = self
            .stdin
            .write_all(line.as_bytes())
            .and_then(|_| self.stdin.flush())
        {
            warn!("Failed to write to GDB: {}", e);
            return self.finish(Vec::new(), BatchEnd::ChannelClosed, Some(token));
        }

        let deadline = Instant::now() + timeout;
        let mut records = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.records.recv_timeout(remaining) {
                Ok(record) => {
                    let done =
                        record.kind() == RecordKind::Result && record.token() == Some(token);
                    records.push(record);
                    if done {
                        let end = self.collect_trailing(&mut records);
                        return self.finish(records, end, Some(token));
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!("Command {} timed out: {}", token, command.trim());
                    return self.finish(records, BatchEnd::TimedOut, Some(token));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return self.finish(records, BatchEnd::ChannelClosed, Some(token));
                }
            }
        }
    }

    /// Notifications that follow the result record closely belong to it
    /// (`^running` is followed by `*running`, and so on).
    fn collect_trailing(&mut self, records: &mut Vec<MiOutputRecord>) -> BatchEnd {
        let deadline = Instant::now() + TRAILING_LIMIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.records.recv_timeout(remaining.min(GRACE)) {
                Ok(record) => records.push(record),
                Err(RecvTimeoutError::Timeout) => return BatchEnd::Completed,
                // the result arrived, losing the channel afterwards still completes it
                Err(RecvTimeoutError::Disconnected) => return BatchEnd::Completed,
            }
        }
    }

    fn drain(&mut self, wait: Duration) -> Reply {
        let deadline = Instant::now() + wait;
        let mut records = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let window = if records.is_empty() {
                remaining
            } else {
                remaining.min(GRACE)
            };
            match self.records.recv_timeout(window) {
                Ok(record) => records.push(record),
                Err(RecvTimeoutError::Timeout) => {
                    return self.finish(records, BatchEnd::Completed, None)
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return self.finish(records, BatchEnd::ChannelClosed, None)
                }
            }
        }
    }

    /// Classify the batch and apply its state change. Stale result records
    /// are dropped from the reply but their notifications still move the state.
    fn finish(&mut self, records: Vec<MiOutputRecord>, end: BatchEnd, token: Option<u64>) -> Reply {
        let event = self.classifier.classify(&records, token);
        let mut state = lock(&self.state);
        let previous = *state;

        if end == BatchEnd::ChannelClosed {
            *state = SessionState::Dead;
        } else if let Some(outcome) = event.outcome {
            *state = state.transition(outcome);
        }

        if *state != previous {
            info!("Session state {} -> {}", previous, *state);
        }

        Reply {
            event,
            end,
            state: *state,
        }
    }
}

/// Read output loop (runs in background thread)
fn read_output_loop(stdout: impl Read, records: Sender<MiOutputRecord>) {
    let parser = MiParser::new();
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                debug!("GDB output: {}", line);
                if let Some(record) = parser.parse_line(line) {
                    if records.send(record).is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                error!("Error reading GDB output: {}", e);
                break;
            }
        }
    }

    info!("GDB output reader stopped");
}

/// Forward stderr lines (Python tracebacks, startup warnings) as log records
fn read_stderr_loop(stderr: impl Read, records: Sender<MiOutputRecord>) {
    let reader = BufReader::new(stderr);
    for line in reader.lines() {
        match line {
            Ok(line) => {
                debug!("GDB stderr: {}", line);
                if records.send(MiOutputRecord::Log(format!("{}\n", line))).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("GDB stderr closed: {}", e);
                break;
            }
        }
    }
}
