//! Sessions task runner
//!
//! A batch facility layered on the same connection: the client queues tasks
//! (a function reference plus arguments), starts a pool of workers, then
//! listens. While `listen` is outstanding the server streams one `listen`
//! payload per lifecycle event, each carrying the current status tally, and
//! finishes with a terminal result once every task has finished or failed.
//!
//! Workers pull task ids from a shared queue; there is at most one
//! [`Sessions`] per connection.

use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::{self, CodecError, Map, Value};
use crate::function::{CallContext, RemoteFunction};
use crate::payload::{ListenEvent, ListenEventKind, Payload, SessionStatus};
use crate::transport::{MessageTransport, TransportError};

/// Errors raised by the task runner
#[derive(Debug, thiserror::Error)]
pub enum SessionsError {
    #[error("A sessions run already exists on this connection")]
    AlreadyCreated,

    #[error("No sessions run exists on this connection; send `create` first")]
    NotCreated,

    #[error("Sessions already started")]
    AlreadyStarted,

    #[error("Sessions not started; send `start` before `listen`")]
    NotStarted,

    #[error("No tasks queued")]
    NoTasks,

    #[error("Invalid log directory `{path}`: {reason}")]
    LogDir { path: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Default worker count: one per available CPU
pub fn default_worker_num() -> usize {
    std::thread::available_parallelism().map_or_else(
        |e| {
            warn!("Failed to get available parallelism, using one worker: {}", e);
            1
        },
        |n| n.get(),
    )
}

/// Expand `~` and environment variables in a client-supplied log directory
pub fn expand_log_dir(raw: &str) -> Result<PathBuf, SessionsError> {
    let expanded = shellexpand::full(raw).map_err(|e| SessionsError::LogDir {
        path: raw.to_string(),
        reason: e.to_string(),
    })?;
    Ok(PathBuf::from(expanded.into_owned()))
}

/// Lifecycle notifications sent by workers
#[derive(Debug)]
enum WorkerEvent {
    Running { task_id: u64 },
    Finished { task_id: u64, result: Value },
    Failed { task_id: u64, error: String },
    Log { task_id: u64, line: String },
}

/// Log sink handed to a task through its [`CallContext`]
#[derive(Debug, Clone)]
pub struct TaskLogger {
    task_id: u64,
    events: mpsc::UnboundedSender<WorkerEvent>,
    log_file: Option<PathBuf>,
}

impl TaskLogger {
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    /// Append to the task's log file, or stream as a `task_log` event
    pub async fn log(&self, line: String) {
        match &self.log_file {
            Some(path) => {
                if let Err(e) = append_line(path, &line).await {
                    warn!("Failed to write task log {}: {}", path.display(), e);
                }
            }
            None => {
                let _ = self.events.send(WorkerEvent::Log {
                    task_id: self.task_id,
                    line,
                });
            }
        }
    }
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}

struct Task {
    id: u64,
    name: String,
    function: Arc<dyn RemoteFunction>,
    args: Vec<Value>,
    kwargs: Map,
}

/// One batch run of tasks on a worker pool
pub struct Sessions {
    worker_num: usize,
    log_dir: Option<PathBuf>,
    pending: Vec<Task>,
    next_task_id: u64,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    workers: Vec<JoinHandle<()>>,
    status: SessionStatus,
    started: bool,
}

impl Sessions {
    /// Create a run; `worker_num` defaults to the CPU count
    pub async fn create(worker_num: Option<usize>, log_dir: Option<&str>) -> Result<Self, SessionsError> {
        let worker_num = worker_num.unwrap_or_else(default_worker_num).max(1);

        let log_dir = match log_dir {
            Some(raw) => {
                let path = expand_log_dir(raw)?;
                tokio::fs::create_dir_all(&path)
                    .await
                    .map_err(|e| SessionsError::LogDir {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    })?;
                Some(path)
            }
            None => None,
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        info!("Sessions created with {} workers", worker_num);

        Ok(Self {
            worker_num,
            log_dir,
            pending: Vec::new(),
            next_task_id: 1,
            events_tx,
            events_rx,
            workers: Vec::new(),
            status: SessionStatus::default(),
            started: false,
        })
    }

    pub fn worker_num(&self) -> usize {
        self.worker_num
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Queue a task; returns its id
    pub fn add_task(
        &mut self,
        name: impl Into<String>,
        function: Arc<dyn RemoteFunction>,
        args: Vec<Value>,
        kwargs: Map,
    ) -> Result<u64, SessionsError> {
        if self.started {
            return Err(SessionsError::AlreadyStarted);
        }
        let id = self.next_task_id;
        self.next_task_id += 1;
        self.pending.push(Task {
            id,
            name: name.into(),
            function,
            args,
            kwargs,
        });
        self.status.waiting += 1;
        self.status.total += 1;
        Ok(id)
    }

    /// Spawn `min(workers, tasks)` workers over the queued tasks
    pub fn start(&mut self) -> Result<usize, SessionsError> {
        if self.started {
            return Err(SessionsError::AlreadyStarted);
        }
        if self.pending.is_empty() {
            return Err(SessionsError::NoTasks);
        }

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        for task in self.pending.drain(..) {
            // The receiver is alive, so this cannot fail
            let _ = queue_tx.send(task);
        }
        drop(queue_tx);

        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let count = self.worker_num.min(self.status.total);
        for worker_id in 0..count {
            let rx = Arc::clone(&queue_rx);
            let events = self.events_tx.clone();
            let log_dir = self.log_dir.clone();
            self.workers
                .push(tokio::spawn(run_worker(worker_id, rx, events, log_dir)));
        }

        self.started = true;
        info!("Sessions started: {} workers, {} tasks", count, self.status.total);
        Ok(count)
    }

    /// Stream lifecycle events to `transport` until every task is done
    pub async fn listen(
        &mut self,
        transport: &mut dyn MessageTransport,
    ) -> Result<SessionStatus, SessionsError> {
        if !self.started {
            return Err(SessionsError::NotStarted);
        }

        let intro = ListenEvent::new(
            ListenEventKind::Message,
            format!(
                "Running {} tasks on {} workers",
                self.status.total,
                self.workers.len()
            ),
        )
        .with_status(self.status);
        send_event(transport, intro).await?;

        while !self.status.all_done() {
            let Some(event) = self.events_rx.recv().await else {
                break;
            };
            let event = self.apply(event);
            send_event(transport, event).await?;
        }

        Ok(self.status)
    }

    /// Abort all workers
    pub fn terminate(&mut self) {
        for worker in self.workers.drain(..) {
            worker.abort();
        }
        debug!("Sessions terminated at {}", self.status);
    }

    fn apply(&mut self, event: WorkerEvent) -> ListenEvent {
        let status = &mut self.status;
        let listen = match event {
            WorkerEvent::Running { task_id } => {
                status.waiting = status.waiting.saturating_sub(1);
                status.running += 1;
                ListenEvent::new(ListenEventKind::TaskRunning, format!("Task {task_id} running"))
                    .with_task(task_id)
            }
            WorkerEvent::Finished { task_id, result } => {
                status.running = status.running.saturating_sub(1);
                status.finished += 1;
                let rendered = codec::encode(&result).unwrap_or_else(|e| e.to_string());
                ListenEvent::new(
                    ListenEventKind::TaskFinished,
                    format!("Task {task_id} finished: {rendered}"),
                )
                .with_task(task_id)
            }
            WorkerEvent::Failed { task_id, error } => {
                status.running = status.running.saturating_sub(1);
                status.failed += 1;
                ListenEvent::new(
                    ListenEventKind::TaskFailed,
                    format!("Task {task_id} failed: {error}"),
                )
                .with_task(task_id)
            }
            WorkerEvent::Log { task_id, line } => {
                ListenEvent::new(ListenEventKind::TaskLog, line).with_task(task_id)
            }
        };
        listen.with_status(*status)
    }
}

impl Drop for Sessions {
    fn drop(&mut self) {
        self.terminate();
    }
}

async fn send_event(
    transport: &mut dyn MessageTransport,
    event: ListenEvent,
) -> Result<(), SessionsError> {
    let text = codec::encode(&Payload::Listen(event))?;
    transport.send(text).await?;
    Ok(())
}

async fn run_worker(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<Task>>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    log_dir: Option<PathBuf>,
) {
    debug!("Sessions worker {} started", worker_id);

    loop {
        let task = {
            let mut rx = queue.lock().await;
            rx.recv().await
        };

        let Some(task) = task else {
            debug!("Sessions worker {} out of tasks", worker_id);
            break;
        };

        let task_id = task.id;
        let _ = events.send(WorkerEvent::Running { task_id });
        debug!(worker = worker_id, task = task_id, name = %task.name, "Running task");

        let logger = TaskLogger {
            task_id,
            events: events.clone(),
            log_file: log_dir
                .as_ref()
                .map(|dir| dir.join(format!("task-{task_id}.log"))),
        };
        let mut ctx = CallContext::task(logger);

        let outcome = AssertUnwindSafe(task.function.call(&mut ctx, task.args, task.kwargs))
            .catch_unwind()
            .await;

        let event = match outcome {
            Ok(Ok(result)) => WorkerEvent::Finished { task_id, result },
            Ok(Err(e)) => WorkerEvent::Failed {
                task_id,
                error: e.to_string(),
            },
            Err(_) => {
                error!("Task {} panicked", task_id);
                WorkerEvent::Failed {
                    task_id,
                    error: "task panicked".to_string(),
                }
            }
        };
        let _ = events.send(event);
    }
}
