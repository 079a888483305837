//! One Area: a working directory plus at most one running process.
//!
//! Run-state transitions happen under the Area's own async mutex. The
//! process itself runs on a worker task that always leaves the Area in
//! [`RunState::Exited`] and emits `exited`, whatever went wrong.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use remex_core::{AreaId, AreaInfo, AreaState, EventKind, RemexError};

use crate::config::{area_cwd, area_dir};
use crate::error::{io_err, DaemonError};
use crate::sink::Listeners;

/// Upper bound on how long `exit` waits for the worker.
pub const EXIT_TIMEOUT: Duration = Duration::from_secs(10);

const PUMP_BUFFER: usize = 8 * 1024;

/// Handles owned by a launched run.
struct Active {
    stdin: mpsc::UnboundedSender<String>,
    cancel: watch::Sender<bool>,
    finished: watch::Receiver<bool>,
    worker: Option<JoinHandle<()>>,
    canceled: bool,
    launched_at: DateTime<Utc>,
}

impl Active {
    fn request_cancel(&mut self) {
        self.canceled = true;
        self.cancel.send_replace(true);
    }
}

struct Finished {
    exit_code: i32,
    error: Option<String>,
    canceled: bool,
    launched_at: Option<DateTime<Utc>>,
    exited_at: DateTime<Utc>,
}

enum RunState {
    Virginal,
    Launching(Active),
    Running(Active),
    Exited(Finished),
}

impl RunState {
    fn active_mut(&mut self) -> Option<&mut Active> {
        match self {
            RunState::Launching(active) | RunState::Running(active) => Some(active),
            _ => None,
        }
    }

    fn kind(&self) -> AreaState {
        match self {
            RunState::Virginal => AreaState::Virginal,
            RunState::Launching(_) => AreaState::Launching,
            RunState::Running(_) => AreaState::Running,
            RunState::Exited(_) => AreaState::Exited,
        }
    }
}

pub(crate) struct Area {
    pub(crate) id: AreaId,
    pub(crate) root: PathBuf,
    pub(crate) cwd: PathBuf,
    run: Mutex<RunState>,
}

impl Area {
    pub(crate) fn new(sink_root: &Path, id: AreaId) -> Self {
        Self {
            root: area_dir(sink_root, &id),
            cwd: area_cwd(sink_root, &id),
            id,
            run: Mutex::new(RunState::Virginal),
        }
    }

    pub(crate) fn create_dirs(&self) -> Result<(), DaemonError> {
        std::fs::create_dir_all(&self.cwd).map_err(|e| io_err(&self.cwd, e))
    }

    pub(crate) async fn info(&self) -> AreaInfo {
        let run = self.run.lock().await;
        let mut info = AreaInfo {
            id: self.id.clone(),
            cwd: self.cwd.clone(),
            state: run.kind(),
            running: false,
            canceled: false,
            exit_code: None,
            error: None,
            launched_at: None,
            exited_at: None,
        };
        match &*run {
            RunState::Launching(active) | RunState::Running(active) => {
                info.running = true;
                info.canceled = active.canceled;
                info.launched_at = Some(active.launched_at);
            }
            RunState::Exited(done) => {
                info.canceled = done.canceled;
                info.exit_code = Some(done.exit_code);
                info.error = done.error.clone();
                info.launched_at = done.launched_at;
                info.exited_at = Some(done.exited_at);
            }
            RunState::Virginal => {}
        }
        info
    }

    pub(crate) async fn launch(
        self: &Arc<Self>,
        env: BTreeMap<String, String>,
        args: Vec<String>,
        listeners: &Arc<Listeners>,
    ) -> Result<(), RemexError> {
        if args.is_empty() {
            return Err(RemexError::InvalidArgument(
                "launch needs at least a program name".to_string(),
            ));
        }

        let mut run = self.run.lock().await;
        match &*run {
            RunState::Launching(_) | RunState::Running(_) => {
                return Err(RemexError::illegal_state(&self.id, "already running"));
            }
            RunState::Exited(_) => listeners.emit(&self.id, EventKind::Restarted).await,
            RunState::Virginal => {}
        }

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (finished_tx, finished_rx) = watch::channel(false);
        *run = RunState::Launching(Active {
            stdin: stdin_tx,
            cancel: cancel_tx,
            finished: finished_rx,
            worker: None,
            canceled: false,
            launched_at: Utc::now(),
        });
        listeners.emit(&self.id, EventKind::Launching).await;

        tracing::info!(area = %self.id, program = %args[0], args = args.len() - 1, "launching");
        let worker = tokio::spawn(run_worker(
            self.clone(),
            listeners.clone(),
            ProcessSpec { env, args },
            stdin_rx,
            cancel_rx,
            finished_tx,
        ));
        if let Some(active) = run.active_mut() {
            active.worker = Some(worker);
        }
        Ok(())
    }

    pub(crate) async fn cancel(&self) -> Result<(), RemexError> {
        let mut run = self.run.lock().await;
        let active = run
            .active_mut()
            .ok_or_else(|| RemexError::illegal_state(&self.id, "not running"))?;
        active.request_cancel();
        tracing::info!(area = %self.id, "cancel requested");
        Ok(())
    }

    pub(crate) async fn input(&self, text: String) -> Result<(), RemexError> {
        let mut run = self.run.lock().await;
        let active = run
            .active_mut()
            .ok_or_else(|| RemexError::illegal_state(&self.id, "not running"))?;
        active
            .stdin
            .send(text)
            .map_err(|_| RemexError::illegal_state(&self.id, "stdin is closed"))
    }

    /// Cancel, wait up to [`EXIT_TIMEOUT`] for the worker, and report the last
    /// recorded exit code (-1 if the worker has not finished).
    pub(crate) async fn exit(&self) -> Result<i32, RemexError> {
        let finished = {
            let mut run = self.run.lock().await;
            let active = run
                .active_mut()
                .ok_or_else(|| RemexError::illegal_state(&self.id, "not running"))?;
            active.request_cancel();
            active.finished.clone()
        };

        if !wait_finished(finished).await {
            tracing::warn!(area = %self.id, timeout_secs = EXIT_TIMEOUT.as_secs(), "worker did not finish in time");
        }
        Ok(self.last_exit_code().await)
    }

    /// Stop whatever runs here before the Area is deleted.
    pub(crate) async fn retire(&self) {
        let finished = {
            let mut run = self.run.lock().await;
            run.active_mut().map(|active| {
                active.request_cancel();
                active.finished.clone()
            })
        };
        let Some(finished) = finished else {
            return;
        };
        if !wait_finished(finished).await {
            let mut run = self.run.lock().await;
            if let Some(worker) = run.active_mut().and_then(|active| active.worker.take()) {
                tracing::warn!(area = %self.id, "aborting worker that ignored cancel");
                worker.abort();
            }
        }
    }

    async fn last_exit_code(&self) -> i32 {
        match &*self.run.lock().await {
            RunState::Exited(done) => done.exit_code,
            _ => -1,
        }
    }

    async fn mark_running(&self) {
        let mut run = self.run.lock().await;
        let state = std::mem::replace(&mut *run, RunState::Virginal);
        *run = match state {
            RunState::Launching(active) => RunState::Running(active),
            other => other,
        };
    }

    async fn finish(&self, exit_code: i32, error: Option<String>) {
        let mut run = self.run.lock().await;
        let (canceled, launched_at) = match run.active_mut() {
            Some(active) => (active.canceled, Some(active.launched_at)),
            None => (false, None),
        };
        *run = RunState::Exited(Finished {
            exit_code,
            error,
            canceled,
            launched_at,
            exited_at: Utc::now(),
        });
    }
}

struct ProcessSpec {
    env: BTreeMap<String, String>,
    args: Vec<String>,
}

async fn run_worker(
    area: Arc<Area>,
    listeners: Arc<Listeners>,
    spec: ProcessSpec,
    stdin_rx: mpsc::UnboundedReceiver<String>,
    cancel_rx: watch::Receiver<bool>,
    finished: watch::Sender<bool>,
) {
    listeners.emit(&area.id, EventKind::Started).await;

    // The process runs on its own task so a panic there is observed here as
    // a JoinError instead of tearing down the worker.
    let process = tokio::spawn(run_process(
        area.clone(),
        listeners.clone(),
        spec,
        stdin_rx,
        cancel_rx,
    ));
    let (exit_code, error) = match process.await {
        Ok(Ok(code)) => (code, None),
        Ok(Err(err)) => {
            tracing::warn!(area = %area.id, error = %err, "process failed");
            (-1, Some(err.to_string()))
        }
        Err(err) => {
            tracing::error!(area = %area.id, error = %err, "worker crashed");
            (-1, Some(format!("worker crashed: {err}")))
        }
    };

    area.finish(exit_code, error).await;
    finished.send_replace(true);
    tracing::info!(area = %area.id, exit_code, "exited");
    listeners.emit(&area.id, EventKind::Exited).await;
}

async fn run_process(
    area: Arc<Area>,
    listeners: Arc<Listeners>,
    spec: ProcessSpec,
    stdin_rx: mpsc::UnboundedReceiver<String>,
    mut cancel_rx: watch::Receiver<bool>,
) -> Result<i32, DaemonError> {
    let Some((program, rest)) = spec.args.split_first() else {
        return Err(RemexError::InvalidArgument("empty command line".to_string()).into());
    };

    let mut child = Command::new(program)
        .args(rest)
        .envs(&spec.env)
        .current_dir(&area.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| io_err(program, e))?;

    area.mark_running().await;
    listeners.emit(&area.id, EventKind::Running).await;

    let stdin = child
        .stdin
        .take()
        .map(|stdin| tokio::spawn(feed_stdin(stdin, stdin_rx)));
    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump(stdout, area.id.clone(), listeners.clone(), false)));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump(stderr, area.id.clone(), listeners.clone(), true)));
    }

    let exited = tokio::select! {
        status = child.wait() => Some(status),
        true = cancel_requested(&mut cancel_rx) => None,
    };
    let status = match exited {
        Some(status) => status,
        None => {
            terminate(&mut child);
            child.wait().await
        }
    }
    .map_err(|e| io_err(&area.cwd, e))?;

    for pump in pumps {
        if let Err(err) = pump.await {
            tracing::warn!(area = %area.id, error = %err, "output pump failed");
        }
    }
    if let Some(stdin) = stdin {
        stdin.abort();
    }

    Ok(exit_code(status))
}

async fn wait_finished(mut finished: watch::Receiver<bool>) -> bool {
    let done = tokio::time::timeout(EXIT_TIMEOUT, finished.wait_for(|done| *done)).await;
    matches!(done, Ok(Ok(_)))
}

async fn cancel_requested(cancel: &mut watch::Receiver<bool>) -> bool {
    cancel.wait_for(|cancel| *cancel).await.is_ok()
}

async fn feed_stdin(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = rx.recv().await {
        if stdin.write_all(text.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
            break;
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(
    mut reader: R,
    area: AreaId,
    listeners: Arc<Listeners>,
    is_err: bool,
) {
    let mut buf = vec![0u8; PUMP_BUFFER];
    let mut pending = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(area = %area, error = %err, "output read failed");
                break;
            }
        };
        pending.extend_from_slice(&buf[..n]);
        let text = take_utf8(&mut pending);
        if !text.is_empty() {
            listeners.output(&area, text, is_err).await;
        }
    }
    if !pending.is_empty() {
        let text = String::from_utf8_lossy(&pending).into_owned();
        listeners.output(&area, text, is_err).await;
    }
}

/// Drain the decodable prefix of `pending`, keeping a trailing partial
/// character for the next read.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(err) if err.error_len().is_none() => {
            let tail = pending.split_off(err.valid_up_to());
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = tail;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

/// Ask the command to stop with SIGTERM so it can flush and exit on its own.
/// `start_kill` (SIGKILL) is only the fallback when the signal cannot be sent.
#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        if kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok() {
            return;
        }
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
