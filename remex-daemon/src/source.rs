//! Client side: a Source session bound to one remote Area.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use remex_core::{
    AreaEvent, AreaId, AreaInfo, AreaState, EventKind, Link, RemexError, Sink, SinkProxy, Source,
    SourceDispatch, PROTOCOL_VERSION,
};
use remex_sync::SourceFs;

use crate::config::ClientConfig;
use crate::error::DaemonError;

/// How often `join` re-checks the Area while waiting for `exited`.
pub const JOIN_POLL: Duration = Duration::from_millis(500);

const STDIN_BUFFER: usize = 4 * 1024;

/// Local stdio for one launch.
pub struct LaunchIo {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Box<dyn Write + Send>,
    pub stderr: Box<dyn Write + Send>,
}

impl LaunchIo {
    /// The current process's stdio. `forward_stdin` false leaves the remote
    /// stdin open but silent.
    pub fn inherit(forward_stdin: bool) -> Self {
        Self {
            stdin: forward_stdin
                .then(|| Box::new(tokio::io::stdin()) as Box<dyn AsyncRead + Send + Unpin>),
            stdout: Box::new(std::io::stdout()),
            stderr: Box::new(std::io::stderr()),
        }
    }
}

struct Outputs {
    stdout: Box<dyn Write + Send>,
    stderr: Box<dyn Write + Send>,
}

/// A Source driving one Area on a Sink.
pub struct SourceSession {
    sink: Arc<dyn Sink>,
    fs: SourceFs,
    area: OnceLock<AreaId>,
    running: watch::Sender<bool>,
    outputs: Mutex<Option<Outputs>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl SourceSession {
    /// A session against `sink` whose local files live under `cwd`. Call
    /// [`SourceSession::open`] before launching.
    pub fn new(sink: Arc<dyn Sink>, cwd: impl Into<PathBuf>) -> Arc<Self> {
        let (running, _) = watch::channel(false);
        Arc::new(Self {
            sink,
            fs: SourceFs::new(cwd, '/'),
            area: OnceLock::new(),
            running,
            outputs: Mutex::new(None),
            forwarder: Mutex::new(None),
        })
    }

    /// Handshake, adopt the Sink's separator, and create or look up the Area.
    pub async fn open(&self, area: Option<AreaId>) -> Result<AreaInfo, RemexError> {
        let welcome = self.sink.get_welcome(PROTOCOL_VERSION).await?;
        tracing::debug!(
            version = welcome.version,
            separator = %welcome.separator,
            os = welcome.properties.get("os.name").map(String::as_str).unwrap_or("?"),
            "welcome"
        );
        self.fs.set_remote_separator(welcome.separator);

        let info = self.sink.create_area(area).await?;
        if let Some(existing) = self.area.get() {
            if existing != &info.id {
                return Err(RemexError::InvalidArgument(format!(
                    "session already bound to area '{existing}'"
                )));
            }
        }
        let _ = self.area.set(info.id.clone());
        Ok(info)
    }

    pub fn area(&self) -> Result<&AreaId, RemexError> {
        self.area
            .get()
            .ok_or_else(|| RemexError::InvalidArgument("session has no area; call open first".into()))
    }

    pub fn fs(&self) -> &SourceFs {
        &self.fs
    }

    pub fn sink(&self) -> &Arc<dyn Sink> {
        &self.sink
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Translate arguments and environment, push every referenced file, and
    /// start the command remotely.
    pub async fn launch(
        self: &Arc<Self>,
        env: BTreeMap<String, String>,
        args: Vec<String>,
        io: LaunchIo,
    ) -> Result<(), RemexError> {
        let area = self.area()?.clone();
        if self.is_running() {
            return Err(RemexError::illegal_state(&area, "already running"));
        }

        let args = args
            .iter()
            .map(|arg| self.fs.transform(arg).map(|a| a.into_owned()))
            .collect::<Result<Vec<_>, _>>()?;
        let env = env
            .into_iter()
            .map(|(key, value)| -> Result<(String, String), RemexError> {
                let value = self.fs.transform(&value)?.into_owned();
                Ok((key, value))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        self.sync().await?;

        *lock(&self.outputs) = Some(Outputs {
            stdout: io.stdout,
            stderr: io.stderr,
        });
        self.running.send_replace(true);

        if let Err(err) = self.sink.launch(&area, env, args).await {
            self.finish_run();
            return Err(err);
        }

        if let Some(stdin) = io.stdin {
            // `exited` may already have arrived for a very short command.
            if self.is_running() {
                let forwarder = tokio::spawn(forward_stdin(self.clone(), area.clone(), stdin));
                *lock(&self.forwarder) = Some(forwarder);
            }
        }
        Ok(())
    }

    /// Push the current delta batch. An empty batch is not sent.
    pub async fn sync(&self) -> Result<(), RemexError> {
        let area = self.area()?;
        let deltas = self.fs.sync()?;
        if deltas.is_empty() {
            tracing::debug!(area = %area, "nothing to sync");
            return Ok(());
        }
        tracing::debug!(area = %area, deltas = deltas.len(), "syncing");
        self.sink.sync(area, deltas).await
    }

    /// Mark `file` as textual: its paths are rewritten on every sync.
    pub fn update(&self, file: &Path) -> Result<(), RemexError> {
        self.mark_transform(file)
    }

    pub fn mark_transform(&self, file: &Path) -> Result<(), RemexError> {
        Ok(self.fs.mark_transform(file)?)
    }

    pub async fn cancel(&self) -> Result<(), RemexError> {
        self.sink.cancel(self.area()?).await
    }

    pub async fn exit(&self) -> Result<i32, RemexError> {
        self.sink.exit(self.area()?).await
    }

    pub async fn view(&self, path: &str) -> Result<Option<Vec<u8>>, RemexError> {
        self.sink.view(self.area()?, path).await
    }

    /// Wait for the current run to end and return its exit code.
    pub async fn join(&self) -> Result<i32, RemexError> {
        let area = self.area()?.clone();
        let mut running = self.running.subscribe();
        loop {
            let still_running = *running.borrow_and_update();
            if !still_running {
                break;
            }
            if tokio::time::timeout(JOIN_POLL, running.changed()).await.is_ok() {
                continue;
            }
            // No event yet: a Virginal Area means ours was removed under us.
            if self.sink.get_area(&area).await?.state == AreaState::Virginal {
                self.finish_run();
                return Err(RemexError::UnknownArea(area));
            }
        }
        let info = self.sink.get_area(&area).await?;
        Ok(info.exit_code.unwrap_or(-1))
    }

    fn finish_run(&self) {
        if let Some(forwarder) = lock(&self.forwarder).take() {
            forwarder.abort();
        }
        if let Some(mut outputs) = lock(&self.outputs).take() {
            let _ = outputs.stdout.flush();
            let _ = outputs.stderr.flush();
        }
        self.running.send_replace(false);
    }
}

#[async_trait]
impl Source for SourceSession {
    async fn get_data(&self, sha: &str) -> Result<Option<Vec<u8>>, RemexError> {
        let data = self.fs.get_data(sha);
        if data.is_none() {
            tracing::debug!(sha, "no local file for digest");
        }
        Ok(data)
    }

    async fn event(&self, event: AreaEvent) -> Result<(), RemexError> {
        if self.area.get() != Some(&event.area) {
            return Ok(());
        }
        tracing::debug!(area = %event.area, event = %event.kind, "event");
        if event.kind == EventKind::Exited {
            self.finish_run();
        }
        Ok(())
    }

    async fn output(&self, area: &AreaId, text: String, is_err: bool) -> Result<(), RemexError> {
        if self.area.get() != Some(area) {
            return Ok(());
        }
        let mut outputs = lock(&self.outputs);
        let Some(outputs) = outputs.as_mut() else {
            return Ok(());
        };
        let out = if is_err {
            &mut outputs.stderr
        } else {
            &mut outputs.stdout
        };
        out.write_all(text.as_bytes())
            .and_then(|()| out.flush())
            .map_err(|e| remex_core::error::io_err(if is_err { "stderr" } else { "stdout" }, e))
    }
}

/// Relay local stdin to the Area; local EOF cancels the run.
async fn forward_stdin(
    session: Arc<SourceSession>,
    area: AreaId,
    mut stdin: Box<dyn AsyncRead + Send + Unpin>,
) {
    let mut buf = vec![0u8; STDIN_BUFFER];
    loop {
        let n = match stdin.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(area = %area, error = %err, "stdin read failed");
                break;
            }
        };
        let text = String::from_utf8_lossy(&buf[..n]).into_owned();
        if let Err(err) = session.sink.input(&area, text).await {
            tracing::debug!(area = %area, error = %err, "input rejected");
            return;
        }
    }
    tracing::debug!(area = %area, "local stdin closed, cancelling");
    if let Err(err) = session.sink.cancel(&area).await {
        tracing::debug!(area = %area, error = %err, "cancel after EOF failed");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ---------------------------------------------------------------------------
// Connected client
// ---------------------------------------------------------------------------

/// A TCP connection to a Sink with a [`SourceSession`] served on it.
pub struct SourceClient {
    link: Link,
    session: Arc<SourceSession>,
    sink: SinkProxy,
}

impl SourceClient {
    /// Connect and start serving the session. No Area is bound yet.
    pub async fn connect(config: &ClientConfig, cwd: impl Into<PathBuf>) -> Result<Self, DaemonError> {
        let addr = config.connect_addr();
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| DaemonError::Connect {
                addr: addr.clone(),
                source,
            })?;
        let link = Link::new(stream);
        let sink = SinkProxy::new(link.remote());
        let session = SourceSession::new(Arc::new(sink.clone()), cwd);
        link.open(Arc::new(SourceDispatch::new(session.clone())))?;
        tracing::debug!(addr = %addr, "connected to sink");
        Ok(Self {
            link,
            session,
            sink,
        })
    }

    pub fn session(&self) -> &Arc<SourceSession> {
        &self.session
    }

    /// Direct access to the Sink for calls not tied to this session's Area.
    pub fn sink(&self) -> &SinkProxy {
        &self.sink
    }

    pub async fn close(&self) -> Result<(), DaemonError> {
        self.link.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkService;
    use tempfile::TempDir;

    fn session_on(sink: &Arc<SinkService>, cwd: &Path) -> Arc<SourceSession> {
        let as_sink: Arc<dyn Sink> = sink.clone();
        SourceSession::new(as_sink, cwd)
    }

    #[tokio::test]
    async fn open_binds_area_and_allocates_id() {
        let sink_root = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let sink = SinkService::open(sink_root.path()).unwrap();

        let session = session_on(&sink, local.path());
        assert!(session.area().is_err());
        let info = session.open(None).await.unwrap();
        assert_eq!(info.id.as_str(), "1000");
        assert_eq!(session.area().unwrap(), &info.id);
    }

    #[tokio::test]
    async fn sync_pushes_marked_files_in_process() {
        let sink_root = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let sink = SinkService::open(sink_root.path()).unwrap();
        let session = session_on(&sink, local.path());
        sink.add_source(session.clone());
        session.open(None).await.unwrap();

        let file = local.path().join("notes.txt");
        std::fs::write(&file, b"hello").unwrap();
        session.fs().to_remote(&file).unwrap();
        session.sync().await.unwrap();

        assert_eq!(session.view("notes.txt").await.unwrap().unwrap(), b"hello");
    }

    #[tokio::test]
    async fn events_for_other_areas_are_ignored() {
        let sink_root = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let sink = SinkService::open(sink_root.path()).unwrap();
        let session = session_on(&sink, local.path());
        session.open(None).await.unwrap();
        session.running.send_replace(true);

        session
            .event(AreaEvent::new(&AreaId::from("other"), EventKind::Exited))
            .await
            .unwrap();
        assert!(session.is_running());

        let mine = session.area().unwrap().clone();
        session
            .event(AreaEvent::new(&mine, EventKind::Exited))
            .await
            .unwrap();
        assert!(!session.is_running());
    }
}
