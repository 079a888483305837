//! The Sink service: Area registry, delta application and event fan-out.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

use remex_core::api::dispatch_sink;
use remex_core::paths::resolve_under_or_root;
use remex_core::{
    AreaEvent, AreaId, AreaInfo, Delta, EventKind, LinkHandler, RemexError, RemoteHandle, Sink,
    Source, SourceProxy, Welcome, PROTOCOL_VERSION,
};
use remex_sync::{DeltaOutcome, SinkFs};

use crate::area::Area;
use crate::config::{areas_root, shacache_dir};
use crate::error::{io_err, DaemonError};

/// First id handed out by `create_area(None)`.
pub const FIRST_AREA_ID: u64 = 1000;

const EVENT_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// Connected Sources plus in-process event subscribers.
pub(crate) struct Listeners {
    sources: std::sync::RwLock<Vec<(u64, Arc<dyn Source>)>>,
    next_id: AtomicU64,
    events: broadcast::Sender<AreaEvent>,
}

impl Listeners {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            sources: std::sync::RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    fn add(&self, source: Arc<dyn Source>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        match self.sources.write() {
            Ok(mut sources) => sources.push((id, source)),
            Err(poisoned) => poisoned.into_inner().push((id, source)),
        }
        id
    }

    fn remove(&self, id: u64) -> bool {
        let mut sources = match self.sources.write() {
            Ok(sources) => sources,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = sources.len();
        sources.retain(|(sid, _)| *sid != id);
        sources.len() != before
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn Source>> {
        let sources = match self.sources.read() {
            Ok(sources) => sources,
            Err(poisoned) => poisoned.into_inner(),
        };
        sources.iter().map(|(_, source)| source.clone()).collect()
    }

    fn len(&self) -> usize {
        match self.sources.read() {
            Ok(sources) => sources.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Tell every Source and subscriber. A failing Source is logged and
    /// skipped.
    pub(crate) async fn emit(&self, area: &AreaId, kind: EventKind) {
        let event = AreaEvent::new(area, kind);
        tracing::debug!(area = %area, event = %kind, "event");
        for source in self.snapshot() {
            if let Err(err) = source.event(event.clone()).await {
                tracing::warn!(area = %area, event = %kind, error = %err, "event delivery failed");
            }
        }
        let _ = self.events.send(event);
    }

    pub(crate) async fn output(&self, area: &AreaId, text: String, is_err: bool) {
        for source in self.snapshot() {
            if let Err(err) = source.output(area, text.clone(), is_err).await {
                tracing::warn!(area = %area, error = %err, "output delivery failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SinkService
// ---------------------------------------------------------------------------

/// Owns every Area under one root directory.
pub struct SinkService {
    root: PathBuf,
    areas: RwLock<BTreeMap<AreaId, Arc<Area>>>,
    fs: SinkFs,
    listeners: Arc<Listeners>,
}

impl SinkService {
    /// Open the Sink rooted at `root`, adopting Areas already on disk.
    pub fn open(root: impl Into<PathBuf>) -> Result<Arc<Self>, DaemonError> {
        let root = root.into();
        let areas_dir = areas_root(&root);
        std::fs::create_dir_all(&areas_dir).map_err(|e| io_err(&areas_dir, e))?;
        let fs = SinkFs::open(shacache_dir(&root))?;

        let mut areas = BTreeMap::new();
        for entry in std::fs::read_dir(&areas_dir).map_err(|e| io_err(&areas_dir, e))? {
            let entry = entry.map_err(|e| io_err(&areas_dir, e))?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let id = AreaId::from(name);
            areas.insert(id.clone(), Arc::new(Area::new(&root, id)));
        }
        tracing::info!(root = %root.display(), areas = areas.len(), "sink opened");

        Ok(Arc::new(Self {
            root,
            areas: RwLock::new(areas),
            fs,
            listeners: Arc::new(Listeners::new()),
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// In-process event feed, alongside the Sources.
    pub fn subscribe(&self) -> broadcast::Receiver<AreaEvent> {
        self.listeners.events.subscribe()
    }

    /// Register a Source for output, events and blob requests.
    pub fn add_source(&self, source: Arc<dyn Source>) -> u64 {
        self.listeners.add(source)
    }

    pub fn remove_source(&self, id: u64) -> bool {
        self.listeners.remove(id)
    }

    pub fn source_count(&self) -> usize {
        self.listeners.len()
    }

    /// The per-connection endpoint for a peer reached through `remote`.
    pub fn endpoint(self: &Arc<Self>, remote: RemoteHandle) -> Arc<SinkEndpoint> {
        let peer = remote.peer().to_string();
        let source_id = self.add_source(Arc::new(SourceProxy::new(remote)));
        tracing::info!(peer = %peer, source = source_id, "source connected");
        Arc::new(SinkEndpoint {
            sink: self.clone(),
            source_id,
            peer,
        })
    }

    async fn lookup(&self, id: &AreaId) -> Result<Arc<Area>, RemexError> {
        self.areas
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RemexError::UnknownArea(id.clone()))
    }

    async fn get_or_create(&self, id: Option<AreaId>) -> Result<Arc<Area>, RemexError> {
        let area = {
            let mut areas = self.areas.write().await;
            let id = match id {
                Some(id) => {
                    if let Some(area) = areas.get(&id) {
                        return Ok(area.clone());
                    }
                    validate_area_id(&id)?;
                    id
                }
                None => self.allocate_id(&areas),
            };
            let area = Arc::new(Area::new(&self.root, id.clone()));
            area.create_dirs()?;
            areas.insert(id, area.clone());
            area
        };
        tracing::info!(area = %area.id, cwd = %area.cwd.display(), "area created");
        self.listeners.emit(&area.id, EventKind::Created).await;
        self.listeners.emit(&area.id, EventKind::Virginal).await;
        Ok(area)
    }

    fn allocate_id(&self, areas: &BTreeMap<AreaId, Arc<Area>>) -> AreaId {
        let areas_dir = areas_root(&self.root);
        (FIRST_AREA_ID..)
            .map(|n| AreaId::from(n.to_string()))
            .find(|id| !areas.contains_key(id) && !areas_dir.join(id.as_str()).exists())
            .unwrap_or_else(|| AreaId::from(FIRST_AREA_ID.to_string()))
    }
}

/// An Area id doubles as a directory name, so it must be exactly one plain
/// path component.
fn validate_area_id(id: &AreaId) -> Result<(), RemexError> {
    let text = id.as_str();
    let mut components = Path::new(text).components();
    let single_normal = matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none();
    if text.is_empty() || !single_normal || text.contains(&['/', '\\'][..]) {
        return Err(RemexError::InvalidArgument(format!("bad area id '{text}'")));
    }
    Ok(())
}

#[async_trait]
impl Sink for SinkService {
    async fn get_welcome(&self, highest: u32) -> Result<Welcome, RemexError> {
        let properties = BTreeMap::from([
            ("os.name".to_string(), std::env::consts::OS.to_string()),
            ("os.arch".to_string(), std::env::consts::ARCH.to_string()),
            (
                "remex.version".to_string(),
                env!("CARGO_PKG_VERSION").to_string(),
            ),
            ("sink.root".to_string(), self.root.display().to_string()),
        ]);
        Ok(Welcome {
            version: PROTOCOL_VERSION.min(highest),
            separator: MAIN_SEPARATOR,
            properties,
        })
    }

    async fn get_area(&self, id: &AreaId) -> Result<AreaInfo, RemexError> {
        Ok(self.get_or_create(Some(id.clone())).await?.info().await)
    }

    async fn create_area(&self, id: Option<AreaId>) -> Result<AreaInfo, RemexError> {
        Ok(self.get_or_create(id).await?.info().await)
    }

    async fn get_areas(&self) -> Result<Vec<AreaInfo>, RemexError> {
        let areas: Vec<Arc<Area>> = self.areas.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(areas.len());
        for area in areas {
            infos.push(area.info().await);
        }
        Ok(infos)
    }

    async fn remove_area(&self, id: &AreaId) -> Result<bool, RemexError> {
        let Some(area) = self.areas.read().await.get(id).cloned() else {
            return Ok(false);
        };
        area.retire().await;
        match tokio::fs::remove_dir_all(&area.root).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(remex_core::error::io_err(&area.root, err)),
        }
        self.areas.write().await.remove(id);
        tracing::info!(area = %id, "area removed");
        self.listeners.emit(id, EventKind::Deleted).await;
        Ok(true)
    }

    async fn launch(
        &self,
        area: &AreaId,
        env: BTreeMap<String, String>,
        args: Vec<String>,
    ) -> Result<(), RemexError> {
        self.lookup(area)
            .await?
            .launch(env, args, &self.listeners)
            .await
    }

    async fn cancel(&self, area: &AreaId) -> Result<(), RemexError> {
        self.lookup(area).await?.cancel().await
    }

    async fn input(&self, area: &AreaId, text: String) -> Result<(), RemexError> {
        self.lookup(area).await?.input(text).await
    }

    async fn exit(&self, area: &AreaId) -> Result<i32, RemexError> {
        self.lookup(area).await?.exit().await
    }

    async fn view(&self, area: &AreaId, path: &str) -> Result<Option<Vec<u8>>, RemexError> {
        let area = self.lookup(area).await?;
        let target = resolve_under_or_root(&area.cwd, path)?;
        let meta = match tokio::fs::metadata(&target).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(remex_core::error::io_err(&target, err)),
        };
        if meta.is_dir() {
            let mut names = Vec::new();
            let mut entries = tokio::fs::read_dir(&target)
                .await
                .map_err(|e| remex_core::error::io_err(&target, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| remex_core::error::io_err(&target, e))?
            {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
            names.sort();
            Ok(Some(names.join("\n").into_bytes()))
        } else {
            let bytes = tokio::fs::read(&target)
                .await
                .map_err(|e| remex_core::error::io_err(&target, e))?;
            Ok(Some(bytes))
        }
    }

    async fn sync(&self, area: &AreaId, deltas: Vec<Delta>) -> Result<(), RemexError> {
        let area = self.get_or_create(Some(area.clone())).await?;
        let sources = self.listeners.snapshot();
        let outcomes = self.fs.delta(&area.cwd, &deltas, &sources).await;

        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for outcome in &outcomes {
            let key = match outcome {
                DeltaOutcome::Deleted { .. } => "deleted",
                DeltaOutcome::Written { .. } => "written",
                DeltaOutcome::Unchanged { .. } => "unchanged",
                DeltaOutcome::Missing { .. } => "missing",
                DeltaOutcome::Failed { .. } => "failed",
            };
            *counts.entry(key).or_default() += 1;
        }
        let count = |key: &str| counts.get(key).copied().unwrap_or(0);
        tracing::info!(
            area = %area.id,
            deltas = outcomes.len(),
            written = count("written"),
            unchanged = count("unchanged"),
            deleted = count("deleted"),
            missing = count("missing"),
            failed = count("failed"),
            "sync applied",
        );
        Ok(())
    }

    async fn clear_cache(&self) -> Result<(), RemexError> {
        self.fs.clear_cache()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-connection endpoint
// ---------------------------------------------------------------------------

/// Serves the Sink to one connected peer and keeps that peer registered as
/// a Source until the link closes.
pub struct SinkEndpoint {
    sink: Arc<SinkService>,
    source_id: u64,
    peer: String,
}

#[async_trait]
impl LinkHandler for SinkEndpoint {
    async fn handle(&self, body: Value) -> Result<Value, RemexError> {
        dispatch_sink(self.sink.as_ref(), body).await
    }

    async fn closed(&self) {
        self.sink.remove_source(self.source_id);
        tracing::info!(peer = %self.peer, source = self.source_id, "source disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn wait_exited(sink: &SinkService, id: &AreaId) -> AreaInfo {
        for _ in 0..200 {
            let info = sink.get_area(id).await.unwrap();
            if !info.running && info.exit_code.is_some() {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("area {id} never exited");
    }

    #[tokio::test]
    async fn welcome_negotiates_down() {
        let dir = TempDir::new().unwrap();
        let sink = SinkService::open(dir.path()).unwrap();
        let welcome = sink.get_welcome(99).await.unwrap();
        assert_eq!(welcome.version, PROTOCOL_VERSION);
        assert_eq!(welcome.separator, MAIN_SEPARATOR);
        assert!(welcome.properties.contains_key("os.name"));
        assert_eq!(sink.get_welcome(0).await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn ids_allocate_from_1000_and_skip_existing_dirs() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("areas/1000/cwd")).unwrap();
        let sink = SinkService::open(dir.path()).unwrap();

        assert_eq!(sink.get_areas().await.unwrap().len(), 1, "adopted from disk");
        let info = sink.create_area(None).await.unwrap();
        assert_eq!(info.id.as_str(), "1001");
        assert!(info.cwd.is_dir());
        assert_eq!(info.state, remex_core::AreaState::Virginal);
    }

    #[tokio::test]
    async fn create_area_emits_created_then_virginal() {
        let dir = TempDir::new().unwrap();
        let sink = SinkService::open(dir.path()).unwrap();
        let mut events = sink.subscribe();

        let info = sink.create_area(Some(AreaId::from("build"))).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), AreaEvent::new(&info.id, EventKind::Created));
        assert_eq!(events.recv().await.unwrap(), AreaEvent::new(&info.id, EventKind::Virginal));

        // Second reference returns the same Area without new events.
        sink.create_area(Some(AreaId::from("build"))).await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn area_ids_must_be_plain_names() {
        let dir = TempDir::new().unwrap();
        let sink = SinkService::open(dir.path()).unwrap();
        for bad in ["..", "a/b", "", "/x"] {
            assert!(sink.create_area(Some(AreaId::from(bad))).await.is_err(), "{bad}");
        }
    }

    #[tokio::test]
    async fn unknown_area_is_an_error_until_materialized() {
        let dir = TempDir::new().unwrap();
        let sink = SinkService::open(dir.path()).unwrap();
        let ghost = AreaId::from("4242");
        assert!(matches!(sink.cancel(&ghost).await, Err(RemexError::UnknownArea(_))));
        assert!(!sink.remove_area(&ghost).await.unwrap());

        let info = sink.get_area(&ghost).await.unwrap();
        assert_eq!(info.state, remex_core::AreaState::Virginal);
        assert!(info.cwd.is_dir());
        assert!(sink.remove_area(&ghost).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_runs_and_records_exit_code() {
        let dir = TempDir::new().unwrap();
        let sink = SinkService::open(dir.path()).unwrap();
        let area = sink.create_area(None).await.unwrap().id;

        sink.launch(&area, BTreeMap::new(), vec!["sh".into(), "-c".into(), "exit 3".into()])
            .await
            .unwrap();
        let info = wait_exited(&sink, &area).await;
        assert_eq!(info.exit_code, Some(3));
        assert_eq!(info.state, remex_core::AreaState::Exited);
        assert!(!info.canceled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn second_launch_while_running_fails() {
        let dir = TempDir::new().unwrap();
        let sink = SinkService::open(dir.path()).unwrap();
        let area = sink.create_area(None).await.unwrap().id;

        sink.launch(&area, BTreeMap::new(), vec!["sleep".into(), "30".into()])
            .await
            .unwrap();
        let again = sink
            .launch(&area, BTreeMap::new(), vec!["sleep".into(), "30".into()])
            .await;
        assert!(matches!(again, Err(RemexError::IllegalState { .. })));

        sink.cancel(&area).await.unwrap();
        let info = wait_exited(&sink, &area).await;
        assert!(info.canceled);
        assert!(!info.running);
    }

    #[tokio::test]
    async fn empty_args_are_rejected() {
        let dir = TempDir::new().unwrap();
        let sink = SinkService::open(dir.path()).unwrap();
        let area = sink.create_area(None).await.unwrap().id;
        let err = sink.launch(&area, BTreeMap::new(), vec![]).await;
        assert!(matches!(err, Err(RemexError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn unspawnable_program_exits_minus_one_with_error() {
        let dir = TempDir::new().unwrap();
        let sink = SinkService::open(dir.path()).unwrap();
        let area = sink.create_area(None).await.unwrap().id;
        let mut events = sink.subscribe();

        sink.launch(&area, BTreeMap::new(), vec!["/definitely/not/a/program".into()])
            .await
            .unwrap();
        let mut kinds = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("exited event in time")
                .unwrap();
            kinds.push(event.kind);
            if event.kind == EventKind::Exited {
                break;
            }
        }
        assert_eq!(
            kinds,
            vec![EventKind::Launching, EventKind::Started, EventKind::Exited]
        );

        let info = wait_exited(&sink, &area).await;
        assert_eq!(info.exit_code, Some(-1));
        assert!(info.error.is_some());
        assert!(!info.running);
    }

    #[tokio::test]
    async fn view_lists_reads_and_rejects_escapes() {
        let dir = TempDir::new().unwrap();
        let sink = SinkService::open(dir.path()).unwrap();
        let info = sink.create_area(None).await.unwrap();
        std::fs::write(info.cwd.join("b.txt"), b"bee").unwrap();
        std::fs::write(info.cwd.join("a.txt"), b"ay").unwrap();

        let listing = sink.view(&info.id, ".").await.unwrap().unwrap();
        assert_eq!(listing, b"a.txt\nb.txt");
        assert_eq!(sink.view(&info.id, "a.txt").await.unwrap().unwrap(), b"ay");
        assert!(sink.view(&info.id, "nope").await.unwrap().is_none());
        assert!(matches!(
            sink.view(&info.id, "../../etc/passwd").await,
            Err(RemexError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn sync_creates_unknown_area_and_applies_content() {
        let dir = TempDir::new().unwrap();
        let sink = SinkService::open(dir.path()).unwrap();
        let id = AreaId::from("2000");
        sink.sync(&id, vec![Delta::content("x/y.txt", b"why".to_vec())])
            .await
            .unwrap();
        assert_eq!(sink.view(&id, "x/y.txt").await.unwrap().unwrap(), b"why");
    }

    #[tokio::test]
    async fn remove_area_deletes_tree_and_emits_deleted() {
        let dir = TempDir::new().unwrap();
        let sink = SinkService::open(dir.path()).unwrap();
        let info = sink.create_area(None).await.unwrap();
        let mut events = sink.subscribe();

        assert!(sink.remove_area(&info.id).await.unwrap());
        assert!(!dir.path().join("areas").join(info.id.as_str()).exists());
        assert!(sink.get_areas().await.unwrap().iter().all(|a| a.id != info.id));
        assert_eq!(events.recv().await.unwrap().kind, EventKind::Deleted);
    }

    struct Broken;

    #[async_trait]
    impl Source for Broken {
        async fn get_data(&self, _sha: &str) -> Result<Option<Vec<u8>>, RemexError> {
            Err(RemexError::LinkClosed)
        }
        async fn event(&self, _event: AreaEvent) -> Result<(), RemexError> {
            Err(RemexError::LinkClosed)
        }
        async fn output(&self, _area: &AreaId, _text: String, _is_err: bool) -> Result<(), RemexError> {
            Err(RemexError::LinkClosed)
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: std::sync::Mutex<Vec<EventKind>>,
        output: std::sync::Mutex<Vec<(String, bool)>>,
    }

    #[async_trait]
    impl Source for Recorder {
        async fn get_data(&self, _sha: &str) -> Result<Option<Vec<u8>>, RemexError> {
            Ok(None)
        }
        async fn event(&self, event: AreaEvent) -> Result<(), RemexError> {
            self.events.lock().unwrap().push(event.kind);
            Ok(())
        }
        async fn output(&self, _area: &AreaId, text: String, is_err: bool) -> Result<(), RemexError> {
            self.output.lock().unwrap().push((text, is_err));
            Ok(())
        }
    }

    #[tokio::test]
    async fn failing_source_does_not_starve_the_others() {
        let dir = TempDir::new().unwrap();
        let sink = SinkService::open(dir.path()).unwrap();
        let mut events = sink.subscribe();
        let recorder = Arc::new(Recorder::default());

        let broken = sink.add_source(Arc::new(Broken));
        sink.add_source(recorder.clone());
        assert_eq!(sink.source_count(), 2);

        let area = AreaId::from("1000");
        sink.listeners.emit(&area, EventKind::Exited).await;
        sink.listeners.output(&area, "hi\n".into(), true).await;

        assert_eq!(*recorder.events.lock().unwrap(), vec![EventKind::Exited]);
        assert_eq!(*recorder.output.lock().unwrap(), vec![("hi\n".to_string(), true)]);
        assert_eq!(events.recv().await.unwrap().kind, EventKind::Exited);

        assert!(sink.remove_source(broken));
        assert!(!sink.remove_source(broken));
        assert_eq!(sink.source_count(), 1);
    }
}
