//! Sink-side content-addressed store.
//!
//! Blobs live in `<cache>/<sha1-hex>`. Applying a sha-reference delta copies
//! the blob to its target, fetching it from a connected Source first when the
//! cache does not hold it. The in-memory indexes only save transfers; losing
//! them never affects correctness.

use std::collections::{BTreeSet, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use remex_core::digest::{is_sha1_hex, sha1_hex};
use remex_core::paths::resolve_under;
use remex_core::{Delta, DeltaOp, RemexError, Source};

use crate::error::{io_err, SyncError};

/// What happened to one delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaOutcome {
    Deleted { path: PathBuf },
    Written { path: PathBuf },
    /// The target already holds the referenced digest.
    Unchanged { path: PathBuf },
    /// No cache entry and no Source could supply the blob.
    Missing { path: PathBuf, sha: String },
    Failed { path: String, reason: String },
}

#[derive(Debug, Default)]
struct Index {
    by_file: HashMap<PathBuf, String>,
    by_sha: HashMap<String, BTreeSet<PathBuf>>,
}

impl Index {
    fn record(&mut self, file: &Path, sha: &str) {
        self.forget(file);
        self.by_file.insert(file.to_path_buf(), sha.to_string());
        self.by_sha
            .entry(sha.to_string())
            .or_default()
            .insert(file.to_path_buf());
    }

    fn forget(&mut self, file: &Path) {
        if let Some(old) = self.by_file.remove(file) {
            if let Some(files) = self.by_sha.get_mut(&old) {
                files.remove(file);
                if files.is_empty() {
                    self.by_sha.remove(&old);
                }
            }
        }
    }

    fn forget_tree(&mut self, root: &Path) {
        let doomed: Vec<PathBuf> = self
            .by_file
            .keys()
            .filter(|file| file.starts_with(root))
            .cloned()
            .collect();
        for file in doomed {
            self.forget(&file);
        }
    }
}

/// Delta applier and blob cache shared by every Area of a Sink.
#[derive(Debug)]
pub struct SinkFs {
    cache_dir: PathBuf,
    index: Mutex<Index>,
}

impl SinkFs {
    /// Open (creating if needed) the blob cache at `cache_dir`.
    pub fn open(cache_dir: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir).map_err(|e| io_err(&cache_dir, e))?;
        Ok(Self {
            cache_dir,
            index: Mutex::new(Index::default()),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Apply `deltas` under `cwd`, one at a time. A failing delta is logged
    /// and reported in its outcome; the rest of the batch still runs.
    pub async fn delta(
        &self,
        cwd: &Path,
        deltas: &[Delta],
        sources: &[Arc<dyn Source>],
    ) -> Vec<DeltaOutcome> {
        let mut outcomes = Vec::with_capacity(deltas.len());
        for delta in deltas {
            let outcome = match self.apply(cwd, delta, sources).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::warn!(path = %delta.path, error = %err, "delta failed");
                    DeltaOutcome::Failed {
                        path: delta.path.clone(),
                        reason: err.to_string(),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Digest last written to `file`, if known.
    pub fn recorded_sha(&self, file: &Path) -> Option<String> {
        self.lock().by_file.get(file).cloned()
    }

    /// Drop every cached blob and forget both indexes.
    pub fn clear_cache(&self) -> Result<(), SyncError> {
        match std::fs::remove_dir_all(&self.cache_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(&self.cache_dir, err)),
        }
        std::fs::create_dir_all(&self.cache_dir).map_err(|e| io_err(&self.cache_dir, e))?;
        *self.lock() = Index::default();
        tracing::info!(cache = %self.cache_dir.display(), "blob cache cleared");
        Ok(())
    }

    // ---- Per-delta ---------------------------------------------------------

    async fn apply(
        &self,
        cwd: &Path,
        delta: &Delta,
        sources: &[Arc<dyn Source>],
    ) -> Result<DeltaOutcome, SyncError> {
        let target = resolve_under(cwd, &delta.path)?;
        match delta.op() {
            Some(DeltaOp::Delete) => self.delete(target).await,
            Some(DeltaOp::Sha(sha)) => self.fetch_into(target, sha, sources).await,
            Some(DeltaOp::Content(bytes)) => {
                let sha = sha1_hex(bytes);
                write_atomic(&target, bytes).await?;
                self.lock().record(&target, &sha);
                tracing::debug!(path = %target.display(), sha, "wrote inline content");
                Ok(DeltaOutcome::Written { path: target })
            }
            None => Err(SyncError::EmptyDelta(delta.path.clone())),
        }
    }

    async fn delete(&self, target: PathBuf) -> Result<DeltaOutcome, SyncError> {
        let result = match tokio::fs::symlink_metadata(&target).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&target).await,
            Ok(_) => tokio::fs::remove_file(&target).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(&target, err)),
        }
        self.lock().forget_tree(&target);
        tracing::debug!(path = %target.display(), "deleted");
        Ok(DeltaOutcome::Deleted { path: target })
    }

    async fn fetch_into(
        &self,
        target: PathBuf,
        sha: &str,
        sources: &[Arc<dyn Source>],
    ) -> Result<DeltaOutcome, SyncError> {
        if !is_sha1_hex(sha) {
            return Err(RemexError::InvalidArgument(format!("not a SHA-1 digest: '{sha}'")).into());
        }
        let sha = sha.to_ascii_lowercase();

        if self.recorded_sha(&target).as_deref() == Some(sha.as_str())
            && tokio::fs::try_exists(&target).await.unwrap_or(false)
        {
            tracing::debug!(path = %target.display(), sha, "already up to date");
            return Ok(DeltaOutcome::Unchanged { path: target });
        }

        let Some(bytes) = self.resolve_blob(&sha, sources).await? else {
            self.lock().forget(&target);
            tracing::warn!(path = %target.display(), sha, "no source could supply blob");
            return Ok(DeltaOutcome::Missing { path: target, sha });
        };

        write_atomic(&target, &bytes).await?;
        self.lock().record(&target, &sha);
        tracing::debug!(path = %target.display(), sha, "wrote blob");
        Ok(DeltaOutcome::Written { path: target })
    }

    /// Cache first, then a local file already known to hold `sha`, then each
    /// Source in turn. Anything not read from the cache is persisted into it.
    async fn resolve_blob(
        &self,
        sha: &str,
        sources: &[Arc<dyn Source>],
    ) -> Result<Option<Vec<u8>>, SyncError> {
        let blob = self.cache_dir.join(sha);
        match tokio::fs::read(&blob).await {
            Ok(bytes) if sha1_hex(&bytes) == sha => return Ok(Some(bytes)),
            Ok(_) => {
                tracing::warn!(blob = %blob.display(), "corrupt cache entry, discarding");
                let _ = tokio::fs::remove_file(&blob).await;
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(&blob, err)),
        }

        let candidates: Vec<PathBuf> = self
            .lock()
            .by_sha
            .get(sha)
            .map(|files| files.iter().cloned().collect())
            .unwrap_or_default();
        for candidate in candidates {
            if let Ok(bytes) = tokio::fs::read(&candidate).await {
                if sha1_hex(&bytes) == sha {
                    self.persist_blob(&blob, sha, &bytes).await;
                    return Ok(Some(bytes));
                }
            }
            self.lock().forget(&candidate);
        }

        for source in sources {
            match source.get_data(sha).await {
                Ok(Some(bytes)) => {
                    let actual = sha1_hex(&bytes);
                    if actual != sha {
                        let err = SyncError::DigestMismatch {
                            expected: sha.to_string(),
                            actual,
                        };
                        tracing::warn!(error = %err, "source sent wrong bytes");
                        continue;
                    }
                    self.persist_blob(&blob, sha, &bytes).await;
                    return Ok(Some(bytes));
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(sha, error = %err, "get_data failed"),
            }
        }
        Ok(None)
    }

    /// Store `bytes` as the blob for `sha`. Losing a race to another writer
    /// of the same blob is fine; any other failure only costs a later refetch.
    async fn persist_blob(&self, blob: &Path, sha: &str, bytes: &[u8]) {
        let Err(err) = write_atomic(blob, bytes).await else {
            return;
        };
        match tokio::fs::read(blob).await {
            Ok(existing) if sha1_hex(&existing) == sha => {
                tracing::debug!(sha, "blob stored by a concurrent writer");
            }
            _ => tracing::warn!(sha, error = %err, "could not cache blob"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Index> {
        match self.index.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Temp name next to `path`, unique per process and per call.
fn tmp_path(path: &Path) -> PathBuf {
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    PathBuf::from(format!("{}.remex.{}.{n}.tmp", path.display(), std::process::id()))
}

/// Write to a private temp file next to `path`, then rename over it.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_err(parent, e))?;
    }
    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| io_err(&tmp, e))?;
    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_err(path, err));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use remex_core::{AreaEvent, AreaId};
    use tempfile::TempDir;

    /// Serves blobs from memory and counts how often it was asked.
    #[derive(Default)]
    struct MemorySource {
        blobs: HashMap<String, Vec<u8>>,
        calls: AtomicUsize,
    }

    impl MemorySource {
        fn with(blobs: &[&[u8]]) -> Arc<Self> {
            Arc::new(Self {
                blobs: blobs.iter().map(|b| (sha1_hex(b), b.to_vec())).collect(),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Source for MemorySource {
        async fn get_data(&self, sha: &str) -> Result<Option<Vec<u8>>, RemexError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.blobs.get(sha).cloned())
        }

        async fn event(&self, _event: AreaEvent) -> Result<(), RemexError> {
            Ok(())
        }

        async fn output(&self, _area: &AreaId, _text: String, _is_err: bool) -> Result<(), RemexError> {
            Ok(())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl Source for FailingSource {
        async fn get_data(&self, _sha: &str) -> Result<Option<Vec<u8>>, RemexError> {
            Err(RemexError::LinkClosed)
        }

        async fn event(&self, _event: AreaEvent) -> Result<(), RemexError> {
            Ok(())
        }

        async fn output(&self, _area: &AreaId, _text: String, _is_err: bool) -> Result<(), RemexError> {
            Ok(())
        }
    }

    fn setup() -> (TempDir, SinkFs, PathBuf) {
        let root = TempDir::new().unwrap();
        let fs = SinkFs::open(root.path().join("shacache")).unwrap();
        let cwd = root.path().join("areas/1000/cwd");
        std::fs::create_dir_all(&cwd).unwrap();
        (root, fs, cwd)
    }

    #[tokio::test]
    async fn sha_delta_fetches_from_source_and_caches_blob() {
        let (_root, fs, cwd) = setup();
        let source = MemorySource::with(&[b"hello"]);
        let sources: Vec<Arc<dyn Source>> = vec![source.clone()];

        let sha = sha1_hex(b"hello");
        let out = fs
            .delta(&cwd, &[Delta::sha("lib/a.txt", sha.clone())], &sources)
            .await;

        assert!(matches!(out[0], DeltaOutcome::Written { .. }));
        assert_eq!(std::fs::read(cwd.join("lib/a.txt")).unwrap(), b"hello");
        assert!(fs.cache_dir().join(&sha).exists());
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn matching_recorded_sha_skips_fetch() {
        let (_root, fs, cwd) = setup();
        let source = MemorySource::with(&[b"hello"]);
        let sources: Vec<Arc<dyn Source>> = vec![source.clone()];
        let delta = Delta::sha("a.txt", sha1_hex(b"hello"));

        fs.delta(&cwd, &[delta.clone()], &sources).await;
        let out = fs.delta(&cwd, &[delta], &sources).await;

        assert!(matches!(out[0], DeltaOutcome::Unchanged { .. }));
        assert_eq!(source.calls(), 1, "dedup must not call get_data again");
    }

    #[tokio::test]
    async fn cached_blob_serves_second_path_without_source() {
        let (_root, fs, cwd) = setup();
        let source = MemorySource::with(&[b"same"]);
        let sources: Vec<Arc<dyn Source>> = vec![source.clone()];
        let sha = sha1_hex(b"same");

        let out = fs
            .delta(
                &cwd,
                &[Delta::sha("a.txt", sha.clone()), Delta::sha("b.txt", sha.clone())],
                &sources,
            )
            .await;

        assert!(out.iter().all(|o| matches!(o, DeltaOutcome::Written { .. })));
        assert_eq!(source.calls(), 1);
        let blobs = std::fs::read_dir(fs.cache_dir()).unwrap().count();
        assert_eq!(blobs, 1, "identical bytes share one blob");
    }

    #[tokio::test]
    async fn missing_blob_leaves_target_untouched() {
        let (_root, fs, cwd) = setup();
        std::fs::write(cwd.join("a.txt"), b"old").unwrap();
        let sources: Vec<Arc<dyn Source>> = vec![MemorySource::with(&[])];

        let out = fs
            .delta(&cwd, &[Delta::sha("a.txt", sha1_hex(b"new"))], &sources)
            .await;

        assert!(matches!(out[0], DeltaOutcome::Missing { .. }));
        assert_eq!(std::fs::read(cwd.join("a.txt")).unwrap(), b"old");
        assert!(fs.recorded_sha(&cwd.join("a.txt")).is_none());
    }

    #[tokio::test]
    async fn failing_source_is_skipped_for_the_next() {
        let (_root, fs, cwd) = setup();
        let good = MemorySource::with(&[b"x"]);
        let sources: Vec<Arc<dyn Source>> = vec![Arc::new(FailingSource), good.clone()];

        let out = fs
            .delta(&cwd, &[Delta::sha("x", sha1_hex(b"x"))], &sources)
            .await;

        assert!(matches!(out[0], DeltaOutcome::Written { .. }));
        assert_eq!(good.calls(), 1);
    }

    #[tokio::test]
    async fn escaping_path_fails_alone() {
        let (root, fs, cwd) = setup();
        let out = fs
            .delta(
                &cwd,
                &[
                    Delta::content("../../escape.txt", b"bad".to_vec()),
                    Delta::content("/abs.txt", b"bad".to_vec()),
                    Delta::content("ok.txt", b"good".to_vec()),
                ],
                &[],
            )
            .await;

        assert!(matches!(out[0], DeltaOutcome::Failed { .. }));
        assert!(matches!(out[1], DeltaOutcome::Failed { .. }));
        assert!(matches!(out[2], DeltaOutcome::Written { .. }));
        assert!(!root.path().join("areas/escape.txt").exists());
        assert_eq!(std::fs::read(cwd.join("ok.txt")).unwrap(), b"good");
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_removes_trees() {
        let (_root, fs, cwd) = setup();
        fs.delta(&cwd, &[Delta::content("d/a.txt", b"a".to_vec())], &[])
            .await;

        let out = fs.delta(&cwd, &[Delta::delete("d")], &[]).await;
        assert!(matches!(out[0], DeltaOutcome::Deleted { .. }));
        assert!(!cwd.join("d").exists());
        assert!(fs.recorded_sha(&cwd.join("d/a.txt")).is_none());

        let again = fs.delta(&cwd, &[Delta::delete("d")], &[]).await;
        assert!(matches!(again[0], DeltaOutcome::Deleted { .. }));
    }

    #[tokio::test]
    async fn content_delta_records_digest() {
        let (_root, fs, cwd) = setup();
        fs.delta(&cwd, &[Delta::content("bnd.bnd", b"-runpath: x".to_vec())], &[])
            .await;
        assert_eq!(
            fs.recorded_sha(&cwd.join("bnd.bnd")),
            Some(sha1_hex(b"-runpath: x"))
        );
    }

    #[tokio::test]
    async fn bogus_sha_is_rejected() {
        let (_root, fs, cwd) = setup();
        let out = fs.delta(&cwd, &[Delta::sha("a", "../../x")], &[]).await;
        assert!(matches!(out[0], DeltaOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn clear_cache_forces_refetch() {
        let (_root, fs, cwd) = setup();
        let source = MemorySource::with(&[b"v"]);
        let sources: Vec<Arc<dyn Source>> = vec![source.clone()];
        let delta = Delta::sha("v.txt", sha1_hex(b"v"));

        fs.delta(&cwd, &[delta.clone()], &sources).await;
        fs.clear_cache().unwrap();
        assert_eq!(std::fs::read_dir(fs.cache_dir()).unwrap().count(), 0);

        let out = fs.delta(&cwd, &[delta], &sources).await;
        assert!(matches!(out[0], DeltaOutcome::Written { .. }));
        assert_eq!(source.calls(), 2);
    }

    #[test]
    fn temp_names_never_repeat() {
        let target = Path::new("/cache/abc");
        let a = tmp_path(target);
        let b = tmp_path(target);
        assert_ne!(a, b);
        assert!(a.to_string_lossy().starts_with("/cache/abc.remex."));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_fetches_of_one_blob_all_succeed() {
        let root = TempDir::new().unwrap();
        let fs = Arc::new(SinkFs::open(root.path().join("shacache")).unwrap());
        let payload = vec![7u8; 256 * 1024];
        let sha = sha1_hex(&payload);
        let source = MemorySource::with(&[&payload]);

        for round in 0..10 {
            fs.clear_cache().unwrap();
            let mut tasks = Vec::new();
            for area in 0..16 {
                let fs = fs.clone();
                let cwd = root.path().join(format!("areas/{round}-{area}/cwd"));
                let sources: Vec<Arc<dyn Source>> = vec![source.clone()];
                let delta = Delta::sha("lib/dep.jar", sha.clone());
                tasks.push(tokio::spawn(async move {
                    let out = fs.delta(&cwd, &[delta], &sources).await;
                    (cwd, out)
                }));
            }
            for task in tasks {
                let (cwd, out) = task.await.unwrap();
                assert!(
                    matches!(out[0], DeltaOutcome::Written { .. } | DeltaOutcome::Unchanged { .. }),
                    "round {round}: {out:?}"
                );
                assert_eq!(std::fs::read(cwd.join("lib/dep.jar")).unwrap(), payload);
            }
        }

        let names: Vec<String> = std::fs::read_dir(fs.cache_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![sha], "one blob and no leftover temp files");
    }
}
