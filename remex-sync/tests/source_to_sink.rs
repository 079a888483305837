use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use remex_core::digest::sha1_file;
use remex_core::paths::resolve_under;
use remex_core::{AreaEvent, AreaId, RemexError, Source};
use remex_sync::{DeltaOutcome, SinkFs, SourceFs};

/// A Source backed directly by a [`SourceFs`], as the client session is.
struct LocalSource {
    fs: SourceFs,
    fetches: AtomicUsize,
}

#[async_trait]
impl Source for LocalSource {
    async fn get_data(&self, sha: &str) -> Result<Option<Vec<u8>>, RemexError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.fs.get_data(sha))
    }

    async fn event(&self, _event: AreaEvent) -> Result<(), RemexError> {
        Ok(())
    }

    async fn output(&self, _area: &AreaId, _text: String, _is_err: bool) -> Result<(), RemexError> {
        Ok(())
    }
}

struct Fixture {
    local: TempDir,
    outside: TempDir,
    _sink_root: TempDir,
    source: Arc<LocalSource>,
    sink: SinkFs,
    area_cwd: std::path::PathBuf,
}

fn fixture() -> Fixture {
    let local = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    let sink_root = TempDir::new().unwrap();
    let area_cwd = sink_root.path().join("areas/1000/cwd");
    std::fs::create_dir_all(&area_cwd).unwrap();
    Fixture {
        source: Arc::new(LocalSource {
            fs: SourceFs::with_local_separator(local.path(), '/', '/'),
            fetches: AtomicUsize::new(0),
        }),
        sink: SinkFs::open(sink_root.path().join("shacache")).unwrap(),
        area_cwd,
        local,
        outside,
        _sink_root: sink_root,
    }
}

#[tokio::test]
async fn translated_file_lands_with_same_digest() {
    let f = fixture();
    let file = f.outside.path().join("input.txt");
    std::fs::write(&file, b"the quick brown fox").unwrap();

    let arg = f.source.fs.transform(&file.display().to_string()).unwrap().into_owned();
    assert!(arg.starts_with("_ABS/"));

    let deltas = f.source.fs.sync().unwrap();
    let sources: Vec<Arc<dyn Source>> = vec![f.source.clone()];
    let outcomes = f.sink.delta(&f.area_cwd, &deltas, &sources).await;
    assert!(outcomes.iter().all(|o| matches!(o, DeltaOutcome::Written { .. })));

    let landed = resolve_under(&f.area_cwd, &arg).unwrap();
    assert_eq!(sha1_file(&landed).unwrap(), sha1_file(&file).unwrap());
}

#[tokio::test]
async fn resync_of_unchanged_tree_transfers_nothing() {
    let f = fixture();
    let dir = f.local.path().join("lib");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("a.jar"), b"a").unwrap();
    std::fs::write(dir.join("b.jar"), b"a").unwrap();
    f.source.fs.to_remote(&dir).unwrap();

    let sources: Vec<Arc<dyn Source>> = vec![f.source.clone()];
    let first = f.source.fs.sync().unwrap();
    assert_eq!(first.len(), 2);
    f.sink.delta(&f.area_cwd, &first, &sources).await;
    assert_eq!(f.source.fetches.load(Ordering::SeqCst), 1, "identical files fetched once");

    assert!(f.source.fs.sync().unwrap().is_empty());

    // Re-sending the same references is a no-op on the sink side too.
    let outcomes = f.sink.delta(&f.area_cwd, &first, &sources).await;
    assert!(outcomes.iter().all(|o| matches!(o, DeltaOutcome::Unchanged { .. })));
    assert_eq!(f.source.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn local_delete_propagates() {
    let f = fixture();
    let file = f.local.path().join("tmp.txt");
    std::fs::write(&file, b"bye").unwrap();
    let remote = f.source.fs.to_remote(&file).unwrap();

    let sources: Vec<Arc<dyn Source>> = vec![f.source.clone()];
    let deltas = f.source.fs.sync().unwrap();
    f.sink.delta(&f.area_cwd, &deltas, &sources).await;
    assert!(f.area_cwd.join(&remote).exists());

    std::fs::remove_file(&file).unwrap();
    let deltas = f.source.fs.sync().unwrap();
    assert!(deltas[0].delete);
    f.sink.delta(&f.area_cwd, &deltas, &sources).await;
    assert!(!f.area_cwd.join(&remote).exists());
}
