//! Source-side file bookkeeping.
//!
//! Tracks every local file a Source has referenced, the remote path it maps
//! to, and its last known SHA-1 and mtime. [`SourceFs::sync`] turns the
//! differences since the previous call into one batch of [`Delta`]s.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use walkdir::WalkDir;

use remex_core::digest::{sha1_file, sha1_hex};
use remex_core::{Delta, RemexError};

use crate::error::{io_err, SyncError};
use crate::translate::{remote_path, rewrite_paths, PathShape};

/// What a tracked path is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Dir,
    File {
        sha: String,
        modified: Option<SystemTime>,
    },
}

/// One tracked local path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescription {
    pub local: PathBuf,
    pub remote: String,
    pub entry: Entry,
    /// Force a resync on the next [`SourceFs::sync`].
    pub touched: bool,
    /// Send transformed text instead of a byte-identical copy.
    pub transform: bool,
}

impl FileDescription {
    pub fn sha(&self) -> Option<&str> {
        match &self.entry {
            Entry::File { sha, .. } => Some(sha),
            Entry::Dir => None,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.entry, Entry::Dir)
    }
}

#[derive(Debug)]
struct State {
    remote_separator: char,
    files: BTreeMap<PathBuf, FileDescription>,
    by_sha: HashMap<String, BTreeSet<PathBuf>>,
}

/// Per-Source file registry.
#[derive(Debug)]
pub struct SourceFs {
    cwd: PathBuf,
    local_separator: char,
    state: Mutex<State>,
}

impl SourceFs {
    /// Registry rooted at `cwd`, translating to a Sink that uses
    /// `remote_separator`.
    pub fn new(cwd: impl Into<PathBuf>, remote_separator: char) -> Self {
        Self::with_local_separator(cwd, MAIN_SEPARATOR, remote_separator)
    }

    pub fn with_local_separator(
        cwd: impl Into<PathBuf>,
        local_separator: char,
        remote_separator: char,
    ) -> Self {
        Self {
            cwd: cwd.into(),
            local_separator,
            state: Mutex::new(State {
                remote_separator,
                files: BTreeMap::new(),
                by_sha: HashMap::new(),
            }),
        }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Switch the remote convention (after the Welcome handshake). Every
    /// already-tracked remote path is recomputed.
    pub fn set_remote_separator(&self, separator: char) {
        let mut state = self.lock();
        if state.remote_separator == separator {
            return;
        }
        state.remote_separator = separator;
        let cwd = self.cwd.to_string_lossy().to_string();
        for fd in state.files.values_mut() {
            fd.remote = remote_path(
                &fd.local.to_string_lossy(),
                &cwd,
                self.local_separator,
                separator,
            );
        }
    }

    /// Remote path for `file`, registering it (and, for a directory, every
    /// path below it) on first sight.
    pub fn to_remote(&self, file: &Path) -> Result<String, SyncError> {
        let mut state = self.lock();
        self.to_remote_locked(&mut state, file)
    }

    /// Rewrite every path-shaped substring in `text` to its remote form.
    pub fn transform<'t>(&self, text: &'t str) -> Result<Cow<'t, str>, SyncError> {
        let mut state = self.lock();
        self.transform_locked(&mut state, text)
    }

    /// Mark `file` as textual: its content is sent through [`Self::transform`].
    /// Directories are rejected.
    pub fn mark_transform(&self, file: &Path) -> Result<(), SyncError> {
        let mut state = self.lock();
        self.to_remote_locked(&mut state, file)?;
        let key = self.absolute(file);
        if let Some(fd) = state.files.get_mut(&key) {
            if fd.is_dir() {
                return Err(RemexError::InvalidArgument(format!(
                    "cannot transform directory {}",
                    key.display()
                ))
                .into());
            }
            fd.transform = true;
            fd.touched = true;
        }
        Ok(())
    }

    /// Force `file` to be resent on the next sync.
    pub fn touch(&self, file: &Path) -> Result<(), SyncError> {
        let mut state = self.lock();
        self.to_remote_locked(&mut state, file)?;
        if let Some(fd) = state.files.get_mut(&self.absolute(file)) {
            fd.touched = true;
        }
        Ok(())
    }

    /// Compute the deltas since the last call.
    ///
    /// Transform files always produce inline content. Other files produce a
    /// sha reference when their mtime changed or they were touched, or a
    /// delete when they vanished (and are then forgotten).
    pub fn sync(&self) -> Result<Vec<Delta>, SyncError> {
        let mut state = self.lock();
        let mut deltas = Vec::new();

        self.rescan_directories(&mut state)?;

        let transforms: Vec<PathBuf> = state
            .files
            .values()
            .filter(|fd| fd.transform)
            .map(|fd| fd.local.clone())
            .collect();
        for local in transforms {
            let bytes = match std::fs::read(&local) {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    if let Some(fd) = self.forget(&mut state, &local) {
                        deltas.push(Delta::delete(fd.remote));
                    }
                    continue;
                }
                Err(err) => return Err(io_err(&local, err)),
            };
            let text = String::from_utf8_lossy(&bytes).into_owned();
            let content = self.transform_locked(&mut state, &text)?.into_owned();
            if let Some(fd) = state.files.get_mut(&local) {
                fd.touched = false;
                deltas.push(Delta::content(fd.remote.clone(), content.into_bytes()));
            }
        }

        let candidates: Vec<PathBuf> = state
            .files
            .values()
            .filter(|fd| !fd.transform && !fd.is_dir())
            .map(|fd| fd.local.clone())
            .collect();
        for local in candidates {
            let modified = match std::fs::metadata(&local) {
                Ok(meta) => meta.modified().ok(),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    if let Some(fd) = self.forget(&mut state, &local) {
                        tracing::debug!(path = %local.display(), remote = %fd.remote, "tracked file deleted");
                        deltas.push(Delta::delete(fd.remote));
                    }
                    continue;
                }
                Err(err) => return Err(io_err(&local, err)),
            };

            let Some(fd) = state.files.get(&local) else {
                continue;
            };
            let Entry::File {
                sha: old_sha,
                modified: recorded,
            } = &fd.entry
            else {
                continue;
            };
            if !fd.touched && *recorded == modified {
                continue;
            }

            let old_sha = old_sha.clone();
            let sha = Self::update_sha_locked(&mut state, &old_sha, &local)?;
            if let Some(fd) = state.files.get_mut(&local) {
                fd.entry = Entry::File {
                    sha: sha.clone(),
                    modified,
                };
                fd.touched = false;
                deltas.push(Delta::sha(fd.remote.clone(), sha));
            }
        }

        Ok(deltas)
    }

    /// Recompute the digest of `file`, moving it from `old_sha` to the new
    /// digest in the reverse index.
    pub fn update_sha(&self, old_sha: &str, file: &Path) -> Result<String, SyncError> {
        let mut state = self.lock();
        let key = self.absolute(file);
        let sha = Self::update_sha_locked(&mut state, old_sha, &key)?;
        if let Some(fd) = state.files.get_mut(&key) {
            let modified = std::fs::metadata(&key).ok().and_then(|m| m.modified().ok());
            fd.entry = Entry::File {
                sha: sha.clone(),
                modified,
            };
        }
        Ok(sha)
    }

    /// Bytes of a still-existing local file whose content hashes to `sha`.
    pub fn get_data(&self, sha: &str) -> Option<Vec<u8>> {
        let candidates: Vec<PathBuf> = {
            let state = self.lock();
            state
                .by_sha
                .get(sha)
                .map(|paths| paths.iter().cloned().collect())
                .unwrap_or_default()
        };
        for path in candidates {
            let Ok(bytes) = std::fs::read(&path) else {
                continue;
            };
            if sha1_hex(&bytes) == sha {
                return Some(bytes);
            }
            tracing::debug!(path = %path.display(), sha, "candidate changed since it was hashed");
        }
        None
    }

    /// Snapshot of one tracked path.
    pub fn describe(&self, file: &Path) -> Option<FileDescription> {
        self.lock().files.get(&self.absolute(file)).cloned()
    }

    /// Number of tracked paths.
    pub fn len(&self) -> usize {
        self.lock().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -----------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn absolute(&self, file: &Path) -> PathBuf {
        let text = file.to_string_lossy();
        if file.is_absolute() || PathShape::of(&text).is_absolute() {
            file.to_path_buf()
        } else {
            self.cwd.join(file)
        }
    }

    fn remote_for(&self, state: &State, local: &Path) -> String {
        remote_path(
            &local.to_string_lossy(),
            &self.cwd.to_string_lossy(),
            self.local_separator,
            state.remote_separator,
        )
    }

    fn to_remote_locked(&self, state: &mut State, file: &Path) -> Result<String, SyncError> {
        let key = self.absolute(file);
        if let Some(fd) = state.files.get(&key) {
            return Ok(fd.remote.clone());
        }

        let remote = self.remote_for(state, &key);
        let meta = match std::fs::metadata(&key) {
            Ok(meta) => meta,
            // Translated but not tracked: nothing to mirror yet.
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(remote),
            Err(err) if err.kind() == ErrorKind::InvalidInput => return Ok(remote),
            Err(err) => return Err(io_err(&key, err)),
        };

        if meta.is_dir() {
            self.register_dir(state, &key, remote.clone())?;
        } else {
            self.register_file(state, &key, remote.clone(), meta.modified().ok())?;
        }
        Ok(remote)
    }

    fn transform_locked<'t>(
        &self,
        state: &mut State,
        text: &'t str,
    ) -> Result<Cow<'t, str>, SyncError> {
        let mut failure = None;
        let out = rewrite_paths(text, |path| match self.to_remote_locked(state, Path::new(path)) {
            Ok(remote) => remote,
            Err(err) => {
                failure.get_or_insert(err);
                path.to_string()
            }
        });
        match failure {
            Some(err) => Err(err),
            None => Ok(out),
        }
    }

    fn register_file(
        &self,
        state: &mut State,
        key: &Path,
        remote: String,
        modified: Option<SystemTime>,
    ) -> Result<(), SyncError> {
        let sha = sha1_file(key)?;
        state
            .by_sha
            .entry(sha.clone())
            .or_default()
            .insert(key.to_path_buf());
        state.files.insert(
            key.to_path_buf(),
            FileDescription {
                local: key.to_path_buf(),
                remote,
                entry: Entry::File { sha, modified },
                touched: true,
                transform: false,
            },
        );
        Ok(())
    }

    fn register_dir(&self, state: &mut State, key: &Path, remote: String) -> Result<(), SyncError> {
        state.files.insert(
            key.to_path_buf(),
            FileDescription {
                local: key.to_path_buf(),
                remote,
                entry: Entry::Dir,
                touched: false,
                transform: false,
            },
        );
        self.register_children(state, key)
    }

    fn register_children(&self, state: &mut State, dir: &Path) -> Result<(), SyncError> {
        for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(dir = %dir.display(), error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            let path = entry.path().to_path_buf();
            if state.files.contains_key(&path) {
                continue;
            }
            let remote = self.remote_for(state, &path);
            if entry.file_type().is_dir() {
                state.files.insert(
                    path.clone(),
                    FileDescription {
                        local: path,
                        remote,
                        entry: Entry::Dir,
                        touched: false,
                        transform: false,
                    },
                );
            } else if entry.file_type().is_file() {
                let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
                self.register_file(state, &path, remote, modified)?;
            }
        }
        Ok(())
    }

    /// Pick up files created inside tracked directories; drop directories
    /// that vanished (their files are reported as deletes by the file pass).
    fn rescan_directories(&self, state: &mut State) -> Result<(), SyncError> {
        let dirs: Vec<PathBuf> = state
            .files
            .values()
            .filter(|fd| fd.is_dir())
            .map(|fd| fd.local.clone())
            .collect();
        for dir in dirs {
            if dir.is_dir() {
                self.register_children(state, &dir)?;
            } else {
                state.files.remove(&dir);
            }
        }
        Ok(())
    }

    fn update_sha_locked(state: &mut State, old_sha: &str, key: &Path) -> Result<String, SyncError> {
        if let Some(paths) = state.by_sha.get_mut(old_sha) {
            paths.remove(key);
            if paths.is_empty() {
                state.by_sha.remove(old_sha);
            }
        }
        let sha = sha1_file(key)?;
        state
            .by_sha
            .entry(sha.clone())
            .or_default()
            .insert(key.to_path_buf());
        Ok(sha)
    }

    fn forget(&self, state: &mut State, key: &Path) -> Option<FileDescription> {
        let fd = state.files.remove(key)?;
        if let Some(sha) = fd.sha() {
            if let Some(paths) = state.by_sha.get_mut(sha) {
                paths.remove(key);
                if paths.is_empty() {
                    state.by_sha.remove(sha);
                }
            }
        }
        Some(fd)
    }
}
