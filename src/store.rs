//! Locked, atomically written JSON documents.
//!
//! Both the config file and the patch history use the same discipline: an
//! advisory lock on a `<file>.lock` sidecar held for the whole
//! read-modify-write, and saves that go through a sibling temp file which
//! is fsynced and renamed over the target.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A persisted document with a schema version.
pub trait Versioned: Serialize + DeserializeOwned + Default {
    /// Highest version this build reads and writes.
    const CURRENT_VERSION: u32;

    fn version(&self) -> u32;
    fn set_version(&mut self, version: u32);
}

/// Exclusive advisory lock on a sidecar file. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Poll a non-blocking exclusive lock until it is acquired or `timeout` elapses.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, ConfigError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| ConfigError::io(path, source))?;
        restrict_file_mode(&file);

        let started = Instant::now();
        loop {
            match try_lock_exclusive(&file) {
                Ok(true) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    })
                }
                Ok(false) => {
                    if started.elapsed() >= timeout {
                        return Err(ConfigError::LockBusy {
                            path: path.to_path_buf(),
                            waited: started.elapsed(),
                        });
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(source) => return Err(ConfigError::io(path, source)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
    match FileExt::try_lock_exclusive(file) {
        Ok(()) => Ok(true),
        Err(err)
            if err.kind() == std::io::ErrorKind::WouldBlock
                || err.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
        {
            Ok(false)
        }
        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => Ok(false),
        Err(err) => Err(err),
    }
}

fn unlock(file: &File) {
    let _ = FileExt::unlock(file);
}

#[cfg(unix)]
fn restrict_file_mode(file: &File) {
    use std::os::unix::fs::PermissionsExt;
    let _ = file.set_permissions(std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_file_mode(_file: &File) {}

/// Create `dir` (and parents) with owner-only permissions.
/// Existing directories are left as they are.
pub fn ensure_private_dir(dir: &Path) -> Result<(), ConfigError> {
    if dir.is_dir() {
        return Ok(());
    }
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(dir)
        .map_err(|source| ConfigError::io(dir, source))
}

/// Replace `path` with `bytes` via a sibling temp file, fsync and rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ConfigError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    ensure_private_dir(dir)?;

    let mut tmp =
        tempfile::NamedTempFile::new_in(dir).map_err(|source| ConfigError::io(dir, source))?;
    restrict_file_mode(tmp.as_file());
    tmp.write_all(bytes)
        .map_err(|source| ConfigError::io(tmp.path(), source))?;
    tmp.as_file()
        .sync_all()
        .map_err(|source| ConfigError::io(tmp.path(), source))?;
    tmp.persist(path)
        .map_err(|err| ConfigError::io(path, err.error))?;
    Ok(())
}

/// Run a store operation on the blocking pool. Lock acquisition polls
/// with a thread sleep, so async callers go through here.
pub async fn blocking<T, F>(op: F) -> Result<T, ConfigError>
where
    F: FnOnce() -> Result<T, ConfigError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|err| ConfigError::Background(err.to_string()))?
}

/// Sidecar lock path for a store file: `<file>.lock`.
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

/// A versioned JSON document at a fixed path.
#[derive(Debug, Clone)]
pub struct JsonStore<T> {
    path: PathBuf,
    lock_timeout: Duration,
    _doc: PhantomData<fn() -> T>,
}

impl<T: Versioned> JsonStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            _doc: PhantomData,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document. A missing file yields the default document.
    pub fn load(&self) -> Result<T, ConfigError> {
        let body = match std::fs::read(&self.path) {
            Ok(body) => body,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let mut doc = T::default();
                doc.set_version(T::CURRENT_VERSION);
                return Ok(doc);
            }
            Err(source) => return Err(ConfigError::io(&self.path, source)),
        };

        let mut doc: T =
            serde_json::from_slice(&body).map_err(|source| ConfigError::Malformed {
                path: self.path.clone(),
                source,
            })?;
        match doc.version() {
            0 => doc.set_version(T::CURRENT_VERSION),
            v if v > T::CURRENT_VERSION => {
                return Err(ConfigError::VersionUnsupported {
                    path: self.path.clone(),
                    found: v,
                    supported: T::CURRENT_VERSION,
                })
            }
            _ => {}
        }
        Ok(doc)
    }

    /// Write the document atomically with owner-only permissions.
    pub fn save(&self, doc: &T) -> Result<(), ConfigError> {
        let mut body = serde_json::to_vec_pretty(doc).map_err(|source| ConfigError::Malformed {
            path: self.path.clone(),
            source,
        })?;
        body.push(b'\n');
        write_atomic(&self.path, &body)
    }

    /// Take the document's sidecar lock. Hold it to make a longer sequence
    /// of reads and [`JsonStore::update_locked`] calls atomic.
    pub fn lock(&self) -> Result<FileLock, ConfigError> {
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_private_dir(dir)?;
        }
        FileLock::acquire(&lock_path_for(&self.path), self.lock_timeout)
    }

    /// Lock, load, mutate, save, unlock. The lock is released on every exit path.
    pub fn update<R>(&self, mutate: impl FnOnce(&mut T) -> R) -> Result<R, ConfigError> {
        let lock = self.lock()?;
        self.update_locked(&lock, mutate)
    }

    /// Load, mutate and save under a lock the caller already holds.
    pub fn update_locked<R>(
        &self,
        _held: &FileLock,
        mutate: impl FnOnce(&mut T) -> R,
    ) -> Result<R, ConfigError> {
        let mut doc = self.load()?;
        let out = mutate(&mut doc);
        doc.set_version(T::CURRENT_VERSION);
        self.save(&doc)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        #[serde(default)]
        version: u32,
        #[serde(default)]
        value: u64,
    }

    impl Versioned for Counter {
        const CURRENT_VERSION: u32 = 1;

        fn version(&self) -> u32 {
            self.version
        }

        fn set_version(&mut self, version: u32) {
            self.version = version;
        }
    }

    #[test]
    fn missing_file_loads_default_at_current_version() {
        let tmp = tempfile::tempdir().unwrap();
        let store: JsonStore<Counter> = JsonStore::new(tmp.path().join("counter.json"));
        let doc = store.load().unwrap();
        assert_eq!(doc.version, 1);
        assert_eq!(doc.value, 0);
    }

    #[test]
    fn malformed_file_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("counter.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store: JsonStore<Counter> = JsonStore::new(&path);
        assert!(matches!(store.load(), Err(ConfigError::Malformed { .. })));
    }

    #[test]
    fn future_version_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("counter.json");
        std::fs::write(&path, br#"{"version": 7, "value": 1}"#).unwrap();
        let store: JsonStore<Counter> = JsonStore::new(&path);
        assert!(matches!(
            store.load(),
            Err(ConfigError::VersionUnsupported { found: 7, .. })
        ));
    }

    #[test]
    fn update_persists_and_creates_private_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("counter.json");
        let store: JsonStore<Counter> = JsonStore::new(&path);

        let out = store.update(|doc| {
            doc.value += 5;
            doc.value
        });
        assert_eq!(out.unwrap(), 5);
        assert_eq!(store.load().unwrap().value, 5);
        assert!(lock_path_for(&path).exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
            let dir_mode = std::fs::metadata(path.parent().unwrap())
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(dir_mode & 0o777, 0o700);
        }
    }

    #[test]
    fn concurrent_updates_are_serialized() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("counter.json");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store: JsonStore<Counter> = JsonStore::new(&path);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        store.update(|doc| doc.value += 1).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let store: JsonStore<Counter> = JsonStore::new(&path);
        assert_eq!(store.load().unwrap().value, 80);
    }

    #[cfg(unix)]
    #[test]
    fn held_lock_times_out_as_busy() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("counter.json");
        let lock_path = lock_path_for(&path);
        // flock locks are per open file description, so a second open in
        // the same process contends with the first.
        let _held = FileLock::acquire(&lock_path, Duration::from_secs(1)).unwrap();

        let store: JsonStore<Counter> =
            JsonStore::new(&path).with_lock_timeout(Duration::from_millis(100));
        let err = store.update(|doc| doc.value += 1).unwrap_err();
        assert!(matches!(err, ConfigError::LockBusy { .. }));
    }

    #[test]
    fn update_locked_writes_under_a_held_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state").join("counter.json");
        let store: JsonStore<Counter> =
            JsonStore::new(&path).with_lock_timeout(Duration::from_millis(100));

        let held = store.lock().unwrap();
        store.update_locked(&held, |doc| doc.value = 3).unwrap();
        store.update_locked(&held, |doc| doc.value += 1).unwrap();
        assert!(matches!(
            store.update(|doc| doc.value = 0),
            Err(ConfigError::LockBusy { .. })
        ));
        drop(held);

        store.update(|doc| doc.value += 1).unwrap();
        assert_eq!(store.load().unwrap().value, 5);
    }

    #[tokio::test]
    async fn blocking_runs_store_calls_off_the_runtime() {
        let tmp = tempfile::tempdir().unwrap();
        let store: JsonStore<Counter> = JsonStore::new(tmp.path().join("counter.json"));
        let worker = store.clone();
        let value = blocking(move || worker.update(|doc| {
            doc.value = 9;
            doc.value
        }))
        .await
        .unwrap();
        assert_eq!(value, 9);
        assert_eq!(store.load().unwrap().value, 9);
    }

    #[test]
    fn lock_path_appends_suffix() {
        assert_eq!(
            lock_path_for(Path::new("/tmp/x/config.json")),
            Path::new("/tmp/x/config.json.lock")
        );
    }
}
