use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File};
use std::future::Future;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use super::capacity::CapacityTracker;
use super::{CapacityPolicy, Consumer, ConsumerError, StorageConfig, StorageError, MIN_RETRY_INTERVAL};
use crate::workerpool::panic_message;

const ENTRY_EXT: &str = "entry";
const TMP_EXT: &str = "tmp";

/// First byte of every entry file
const FORMAT_RAW: u8 = 0;
const FORMAT_LZ4: u8 = 1;

#[derive(Debug, Clone, Copy)]
struct Entry {
    seq: u64,
    /// Bytes on disk, header included
    size: u64,
}

#[derive(Debug, Default)]
struct Index {
    queues: HashMap<String, VecDeque<Entry>>,
    next_seq: u64,
}

/// Disk-backed, capacity-bounded FIFO buffer with one replay consumer per key.
///
/// Layout: `<path>/<key>/<seq>.entry`. Writes go through a single lock, land
/// in a `.tmp` file first and are renamed into place once synced, so a crash
/// never exposes a partial entry.
pub struct Storage {
    config: StorageConfig,
    enabled: bool,
    index: Mutex<Index>,
    capacity: CapacityTracker,
    consumers: RwLock<HashMap<String, Consumer>>,
    /// Entries dropped without a successful replay
    discarded: AtomicU64,
    notify: Notify,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Storage {
    /// Open or create the buffer at `config.path`. If that fails the instance
    /// is disabled for its whole lifetime.
    pub fn open(config: StorageConfig) -> Self {
        let (shutdown, _) = watch::channel(false);

        let (index, used, enabled) = match Self::prepare(&config) {
            Ok((index, used)) => {
                let pending: usize = index.queues.values().map(VecDeque::len).sum();
                tracing::info!(
                    path = %config.path.display(),
                    capacity = config.capacity,
                    used,
                    pending,
                    "Storage opened"
                );
                (index, used, true)
            }
            Err(e) => {
                tracing::error!(
                    path = %config.path.display(),
                    "Failed to open storage, buffering disabled: {}",
                    e
                );
                (Index::default(), 0, false)
            }
        };

        let capacity = CapacityTracker::new(config.capacity);
        if used > config.capacity {
            tracing::warn!(
                used,
                capacity = config.capacity,
                "Recovered entries exceed capacity, new writes rejected until drained"
            );
        }
        capacity.allocate(used);

        Self {
            config,
            enabled,
            index: Mutex::new(index),
            capacity,
            consumers: RwLock::new(HashMap::new()),
            discarded: AtomicU64::new(0),
            notify: Notify::new(),
            shutdown,
            worker: Mutex::new(None),
        }
    }

    fn prepare(config: &StorageConfig) -> Result<(Index, u64), StorageError> {
        if config.capacity == 0 {
            return Err(StorageError::InvalidConfig("capacity must be > 0".to_string()));
        }
        fs::create_dir_all(&config.path)?;
        recover(&config.path)
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn capacity(&self) -> u64 {
        self.capacity.max()
    }

    pub fn used_bytes(&self) -> u64 {
        self.capacity.used()
    }

    /// Entries removed because they were unreadable or their consumer panicked
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Entries waiting for replay under `key`
    pub fn pending(&self, key: &str) -> usize {
        self.index.lock().queues.get(key).map(VecDeque::len).unwrap_or(0)
    }

    pub fn pending_total(&self) -> usize {
        self.index.lock().queues.values().map(VecDeque::len).sum()
    }

    /// Bind the replay function for `key`. Each key takes exactly one.
    pub fn register_consumer<F, Fut>(&self, key: &str, consumer: F) -> Result<(), StorageError>
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ConsumerError>> + Send + 'static,
    {
        validate_key(key)?;
        let mut consumers = self.consumers.write();
        if consumers.contains_key(key) {
            return Err(StorageError::ConsumerExists(key.to_string()));
        }
        let consumer: Consumer = Arc::new(move |payload| consumer(payload).boxed());
        consumers.insert(key.to_string(), consumer);
        drop(consumers);

        self.notify.notify_one();
        Ok(())
    }

    /// Persist `payload` under `key`.
    ///
    /// Blocks on file IO and fsync. Async callers should run it through
    /// `spawn_blocking`.
    pub fn put(&self, key: &str, payload: &[u8]) -> Result<(), StorageError> {
        if !self.enabled {
            return Err(StorageError::Disabled);
        }
        validate_key(key)?;

        let (format, data) = if self.config.compress {
            (FORMAT_LZ4, lz4_flex::compress_prepend_size(payload))
        } else {
            (FORMAT_RAW, payload.to_vec())
        };
        let size = data.len() as u64 + 1;

        let mut index = self.index.lock();

        if size > self.capacity.max() {
            return Err(self.capacity_exceeded(size));
        }
        if !self.capacity.try_allocate(size) {
            match self.config.policy {
                CapacityPolicy::Reject => return Err(self.capacity_exceeded(size)),
                CapacityPolicy::EvictOldest => {
                    let evicted = self.evict_until_fits(&mut index, size);
                    tracing::warn!(evicted, requested = size, "Storage full, evicted oldest entries");
                    if !self.capacity.try_allocate(size) {
                        return Err(self.capacity_exceeded(size));
                    }
                }
            }
        }

        let seq = index.next_seq;
        if let Err(e) = write_entry(&self.config.path.join(key), seq, format, &data) {
            self.capacity.free(size);
            return Err(e.into());
        }
        index.next_seq += 1;
        index
            .queues
            .entry(key.to_string())
            .or_default()
            .push_back(Entry { seq, size });
        drop(index);

        tracing::debug!(key, seq, bytes = size, "Buffered entry");
        self.notify.notify_one();
        Ok(())
    }

    fn capacity_exceeded(&self, requested: u64) -> StorageError {
        StorageError::CapacityExceeded {
            requested,
            used: self.capacity.used(),
            capacity: self.capacity.max(),
        }
    }

    /// Remove the globally oldest entries until `size` more bytes fit
    fn evict_until_fits(&self, index: &mut Index, size: u64) -> usize {
        let mut evicted = 0;
        while self.capacity.used() + size > self.capacity.max() {
            let oldest = index
                .queues
                .iter()
                .filter_map(|(key, q)| q.front().map(|e| (key.clone(), e.seq)))
                .min_by_key(|(_, seq)| *seq);
            let Some((key, _)) = oldest else { break };
            if let Some(entry) = index.queues.get_mut(&key).and_then(VecDeque::pop_front) {
                self.delete_file(&key, entry);
                evicted += 1;
            }
        }
        evicted
    }

    fn delete_file(&self, key: &str, entry: Entry) {
        let path = entry_path(&self.config.path.join(key), entry.seq, ENTRY_EXT);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), "Failed to delete entry: {}", e);
            }
        }
        self.capacity.free(entry.size);
    }

    fn discard_entry(&self, key: &str, seq: u64) -> bool {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        self.remove_entry(key, seq)
    }

    fn retry_interval(&self) -> Duration {
        self.config.retry_interval.max(MIN_RETRY_INTERVAL)
    }

    fn front(&self, key: &str) -> Option<Entry> {
        self.index.lock().queues.get(key).and_then(|q| q.front().copied())
    }

    /// Remove an entry if it is still queued. Returns false if it was evicted
    /// in the meantime.
    fn remove_entry(&self, key: &str, seq: u64) -> bool {
        let mut index = self.index.lock();
        let Some(queue) = index.queues.get_mut(key) else {
            return false;
        };
        let Some(pos) = queue.iter().position(|e| e.seq == seq) else {
            return false;
        };
        let entry = queue.remove(pos);
        drop(index);

        if let Some(entry) = entry {
            self.delete_file(key, entry);
        }
        true
    }

    fn read_entry(&self, key: &str, entry: Entry) -> Result<Vec<u8>, StorageError> {
        let path = entry_path(&self.config.path.join(key), entry.seq, ENTRY_EXT);
        let raw = fs::read(&path)?;
        match raw.split_first() {
            Some((&FORMAT_RAW, data)) => Ok(data.to_vec()),
            Some((&FORMAT_LZ4, data)) => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| StorageError::Corrupted(e.to_string())),
            Some((format, _)) => Err(StorageError::Corrupted(format!(
                "unknown entry format {}",
                format
            ))),
            None => Err(StorageError::Corrupted("empty entry".to_string())),
        }
    }

    /// Start the single background replay loop
    pub fn run_consume_worker(self: &Arc<Self>) -> Result<(), StorageError> {
        if !self.enabled {
            return Err(StorageError::Disabled);
        }
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(StorageError::AlreadyRunning);
        }

        let storage = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        *worker = Some(tokio::spawn(storage.consume_loop(shutdown)));
        Ok(())
    }

    async fn consume_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(path = %self.config.path.display(), "Storage consume worker started");

        let mut backoff: HashMap<String, Instant> = HashMap::new();
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.consume_round(&mut backoff).await {
                continue;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.retry_interval()) => {}
                _ = shutdown.changed() => {}
            }
        }

        tracing::info!("Storage consume worker stopped");
    }

    /// Offer the oldest entry of every ready key to its consumer. Returns true
    /// if any entry was removed.
    async fn consume_round(&self, backoff: &mut HashMap<String, Instant>) -> bool {
        let consumers: Vec<(String, Consumer)> = self
            .consumers
            .read()
            .iter()
            .map(|(k, c)| (k.clone(), Arc::clone(c)))
            .collect();

        let mut progressed = false;
        for (key, consumer) in consumers {
            if backoff.get(&key).is_some_and(|until| Instant::now() < *until) {
                continue;
            }
            let Some(entry) = self.front(&key) else {
                continue;
            };

            let payload = match self.read_entry(&key, entry) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(key = %key, seq = entry.seq, "Dropping unreadable entry: {}", e);
                    progressed |= self.discard_entry(&key, entry.seq);
                    continue;
                }
            };

            let started = Instant::now();
            let result = match AssertUnwindSafe(async move { consumer(payload).await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => {
                    tracing::error!(
                        key = %key,
                        seq = entry.seq,
                        "Replay consumer panicked, dropping entry: {}",
                        panic_message(panic.as_ref())
                    );
                    progressed |= self.discard_entry(&key, entry.seq);
                    continue;
                }
            };
            match result {
                Ok(()) => {
                    self.remove_entry(&key, entry.seq);
                    backoff.remove(&key);
                    progressed = true;
                    tracing::debug!(key = %key, seq = entry.seq, cost = ?started.elapsed(), "Replayed entry");
                }
                Err(e) => {
                    tracing::warn!(
                        key = %key,
                        seq = entry.seq,
                        retry_in = ?self.retry_interval(),
                        "Replay failed, keeping entry: {}",
                        e
                    );
                    backoff.insert(key, Instant::now() + self.retry_interval());
                }
            }
        }
        progressed
    }

    /// Stop the replay loop, waiting at most `grace`, and sync the directory
    pub async fn close(&self, grace: Duration) -> Result<(), StorageError> {
        self.shutdown.send_replace(true);

        let handle = self.worker.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                tracing::warn!(grace = ?grace, "Storage consumer did not stop in time, aborting");
                handle.abort();
            }
        }

        if self.enabled {
            File::open(&self.config.path)?.sync_all()?;
        }
        tracing::info!(pending = self.pending_total(), "Storage closed");
        Ok(())
    }
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

fn entry_path(dir: &Path, seq: u64, ext: &str) -> PathBuf {
    dir.join(format!("{:020}.{}", seq, ext))
}

fn write_entry(dir: &Path, seq: u64, format: u8, data: &[u8]) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let tmp = entry_path(dir, seq, TMP_EXT);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&[format])?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, entry_path(dir, seq, ENTRY_EXT))
}

/// Rebuild the index from the directory tree, deleting stale temp files
fn recover(root: &Path) -> Result<(Index, u64), StorageError> {
    let mut index = Index::default();
    let mut used = 0u64;
    let mut max_seq: Option<u64> = None;

    for dir in fs::read_dir(root)? {
        let dir = dir?;
        if !dir.file_type()?.is_dir() {
            continue;
        }
        let Some(key) = dir.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if validate_key(&key).is_err() {
            continue;
        }

        let mut entries = Vec::new();
        for file in fs::read_dir(dir.path())? {
            let file = file?;
            let path = file.path();
            let ext = path.extension().and_then(|e| e.to_str());
            let seq = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok());

            match (ext, seq) {
                (Some(TMP_EXT), _) => {
                    tracing::debug!(path = %path.display(), "Removing partial entry");
                    fs::remove_file(&path)?;
                }
                (Some(ENTRY_EXT), Some(seq)) => {
                    let size = file.metadata()?.len();
                    used += size;
                    max_seq = Some(max_seq.map_or(seq, |m| m.max(seq)));
                    entries.push(Entry { seq, size });
                }
                _ => {}
            }
        }

        if !entries.is_empty() {
            entries.sort_by_key(|e| e.seq);
            index.queues.insert(key, entries.into());
        }
    }

    index.next_seq = max_seq.map_or(0, |m| m + 1);
    Ok((index, used))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio_test::assert_ok;

    fn open(dir: &TempDir, capacity: u64) -> Arc<Storage> {
        Arc::new(Storage::open(
            StorageConfig::new(dir.path(), capacity)
                .with_retry_interval(Duration::from_millis(20))
                .with_compression(false),
        ))
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    #[test]
    fn test_open_failure_disables_storage() {
        let dir = TempDir::new().unwrap();
        let file_path = dir.path().join("not-a-dir");
        fs::write(&file_path, b"x").unwrap();

        let storage = Storage::open(StorageConfig::new(&file_path, 1024));
        assert!(!storage.enabled());
        assert!(matches!(storage.put("http", b"data"), Err(StorageError::Disabled)));
    }

    #[test]
    fn test_zero_capacity_disables_storage() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(StorageConfig::new(dir.path(), 0));
        assert!(!storage.enabled());
    }

    #[test]
    fn test_register_consumer_once_per_key() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, 1024);

        storage
            .register_consumer("http", |_| async { Ok(()) })
            .unwrap();
        assert!(matches!(
            storage.register_consumer("http", |_| async { Ok(()) }),
            Err(StorageError::ConsumerExists(_))
        ));
        assert!(storage.register_consumer("udp", |_| async { Ok(()) }).is_ok());
        assert!(matches!(
            storage.register_consumer("../etc", |_| async { Ok(()) }),
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_put_tracks_bytes_and_order() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, 1024);

        storage.put("http", b"first").unwrap();
        storage.put("http", b"second").unwrap();
        storage.put("udp", b"third").unwrap();

        assert_eq!(storage.pending("http"), 2);
        assert_eq!(storage.pending("udp"), 1);
        assert_eq!(storage.used_bytes(), (5 + 1) + (6 + 1) + (5 + 1));

        let front = storage.front("http").unwrap();
        assert_eq!(storage.read_entry("http", front).unwrap(), b"first");
    }

    #[test]
    fn test_capacity_rejects_without_eviction() {
        let dir = TempDir::new().unwrap();
        // each 9-byte payload takes 10 bytes on disk
        let storage = open(&dir, 30);

        for _ in 0..3 {
            storage.put("http", b"123456789").unwrap();
        }
        assert_eq!(storage.used_bytes(), 30);

        let result = storage.put("http", b"123456789");
        assert!(matches!(
            result,
            Err(StorageError::CapacityExceeded { requested: 10, used: 30, capacity: 30 })
        ));
        assert_eq!(storage.pending("http"), 3);
        assert!(storage.used_bytes() <= storage.capacity());
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(
            StorageConfig::new(dir.path(), 8)
                .with_policy(CapacityPolicy::EvictOldest)
                .with_compression(false),
        ));
        assert!(matches!(
            storage.put("http", b"0123456789"),
            Err(StorageError::CapacityExceeded { .. })
        ));
        assert_eq!(storage.used_bytes(), 0);
    }

    #[test]
    fn test_evict_oldest_policy() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(
            StorageConfig::new(dir.path(), 20)
                .with_policy(CapacityPolicy::EvictOldest)
                .with_compression(false),
        );

        storage.put("http", b"aaaaaaaaa").unwrap();
        storage.put("udp", b"bbbbbbbbb").unwrap();
        storage.put("http", b"ccccccccc").unwrap();

        assert_eq!(storage.used_bytes(), 20);
        assert_eq!(storage.pending("udp"), 1);
        assert_eq!(storage.pending("http"), 1);
        let front = storage.front("http").unwrap();
        assert_eq!(storage.read_entry("http", front).unwrap(), b"ccccccccc");
    }

    #[test]
    fn test_recovers_entries_after_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let storage = open(&dir, 1024);
            storage.put("http", b"one").unwrap();
            storage.put("http", b"two").unwrap();
        }
        fs::write(dir.path().join("http").join("00000000000000000009.tmp"), b"torn").unwrap();

        let storage = open(&dir, 1024);
        assert!(storage.enabled());
        assert_eq!(storage.pending("http"), 2);
        assert_eq!(storage.used_bytes(), 4 + 4);
        assert!(!dir.path().join("http").join("00000000000000000009.tmp").exists());

        storage.put("http", b"three").unwrap();
        let seqs: Vec<u64> = storage.index.lock().queues["http"].iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_compressed_roundtrip() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(StorageConfig::new(dir.path(), 1 << 20));
        let payload = vec![b'x'; 4096];

        storage.put("http", &payload).unwrap();
        assert!(storage.used_bytes() < 4096);

        let front = storage.front("http").unwrap();
        assert_eq!(storage.read_entry("http", front).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_successful_consumer_drains_entries() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, 1024);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        storage
            .register_consumer("http", move |payload| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().push(payload);
                    Ok(())
                }
            })
            .unwrap();

        storage.put("http", b"a").unwrap();
        storage.put("http", b"b").unwrap();
        storage.run_consume_worker().unwrap();
        storage.put("http", b"c").unwrap();

        assert!(wait_until(|| storage.pending("http") == 0).await);
        assert_eq!(*seen.lock(), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(storage.used_bytes(), 0);

        assert_ok!(storage.close(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_failing_consumer_keeps_entry() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, 1024);
        let attempts = Arc::new(AtomicUsize::new(0));
        let healthy = Arc::new(AtomicBool::new(false));

        let (a, h) = (Arc::clone(&attempts), Arc::clone(&healthy));
        storage
            .register_consumer("http", move |_| {
                let (a, h) = (Arc::clone(&a), Arc::clone(&h));
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    if h.load(Ordering::SeqCst) {
                        Ok(())
                    } else {
                        Err(ConsumerError::from("collector down"))
                    }
                }
            })
            .unwrap();

        storage.put("http", b"payload").unwrap();
        storage.run_consume_worker().unwrap();

        assert!(wait_until(|| attempts.load(Ordering::SeqCst) >= 2).await);
        assert_eq!(storage.pending("http"), 1);

        healthy.store(true, Ordering::SeqCst);
        assert!(wait_until(|| storage.pending("http") == 0).await);

        assert_ok!(storage.close(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_entries_without_consumer_stay() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, 1024);
        storage
            .register_consumer("http", |_| async { Ok(()) })
            .unwrap();

        storage.put("udp", b"orphan").unwrap();
        storage.put("http", b"served").unwrap();
        storage.run_consume_worker().unwrap();

        assert!(wait_until(|| storage.pending("http") == 0).await);
        assert_eq!(storage.pending("udp"), 1);
        assert!(matches!(
            storage.run_consume_worker(),
            Err(StorageError::AlreadyRunning)
        ));

        assert_ok!(storage.close(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_panicking_consumer_drops_entry_and_keeps_running() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, 1024);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        storage
            .register_consumer("udp", move |payload| {
                let sink = Arc::clone(&sink);
                async move {
                    if payload == b"boom" {
                        panic!("consumer bug");
                    }
                    sink.lock().push(payload);
                    Ok(())
                }
            })
            .unwrap();

        storage.put("udp", b"boom").unwrap();
        storage.run_consume_worker().unwrap();
        storage.put("udp", b"after").unwrap();

        assert!(wait_until(|| storage.pending("udp") == 0).await);
        assert_eq!(*seen.lock(), vec![b"after".to_vec()]);
        assert_eq!(storage.discarded(), 1);
        assert_eq!(storage.used_bytes(), 0);

        storage.put("udp", b"later").unwrap();
        assert!(wait_until(|| storage.pending("udp") == 0).await);
        assert_eq!(seen.lock().len(), 2);

        assert_ok!(storage.close(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_zero_retry_interval_does_not_spin() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(
            StorageConfig::new(dir.path(), 1024).with_retry_interval(Duration::ZERO),
        ));
        let attempts = Arc::new(AtomicUsize::new(0));

        let a = Arc::clone(&attempts);
        storage
            .register_consumer("http", move |_| {
                let a = Arc::clone(&a);
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(ConsumerError::from("collector down"))
                }
            })
            .unwrap();
        storage.put("http", b"payload").unwrap();
        storage.run_consume_worker().unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let attempts = attempts.load(Ordering::SeqCst);
        assert!(attempts >= 2, "consumer retried {} times", attempts);
        assert!(attempts <= 40, "consumer retried {} times", attempts);
        assert_eq!(storage.pending("http"), 1);

        assert_ok!(storage.close(Duration::from_secs(1)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_puts_never_exceed_capacity() {
        let dir = TempDir::new().unwrap();
        // 99-byte payload plus the format byte: room for exactly ten entries
        let storage = open(&dir, 1000);

        let writers: Vec<_> = (0..32)
            .map(|_| {
                let storage = Arc::clone(&storage);
                tokio::task::spawn_blocking(move || storage.put("http", &[7u8; 99]))
            })
            .collect();

        let mut accepted = 0;
        for writer in writers {
            match writer.await.unwrap() {
                Ok(()) => accepted += 1,
                Err(e) => assert!(matches!(e, StorageError::CapacityExceeded { .. })),
            }
        }

        assert_eq!(accepted, 10);
        assert_eq!(storage.pending("http"), 10);
        assert_eq!(storage.used_bytes(), 1000);
        assert!(storage.used_bytes() <= storage.capacity());

        // what is on disk matches the accounting
        let reopened = open(&dir, 1000);
        assert_eq!(reopened.pending("http"), 10);
        assert_eq!(reopened.used_bytes(), 1000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_puts_with_eviction_stay_bounded() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(
            StorageConfig::new(dir.path(), 1000)
                .with_policy(CapacityPolicy::EvictOldest)
                .with_compression(false),
        ));

        let writers: Vec<_> = (0..32)
            .map(|_| {
                let storage = Arc::clone(&storage);
                tokio::task::spawn_blocking(move || storage.put("udp", &[7u8; 99]))
            })
            .collect();
        for writer in writers {
            assert_ok!(writer.await.unwrap());
        }

        assert_eq!(storage.pending("udp"), 10);
        assert_eq!(storage.used_bytes(), 1000);
        assert!(storage.used_bytes() <= storage.capacity());
    }

    #[tokio::test]
    async fn test_close_is_bounded_with_stuck_consumer() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, 1024);
        storage
            .register_consumer("http", |_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .unwrap();
        storage.put("http", b"slow").unwrap();
        storage.run_consume_worker().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        assert_ok!(storage.close(Duration::from_millis(100)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(storage.pending("http"), 1);
    }
}
