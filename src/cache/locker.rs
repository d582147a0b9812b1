use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::error;

/// A reference-counted named lock. The table mutex covers only entry
/// insert/lookup; blocking happens on the entry's own RwLock.
struct LockEntry {
    lock: Arc<RwLock<()>>,
    refs: usize,
}

/// Named read/write locks keyed by cache key.
///
/// This is the request-collapsing primitive: a miss path takes the write
/// lock for its fingerprint, re-checks the cache, performs the one origin
/// fetch, stores, then downgrades to a read lock. Contending requests that
/// arrived mid-fetch block on the read side and wake to a populated cache,
/// so at most one upstream fetch occurs per fingerprint.
///
/// tokio's RwLock is write-preferring, so a steady stream of readers
/// cannot starve a waiting writer. Handles release on drop; because they
/// are move-only, releasing twice is unrepresentable, and the reference
/// count underflow check below guards the remaining invariant.
pub struct Locker {
    table: Mutex<HashMap<String, LockEntry>>,
}

impl Locker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(HashMap::new()),
        })
    }

    fn checkout(&self, key: &str) -> Arc<RwLock<()>> {
        let mut table = self.table.lock().unwrap();
        let entry = table.entry(key.to_string()).or_insert_with(|| LockEntry {
            lock: Arc::new(RwLock::new(())),
            refs: 0,
        });
        entry.refs += 1;
        Arc::clone(&entry.lock)
    }

    fn checkin(&self, key: &str) {
        let mut table = self.table.lock().unwrap();
        match table.get_mut(key) {
            Some(entry) => {
                entry.refs -= 1;
                if entry.refs == 0 {
                    table.remove(key);
                }
            }
            None => {
                // A release with no matching acquisition is a programming
                // error; report it rather than corrupt the table.
                error!(key, "lock release without acquisition");
                debug_assert!(false, "lock release without acquisition: {}", key);
            }
        }
    }

    /// Acquires a shared lock on `key`. Multiple readers may hold the same
    /// key concurrently.
    pub async fn rlock(self: &Arc<Self>, key: &str) -> ReadHandle {
        let lock = self.checkout(key);
        let guard = lock.read_owned().await;
        ReadHandle {
            guard: Some(guard),
            key: key.to_string(),
            locker: Arc::clone(self),
        }
    }

    /// Acquires the exclusive lock on `key`.
    pub async fn lock(self: &Arc<Self>, key: &str) -> WriteHandle {
        let lock = self.checkout(key);
        let guard = lock.write_owned().await;
        WriteHandle {
            guard: Some(guard),
            key: key.to_string(),
            locker: Arc::clone(self),
        }
    }

    /// Number of keys with live acquisitions; test hook.
    pub fn active_keys(&self) -> usize {
        self.table.lock().unwrap().len()
    }
}

/// A held shared lock; releases on drop.
pub struct ReadHandle {
    guard: Option<OwnedRwLockReadGuard<()>>,
    key: String,
    locker: Arc<Locker>,
}

impl ReadHandle {
    pub fn release(self) {}

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        if self.guard.take().is_some() {
            self.locker.checkin(&self.key);
        }
    }
}

/// A held exclusive lock; releases on drop, or downgrades into a
/// [`ReadHandle`] without letting another writer interleave.
pub struct WriteHandle {
    guard: Option<OwnedRwLockWriteGuard<()>>,
    key: String,
    locker: Arc<Locker>,
}

impl WriteHandle {
    pub fn release(self) {}

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Atomically trades the exclusive lock for a shared one on the same
    /// key. This is the hand-off used after a cache-miss fill: readers
    /// blocked on this key wake to the freshly stored value, and no other
    /// writer can slip in between.
    pub fn downgrade(mut self) -> ReadHandle {
        let write_guard = self
            .guard
            .take()
            .expect("write handle downgraded after release");
        let read_guard = OwnedRwLockWriteGuard::downgrade(write_guard);
        ReadHandle {
            guard: Some(read_guard),
            key: self.key.clone(),
            locker: Arc::clone(&self.locker),
        }
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        if self.guard.take().is_some() {
            self.locker.checkin(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_readers() {
        let locker = Locker::new();
        let r1 = locker.rlock("k").await;
        let r2 = locker.rlock("k").await;
        assert_eq!(locker.active_keys(), 1);
        drop(r1);
        drop(r2);
        assert_eq!(locker.active_keys(), 0);
    }

    #[tokio::test]
    async fn test_writer_excludes_readers() {
        let locker = Locker::new();
        let w = locker.lock("k").await;

        let locker2 = Arc::clone(&locker);
        let blocked = tokio::spawn(async move {
            let _r = locker2.rlock("k").await;
        });
        // the reader cannot acquire while the writer holds the key
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        drop(w);
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("reader should acquire after writer release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let locker = Locker::new();
        let _w = locker.lock("a").await;
        // a writer on a different key does not block
        tokio::time::timeout(Duration::from_millis(100), locker.lock("b"))
            .await
            .expect("distinct keys must not contend");
    }

    #[tokio::test]
    async fn test_downgrade_blocks_other_writers() {
        let locker = Locker::new();
        let w = locker.lock("k").await;

        let locker2 = Arc::clone(&locker);
        let second_writer = tokio::spawn(async move {
            let _w = locker2.lock("k").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second_writer.is_finished());

        let r = w.downgrade();
        // still held as a read lock; the second writer must keep waiting
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second_writer.is_finished());

        drop(r);
        tokio::time::timeout(Duration::from_secs(1), second_writer)
            .await
            .expect("writer should acquire after downgrade release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_single_fill_under_contention() {
        let locker = Locker::new();
        let fills = Arc::new(AtomicUsize::new(0));
        let filled = Arc::new(std::sync::Mutex::new(false));

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let locker = Arc::clone(&locker);
            let fills = Arc::clone(&fills);
            let filled = Arc::clone(&filled);
            tasks.push(tokio::spawn(async move {
                let r = locker.rlock("fp").await;
                let have = *filled.lock().unwrap();
                drop(r);
                if !have {
                    let w = locker.lock("fp").await;
                    // re-check under the write lock
                    let mut f = filled.lock().unwrap();
                    if !*f {
                        fills.fetch_add(1, Ordering::SeqCst);
                        *f = true;
                    }
                    drop(f);
                    let _r = w.downgrade();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(fills.load(Ordering::SeqCst), 1);
        assert_eq!(locker.active_keys(), 0);
    }
}
