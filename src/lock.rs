//! Named mutual exclusion with scoped guards.

use std::fs::{File, OpenOptions};
use std::io;
use std::sync::Arc;

use dashmap::DashMap;
use nix::fcntl::{Flock, FlockArg};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use crate::store::StorageKey;

/// Guard type for the in-process locks in this module.
pub type InProcessGuard = ArcMutexGuard<RawMutex, ()>;

/// Named mutual exclusion: acquiring blocks, with no timeout, until no
/// other holder exists for the key, and the guard releases when dropped
/// on every exit path.
///
/// An implementation may ignore the key (one lock shared by every
/// computation, like [`SingleLock`]) or derive a distinct lock per key
/// (like [`FileLock`]); the coordinator treats both uniformly.
pub trait Lock {
    type Guard;

    fn acquire(&self, key: &StorageKey) -> io::Result<Self::Guard>;
}

/// Advisory file lock on the key's `.lock` sibling artifact.
///
/// Visible to every process sharing the file system, and to every handle
/// within one process, since `flock` locks attach to the open file
/// description rather than the process.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileLock;

/// Held advisory file lock; dropping releases it with the descriptor.
pub struct FileGuard {
    _lock: Flock<File>,
}

impl Lock for FileLock {
    type Guard = FileGuard;

    fn acquire(&self, key: &StorageKey) -> io::Result<FileGuard> {
        let token = key.lock_token();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(token.as_str())?;
        log::trace!("Waiting for file lock. token={}", token);
        let lock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| io::Error::from_raw_os_error(errno as i32))?;
        log::trace!("Acquired file lock. token={}", token);
        Ok(FileGuard { _lock: lock })
    }
}

/// One shared in-process lock serializing every key.
///
/// The "single lock object" form of the lock contract: useful when a
/// host wants all fixture setup serialized within a process regardless
/// of key.
#[derive(Clone, Debug, Default)]
pub struct SingleLock {
    inner: Arc<Mutex<()>>,
}

impl SingleLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Lock for SingleLock {
    type Guard = InProcessGuard;

    fn acquire(&self, _key: &StorageKey) -> io::Result<InProcessGuard> {
        Ok(self.inner.lock_arc())
    }
}

/// Per-key in-process locks, backing
/// [`InMemoryStore`](crate::store::InMemoryStore)'s default mutual
/// exclusion. Clones share the same lock table.
#[derive(Clone, Debug, Default)]
pub struct KeyedLock {
    cells: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Lock for KeyedLock {
    type Guard = InProcessGuard;

    fn acquire(&self, key: &StorageKey) -> io::Result<InProcessGuard> {
        let cell = self
            .cells
            .entry(key.to_string())
            .or_default()
            .value()
            .clone();
        Ok(cell.lock_arc())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn file_lock_excludes_between_handles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = StorageKey::new(format!("{}/value.json", dir.path().display()));

        let counter = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        crossbeam_utils::thread::scope(|scope| {
            for _ in 0..4 {
                let key = key.clone();
                let counter = Arc::clone(&counter);
                let peak = Arc::clone(&peak);
                scope.spawn(move |_| {
                    let _guard = FileLock.acquire(&key).expect("acquire");
                    let inside = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(inside, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    counter.fetch_sub(1, Ordering::SeqCst);
                });
            }
        })
        .expect("threads join");

        assert_eq!(peak.load(Ordering::SeqCst), 1, "two holders overlapped");
    }

    #[test]
    fn file_lock_reacquires_after_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = StorageKey::new(format!("{}/value.json", dir.path().display()));
        drop(FileLock.acquire(&key).expect("first acquire"));
        drop(FileLock.acquire(&key).expect("second acquire"));
    }

    #[test]
    fn keyed_lock_is_independent_per_key() {
        let locks = KeyedLock::new();
        let a = locks.acquire(&StorageKey::new("a")).expect("lock a");
        // A different key must not block even while `a` is held.
        let b = locks.acquire(&StorageKey::new("b")).expect("lock b");
        drop(a);
        drop(b);
    }

    #[test]
    fn single_lock_ignores_the_key() {
        let lock = SingleLock::new();
        let guard = lock.acquire(&StorageKey::new("a")).expect("lock");
        let blocked = Arc::new(AtomicUsize::new(0));
        crossbeam_utils::thread::scope(|scope| {
            let peer = lock.clone();
            let observed = Arc::clone(&blocked);
            scope.spawn(move |_| {
                let _second = peer.acquire(&StorageKey::new("b")).expect("lock");
                observed.store(1, Ordering::SeqCst);
            });
            std::thread::sleep(Duration::from_millis(30));
            assert_eq!(blocked.load(Ordering::SeqCst), 0, "other key acquired early");
            drop(guard);
        })
        .expect("threads join");
        assert_eq!(blocked.load(Ordering::SeqCst), 1);
    }
}
