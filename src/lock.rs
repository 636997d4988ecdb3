//! Fleet-wide mutual exclusion on top of an annotation of a shared object.
//!
//! The annotation is either empty (free) or the holder's node name. Every
//! write is a compare-and-set against the resource version it was computed
//! from, so two nodes racing for a free lock cannot both win: the loser gets
//! a conflict, re-reads, and finds the lock held.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::CoordinationObject;
use crate::error::{HostUpgradesError, Result};
use crate::retry::{Backoff, retry_on_conflict};
use crate::types::{ObjectEvent, ObjectRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
enum LockState {
    Free,
    Acquired,
    Held(String),
}

/// What to do with the lock once the guarded body returns successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hold {
    Release,
    /// Leave the lock held, to be released after the host comes back.
    Keep,
}

pub struct DistributedLock {
    object: Arc<dyn CoordinationObject>,
    annotation: String,
    holder: String,
    backoff: Backoff,
}

impl fmt::Display for DistributedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.object.describe())
    }
}

impl DistributedLock {
    pub fn new(object: Arc<dyn CoordinationObject>, annotation: &str, holder: &str) -> Self {
        Self {
            object,
            annotation: annotation.to_string(),
            holder: holder.to_string(),
            backoff: Backoff::LOCK,
        }
    }

    fn state(&self, record: &ObjectRecord) -> LockState {
        match record.annotation(&self.annotation) {
            "" => LockState::Free,
            value if value == self.holder => LockState::Acquired,
            value => LockState::Held(value.to_string()),
        }
    }

    /// Current lock value, and whether it is ours. Never writes.
    pub async fn test(&self) -> Result<(String, bool)> {
        let record = self.object.get().await?;
        let value = record.annotation(&self.annotation).to_string();
        let state = self.state(&record);

        debug!(lock = %self, value = %value, state = ?state, "Tested lock");
        Ok((value, state == LockState::Acquired))
    }

    /// Wait for the lock to be free (or already ours) and take it.
    ///
    /// Fails with [`HostUpgradesError::LockBusy`] if `deadline` passes while
    /// another node holds the lock.
    pub async fn acquire(&self, deadline: Option<Instant>) -> Result<()> {
        info!(lock = %self, holder = %self.holder, "Acquiring lock");

        retry_on_conflict(&self.backoff, || async move {
            let record = self.object.get().await?;
            let record = self.wait(record, deadline).await?;

            debug!(lock = %self, version = record.version(), "Setting lock");
            self.object
                .update_annotation(record.version(), &self.annotation, Some(&self.holder))
                .await?;
            Ok(())
        })
        .await?;

        info!(lock = %self, holder = %self.holder, "Acquired lock");
        Ok(())
    }

    /// Block until a record shows the lock available, returning that record.
    async fn wait(&self, mut record: ObjectRecord, deadline: Option<Instant>) -> Result<ObjectRecord> {
        loop {
            let holder = match self.state(&record) {
                LockState::Free | LockState::Acquired => return Ok(record),
                LockState::Held(holder) => holder,
            };

            info!(lock = %self, holder = %holder, "Waiting for lock");

            let watched = self.watch_until_available(record.version());
            let available = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, watched)
                    .await
                    .map_err(|_| HostUpgradesError::LockBusy {
                        lock: self.to_string(),
                        holder: holder.clone(),
                    })??,
                None => watched.await?,
            };

            record = match available {
                Some(record) => record,
                None => {
                    debug!(lock = %self, "Lock watch ended, re-reading");
                    self.object.get().await?
                }
            };
        }
    }

    /// Watch from `version` until an event shows the lock available. `None`
    /// if the watch ended first.
    async fn watch_until_available(&self, version: &str) -> Result<Option<ObjectRecord>> {
        let mut events = self.object.watch(version).await?;

        while let Some(event) = events.next().await {
            match event {
                ObjectEvent::Added(record) | ObjectEvent::Modified(record) => {
                    match self.state(&record) {
                        LockState::Held(holder) => {
                            debug!(lock = %self, holder = %holder, "Lock still held");
                        }
                        _ => return Ok(Some(record)),
                    }
                }
                ObjectEvent::Bookmark => {}
                ObjectEvent::Deleted(_) => {
                    return Err(HostUpgradesError::Connection(
                        self.to_string(),
                        "lock object deleted while waiting".to_string(),
                    ));
                }
                ObjectEvent::Error(message) => {
                    return Err(HostUpgradesError::Connection(self.to_string(), message));
                }
            }
        }

        Ok(None)
    }

    /// Clear the lock, which must be ours.
    ///
    /// Fails with [`HostUpgradesError::BrokenLock`] without writing anything
    /// if the lock holds some other value.
    pub async fn release(&self) -> Result<()> {
        info!(lock = %self, holder = %self.holder, "Releasing lock");

        retry_on_conflict(&self.backoff, || async move {
            let record = self.object.get().await?;
            let value = record.annotation(&self.annotation);

            if value != self.holder {
                return Err(HostUpgradesError::BrokenLock {
                    lock: self.to_string(),
                    key: self.annotation.clone(),
                    value: value.to_string(),
                    expected: self.holder.clone(),
                });
            }

            self.object
                .update_annotation(record.version(), &self.annotation, None)
                .await?;
            Ok(())
        })
        .await?;

        info!(lock = %self, "Released lock");
        Ok(())
    }
}

/// Run `f` while holding `lock`.
///
/// Without a lock `f` runs directly. The lock is released after `f` fails or
/// returns [`Hold::Release`]; release failures are logged, not returned.
pub async fn with_lock<F, Fut>(
    lock: Option<&DistributedLock>,
    deadline: Option<Instant>,
    f: F,
) -> Result<Hold>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Hold>>,
{
    let Some(lock) = lock else {
        debug!("No lock configured, running unlocked");
        return f().await;
    };

    lock.acquire(deadline).await?;

    let result = f().await;

    match &result {
        Ok(Hold::Keep) => {
            info!(lock = %lock, "Leaving lock held for reboot");
        }
        Ok(Hold::Release) | Err(_) => {
            if let Err(e) = lock.release().await {
                warn!(lock = %lock, error = %e, "Failed to release lock");
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeObject;
    use crate::types::LOCK_ANNOTATION;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn setup(object: FakeObject) -> (Arc<FakeObject>, DistributedLock) {
        let object = Arc::new(object);
        let lock = DistributedLock::new(object.clone(), LOCK_ANNOTATION, "node-a");
        (object, lock)
    }

    fn deadline_in(millis: u64) -> Option<Instant> {
        Some(Instant::now() + Duration::from_millis(millis))
    }

    #[tokio::test]
    async fn test_acquire_free_lock() {
        let (object, lock) = setup(FakeObject::new("host-upgrades"));

        lock.acquire(None).await.unwrap();

        assert_eq!(object.annotation(LOCK_ANNOTATION).as_deref(), Some("node-a"));
        assert_eq!(lock.test().await.unwrap(), ("node-a".to_string(), true));
    }

    #[tokio::test]
    async fn test_reacquire_own_lock() {
        let (object, lock) =
            setup(FakeObject::new("host-upgrades").with_annotation(LOCK_ANNOTATION, "node-a"));

        lock.acquire(deadline_in(10)).await.unwrap();

        assert_eq!(object.annotation(LOCK_ANNOTATION).as_deref(), Some("node-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_retries_conflicts() {
        let (object, lock) = setup(FakeObject::new("host-upgrades"));
        object.inject_conflicts(3);

        lock.acquire(None).await.unwrap();

        assert_eq!(object.annotation(LOCK_ANNOTATION).as_deref(), Some("node-a"));
        assert_eq!(object.writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_conflict_exhaustion() {
        let (object, lock) = setup(FakeObject::new("host-upgrades"));
        object.inject_conflicts(Backoff::LOCK.steps);

        let err = lock.acquire(None).await.unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(object.annotation(LOCK_ANNOTATION), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_busy_until_deadline() {
        let (object, lock) =
            setup(FakeObject::new("host-upgrades").with_annotation(LOCK_ANNOTATION, "node-b"));

        let err = lock.acquire(deadline_in(1_000)).await.unwrap_err();

        match err {
            HostUpgradesError::LockBusy { holder, .. } => assert_eq!(holder, "node-b"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(object.annotation(LOCK_ANNOTATION).as_deref(), Some("node-b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_release() {
        let (object, lock) =
            setup(FakeObject::new("host-upgrades").with_annotation(LOCK_ANNOTATION, "node-b"));

        let other = object.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            other.set_externally(LOCK_ANNOTATION, None);
        });

        lock.acquire(deadline_in(60_000)).await.unwrap();

        assert_eq!(object.annotation(LOCK_ANNOTATION).as_deref(), Some("node-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_ignores_handover_to_other_node() {
        let (object, lock) =
            setup(FakeObject::new("host-upgrades").with_annotation(LOCK_ANNOTATION, "node-b"));

        let other = object.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            other.set_externally(LOCK_ANNOTATION, Some("node-c"));
            tokio::time::sleep(Duration::from_secs(10)).await;
            other.set_externally(LOCK_ANNOTATION, None);
        });

        lock.acquire(None).await.unwrap();

        assert_eq!(object.annotation(LOCK_ANNOTATION).as_deref(), Some("node-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_rewatches_after_watch_ends() {
        let (object, lock) =
            setup(FakeObject::new("host-upgrades").with_annotation(LOCK_ANNOTATION, "node-b"));
        object.script_watch(vec![ObjectEvent::Bookmark]);

        let other = object.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            other.set_externally(LOCK_ANNOTATION, None);
        });

        lock.acquire(None).await.unwrap();

        assert_eq!(object.annotation(LOCK_ANNOTATION).as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn test_acquire_fails_when_object_deleted() {
        let (object, lock) =
            setup(FakeObject::new("host-upgrades").with_annotation(LOCK_ANNOTATION, "node-b"));
        object.script_watch(vec![ObjectEvent::Deleted(ObjectRecord::default())]);

        let err = lock.acquire(None).await.unwrap_err();
        assert!(matches!(err, HostUpgradesError::Connection(_, _)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutual_exclusion() {
        let object = Arc::new(FakeObject::new("host-upgrades"));
        let a = DistributedLock::new(object.clone(), LOCK_ANNOTATION, "node-a");
        let b = DistributedLock::new(object.clone(), LOCK_ANNOTATION, "node-b");

        let (ra, rb) = tokio::join!(a.acquire(deadline_in(5_000)), b.acquire(deadline_in(5_000)));

        assert!(ra.is_ok() != rb.is_ok(), "exactly one node must win");
        let winner = if ra.is_ok() { "node-a" } else { "node-b" };
        assert_eq!(object.annotation(LOCK_ANNOTATION).as_deref(), Some(winner));
        assert_eq!(object.writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_passes_between_nodes() {
        let object = Arc::new(FakeObject::new("host-upgrades"));
        let a = DistributedLock::new(object.clone(), LOCK_ANNOTATION, "node-a");
        let b = DistributedLock::new(object.clone(), LOCK_ANNOTATION, "node-b");

        a.acquire(None).await.unwrap();

        let release = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            a.release().await
        };
        let (acquired, released) = tokio::join!(b.acquire(deadline_in(10_000)), release);

        released.unwrap();
        acquired.unwrap();
        assert_eq!(object.annotation(LOCK_ANNOTATION).as_deref(), Some("node-b"));
    }

    #[tokio::test]
    async fn test_release_own_lock() {
        let (object, lock) =
            setup(FakeObject::new("host-upgrades").with_annotation(LOCK_ANNOTATION, "node-a"));

        lock.release().await.unwrap();

        assert_eq!(object.annotation(LOCK_ANNOTATION), None);
        assert_eq!(lock.test().await.unwrap(), (String::new(), false));
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_broken_lock() {
        let (object, lock) =
            setup(FakeObject::new("host-upgrades").with_annotation(LOCK_ANNOTATION, "node-b"));

        let err = lock.release().await.unwrap_err();

        assert!(matches!(err, HostUpgradesError::BrokenLock { .. }));
        assert_eq!(object.annotation(LOCK_ANNOTATION).as_deref(), Some("node-b"));
        assert_eq!(object.writes(), 0);
    }

    #[tokio::test]
    async fn test_test_never_writes() {
        let (object, lock) =
            setup(FakeObject::new("host-upgrades").with_annotation(LOCK_ANNOTATION, "node-b"));

        assert_eq!(lock.test().await.unwrap(), ("node-b".to_string(), false));
        assert_eq!(object.writes(), 0);
    }

    #[tokio::test]
    async fn test_with_lock_releases_after_success() {
        let (object, lock) = setup(FakeObject::new("host-upgrades"));
        let fake = object.as_ref();

        let hold = with_lock(Some(&lock), None, || async move {
            assert_eq!(fake.annotation(LOCK_ANNOTATION).as_deref(), Some("node-a"));
            Ok(Hold::Release)
        })
        .await
        .unwrap();

        assert_eq!(hold, Hold::Release);
        assert_eq!(object.annotation(LOCK_ANNOTATION), None);
    }

    #[tokio::test]
    async fn test_with_lock_keeps_lock_for_reboot() {
        let (object, lock) = setup(FakeObject::new("host-upgrades"));

        let hold = with_lock(Some(&lock), None, || async { Ok(Hold::Keep) })
            .await
            .unwrap();

        assert_eq!(hold, Hold::Keep);
        assert_eq!(object.annotation(LOCK_ANNOTATION).as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn test_with_lock_releases_after_error() {
        let (object, lock) = setup(FakeObject::new("host-upgrades"));

        let err = with_lock(Some(&lock), None, || async {
            Err(HostUpgradesError::Upgrade("apt-get failed".to_string()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, HostUpgradesError::Upgrade(_)));
        assert_eq!(object.annotation(LOCK_ANNOTATION), None);
    }

    #[tokio::test]
    async fn test_with_lock_swallows_broken_release() {
        let (object, lock) = setup(FakeObject::new("host-upgrades"));

        let fake = object.as_ref();

        let hold = with_lock(Some(&lock), None, || async move {
            fake.set_externally(LOCK_ANNOTATION, Some("node-b"));
            Ok(Hold::Release)
        })
        .await
        .unwrap();

        assert_eq!(hold, Hold::Release);
        assert_eq!(object.annotation(LOCK_ANNOTATION).as_deref(), Some("node-b"));
    }

    #[tokio::test]
    async fn test_with_lock_without_lock_runs_directly() {
        let calls = &AtomicU32::new(0);

        let hold = with_lock(None, None, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Hold::Keep)
        })
        .await
        .unwrap();

        assert_eq!(hold, Hold::Keep);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
