//! The metadata store facade: owns dirty tracking and the debounced,
//! coordinated snapshot of one account's feed metadata file.

use crate::coalescing::{CoalescingKey, CoalescingQueue, FlushAction};
use crate::coordination::FileCoordinator;
use crate::core::{Result, StoreError};
use crate::metadata::{MetadataMapping, MetadataOwner};
use futures::FutureExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;

const SAVE_QUEUE_NAME: &str = "Save Queue";
const SAVE_INTERVAL: Duration = Duration::from_millis(500);

/// Persists one account's feed-identifier → metadata mapping to a single
/// file. Mutations mark the store dirty; dirty signals inside one coalescing
/// window collapse into a single filtered, atomic write. All I/O failures are
/// logged, never surfaced: the in-memory mapping stays authoritative.
pub struct FeedMetadataFile {
    path: PathBuf,
    owner: Weak<dyn MetadataOwner>,
    queue: Arc<CoalescingQueue>,
    coordinator: Arc<FileCoordinator>,
    dirty: AtomicBool,
    // Serializes flushes so "check dirty, clear, snapshot, write" never
    // overlaps with itself.
    save_lock: Mutex<()>,
}

impl FeedMetadataFile {
    pub fn new(path: impl Into<PathBuf>, owner: Weak<dyn MetadataOwner>) -> Arc<Self> {
        Self::with_parts(
            path,
            owner,
            Arc::new(CoalescingQueue::new(SAVE_QUEUE_NAME, SAVE_INTERVAL)),
            Arc::new(FileCoordinator::default()),
        )
    }

    /// Construction with a shared queue and coordinator. Participants that
    /// touch the same path must share the coordinator.
    pub fn with_parts(
        path: impl Into<PathBuf>,
        owner: Weak<dyn MetadataOwner>,
        queue: Arc<CoalescingQueue>,
        coordinator: Arc<FileCoordinator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            owner,
            queue,
            coordinator,
            dirty: AtomicBool::new(false),
            save_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Records that the in-memory mapping changed and schedules a coalesced
    /// flush keyed by this instance. Returns immediately; the write happens
    /// on the queue's timer task.
    pub fn mark_dirty(self: &Arc<Self>) {
        self.dirty.store(true, Ordering::SeqCst);

        let me = Arc::clone(self);
        let action: FlushAction = Arc::new(move || {
            let me = me.clone();
            async move {
                me.save_if_needed().await;
            }
            .boxed()
        });
        self.queue.add(CoalescingKey::for_instance(self), action);
    }

    /// The flush action. Clears the dirty flag before writing; a write
    /// failure restores it, so the store is never clean while a change is
    /// unpersisted. A mutation landing mid-write re-sets the flag and opens
    /// a fresh window, so it is not lost either.
    pub async fn save_if_needed(&self) {
        let _flush = self.save_lock.lock().await;

        if self.dirty.swap(false, Ordering::SeqCst) {
            if let Err(err) = self.save_inner().await {
                self.dirty.store(true, Ordering::SeqCst);
                tracing::error!(
                    path = %self.path.display(),
                    error = %err,
                    "Save to disk failed"
                );
            }
        }
    }

    /// Unconditional save. Fire-and-forget: failures are logged only.
    pub async fn save(&self) {
        if let Err(err) = self.save_inner().await {
            tracing::error!(
                path = %self.path.display(),
                error = %err,
                "Save to disk failed"
            );
        }
    }

    /// Replaces the owner's mapping with the decoded file contents and
    /// re-attaches each record's back-reference. A missing or undecodable
    /// file substitutes an empty mapping; a coordination or I/O failure is
    /// logged and leaves the in-memory mapping untouched.
    pub async fn load(&self) {
        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        if owner.is_deleted() {
            return;
        }

        let mut mapping = match self.coordinator.read(&self.path).await {
            Ok(bytes) => match rmp_serde::from_slice::<MetadataMapping>(&bytes) {
                Ok(mapping) => mapping,
                Err(err) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %err,
                        "Metadata file is undecodable, substituting empty mapping"
                    );
                    MetadataMapping::new()
                }
            },
            Err(err) if err.is_not_found() => MetadataMapping::new(),
            Err(err) => {
                tracing::error!(
                    path = %self.path.display(),
                    error = %err,
                    "Read from disk coordination failed"
                );
                return;
            }
        };

        for metadata in mapping.values_mut() {
            metadata.attach_owner(self.owner.clone());
        }
        owner.replace_metadata(mapping);
    }

    async fn save_inner(&self) -> Result<()> {
        let Some(owner) = self.owner.upgrade() else {
            return Ok(());
        };
        // Never resurrect a deleted account's file.
        if owner.is_deleted() {
            return Ok(());
        }

        let filtered = Self::metadata_for_subscribed_feeds(owner.as_ref());
        let bytes = rmp_serde::to_vec_named(&filtered)
            .map_err(|err| StoreError::SerializationError(err.to_string()))?;
        self.coordinator.write(&self.path, &bytes).await?;

        tracing::debug!(
            path = %self.path.display(),
            entries = filtered.len(),
            "metadata saved"
        );
        Ok(())
    }

    /// Entries for feeds the account no longer subscribes to stay in memory
    /// but are dropped from the persisted set. Filtering keys off each
    /// record's own feed identifier.
    fn metadata_for_subscribed_feeds(owner: &dyn MetadataOwner) -> MetadataMapping {
        let feed_ids = owner.subscribed_feed_ids();
        owner
            .metadata_snapshot()
            .into_iter()
            .filter(|(_, metadata)| feed_ids.contains(&metadata.feed_id))
            .collect()
    }
}
