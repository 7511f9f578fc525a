//! Background snapshot persistence for a board.
//!
//! The board is flushed to disk as an encoded full-state update whenever
//! it is dirty at a check tick, and loaded back by merging the stored
//! update into a fresh board.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

use crate::board::BoardStore;
use crate::error::BoardResult;

const SNAPSHOT_EXTENSION: &str = "board";

/// Manages background persistence for one board.
pub struct SnapshotManager {
    store: Arc<BoardStore>,
    storage_path: PathBuf,
    check_interval: Duration,
    handles: JoinSet<()>,
}

impl SnapshotManager {
    pub fn new(store: Arc<BoardStore>, storage_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            storage_path: storage_path.into(),
            check_interval: Duration::from_secs(10),
            handles: JoinSet::new(),
        }
    }

    /// Set the interval for dirty checks.
    pub fn set_check_interval(&mut self, interval: Duration) {
        self.check_interval = interval;
    }

    /// Path the board snapshot is written to.
    pub fn snapshot_path(&self) -> PathBuf {
        self.storage_path
            .join(format!("{}.{}", self.store.room(), SNAPSHOT_EXTENSION))
    }

    /// Merge a previously written snapshot into the board, then run the
    /// legacy card migration over the restored state. A missing snapshot
    /// file is a fresh board, not an error.
    pub async fn load(&self) -> BoardResult<()> {
        let path = self.snapshot_path();
        if !tokio::fs::try_exists(&path).await? {
            debug!(path = %path.display(), "no snapshot to load");
            return Ok(());
        }
        let snapshot = tokio::fs::read(&path).await?;
        self.store.apply_update(&snapshot)?;
        let migrated = self.store.migrate_legacy_cards();
        self.store.mark_clean();
        info!(
            path = %path.display(),
            migrated,
            "loaded board snapshot"
        );
        Ok(())
    }

    /// Start the background flush loop.
    pub async fn start(&mut self) -> BoardResult<()> {
        tokio::fs::create_dir_all(&self.storage_path).await?;

        info!(
            room = %self.store.room(),
            path = %self.storage_path.display(),
            "starting snapshot manager"
        );

        let store = self.store.clone();
        let path = self.snapshot_path();
        let check_interval = self.check_interval;

        self.handles.spawn(async move {
            let mut ticker = interval(check_interval);
            loop {
                ticker.tick().await;
                if store.is_dirty() {
                    match persist_board(&store, &path).await {
                        Ok(()) => {
                            debug!(room = %store.room(), "persisted board");
                            store.mark_clean();
                        }
                        Err(e) => error!(room = %store.room(), "failed to persist board: {}", e),
                    }
                }
            }
        });

        Ok(())
    }

    /// Stop the flush loop after a final persistence pass.
    pub async fn stop(&mut self) {
        info!(room = %self.store.room(), "stopping snapshot manager");

        if self.store.is_dirty() {
            match persist_board(&self.store, &self.snapshot_path()).await {
                Ok(()) => {
                    info!(room = %self.store.room(), "final persist of board");
                    self.store.mark_clean();
                }
                Err(e) => {
                    error!(room = %self.store.room(), "failed final persist: {}", e)
                }
            }
        }

        self.handles.abort_all();
        while let Some(result) = self.handles.join_next().await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!("persistence task error: {}", e);
                }
            }
        }
    }
}

/// Write the board's full state to disk.
async fn persist_board(store: &BoardStore, path: &Path) -> BoardResult<()> {
    let snapshot = store.encode_snapshot();
    tokio::fs::write(path, snapshot).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{ColumnId, LocalPresence, Participant};
    use crate::config::BoardConfig;
    use tempfile::TempDir;

    fn board(room: &str, user: &str) -> Arc<BoardStore> {
        let config = BoardConfig {
            room: room.to_string(),
            ..Default::default()
        };
        let participant = Participant {
            id: user.to_string(),
            name: format!("Anonymous {}", user),
            color: "#3366ff".to_string(),
        };
        Arc::new(BoardStore::new(
            config,
            participant,
            Arc::new(LocalPresence::new(1)),
        ))
    }

    #[tokio::test]
    async fn snapshot_round_trip_restores_cards_and_texts() {
        let temp_dir = TempDir::new().unwrap();
        let store = board("team-a", "u1");
        let card = store.create_card(ColumnId::Good, "persist me");
        store.commit_card(ColumnId::Good, &card.id);

        let mut manager = SnapshotManager::new(store.clone(), temp_dir.path());
        manager.start().await.unwrap();
        manager.stop().await;

        let path = temp_dir.path().join("team-a.board");
        assert!(path.exists());
        assert!(!store.is_dirty());

        let restored = board("team-a", "u2");
        let loader = SnapshotManager::new(restored.clone(), temp_dir.path());
        loader.load().await.unwrap();

        assert_eq!(restored.cards(ColumnId::Good), store.cards(ColumnId::Good));
        assert_eq!(
            restored.text_content(&card.text_id).unwrap(),
            "persist me"
        );
    }

    #[tokio::test]
    async fn background_loop_flushes_dirty_boards() {
        let temp_dir = TempDir::new().unwrap();
        let store = board("team-b", "u1");

        let mut manager = SnapshotManager::new(store.clone(), temp_dir.path());
        manager.set_check_interval(Duration::from_millis(10));
        manager.start().await.unwrap();

        store.create_card(ColumnId::Kudos, "flushed soon");
        let path = temp_dir.path().join("team-b.board");
        for _ in 0..200 {
            if path.exists() && !store.is_dirty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        manager.stop().await;

        assert!(path.exists());
        assert!(!store.is_dirty());
    }

    #[tokio::test]
    async fn load_runs_the_legacy_migration() {
        let temp_dir = TempDir::new().unwrap();

        // A snapshot written by an older deployment: one card without a
        // text object.
        let old = board("team-c", "u1");
        let legacy = crate::board::Card {
            id: "old-1".to_string(),
            text: "pre-crdt".to_string(),
            created_by: "u1".to_string(),
            created_at: 1,
            ..Default::default()
        };
        {
            use yrs::{Array, Transact};
            // Root refs must be resolved before the write transaction
            // opens; get_or_insert_array takes its own.
            let column = old.doc().get_or_insert_array(ColumnId::Improve.key());
            let mut txn = old.doc().transact_mut();
            column.push_back(&mut txn, legacy.to_any());
        }
        tokio::fs::create_dir_all(temp_dir.path()).await.unwrap();
        tokio::fs::write(
            temp_dir.path().join("team-c.board"),
            old.encode_snapshot(),
        )
        .await
        .unwrap();

        let restored = board("team-c", "u2");
        let manager = SnapshotManager::new(restored.clone(), temp_dir.path());
        manager.load().await.unwrap();

        let card = restored.card(ColumnId::Improve, "old-1").unwrap();
        assert_eq!(card.text_id, "text-old-1");
        assert!(card.is_committed);
        assert_eq!(restored.text_content("text-old-1").unwrap(), "pre-crdt");
    }

    #[tokio::test]
    async fn missing_snapshot_is_not_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = board("team-d", "u1");
        let manager = SnapshotManager::new(store.clone(), temp_dir.path());
        manager.load().await.unwrap();
        assert!(store.cards(ColumnId::Good).is_empty());
    }
}
