use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

use super::presence::{typing_claims, PresenceMap};
use super::store::BoardStore;

/// Manages background garbage collection of abandoned drafts.
///
/// Every tick the sweeper asks the presence map which cards are claimed by
/// a live typing session and deletes the idle, empty drafts that nobody
/// claims. The store applies the idleness threshold itself; the sweeper
/// only supplies cadence, claims and the current time.
pub struct DraftSweeper {
    store: Arc<BoardStore>,
    presence: Arc<dyn PresenceMap>,
    sweep_interval: Duration,
    handles: JoinSet<()>,
}

impl DraftSweeper {
    pub fn new(store: Arc<BoardStore>, presence: Arc<dyn PresenceMap>) -> Self {
        Self {
            store,
            presence,
            sweep_interval: Duration::from_secs(60),
            handles: JoinSet::new(),
        }
    }

    /// Set the interval between sweep passes.
    pub fn set_sweep_interval(&mut self, interval: Duration) {
        self.sweep_interval = interval;
    }

    /// Start the background sweep loop.
    pub fn start(&mut self) {
        info!(
            room = %self.store.room(),
            interval_secs = self.sweep_interval.as_secs(),
            "starting draft sweeper"
        );

        let store = self.store.clone();
        let presence = self.presence.clone();
        let sweep_interval = self.sweep_interval;

        self.handles.spawn(async move {
            let mut ticker = interval(sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a freshly
            // created empty board is not swept mid-setup.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let claims = typing_claims(presence.as_ref());
                let removed =
                    store.sweep_abandoned_drafts(&claims, Utc::now().timestamp_millis());
                if removed > 0 {
                    debug!(removed, "sweep pass removed drafts");
                }
            }
        });
    }

    /// Stop the sweep loop without a final pass; drafts are cheap to keep.
    pub async fn stop(&mut self) {
        info!(room = %self.store.room(), "stopping draft sweeper");
        self.handles.abort_all();
        while let Some(result) = self.handles.join_next().await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!("sweep task error: {}", e);
                }
            }
        }
    }
}
