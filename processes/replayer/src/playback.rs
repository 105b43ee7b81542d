//! Drives a recorded session into the tracker's client feeds

use std::time::Duration;

use agora_module_block_tracker::BlockTracker;
use anyhow::{anyhow, Result};
use tokio::time::{sleep, timeout};
use tracing::{info, info_span, warn, Instrument};

use crate::recorded_client::SessionFeeds;
use crate::session::{Action, Step};

pub struct Playback {
    feeds: SessionFeeds,
    lookup_timeout: Duration,
}

impl Playback {
    pub fn new(feeds: SessionFeeds, lookup_timeout: Duration) -> Self {
        Self {
            feeds,
            lookup_timeout,
        }
    }

    /// Play every step in order. The feeds stay open afterwards so the
    /// tracker keeps running until the playback is dropped.
    pub async fn run(&self, tracker: &BlockTracker, steps: Vec<Step>) -> Result<()> {
        let total = steps.len();
        for (n, step) in steps.into_iter().enumerate() {
            if step.delay_ms > 0 {
                sleep(Duration::from_millis(step.delay_ms)).await;
            }
            self.play(tracker, step.action)
                .instrument(info_span!("step", n))
                .await?;
        }
        info!("Played {total} steps");
        Ok(())
    }

    async fn play(&self, tracker: &BlockTracker, action: Action) -> Result<()> {
        match action {
            Action::Best(chain) => self
                .feeds
                .best
                .send(Ok(chain))
                .map_err(|_| anyhow!("Best block feed closed"))?,
            Action::Finalized(block) => self
                .feeds
                .finalized
                .send(Ok(block))
                .map_err(|_| anyhow!("Finalized block feed closed"))?,
            Action::Announce(announcement) => self
                .feeds
                .announcements
                .send(Ok(announcement))
                .map_err(|_| anyhow!("Announcement feed closed"))?,
            Action::Lookup(key) => self.lookup(tracker, &key).await,
        }
        Ok(())
    }

    async fn lookup(&self, tracker: &BlockTracker, key: &str) {
        let found = timeout(self.lookup_timeout, async {
            let mut info = tracker.block_info_by_key(key).await?;
            let record = info.wait_for(Option::is_some).await.ok().and_then(|r| r.clone());
            Ok::<_, anyhow::Error>(record)
        })
        .await;

        match found {
            Ok(Ok(Some(record))) => info!(
                key,
                number = record.number,
                hash = %record.hash,
                status = %record.status,
                extrinsics = record.extrinsic_count(),
                events = record.event_count(),
                "Lookup resolved"
            ),
            Ok(Ok(None)) => warn!(key, "Lookup ended before the block loaded"),
            Ok(Err(e)) => warn!(key, "Lookup failed: {e}"),
            Err(_) => warn!(key, "Lookup timed out"),
        }
    }
}
