//! Recent-events ticker.
//!
//! Keeps the filtered events of every live Best or Finalized block and
//! renders them newest first, grouped by extrinsic, with per-group,
//! per-block and global length caps.

use std::collections::HashMap;
use std::sync::Arc;

use agora_common::{BlockHash, BlockRecord, BlockStatus, ChainEvent, EventRecord, Phase};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::block_store::BlockStore;
use crate::configuration::EventsConfig;
use crate::event_filter::EventFilter;
use crate::live_records::{LiveEvent, LiveRecords};

/// One line of the ticker
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventRow {
    Event {
        status: BlockStatus,
        hash: BlockHash,
        number: u64,
        event: ChainEvent,
        phase: Phase,
        /// Position in the block's unfiltered event list
        index: usize,
    },

    /// Stands in for events cut from an over-long extrinsic group
    EventEllipsis {
        number: u64,
        hash: BlockHash,
        phase: Phase,
        elided: usize,
    },

    /// Stands in for groups cut from an over-long block
    BlockEllipsis {
        number: u64,
        hash: BlockHash,
        elided: usize,
    },
}

impl EventRow {
    /// Grouping key: `number-phase`, or just `number` for a block ellipsis
    pub fn key(&self) -> String {
        match self {
            EventRow::Event { number, phase, .. } | EventRow::EventEllipsis { number, phase, .. } => {
                format!("{number}-{phase}")
            }
            EventRow::BlockEllipsis { number, .. } => number.to_string(),
        }
    }

    pub fn number(&self) -> u64 {
        match self {
            EventRow::Event { number, .. }
            | EventRow::EventEllipsis { number, .. }
            | EventRow::BlockEllipsis { number, .. } => *number,
        }
    }
}

pub type RecentEvents = Arc<Vec<EventRow>>;

/// A block's filtered events, never empty
struct Contribution {
    status: BlockStatus,
    number: u64,
    events: Vec<(usize, EventRecord)>,
}

pub struct EventProjector {
    filter: EventFilter,
    max_group_length: usize,
    max_block_length: usize,
    max_length: usize,
    blocks: HashMap<BlockHash, Contribution>,
}

impl EventProjector {
    pub fn new(config: &EventsConfig) -> Self {
        Self {
            filter: EventFilter::from_config(config),
            max_group_length: config.max_group_length.max(2),
            max_block_length: config.max_block_length.max(2),
            max_length: config.max_length,
            blocks: HashMap::new(),
        }
    }

    /// Take in the latest value of a record. Returns true once the record is
    /// settled and needs no more updates.
    pub fn update(&mut self, record: &BlockRecord) -> bool {
        if let Some(events) = &record.events {
            let kept: Vec<(usize, EventRecord)> = events
                .iter()
                .enumerate()
                .filter(|(_, e)| self.filter.accepts(&e.event))
                .map(|(index, e)| (index, e.clone()))
                .collect();
            // Blocks with nothing interesting never contribute
            if !kept.is_empty() {
                self.blocks.insert(
                    record.hash,
                    Contribution {
                        status: record.status,
                        number: record.number,
                        events: kept,
                    },
                );
            }
        }
        record.is_settled()
    }

    pub fn remove(&mut self, hash: &BlockHash) -> bool {
        self.blocks.remove(hash).is_some()
    }

    pub fn contributors(&self) -> usize {
        self.blocks.len()
    }

    /// Render the ticker, newest first
    pub fn project(&self) -> Vec<EventRow> {
        let mut blocks: Vec<(&BlockHash, &Contribution)> = self
            .blocks
            .iter()
            .filter(|(_, c)| matches!(c.status, BlockStatus::Best | BlockStatus::Finalized))
            .collect();
        blocks.sort_by_key(|(hash, c)| (c.number, **hash));

        let mut rows: Vec<EventRow> = blocks
            .into_iter()
            .flat_map(|(hash, c)| self.block_rows(*hash, c))
            .collect();
        rows.reverse();
        rows.truncate(self.max_length);
        rows
    }

    /// One block's rows in chronological order
    fn block_rows(&self, hash: BlockHash, block: &Contribution) -> Vec<EventRow> {
        let number = block.number;

        // Groups keep first-appearance order
        let mut groups: Vec<(Phase, Vec<EventRow>)> = Vec::new();
        for (index, record) in &block.events {
            let row = EventRow::Event {
                status: block.status,
                hash,
                number,
                event: record.event.clone(),
                phase: record.phase,
                index: *index,
            };
            match groups.iter_mut().find(|(phase, _)| *phase == record.phase) {
                Some((_, group)) => group.push(row),
                None => groups.push((record.phase, vec![row])),
            }
        }

        let mut groups: Vec<Vec<EventRow>> = groups
            .into_iter()
            .map(|(phase, mut group)| {
                if group.len() > self.max_group_length {
                    let elided = group.len() - self.max_group_length + 1;
                    group.truncate(self.max_group_length - 1);
                    group.insert(
                        0,
                        EventRow::EventEllipsis {
                            number,
                            hash,
                            phase,
                            elided,
                        },
                    );
                }
                group
            })
            .collect();

        let block_ellipsis = (groups.len() > self.max_block_length).then(|| {
            let elided = groups.len() - self.max_block_length + 1;
            groups.truncate(self.max_block_length - 1);
            EventRow::BlockEllipsis {
                number,
                hash,
                elided,
            }
        });

        groups.into_iter().flatten().chain(block_ellipsis).collect()
    }
}

/// Keep `output` equal to the projection of the store's live records
pub async fn run_event_projector(
    store: BlockStore,
    config: EventsConfig,
    output: watch::Sender<RecentEvents>,
    mut shutdown: watch::Receiver<()>,
) {
    let mut projector = EventProjector::new(&config);
    let mut live = LiveRecords::new(store);

    loop {
        let event = tokio::select! {
            event = live.next() => event,
            _ = shutdown.changed() => break,
        };

        match event {
            LiveEvent::Record(record) => {
                if projector.update(&record) {
                    debug!("Block {} settled for the event ticker", record.number);
                    live.unfollow(&record.hash);
                }
            }
            LiveEvent::Removed(hashes) => {
                for hash in &hashes {
                    projector.remove(hash);
                }
            }
            LiveEvent::Closed => break,
        }

        let rows = projector.project();
        output.send_if_modified(|current| {
            if **current == rows {
                return false;
            }
            *current = Arc::new(rows);
            true
        });
    }
    info!("Event projector stopped");
}
