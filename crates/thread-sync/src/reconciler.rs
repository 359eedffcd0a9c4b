//! Applies snapshots and incremental events to the message store.
//!
//! Every apply carries the epoch it was issued under. Results from a binding
//! that has since been replaced are reported as [`ApplyDecision::StaleEpoch`]
//! and never touch the store.
//!
//! A snapshot fetch is bracketed by a [`SnapshotTicket`]. While any ticket is
//! outstanding, applied events are journaled so that a snapshot taken before
//! those events can be brought forward when it lands.

use std::collections::{BTreeSet, VecDeque};

use tracing::{debug, warn};

use crate::frame::ThreadEvent;
use crate::model::{Message, Thread, ThreadId, ThreadSnapshot};
use crate::store::{MessageStore, StoreChange};

pub type Epoch = u64;

pub const DEFAULT_JOURNAL_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyDecision {
    Inserted { index: usize },
    InsertedFromUpdate { index: usize },
    Merged,
    Duplicate,
    Replaced {
        messages: usize,
        replayed: usize,
        truncated: bool,
    },
    Superseded,
    StaleEpoch { current: Epoch, incoming: Epoch },
    ForeignThread,
    Unbound,
    Malformed,
}

impl ApplyDecision {
    /// Whether the store or thread metadata may have changed.
    #[must_use]
    pub fn is_change(self) -> bool {
        matches!(
            self,
            Self::Inserted { .. }
                | Self::InsertedFromUpdate { .. }
                | Self::Merged
                | Self::Replaced { .. }
        )
    }
}

/// Handle for one in-flight snapshot fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotTicket {
    epoch: Epoch,
    serial: u64,
}

impl SnapshotTicket {
    #[must_use]
    pub fn epoch(self) -> Epoch {
        self.epoch
    }
}

#[derive(Debug, Clone)]
struct JournalEntry {
    /// Newest ticket serial issued when the event was applied.
    issued: u64,
    event: ThreadEvent,
}

#[derive(Debug)]
pub struct Reconciler {
    epoch: Epoch,
    thread_id: Option<ThreadId>,
    thread: Option<Thread>,
    store: MessageStore,
    last_serial: u64,
    applied_serial: u64,
    pending: BTreeSet<u64>,
    journal: VecDeque<JournalEntry>,
    journal_capacity: usize,
    journal_truncated: bool,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(DEFAULT_JOURNAL_CAPACITY)
    }
}

impl Reconciler {
    #[must_use]
    pub fn new(journal_capacity: usize) -> Self {
        Self {
            epoch: 0,
            thread_id: None,
            thread: None,
            store: MessageStore::new(),
            last_serial: 0,
            applied_serial: 0,
            pending: BTreeSet::new(),
            journal: VecDeque::new(),
            journal_capacity: journal_capacity.max(1),
            journal_truncated: false,
        }
    }

    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    #[must_use]
    pub fn thread_id(&self) -> Option<&ThreadId> {
        self.thread_id.as_ref()
    }

    #[must_use]
    pub fn thread(&self) -> Option<&Thread> {
        self.thread.as_ref()
    }

    #[must_use]
    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        self.store.messages()
    }

    #[must_use]
    pub fn running(&self) -> bool {
        self.thread.as_ref().is_some_and(|thread| thread.running)
    }

    #[must_use]
    pub fn awaiting_input(&self) -> bool {
        self.store.awaiting_input()
    }

    #[must_use]
    pub fn is_current(&self, epoch: Epoch) -> bool {
        self.thread_id.is_some() && epoch == self.epoch
    }

    /// Switch to `thread_id`, clearing everything held for the previous thread.
    pub fn rebind(&mut self, thread_id: ThreadId) -> Epoch {
        self.reset();
        self.thread_id = Some(thread_id);
        self.epoch
    }

    /// Drop the current binding. Work issued under the old epoch becomes stale.
    pub fn release(&mut self) -> Epoch {
        self.reset();
        self.epoch
    }

    fn reset(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        self.thread_id = None;
        self.thread = None;
        self.store.clear();
        self.pending.clear();
        self.journal.clear();
        self.journal_truncated = false;
        self.applied_serial = self.last_serial;
    }

    /// Issue a ticket before starting a snapshot fetch.
    pub fn begin_snapshot(&mut self, epoch: Epoch) -> Option<SnapshotTicket> {
        if !self.is_current(epoch) {
            return None;
        }
        self.last_serial += 1;
        self.pending.insert(self.last_serial);
        Some(SnapshotTicket {
            epoch,
            serial: self.last_serial,
        })
    }

    /// Forget a ticket whose fetch failed.
    pub fn abandon_snapshot(&mut self, ticket: SnapshotTicket) {
        if ticket.epoch == self.epoch {
            self.pending.remove(&ticket.serial);
            self.prune_journal();
        }
    }

    /// Replace the store with a snapshot, then replay events journaled since its ticket.
    pub fn apply_snapshot(
        &mut self,
        ticket: SnapshotTicket,
        snapshot: ThreadSnapshot,
    ) -> ApplyDecision {
        if let Some(decision) = self.check_epoch(ticket.epoch) {
            return decision;
        }
        self.pending.remove(&ticket.serial);
        if ticket.serial <= self.applied_serial {
            debug!(serial = ticket.serial, applied = self.applied_serial, "snapshot superseded");
            self.prune_journal();
            return ApplyDecision::Superseded;
        }
        if let (Some(bound), Some(thread)) = (self.thread_id.as_ref(), snapshot.thread.as_ref())
            && &thread.id != bound
        {
            warn!(bound = %bound, received = %thread.id, "snapshot for a different thread dropped");
            self.prune_journal();
            return ApplyDecision::ForeignThread;
        }

        let messages: Vec<Message> = snapshot
            .messages
            .into_iter()
            .filter(|message| self.accepts_thread(message.thread_id.as_ref()))
            .collect();
        if snapshot.thread.is_some() {
            self.thread = snapshot.thread;
        }
        self.store.replace(messages);
        self.applied_serial = ticket.serial;

        let replay: Vec<ThreadEvent> = self
            .journal
            .iter()
            .filter(|entry| entry.issued >= ticket.serial)
            .map(|entry| entry.event.clone())
            .collect();
        let replayed = replay.len();
        for event in replay {
            self.apply_to_store(event);
        }

        let truncated = self.journal_truncated;
        self.prune_journal();
        if truncated {
            warn!(serial = ticket.serial, "event journal overflowed while snapshot was in flight");
        }

        ApplyDecision::Replaced {
            messages: self.store.len(),
            replayed,
            truncated,
        }
    }

    /// Apply one live event.
    pub fn apply_event(&mut self, epoch: Epoch, event: ThreadEvent) -> ApplyDecision {
        if let Some(decision) = self.check_epoch(epoch) {
            return decision;
        }
        if !self.accepts_thread(event.thread_id()) {
            warn!(
                bound = ?self.thread_id,
                received = ?event.thread_id(),
                "event for a different thread dropped"
            );
            return ApplyDecision::ForeignThread;
        }
        if event.message_id().is_none() {
            return ApplyDecision::Malformed;
        }

        if !self.pending.is_empty() {
            self.journal_event(event.clone());
        }
        self.apply_to_store(event)
    }

    fn apply_to_store(&mut self, event: ThreadEvent) -> ApplyDecision {
        match event {
            ThreadEvent::Insert(message) => match self.store.insert(message) {
                StoreChange::Inserted { index } => ApplyDecision::Inserted { index },
                _ => ApplyDecision::Duplicate,
            },
            ThreadEvent::Update(patch) => {
                let Some(id) = patch.id.clone() else {
                    return ApplyDecision::Malformed;
                };
                match self.store.merge(&id, &patch) {
                    Some(StoreChange::Unchanged) => ApplyDecision::Duplicate,
                    Some(_) => ApplyDecision::Merged,
                    None => match self.store.insert(patch.into_message(id)) {
                        StoreChange::Inserted { index } => {
                            ApplyDecision::InsertedFromUpdate { index }
                        }
                        _ => ApplyDecision::Duplicate,
                    },
                }
            }
        }
    }

    fn journal_event(&mut self, event: ThreadEvent) {
        if self.journal.len() >= self.journal_capacity {
            self.journal.pop_front();
            self.journal_truncated = true;
        }
        self.journal.push_back(JournalEntry {
            issued: self.last_serial,
            event,
        });
    }

    fn prune_journal(&mut self) {
        match self.pending.first().copied() {
            Some(oldest) => self.journal.retain(|entry| entry.issued >= oldest),
            None => {
                self.journal.clear();
                self.journal_truncated = false;
            }
        }
    }

    fn check_epoch(&self, epoch: Epoch) -> Option<ApplyDecision> {
        if epoch != self.epoch {
            debug!(current = self.epoch, incoming = epoch, "stale apply discarded");
            return Some(ApplyDecision::StaleEpoch {
                current: self.epoch,
                incoming: epoch,
            });
        }
        if self.thread_id.is_none() {
            return Some(ApplyDecision::Unbound);
        }
        None
    }

    fn accepts_thread(&self, thread_id: Option<&ThreadId>) -> bool {
        match (thread_id, self.thread_id.as_ref()) {
            (Some(incoming), Some(bound)) => incoming == bound,
            _ => true,
        }
    }
}
