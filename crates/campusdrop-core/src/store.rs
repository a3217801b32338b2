// Challenge state machine: the single authoritative view of what is live.
//
// Phases cycle idle -> live -> results -> live ... for the whole session.
// Every applied transition bumps `revision` and publishes a fresh
// `SyncSnapshot` to all watchers. Ignored events publish nothing.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::clock::ClockService;
use crate::protocol::{Challenge, ChallengeEnd, ChallengePatch, Origin, PushEvent};

/// Live-challenge phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Nothing live.
    Idle,
    /// `current` is live.
    Live,
    /// `current` just ended; kept so the UI can show what ended.
    Results,
}

/// Result of offering an event to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// State changed and was published.
    Applied,
    /// Valid event that matched the existing state exactly.
    Unchanged,
    /// Event referred to a challenge that is not current.
    Stale,
    /// Merge would have produced an invalid challenge.
    Rejected,
    /// Push event id already applied.
    Duplicate,
}

/// Read model published to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub phase: Phase,
    pub current: Option<Challenge>,
    /// Clock offset at the time this snapshot was published.
    pub server_time_offset_ms: i64,
    pub last_event_id: Option<String>,
    /// Source of the drop that set `current`.
    pub last_source: Option<Origin>,
    pub push_connected: bool,
    pub revision: u64,
    /// Revision at which `current` was last set by a drop. Zero before any.
    pub drop_revision: u64,
}

impl SyncSnapshot {
    fn initial() -> Self {
        SyncSnapshot {
            phase: Phase::Idle,
            current: None,
            server_time_offset_ms: 0,
            last_event_id: None,
            last_source: None,
            push_connected: false,
            revision: 0,
            drop_revision: 0,
        }
    }
}

/// Mutable owner of the challenge sync state.
pub struct ChallengeStore {
    state: SyncSnapshot,
    clock: Arc<ClockService>,
    tx: watch::Sender<SyncSnapshot>,
}

impl ChallengeStore {
    pub fn new(clock: Arc<ClockService>) -> Self {
        let state = SyncSnapshot::initial();
        let (tx, _rx) = watch::channel(state.clone());
        ChallengeStore { state, clock, tx }
    }

    /// Watch the published snapshot. Never blocks the store.
    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        let mut snapshot = self.state.clone();
        snapshot.server_time_offset_ms = self.clock.offset_ms();
        snapshot
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn current(&self) -> Option<&Challenge> {
        self.state.current.as_ref()
    }

    // -- Public mutators --

    /// Drop: make `challenge` current and live, whatever the prior phase.
    pub fn on_drop(&mut self, challenge: Challenge) -> Outcome {
        let outcome = self.drop_inner(challenge, None);
        self.publish_if_applied(outcome);
        outcome
    }

    /// Update: merge `patch` into the current challenge. No-op when idle.
    pub fn on_update(&mut self, patch: &ChallengePatch) -> Outcome {
        let outcome = self.update_inner(patch);
        self.publish_if_applied(outcome);
        outcome
    }

    /// End: move to results iff `end.id` names the current challenge.
    pub fn on_end(&mut self, end: &ChallengeEnd) -> Outcome {
        let outcome = self.end_inner(end);
        self.publish_if_applied(outcome);
        outcome
    }

    /// Apply an event from a transport or the poller.
    ///
    /// Events carrying the id of the last applied push event are dropped as
    /// redeliveries. Drops record `origin` as the source of `current`.
    pub fn apply(&mut self, origin: Origin, event: PushEvent, event_id: Option<String>) -> Outcome {
        if event_id.is_some() && event_id == self.state.last_event_id {
            return Outcome::Duplicate;
        }

        let outcome = match event {
            PushEvent::Drop(challenge) => self.drop_inner(challenge, Some(origin)),
            PushEvent::Update(patch) => self.update_inner(&patch),
            PushEvent::End(end) => self.end_inner(&end),
        };

        if outcome == Outcome::Applied {
            if event_id.is_some() {
                self.state.last_event_id = event_id;
            }
            self.publish();
        }
        outcome
    }

    /// Record push-channel connectivity. Published only when it changes.
    pub fn set_push_connected(&mut self, connected: bool) {
        if self.state.push_connected != connected {
            self.state.push_connected = connected;
            self.publish();
        }
    }

    // -- Transitions --

    fn drop_inner(&mut self, challenge: Challenge, origin: Option<Origin>) -> Outcome {
        if self.state.phase == Phase::Live && self.state.current.as_ref() == Some(&challenge) {
            return Outcome::Unchanged;
        }
        if let Some(previous) = &self.state.current {
            if previous.id != challenge.id && self.state.phase == Phase::Live {
                debug!(previous = %previous.id, next = %challenge.id, "drop replaces live challenge");
            }
        }
        self.state.current = Some(challenge);
        self.state.phase = Phase::Live;
        self.state.last_source = origin;
        // An applied drop is always published next.
        self.state.drop_revision = self.state.revision + 1;
        Outcome::Applied
    }

    fn update_inner(&mut self, patch: &ChallengePatch) -> Outcome {
        let Some(current) = &self.state.current else {
            debug!("update with no current challenge ignored");
            return Outcome::Stale;
        };

        if let Some(id) = &patch.id {
            if *id != current.id {
                debug!(patch_id = %id, current_id = %current.id, "merging update addressed to another id");
            }
        }

        let next = match current.merged(patch) {
            Ok(next) => next,
            Err(e) => {
                warn!("rejecting challenge update: {e}");
                return Outcome::Rejected;
            }
        };
        if next == *current {
            return Outcome::Unchanged;
        }
        self.state.current = Some(next);
        Outcome::Applied
    }

    fn end_inner(&mut self, end: &ChallengeEnd) -> Outcome {
        match &self.state.current {
            Some(current) if current.id == end.id => {
                if self.state.phase == Phase::Results {
                    Outcome::Unchanged
                } else {
                    self.state.phase = Phase::Results;
                    Outcome::Applied
                }
            }
            _ => {
                debug!(id = %end.id, "end for non-current challenge ignored");
                Outcome::Stale
            }
        }
    }

    fn publish_if_applied(&mut self, outcome: Outcome) {
        if outcome == Outcome::Applied {
            self.publish();
        }
    }

    fn publish(&mut self) {
        self.state.revision += 1;
        self.tx.send_replace(self.snapshot());
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
