//! Awareness registry: short-lived presence per participant.
//!
//! Cursor, selection and display identity, keyed by participant id and
//! versioned by a per-participant logical clock. Independent from the
//! document's own versioning and never persisted.
//!
//! ## Merge rule
//!
//! ```text
//! incoming { participant, clock, state }
//!       │
//!       ├── participant == local ──► dropped
//!       ├── clock <= stored clock ──► dropped (stale)
//!       └── clock >  stored clock,
//!           or nothing stored ─────► stored; state None removes the entry
//! ```
//!
//! Last-writer-wins per participant by logical clock, never wall time.
//! Clocks are only kept for present participants. Once a remote entry is
//! withdrawn or expires its clock is forgotten, so a participant that
//! restarts with the same id and a clock from 1 is accepted again. A
//! delayed entry arriving after a withdrawal can briefly bring a
//! participant back; it expires like any silent entry.
//! The registry has no timer of its own: the owning session calls
//! `expire_stale` periodically.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::document::Origin;
use crate::protocol::PeerInfo;
use crate::subscription::{SubscriptionId, Subscribers};

pub type ParticipantId = Uuid;

// ───────────────────────────────────────────────────────────────────
// Payload types
// ───────────────────────────────────────────────────────────────────

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, visually distinct color from a UUID.
    ///
    /// The hue comes from the UUID bits, saturation and lightness are
    /// fixed for vivid cursors.
    pub fn from_uuid(id: Uuid) -> Self {
        let hash = id.as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 } // Default blue
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l); // Achromatic
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Selected range in document byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: u32,
    pub head: u32,
}

/// What one participant publishes about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantState {
    pub name: String,
    pub color: CursorColor,
    /// Caret offset, if the participant has focus.
    pub cursor: Option<u32>,
    pub selection: Option<Selection>,
}

impl ParticipantState {
    /// Initial state for a participant: identity only, no caret.
    pub fn for_peer(peer: &PeerInfo) -> Self {
        Self {
            name: peer.name.clone(),
            color: peer.color,
            cursor: None,
            selection: None,
        }
    }

    pub fn with_cursor(mut self, cursor: u32) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn with_selection(mut self, anchor: u32, head: u32) -> Self {
        self.selection = Some(Selection { anchor, head });
        self
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire format
// ───────────────────────────────────────────────────────────────────

/// One participant's entry on the wire. `state: None` means "left".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub participant: ParticipantId,
    pub clock: u64,
    pub state: Option<ParticipantState>,
}

/// A set of changed entries.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn encode(&self) -> Result<Vec<u8>, AwarenessError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| AwarenessError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AwarenessError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| AwarenessError::DeserializationError(e.to_string()))?;
        Ok(update)
    }
}

/// Awareness codec errors.
#[derive(Debug, Clone, PartialEq)]
pub enum AwarenessError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for AwarenessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Awareness serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Awareness deserialization error: {e}"),
        }
    }
}

impl std::error::Error for AwarenessError {}

/// Notification raised when the active set changes.
///
/// Timeouts are reported with `Origin::Remote`: they are local
/// observations of a remote participant going silent and are never
/// broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessChange {
    pub origin: Origin,
    pub added: Vec<ParticipantId>,
    pub updated: Vec<ParticipantId>,
    pub removed: Vec<ParticipantId>,
    /// Encoded delta to broadcast (local changes only).
    pub update: Option<Vec<u8>>,
}

impl AwarenessChange {
    fn empty(origin: Origin) -> Self {
        Self {
            origin,
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            update: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct EntryMeta {
    clock: u64,
    last_updated: Instant,
}

/// Presence of every known participant, including the local one.
pub struct AwarenessRegistry {
    local_id: ParticipantId,
    /// Clock and freshness of the local participant and of every remote
    /// participant in `states`.
    meta: HashMap<ParticipantId, EntryMeta>,
    states: HashMap<ParticipantId, ParticipantState>,
    subscribers: Subscribers<AwarenessChange>,
}

impl AwarenessRegistry {
    pub fn new(local_id: ParticipantId) -> Self {
        Self {
            local_id,
            meta: HashMap::new(),
            states: HashMap::new(),
            subscribers: Subscribers::new(),
        }
    }

    pub fn local_id(&self) -> ParticipantId {
        self.local_id
    }

    pub fn local_state(&self) -> Option<&ParticipantState> {
        self.states.get(&self.local_id)
    }

    pub fn local_clock(&self) -> u64 {
        self.clock_of(&self.local_id).unwrap_or(0)
    }

    /// Replace the local participant's state.
    ///
    /// Bumps the local clock and notifies subscribers with a delta that
    /// holds only the local entry. `None` withdraws the local presence.
    pub fn set_local_state(&mut self, state: Option<ParticipantState>) -> AwarenessChange {
        self.set_local_state_at(state, Instant::now())
    }

    fn set_local_state_at(&mut self, state: Option<ParticipantState>, now: Instant) -> AwarenessChange {
        let clock = self.bump_local_clock(now);
        let mut change = AwarenessChange::empty(Origin::Local);

        match &state {
            Some(s) => {
                if self.states.insert(self.local_id, s.clone()).is_some() {
                    change.updated.push(self.local_id);
                } else {
                    change.added.push(self.local_id);
                }
            }
            None => {
                if self.states.remove(&self.local_id).is_some() {
                    change.removed.push(self.local_id);
                }
            }
        }

        change.update = self.encode_entry(clock, state);
        self.subscribers.notify(&change);
        change
    }

    /// Re-publish the local state with a fresh clock (heartbeat).
    ///
    /// Returns `None` when there is no local state to renew.
    pub fn renew_local(&mut self) -> Option<AwarenessChange> {
        self.renew_local_at(Instant::now())
    }

    fn renew_local_at(&mut self, now: Instant) -> Option<AwarenessChange> {
        let state = self.local_state()?.clone();
        let clock = self.bump_local_clock(now);

        let mut change = AwarenessChange::empty(Origin::Local);
        change.updated.push(self.local_id);
        change.update = self.encode_entry(clock, Some(state));
        self.subscribers.notify(&change);
        Some(change)
    }

    /// True if the local entry is older than `max_age`.
    pub fn local_needs_renewal(&self, max_age: Duration) -> bool {
        self.local_needs_renewal_at(Instant::now(), max_age)
    }

    fn local_needs_renewal_at(&self, now: Instant, max_age: Duration) -> bool {
        if self.local_state().is_none() {
            return false;
        }
        self.meta
            .get(&self.local_id)
            .map_or(true, |m| now.saturating_duration_since(m.last_updated) >= max_age)
    }

    /// Encoded "left" entry for the local participant.
    ///
    /// Bumps the local clock but keeps the local state, so a later
    /// `renew_local` re-announces the participant with a newer clock.
    pub fn leave_update(&mut self) -> Option<Vec<u8>> {
        let clock = self.bump_local_clock(Instant::now());
        self.encode_entry(clock, None)
    }

    /// Merge remote entries. Malformed payloads and stale entries are
    /// dropped with a log line; this never fails.
    pub fn apply_remote_update(&mut self, bytes: &[u8], origin: Origin) -> AwarenessChange {
        self.apply_remote_update_at(bytes, origin, Instant::now())
    }

    fn apply_remote_update_at(&mut self, bytes: &[u8], origin: Origin, now: Instant) -> AwarenessChange {
        let mut change = AwarenessChange::empty(origin);

        let update = match AwarenessUpdate::decode(bytes) {
            Ok(update) => update,
            Err(e) => {
                log::warn!("Dropping malformed awareness update: {e}");
                return change;
            }
        };

        for entry in update.entries {
            if entry.participant == self.local_id {
                log::debug!("Ignoring remote awareness entry for local participant");
                continue;
            }

            let stored = self.meta.get(&entry.participant).map(|m| m.clock);
            if stored.is_some_and(|clock| entry.clock <= clock) {
                log::trace!(
                    "Stale awareness entry for {} (clock {} <= {:?})",
                    entry.participant,
                    entry.clock,
                    stored
                );
                continue;
            }

            match entry.state {
                Some(state) => {
                    self.meta.insert(
                        entry.participant,
                        EntryMeta { clock: entry.clock, last_updated: now },
                    );
                    if self.states.insert(entry.participant, state).is_some() {
                        change.updated.push(entry.participant);
                    } else {
                        change.added.push(entry.participant);
                    }
                }
                None => {
                    self.meta.remove(&entry.participant);
                    if self.states.remove(&entry.participant).is_some() {
                        change.removed.push(entry.participant);
                    }
                }
            }
        }

        if !change.is_empty() {
            self.subscribers.notify(&change);
        }
        change
    }

    /// Remove remote entries whose clock has not advanced within `timeout`.
    ///
    /// The local entry is never expired. Returns the removed participants.
    pub fn expire_stale(&mut self, timeout: Duration) -> Vec<ParticipantId> {
        self.expire_stale_at(Instant::now(), timeout)
    }

    fn expire_stale_at(&mut self, now: Instant, timeout: Duration) -> Vec<ParticipantId> {
        let mut removed: Vec<ParticipantId> = self
            .states
            .keys()
            .filter(|id| **id != self.local_id)
            .filter(|id| {
                self.meta
                    .get(id)
                    .map_or(true, |m| now.saturating_duration_since(m.last_updated) >= timeout)
            })
            .copied()
            .collect();
        removed.sort();

        for id in &removed {
            self.states.remove(id);
            self.meta.remove(id);
            log::debug!("Awareness entry for {id} expired");
        }

        if !removed.is_empty() {
            let mut change = AwarenessChange::empty(Origin::Remote);
            change.removed = removed.clone();
            self.subscribers.notify(&change);
        }
        removed
    }

    /// Active participants (local included), ordered by id.
    pub fn active_entries(&self) -> Vec<(ParticipantId, ParticipantState)> {
        let mut entries: Vec<_> = self
            .states
            .iter()
            .map(|(id, state)| (*id, state.clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    pub fn get(&self, participant: &ParticipantId) -> Option<&ParticipantState> {
        self.states.get(participant)
    }

    pub fn clock_of(&self, participant: &ParticipantId) -> Option<u64> {
        self.meta.get(participant).map(|m| m.clock)
    }

    /// Number of active participants.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn subscribe<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: Fn(&AwarenessChange) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn bump_local_clock(&mut self, now: Instant) -> u64 {
        let clock = self.local_clock() + 1;
        self.meta.insert(self.local_id, EntryMeta { clock, last_updated: now });
        clock
    }

    fn encode_entry(&self, clock: u64, state: Option<ParticipantState>) -> Option<Vec<u8>> {
        let update = AwarenessUpdate {
            entries: vec![AwarenessEntry {
                participant: self.local_id,
                clock,
                state,
            }],
        };
        match update.encode() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::warn!("Failed to encode local awareness entry: {e}");
                None
            }
        }
    }
}

impl std::fmt::Debug for AwarenessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwarenessRegistry")
            .field("local_id", &self.local_id)
            .field("active", &self.states.len())
            .finish()
    }
}
