//! Replicated document: the mergeable shared content of a session.
//!
//! Wraps a Yrs `Doc` with a single text root. Yrs stores content as a
//! causally ordered set of operations with tombstoned deletions, so
//! applying updates is idempotent, commutative and converges regardless
//! of arrival order.
//!
//! ```text
//! local edit ──► capture_local_change() ──► DocumentChange { origin: Local }
//!                                                │
//! network    ──► apply_update(.., Remote) ──► DocumentChange { origin: Remote }
//!                                                │
//!                                     subscribers (session, persistence)
//! ```
//!
//! Concurrent insertions at the same position are ordered by Yrs' YATA
//! rule (lower client id first), identically on every replica.

use std::fmt;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, Text, TextRef, Transact, TransactionMut};

use crate::subscription::{SubscriptionId, Subscribers};

/// Name of the text root shared by all replicas.
pub const CONTENT_ROOT: &str = "content";

/// lib0 v1 encoding of an update with no structs and an empty delete set.
const EMPTY_UPDATE_V1: [u8; 2] = [0, 0];

/// Where an applied change came from.
///
/// Checked structurally by the session: only `Local` changes are
/// broadcast, which stops updates from echoing back to their source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Produced by an edit on this replica.
    Local,
    /// Received from the network or restored from storage.
    Remote,
}

/// Opaque binary delta (Yrs lib0 v1 update).
#[derive(Clone, PartialEq, Eq)]
pub struct Update(Vec<u8>);

impl Update {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the update carries no operations at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty() || self.0 == EMPTY_UPDATE_V1
    }
}

impl From<Vec<u8>> for Update {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Update({} bytes)", self.0.len())
    }
}

/// Summary of which operations a replica has seen: one clock per client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateVector(yrs::StateVector);

impl StateVector {
    /// Encode as lib0 v1 bytes for the handshake.
    pub fn encode(&self) -> Vec<u8> {
        self.0.encode_v1()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DocError> {
        yrs::StateVector::decode_v1(bytes)
            .map(Self)
            .map_err(|e| DocError::MalformedStateVector(e.to_string()))
    }

    /// True for a replica that has seen nothing.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Change notification raised after every successful mutation.
#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub origin: Origin,
    /// The operations that were applied.
    pub update: Update,
    /// State vector of the replica just before the change.
    pub before: StateVector,
}

/// Document errors.
#[derive(Debug, Clone, PartialEq)]
pub enum DocError {
    /// Update bytes could not be decoded.
    MalformedUpdate(String),
    /// State vector bytes could not be decoded.
    MalformedStateVector(String),
    /// Yrs refused to integrate a decoded update.
    ApplyFailed(String),
    /// Edit range lies outside the current content.
    OutOfBounds { index: u32, len: u32 },
    /// Offset falls inside a multi-byte character.
    NotCharBoundary { index: u32 },
}

impl fmt::Display for DocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocError::MalformedUpdate(e) => write!(f, "Malformed update: {e}"),
            DocError::MalformedStateVector(e) => write!(f, "Malformed state vector: {e}"),
            DocError::ApplyFailed(e) => write!(f, "Failed to apply update: {e}"),
            DocError::OutOfBounds { index, len } => {
                write!(f, "Edit at {index} out of bounds for content of length {len}")
            }
            DocError::NotCharBoundary { index } => {
                write!(f, "Offset {index} is not on a character boundary")
            }
        }
    }
}

impl std::error::Error for DocError {}

/// The authoritative shared content of one session.
///
/// Owned by exactly one session; never shared by reference across
/// sessions. Offsets are UTF-8 byte offsets into the text.
pub struct ReplicatedDocument {
    doc: Doc,
    subscribers: Subscribers<DocumentChange>,
}

impl ReplicatedDocument {
    pub fn new() -> Self {
        let doc = Doc::new();
        doc.get_or_insert_text(CONTENT_ROOT);
        Self {
            doc,
            subscribers: Subscribers::new(),
        }
    }

    // ─── Merge ────────────────────────────────────────────────────────

    /// Merge an update into local state.
    ///
    /// Parts that are already known are ignored, so re-applying is a
    /// no-op. Malformed bytes are rejected before anything is touched.
    pub fn apply_update(&mut self, update: &Update, origin: Origin) -> Result<(), DocError> {
        let decoded = yrs::Update::decode_v1(update.as_bytes())
            .map_err(|e| DocError::MalformedUpdate(e.to_string()))?;

        let before = self.state_vector();
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| DocError::ApplyFailed(e.to_string()))?;
        }

        self.subscribers.notify(&DocumentChange {
            origin,
            update: update.clone(),
            before,
        });
        Ok(())
    }

    /// Run a local edit inside one transaction and capture exactly the
    /// operations it produced.
    ///
    /// Subscribers see the captured update with `Origin::Local`. Edits that
    /// change nothing raise no notification.
    pub fn capture_local_change<R, F>(&mut self, edit: F) -> (R, Update)
    where
        F: FnOnce(&TextRef, &mut TransactionMut<'_>) -> R,
    {
        let before = self.state_vector();
        let text = self.content();
        let (result, update) = {
            let mut txn = self.doc.transact_mut();
            let result = edit(&text, &mut txn);
            (result, Update::from(txn.encode_update_v1()))
        };

        if !update.is_empty() {
            self.subscribers.notify(&DocumentChange {
                origin: Origin::Local,
                update: update.clone(),
                before,
            });
        }
        (result, update)
    }

    /// Insert `chunk` at byte offset `index`.
    pub fn insert(&mut self, index: u32, chunk: &str) -> Result<Update, DocError> {
        let content = self.text();
        let len = content.len() as u32;
        if index > len {
            return Err(DocError::OutOfBounds { index, len });
        }
        check_char_boundary(&content, index)?;
        let ((), update) = self.capture_local_change(|text, txn| text.insert(txn, index, chunk));
        Ok(update)
    }

    /// Delete `len` bytes starting at `index`.
    pub fn delete(&mut self, index: u32, len: u32) -> Result<Update, DocError> {
        let content = self.text();
        let current = content.len() as u32;
        let end = match index.checked_add(len) {
            Some(end) if end <= current => end,
            _ => return Err(DocError::OutOfBounds { index, len: current }),
        };
        check_char_boundary(&content, index)?;
        check_char_boundary(&content, end)?;
        let ((), update) =
            self.capture_local_change(|text, txn| text.remove_range(txn, index, len));
        Ok(update)
    }

    // ─── Handshake ────────────────────────────────────────────────────

    pub fn state_vector(&self) -> StateVector {
        let txn = self.doc.transact();
        StateVector(txn.state_vector())
    }

    /// Minimal update containing everything the holder of `since` lacks.
    pub fn diff_since(&self, since: &StateVector) -> Update {
        let txn = self.doc.transact();
        Update::from(txn.encode_diff_v1(&since.0))
    }

    // ─── Persistence ──────────────────────────────────────────────────

    /// Encode the complete document state.
    pub fn encode_full(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&yrs::StateVector::default())
    }

    /// Merge a full-state encoding produced by `encode_full`.
    pub fn restore_from_full(&mut self, bytes: &[u8]) -> Result<(), DocError> {
        self.apply_update(&Update::from_bytes(bytes), Origin::Remote)
    }

    // ─── Content ──────────────────────────────────────────────────────

    pub fn text(&self) -> String {
        let text = self.content();
        let txn = self.doc.transact();
        text.get_string(&txn)
    }

    /// Content length in bytes.
    pub fn len(&self) -> u32 {
        let text = self.content();
        let txn = self.doc.transact();
        text.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn content(&self) -> TextRef {
        self.doc.get_or_insert_text(CONTENT_ROOT)
    }

    // ─── Notifications ────────────────────────────────────────────────

    pub fn subscribe<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: Fn(&DocumentChange) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for ReplicatedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReplicatedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedDocument")
            .field("len", &self.len())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

/// Yrs splits blocks at byte offsets and panics inside a character.
fn check_char_boundary(content: &str, index: u32) -> Result<(), DocError> {
    if content.is_char_boundary(index as usize) {
        Ok(())
    } else {
        Err(DocError::NotCharBoundary { index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use parking_lot::Mutex;

    fn doc_with(text: &str) -> (ReplicatedDocument, Update) {
        let mut doc = ReplicatedDocument::new();
        let update = doc.insert(0, text).unwrap();
        (doc, update)
    }

    fn recorder(doc: &mut ReplicatedDocument) -> Arc<Mutex<Vec<Origin>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        doc.subscribe(move |change| sink.lock().push(change.origin));
        seen
    }

    #[test]
    fn test_insert_and_delete() {
        let (mut doc, _) = doc_with("hello world");
        doc.delete(5, 6).unwrap();
        assert_eq!(doc.text(), "hello");
        assert_eq!(doc.len(), 5);
    }

    #[test]
    fn test_out_of_bounds_edits_rejected() {
        let (mut doc, _) = doc_with("abc");
        assert_eq!(doc.insert(4, "x"), Err(DocError::OutOfBounds { index: 4, len: 3 }));
        assert!(doc.delete(2, 2).is_err());
        assert!(doc.delete(u32::MAX, 2).is_err());
        assert_eq!(doc.text(), "abc");
    }

    #[test]
    fn test_edits_inside_multibyte_char_rejected() {
        let (mut doc, _) = doc_with("é");
        let seen = recorder(&mut doc);

        assert_eq!(doc.insert(1, "x"), Err(DocError::NotCharBoundary { index: 1 }));
        assert_eq!(doc.delete(1, 1), Err(DocError::NotCharBoundary { index: 1 }));
        assert_eq!(doc.delete(0, 1), Err(DocError::NotCharBoundary { index: 1 }));
        assert_eq!(doc.text(), "é");
        assert!(seen.lock().is_empty());

        doc.insert(2, "x").unwrap();
        doc.insert(0, "ü").unwrap();
        assert_eq!(doc.text(), "üéx");
        doc.delete(2, 2).unwrap();
        assert_eq!(doc.text(), "üx");
    }

    #[test]
    fn test_apply_is_idempotent() {
        let (_, update) = doc_with("abc");
        let mut replica = ReplicatedDocument::new();

        replica.apply_update(&update, Origin::Remote).unwrap();
        let once = replica.text();
        let sv_once = replica.state_vector();

        replica.apply_update(&update, Origin::Remote).unwrap();
        assert_eq!(replica.text(), once);
        assert_eq!(replica.state_vector(), sv_once);
    }

    #[test]
    fn test_apply_commutes() {
        let (_, u1) = doc_with("left");
        let (_, u2) = doc_with("right");

        let mut a = ReplicatedDocument::new();
        a.apply_update(&u1, Origin::Remote).unwrap();
        a.apply_update(&u2, Origin::Remote).unwrap();

        let mut b = ReplicatedDocument::new();
        b.apply_update(&u2, Origin::Remote).unwrap();
        b.apply_update(&u1, Origin::Remote).unwrap();

        assert_eq!(a.text(), b.text());
        assert_eq!(a.state_vector(), b.state_vector());
    }

    #[test]
    fn test_concurrent_inserts_at_same_position_converge() {
        let mut a = ReplicatedDocument::new();
        let mut b = ReplicatedDocument::new();

        let ua = a.insert(0, "X").unwrap();
        let ub = b.insert(0, "Y").unwrap();

        a.apply_update(&ub, Origin::Remote).unwrap();
        b.apply_update(&ua, Origin::Remote).unwrap();

        assert_eq!(a.text(), b.text());
        assert!(a.text() == "XY" || a.text() == "YX");
    }

    #[test]
    fn test_out_of_order_delivery_converges() {
        let mut source = ReplicatedDocument::new();
        let u1 = source.insert(0, "abc").unwrap();
        let u2 = source.insert(3, "def").unwrap();
        let u3 = source.delete(1, 1).unwrap();

        // The second insert arrives before the one it depends on.
        let mut replica = ReplicatedDocument::new();
        for u in [&u2, &u1, &u3] {
            replica.apply_update(u, Origin::Remote).unwrap();
        }

        assert_eq!(replica.text(), source.text());
        assert_eq!(replica.text(), "acdef");
    }

    #[test]
    fn test_malformed_update_rejected_without_corruption() {
        let (mut doc, _) = doc_with("stable");
        let seen = recorder(&mut doc);

        let garbage = Update::from_bytes(vec![0xFF, 0xFE, 0xFD]);
        let err = doc.apply_update(&garbage, Origin::Remote).unwrap_err();
        assert!(matches!(err, DocError::MalformedUpdate(_)));

        assert_eq!(doc.text(), "stable");
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_malformed_state_vector_rejected() {
        assert!(matches!(
            StateVector::decode(&[0xFF, 0xFF]),
            Err(DocError::MalformedStateVector(_))
        ));
    }

    #[test]
    fn test_diff_since_is_minimal_catch_up() {
        let (mut a, _) = doc_with("one ");
        let mut b = ReplicatedDocument::new();
        b.apply_update(&Update::from_bytes(a.encode_full()), Origin::Remote).unwrap();

        a.insert(4, "two").unwrap();

        let diff = a.diff_since(&b.state_vector());
        assert!(!diff.is_empty());
        b.apply_update(&diff, Origin::Remote).unwrap();
        assert_eq!(b.text(), "one two");

        let nothing = a.diff_since(&a.state_vector());
        assert!(nothing.is_empty());
    }

    #[test]
    fn test_state_vector_encode_decode() {
        let (doc, _) = doc_with("abc");
        let sv = doc.state_vector();
        assert!(!sv.is_empty());
        assert_eq!(StateVector::decode(&sv.encode()).unwrap(), sv);
        assert!(StateVector::default().is_empty());
    }

    #[test]
    fn test_restore_from_full_behaves_identically() {
        let (mut original, _) = doc_with("persisted");
        let mut restored = ReplicatedDocument::new();
        restored.restore_from_full(&original.encode_full()).unwrap();
        assert_eq!(restored.text(), original.text());

        // Same subsequent merge result on both.
        let (_, remote) = doc_with("!");
        original.apply_update(&remote, Origin::Remote).unwrap();
        restored.apply_update(&remote, Origin::Remote).unwrap();
        assert_eq!(restored.text(), original.text());
        assert_eq!(restored.state_vector(), original.state_vector());
    }

    #[test]
    fn test_notifications_carry_origin() {
        let mut doc = ReplicatedDocument::new();
        let seen = recorder(&mut doc);

        let update = doc.insert(0, "x").unwrap();
        let mut other = ReplicatedDocument::new();
        let other_seen = recorder(&mut other);
        other.apply_update(&update, Origin::Remote).unwrap();

        assert_eq!(*seen.lock(), vec![Origin::Local]);
        assert_eq!(*other_seen.lock(), vec![Origin::Remote]);
    }

    #[test]
    fn test_noop_edit_raises_no_notification() {
        let mut doc = ReplicatedDocument::new();
        let seen = recorder(&mut doc);

        let update = doc.insert(0, "").unwrap();
        assert!(update.is_empty());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_change_records_prior_state_vector() {
        let (mut doc, _) = doc_with("a");
        let before = doc.state_vector();

        let captured = Arc::new(Mutex::new(None));
        let sink = captured.clone();
        doc.subscribe(move |change| *sink.lock() = Some(change.before.clone()));

        doc.insert(1, "b").unwrap();
        assert_eq!(captured.lock().clone(), Some(before));
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let mut doc = ReplicatedDocument::new();
        let seen = Arc::new(Mutex::new(0usize));
        let sink = seen.clone();
        let id = doc.subscribe(move |_| *sink.lock() += 1);

        doc.insert(0, "a").unwrap();
        assert!(doc.unsubscribe(id));
        doc.insert(1, "b").unwrap();

        assert_eq!(*seen.lock(), 1);
        assert_eq!(doc.subscriber_count(), 0);
    }
}
