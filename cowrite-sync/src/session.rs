//! Sync session: binds one replicated document and one awareness
//! registry to a transport channel and a snapshot store.
//!
//! ## Lifecycle
//!
//! ```text
//!                connect()                    first remote update
//! Disconnected ───────────► Handshaking ─────────────────────────► Synced
//!      ▲                         │                                    │
//!      └──── transport drop / broadcast failure / disconnect() ──────┘
//!                  (state kept; handshake re-runs on reconnect)
//! ```
//!
//! ## Handshake
//!
//! ```text
//! Joiner                                   Peer
//!   │── Step1 (state vector) ─────────────►│
//!   │── catch-up diff (offline edits) ────►│
//!   │◄──────────── Step2 (diff_since sv) ──│
//!   │◄───── Step1Reply (peer's own sv) ────│
//!   │◄──────────── awareness re-announce ──│
//!   │── Step2 (diff_since peer sv) ───────►│
//! ```
//!
//! The `Step1Reply` covers edits the joiner broadcast while nobody was
//! listening. It is answered with a `Step2` only, never another request.
//!
//! ## Echo suppression
//!
//! Local edits and remote updates go through the same document, but the
//! session's own subscription only queues changes whose origin is
//! [`Origin::Local`]. A remote update is applied with `Origin::Remote`
//! and therefore never sent back out.
//!
//! ## Locking
//!
//! Document and awareness live behind one `parking_lot::Mutex` that is
//! never held across an `.await`. Subscription handlers run while it is
//! held and must not call back into the session.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use yrs::{TextRef, TransactionMut};

use async_trait::async_trait;

use crate::awareness::{AwarenessChange, AwarenessRegistry, ParticipantId, ParticipantState};
use crate::document::{
    DocError, DocumentChange, Origin, ReplicatedDocument, StateVector, Update,
};
use crate::persistence::PersistenceController;
use crate::protocol::{MessageKind, PeerInfo, ProtocolError, SyncMessage, SyncStep};
use crate::reconnect::{ConnectionObserver, ReconnectionController};
use crate::storage::{SnapshotStore, StoreError};
use crate::subscription::SubscriptionId;
use crate::transport::{ConnectionState, Transport, TransportError};

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

/// Session timing configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between snapshot saves while the document is dirty (default: 30s)
    pub autosave_interval: Duration,
    /// Remote awareness entries silent for this long are dropped (default: 30s)
    pub awareness_timeout: Duration,
    /// How often stale awareness entries are swept (default: 3s)
    pub awareness_check_interval: Duration,
    /// Save a final snapshot on disconnect (default: true)
    pub save_on_disconnect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            autosave_interval: Duration::from_secs(30),
            awareness_timeout: Duration::from_secs(30),
            awareness_check_interval: Duration::from_secs(3),
            save_on_disconnect: true,
        }
    }
}

impl SessionConfig {
    /// Create config for testing (short timers).
    pub fn for_testing() -> Self {
        Self {
            autosave_interval: Duration::from_millis(50),
            awareness_timeout: Duration::from_millis(300),
            awareness_check_interval: Duration::from_millis(20),
            save_on_disconnect: true,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// State & errors
// ───────────────────────────────────────────────────────────────────

/// Replication state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not exchanging updates. Local edits are kept and sent on reconnect.
    Disconnected,
    /// Handshake sent, no remote update received yet.
    Handshaking,
    /// At least one remote update applied since the handshake.
    Synced,
}

/// Session errors.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    Transport(TransportError),
    Doc(DocError),
    Protocol(ProtocolError),
    Store(StoreError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Transport(e) => write!(f, "Transport error: {e}"),
            SessionError::Doc(e) => write!(f, "Document error: {e}"),
            SessionError::Protocol(e) => write!(f, "Protocol error: {e}"),
            SessionError::Store(e) => write!(f, "Store error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Transport(e) => Some(e),
            SessionError::Doc(e) => Some(e),
            SessionError::Protocol(e) => Some(e),
            SessionError::Store(e) => Some(e),
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        SessionError::Transport(e)
    }
}

impl From<DocError> for SessionError {
    fn from(e: DocError) -> Self {
        SessionError::Doc(e)
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Protocol(e)
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        SessionError::Store(e)
    }
}

// ───────────────────────────────────────────────────────────────────
// Shared state
// ───────────────────────────────────────────────────────────────────

/// A local change waiting to be broadcast.
enum Outbound {
    Doc { before: StateVector, update: Update },
    Awareness(Vec<u8>),
}

struct SessionCore {
    document: ReplicatedDocument,
    awareness: AwarenessRegistry,
    /// Earliest state vector whose successors were never broadcast.
    unsent_since: Option<StateVector>,
}

impl SessionCore {
    /// Record local operations after `before` as unsent. Keeps the
    /// earliest watermark: later ones are already covered by it.
    fn mark_unsent(&mut self, before: StateVector) {
        if self.unsent_since.is_none() {
            self.unsent_since = Some(before);
        }
    }
}

/// State reachable from background tasks.
struct SessionShared<T: Transport> {
    session_id: String,
    identity: PeerInfo,
    config: SessionConfig,
    transport: Arc<T>,
    core: Mutex<SessionCore>,
    outbound: Arc<Mutex<VecDeque<Outbound>>>,
    state: watch::Sender<SessionState>,
}

impl<T: Transport> SessionShared<T> {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn mark_disconnected(&self) {
        let changed = self.state.send_if_modified(|s| {
            if *s == SessionState::Disconnected {
                false
            } else {
                *s = SessionState::Disconnected;
                true
            }
        });
        if changed {
            log::info!("Session {} disconnected", self.session_id);
        }
    }

    fn mark_synced(&self) {
        let changed = self.state.send_if_modified(|s| {
            if *s == SessionState::Handshaking {
                *s = SessionState::Synced;
                true
            } else {
                false
            }
        });
        if changed {
            log::info!("Session {} synced", self.session_id);
        }
    }

    async fn send(&self, msg: SyncMessage) -> Result<(), SessionError> {
        let frame = msg.encode()?;
        self.transport.broadcast(msg.kind, frame).await?;
        Ok(())
    }

    // ─── Outbound ─────────────────────────────────────────────────────

    /// Move queued document changes into the unsent watermark and drop
    /// queued awareness deltas (they are re-announced after the handshake).
    fn absorb_pending(&self, core: &mut SessionCore) {
        let pending: Vec<Outbound> = self.outbound.lock().drain(..).collect();
        for item in pending {
            if let Outbound::Doc { before, .. } = item {
                core.mark_unsent(before);
            }
        }
    }

    /// Broadcast queued local changes.
    ///
    /// While disconnected, or when a broadcast fails, document changes are
    /// kept as unsent for the next handshake.
    async fn flush_outbound(&self) {
        loop {
            let next = self.outbound.lock().pop_front();
            let Some(item) = next else {
                break;
            };

            if self.state() == SessionState::Disconnected {
                if let Outbound::Doc { before, .. } = item {
                    log::trace!("Session {} offline, deferring local update", self.session_id);
                    self.core.lock().mark_unsent(before);
                }
                continue;
            }

            match item {
                Outbound::Doc { before, update } => {
                    let len = update.len();
                    let msg =
                        SyncMessage::update(self.identity.peer_id, &self.session_id, update.into_bytes());
                    match self.send(msg).await {
                        Ok(()) => log::trace!("Broadcast local update ({len} bytes)"),
                        Err(e) => {
                            log::warn!("Local update not delivered, keeping for resync: {e}");
                            self.core.lock().mark_unsent(before);
                            self.mark_disconnected();
                        }
                    }
                }
                Outbound::Awareness(bytes) => {
                    let msg = SyncMessage::awareness(self.identity.peer_id, &self.session_id, bytes);
                    if let Err(e) = self.send(msg).await {
                        log::debug!("Awareness update not delivered: {e}");
                        self.mark_disconnected();
                    }
                }
            }
        }
    }

    // ─── Handshake ────────────────────────────────────────────────────

    /// Announce our state vector, push offline edits and re-announce
    /// presence. Moves the session to `Handshaking`.
    async fn handshake(&self) -> Result<(), SessionError> {
        let (state_vector, catch_up) = {
            let mut core = self.core.lock();
            self.absorb_pending(&mut core);
            let catch_up = core.unsent_since.take().map(|since| {
                let diff = core.document.diff_since(&since);
                (since, diff)
            });
            (core.document.state_vector(), catch_up)
        };

        self.state.send_replace(SessionState::Handshaking);
        log::debug!("Session {} handshaking", self.session_id);

        let step1 =
            SyncMessage::sync_step1(self.identity.peer_id, &self.session_id, state_vector.encode());
        if let Err(e) = self.send(step1).await {
            if let Some((since, _)) = catch_up {
                self.core.lock().unsent_since = Some(since);
            }
            self.mark_disconnected();
            return Err(e);
        }

        if let Some((since, diff)) = catch_up {
            if !diff.is_empty() {
                let len = diff.len();
                let msg = SyncMessage::update(self.identity.peer_id, &self.session_id, diff.into_bytes());
                if let Err(e) = self.send(msg).await {
                    // The restored watermark predates anything marked since.
                    self.core.lock().unsent_since = Some(since);
                    self.mark_disconnected();
                    return Err(e);
                }
                log::info!("Session {} sent catch-up diff ({len} bytes)", self.session_id);
            }
        }

        self.core.lock().awareness.renew_local();
        self.flush_outbound().await;
        Ok(())
    }

    // ─── Inbound ──────────────────────────────────────────────────────

    async fn handle_frame(&self, frame: &[u8]) {
        let msg = match SyncMessage::decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping malformed frame on session {}: {e}", self.session_id);
                return;
            }
        };

        if msg.sender == self.identity.peer_id {
            log::trace!("Ignoring own frame");
            return;
        }
        if msg.session_id != self.session_id {
            log::debug!("Ignoring frame for session {}", msg.session_id);
            return;
        }

        match (msg.kind, msg.sync_step) {
            (MessageKind::DocUpdate, Some(SyncStep::Step1 | SyncStep::Step1Reply)) => {
                self.answer_state_vector(msg).await
            }
            (MessageKind::DocUpdate, _) => self.apply_remote(msg),
            (MessageKind::AwarenessUpdate, _) => {
                let change = self
                    .core
                    .lock()
                    .awareness
                    .apply_remote_update(&msg.payload, Origin::Remote);
                if !change.is_empty() {
                    log::trace!(
                        "Awareness from {}: +{} ~{} -{}",
                        msg.sender,
                        change.added.len(),
                        change.updated.len(),
                        change.removed.len()
                    );
                }
            }
        }
    }

    /// Answer a peer's state vector with what it is missing. A `Step1` also
    /// gets our own state vector back as a `Step1Reply`, so edits the
    /// requester never saw flow the other way, and a presence re-announce
    /// so the newcomer sees us.
    async fn answer_state_vector(&self, msg: SyncMessage) {
        let remote_sv = match StateVector::decode(&msg.payload) {
            Ok(sv) => sv,
            Err(e) => {
                log::warn!("Dropping handshake from {}: {e}", msg.sender);
                return;
            }
        };
        let is_request = msg.is_handshake_request();

        let (diff, own_sv) = {
            let core = self.core.lock();
            (core.document.diff_since(&remote_sv), core.document.state_vector())
        };
        log::debug!("Answering state vector from {} with {} bytes", msg.sender, diff.len());

        let step2 = SyncMessage::sync_step2(self.identity.peer_id, &self.session_id, diff.into_bytes());
        if let Err(e) = self.send(step2).await {
            log::warn!("Failed to answer handshake from {}: {e}", msg.sender);
            self.mark_disconnected();
            return;
        }
        if !is_request {
            return;
        }

        let reply =
            SyncMessage::sync_step1_reply(self.identity.peer_id, &self.session_id, own_sv.encode());
        if let Err(e) = self.send(reply).await {
            log::warn!("Failed to send state vector to {}: {e}", msg.sender);
            self.mark_disconnected();
            return;
        }

        self.core.lock().awareness.renew_local();
        self.flush_outbound().await;
    }

    fn apply_remote(&self, msg: SyncMessage) {
        let update = Update::from(msg.payload);
        let result = self.core.lock().document.apply_update(&update, Origin::Remote);
        match result {
            Ok(()) => {
                log::trace!("Applied remote update from {} ({} bytes)", msg.sender, update.len());
                self.mark_synced();
            }
            Err(e) => log::warn!("Rejected update from {}: {e}", msg.sender),
        }
    }

    // ─── Awareness upkeep ─────────────────────────────────────────────

    async fn sweep_awareness(&self) {
        {
            let mut core = self.core.lock();
            core.awareness.expire_stale(self.config.awareness_timeout);
            if self.state() != SessionState::Disconnected
                && core.awareness.local_needs_renewal(self.config.awareness_timeout / 2)
            {
                core.awareness.renew_local();
            }
        }
        self.flush_outbound().await;
    }
}

#[async_trait]
impl<T: Transport> ConnectionObserver for SessionShared<T> {
    async fn connection_restored(&self) {
        if let Err(e) = self.handshake().await {
            log::warn!("Resync of session {} failed: {e}", self.session_id);
        }
    }

    async fn connection_lost(&self, _state: ConnectionState) {
        self.mark_disconnected();
    }
}

async fn run_inbound<T: Transport>(shared: Arc<SessionShared<T>>, mut inbox: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = inbox.recv().await {
        shared.handle_frame(&frame).await;
    }
    log::debug!("Inbound channel closed for session {}", shared.session_id);
}

async fn run_awareness_sweeper<T: Transport>(shared: Weak<SessionShared<T>>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.sweep_awareness().await;
    }
}

// ───────────────────────────────────────────────────────────────────
// Session
// ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Runtime {
    active: bool,
    tasks: Vec<JoinHandle<()>>,
    reconnect: Option<ReconnectionController>,
}

/// One participant's replication session for one session id.
///
/// The transport and store are injected; the session owns its document
/// and awareness registry exclusively.
pub struct SyncSession<T: Transport> {
    shared: Arc<SessionShared<T>>,
    persistence: Mutex<PersistenceController>,
    runtime: Mutex<Runtime>,
}

impl<T: Transport> SyncSession<T> {
    pub fn new(
        session_id: impl Into<String>,
        identity: PeerInfo,
        transport: Arc<T>,
        store: Arc<dyn SnapshotStore>,
        config: SessionConfig,
    ) -> Self {
        let session_id = session_id.into();
        let outbound: Arc<Mutex<VecDeque<Outbound>>> = Arc::new(Mutex::new(VecDeque::new()));
        let persistence =
            PersistenceController::new(store, session_id.clone(), config.autosave_interval);

        let mut document = ReplicatedDocument::new();
        let queue = outbound.clone();
        let dirty = persistence.dirty_flag();
        document.subscribe(move |change: &DocumentChange| {
            dirty.store(true, Ordering::SeqCst);
            if change.origin == Origin::Local {
                queue.lock().push_back(Outbound::Doc {
                    before: change.before.clone(),
                    update: change.update.clone(),
                });
            }
        });

        let mut awareness = AwarenessRegistry::new(identity.peer_id);
        let queue = outbound.clone();
        awareness.subscribe(move |change: &AwarenessChange| {
            if change.origin == Origin::Local {
                if let Some(bytes) = &change.update {
                    queue.lock().push_back(Outbound::Awareness(bytes.clone()));
                }
            }
        });

        let (state, _) = watch::channel(SessionState::Disconnected);

        Self {
            shared: Arc::new(SessionShared {
                session_id,
                identity,
                config,
                transport,
                core: Mutex::new(SessionCore {
                    document,
                    awareness,
                    unsent_since: None,
                }),
                outbound,
                state,
            }),
            persistence: Mutex::new(persistence),
            runtime: Mutex::new(Runtime::default()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn identity(&self) -> &PeerInfo {
        &self.shared.identity
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.shared.transport
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// True between a successful `connect` and `disconnect`, including
    /// while the transport is temporarily down.
    pub fn is_active(&self) -> bool {
        self.runtime.lock().active
    }

    /// True if local edits are waiting for the next handshake.
    pub fn has_unsent_changes(&self) -> bool {
        self.shared.core.lock().unsent_since.is_some() || !self.shared.outbound.lock().is_empty()
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Load the snapshot, join the channel and start the handshake.
    ///
    /// A missing or unreadable snapshot starts from an empty document.
    /// If the transport refuses the connection the session stays
    /// `Disconnected` and the error is returned; calling `connect` again
    /// retries. Calling it on an active session does nothing.
    pub async fn connect(&self) -> Result<(), SessionError> {
        {
            let mut runtime = self.runtime.lock();
            if runtime.active {
                log::debug!("Session {} already connected", self.shared.session_id);
                return Ok(());
            }
            runtime.active = true;
        }

        self.load_snapshot();

        let inbox = self.shared.transport.on_message();
        if let Err(e) = self
            .shared
            .transport
            .connect(&self.shared.session_id, &self.shared.identity)
            .await
        {
            log::warn!("Failed to connect session {}: {e}", self.shared.session_id);
            self.runtime.lock().active = false;
            return Err(e.into());
        }
        log::info!(
            "Session {} joined as {} ({})",
            self.shared.session_id,
            self.shared.identity.name,
            self.shared.identity.peer_id
        );

        let mut tasks = vec![tokio::spawn(run_inbound(self.shared.clone(), inbox))];
        let reconnect = ReconnectionController::spawn(
            self.shared.transport.on_connection_state_change(),
            self.shared.clone(),
        );

        {
            let mut core = self.shared.core.lock();
            if core.awareness.local_state().is_none() {
                core.awareness
                    .set_local_state(Some(ParticipantState::for_peer(&self.shared.identity)));
            }
        }
        if let Err(e) = self.shared.handshake().await {
            log::warn!(
                "Handshake for session {} failed, waiting for reconnect: {e}",
                self.shared.session_id
            );
        }

        let period = self.shared.config.awareness_check_interval;
        if period.is_zero() {
            log::warn!("Awareness sweep disabled for session {}: zero interval", self.shared.session_id);
        } else {
            tasks.push(tokio::spawn(run_awareness_sweeper(
                Arc::downgrade(&self.shared),
                period,
            )));
        }

        let weak = Arc::downgrade(&self.shared);
        self.persistence.lock().start_autosave(move || {
            weak.upgrade()
                .map(|shared| shared.core.lock().document.encode_full())
        });

        let mut runtime = self.runtime.lock();
        runtime.tasks = tasks;
        runtime.reconnect = Some(reconnect);
        Ok(())
    }

    /// Leave the channel, save a final snapshot and stop every background
    /// task. Safe to call repeatedly; only the first call does anything.
    pub async fn disconnect(&self) {
        let (tasks, reconnect) = {
            let mut runtime = self.runtime.lock();
            if !runtime.active {
                return;
            }
            runtime.active = false;
            (std::mem::take(&mut runtime.tasks), runtime.reconnect.take())
        };

        if let Some(reconnect) = reconnect {
            reconnect.stop();
        }
        for task in tasks {
            task.abort();
        }
        self.persistence.lock().stop_autosave();

        if self.shared.state() != SessionState::Disconnected {
            let leave = self.shared.core.lock().awareness.leave_update();
            if let Some(bytes) = leave {
                let msg = SyncMessage::awareness(self.shared.identity.peer_id, &self.shared.session_id, bytes);
                if let Err(e) = self.shared.send(msg).await {
                    log::debug!("Leave notice not delivered: {e}");
                }
            }
        }

        {
            let mut core = self.shared.core.lock();
            self.shared.absorb_pending(&mut core);
        }

        if self.shared.config.save_on_disconnect {
            if let Err(e) = self.save_now() {
                log::debug!("Final save for session {} skipped: {e}", self.shared.session_id);
            }
        }

        if let Err(e) = self.shared.transport.disconnect().await {
            log::warn!("Transport disconnect for session {} failed: {e}", self.shared.session_id);
        }

        self.shared.state.send_replace(SessionState::Disconnected);
        log::info!("Session {} closed", self.shared.session_id);
    }

    fn load_snapshot(&self) {
        let persistence = self.persistence.lock();
        let mut core = self.shared.core.lock();
        let before = core.document.state_vector();
        if persistence.load_into(&mut core.document) && core.document.state_vector() != before {
            // Content that may never have reached the channel.
            core.unsent_since = Some(StateVector::default());
        }
    }

    /// Save a snapshot immediately.
    pub fn save_now(&self) -> Result<(), SessionError> {
        let persistence = self.persistence.lock();
        let core = self.shared.core.lock();
        persistence.save_now(&core.document)?;
        Ok(())
    }

    pub fn is_autosaving(&self) -> bool {
        self.persistence.lock().is_autosaving()
    }

    // ─── Local edits ──────────────────────────────────────────────────

    /// Insert text at a byte offset and broadcast the change.
    pub async fn insert_text(&self, index: u32, chunk: &str) -> Result<(), SessionError> {
        self.shared.core.lock().document.insert(index, chunk)?;
        self.shared.flush_outbound().await;
        Ok(())
    }

    /// Delete a byte range and broadcast the change.
    pub async fn delete_text(&self, index: u32, len: u32) -> Result<(), SessionError> {
        self.shared.core.lock().document.delete(index, len)?;
        self.shared.flush_outbound().await;
        Ok(())
    }

    /// Run an arbitrary edit in one transaction and broadcast the
    /// operations it produced.
    ///
    /// Offsets are not checked here. Yrs panics on an offset inside a
    /// multi-byte character, so prefer [`insert_text`](Self::insert_text)
    /// and [`delete_text`](Self::delete_text) for untrusted positions.
    pub async fn edit<R, F>(&self, edit: F) -> R
    where
        F: FnOnce(&TextRef, &mut TransactionMut<'_>) -> R,
    {
        let (result, _) = self.shared.core.lock().document.capture_local_change(edit);
        self.shared.flush_outbound().await;
        result
    }

    /// Replace the local participant's presence and broadcast it.
    /// `None` withdraws it.
    pub async fn set_awareness(&self, state: Option<ParticipantState>) {
        self.shared.core.lock().awareness.set_local_state(state);
        self.shared.flush_outbound().await;
    }

    /// Move the local caret, keeping the rest of the presence.
    pub async fn set_cursor(&self, cursor: Option<u32>) {
        {
            let mut core = self.shared.core.lock();
            let mut state = core
                .awareness
                .local_state()
                .cloned()
                .unwrap_or_else(|| ParticipantState::for_peer(&self.shared.identity));
            state.cursor = cursor;
            core.awareness.set_local_state(Some(state));
        }
        self.shared.flush_outbound().await;
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub fn text(&self) -> String {
        self.shared.core.lock().document.text()
    }

    pub fn state_vector(&self) -> StateVector {
        self.shared.core.lock().document.state_vector()
    }

    /// Borrow the document for reading.
    pub fn with_document<R>(&self, f: impl FnOnce(&ReplicatedDocument) -> R) -> R {
        f(&self.shared.core.lock().document)
    }

    /// Active participants, local included, ordered by id.
    pub fn awareness_entries(&self) -> Vec<(ParticipantId, ParticipantState)> {
        self.shared.core.lock().awareness.active_entries()
    }

    pub fn local_awareness(&self) -> Option<ParticipantState> {
        self.shared.core.lock().awareness.local_state().cloned()
    }

    // ─── Subscriptions ────────────────────────────────────────────────

    /// Observe document changes from both origins.
    pub fn subscribe_document<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&DocumentChange) + Send + Sync + 'static,
    {
        self.shared.core.lock().document.subscribe(handler)
    }

    pub fn unsubscribe_document(&self, id: SubscriptionId) -> bool {
        self.shared.core.lock().document.unsubscribe(id)
    }

    /// Observe changes to the active participant set.
    pub fn subscribe_awareness<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&AwarenessChange) + Send + Sync + 'static,
    {
        self.shared.core.lock().awareness.subscribe(handler)
    }

    pub fn unsubscribe_awareness(&self, id: SubscriptionId) -> bool {
        self.shared.core.lock().awareness.unsubscribe(id)
    }

    /// Number of document subscribers, the session's own included.
    pub fn document_subscriber_count(&self) -> usize {
        self.shared.core.lock().document.subscriber_count()
    }
}

impl<T: Transport> Drop for SyncSession<T> {
    fn drop(&mut self) {
        let runtime = self.runtime.get_mut();
        for task in runtime.tasks.drain(..) {
            task.abort();
        }
        runtime.reconnect.take();
    }
}

impl<T: Transport> std::fmt::Debug for SyncSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("session_id", &self.shared.session_id)
            .field("peer_id", &self.shared.identity.peer_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySnapshotStore;
    use crate::transport::MemoryHub;

    fn session(hub: &MemoryHub, store: Arc<MemorySnapshotStore>, name: &str) -> SyncSession<crate::transport::MemoryTransport> {
        SyncSession::new(
            "s1",
            PeerInfo::new(name),
            Arc::new(hub.transport()),
            store,
            SessionConfig::for_testing(),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.autosave_interval, Duration::from_secs(30));
        assert_eq!(config.awareness_timeout, Duration::from_secs(30));
        assert!(config.save_on_disconnect);
    }

    #[test]
    fn test_new_session_is_disconnected() {
        let hub = MemoryHub::new();
        let s = session(&hub, Arc::new(MemorySnapshotStore::new()), "Alice");
        assert_eq!(s.state(), SessionState::Disconnected);
        assert!(!s.is_active());
        assert_eq!(s.text(), "");
    }

    #[tokio::test]
    async fn test_connect_alone_stays_handshaking() {
        let hub = MemoryHub::new();
        let s = session(&hub, Arc::new(MemorySnapshotStore::new()), "Alice");

        s.connect().await.unwrap();
        settle().await;

        assert!(s.is_active());
        assert_eq!(s.state(), SessionState::Handshaking);
        assert_eq!(s.transport().sent(MessageKind::DocUpdate), 1);
        s.disconnect().await;
    }

    #[tokio::test]
    async fn test_edits_before_connect_are_sent_on_handshake() {
        let hub = MemoryHub::new();
        let a = session(&hub, Arc::new(MemorySnapshotStore::new()), "Alice");
        let b = session(&hub, Arc::new(MemorySnapshotStore::new()), "Bob");

        a.insert_text(0, "offline").await.unwrap();
        assert!(a.has_unsent_changes());

        b.connect().await.unwrap();
        a.connect().await.unwrap();
        settle().await;

        assert_eq!(b.text(), "offline");
        assert!(!a.has_unsent_changes());
        a.disconnect().await;
        b.disconnect().await;
    }

    #[tokio::test]
    async fn test_out_of_bounds_edit_is_rejected() {
        let hub = MemoryHub::new();
        let s = session(&hub, Arc::new(MemorySnapshotStore::new()), "Alice");
        let err = s.insert_text(5, "x").await.unwrap_err();
        assert!(matches!(err, SessionError::Doc(DocError::OutOfBounds { .. })));
        assert!(!s.has_unsent_changes());
    }

    #[tokio::test]
    async fn test_connect_sets_initial_presence() {
        let hub = MemoryHub::new();
        let s = session(&hub, Arc::new(MemorySnapshotStore::new()), "Alice");
        s.connect().await.unwrap();

        let local = s.local_awareness().unwrap();
        assert_eq!(local.name, "Alice");
        assert_eq!(local.color, s.identity().color);
        s.disconnect().await;
    }

    #[tokio::test]
    async fn test_set_cursor_keeps_identity() {
        let hub = MemoryHub::new();
        let s = session(&hub, Arc::new(MemorySnapshotStore::new()), "Alice");
        s.set_cursor(Some(3)).await;

        let local = s.local_awareness().unwrap();
        assert_eq!(local.cursor, Some(3));
        assert_eq!(local.name, "Alice");
    }

    #[test]
    fn test_error_display() {
        let err = SessionError::from(TransportError::NotConnected);
        assert_eq!(err.to_string(), "Transport error: Not connected");
        assert!(std::error::Error::source(&err).is_some());
    }
}
