//! # cowrite-sync: Replication core for collaborative text sessions
//!
//! Keeps one shared document convergent across participants connected
//! through a publish/subscribe channel, tracks who is present, and keeps
//! the document durable between sessions.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────── SyncSession ────────────────────────────┐
//! │                                                                     │
//! │  ┌────────────────────┐   Local changes   ┌──────────────────────┐  │
//! │  │ ReplicatedDocument │ ────────────────► │ outbound queue       │──┼──► Transport
//! │  │ (Yrs text)         │ ◄──── Remote ──── │ inbound task         │◄─┼─── (pub/sub)
//! │  └─────────┬──────────┘                   └──────────────────────┘  │
//! │            │ encode_full / restore_from_full                        │
//! │  ┌─────────▼──────────┐   ┌───────────────────┐  ┌────────────────┐ │
//! │  │ Persistence        │   │ AwarenessRegistry │  │ Reconnection   │ │
//! │  │ (autosave, load)   │   │ (presence, LWW)   │  │ (status watch) │ │
//! │  └─────────┬──────────┘   └───────────────────┘  └────────────────┘ │
//! └────────────┼────────────────────────────────────────────────────────┘
//!              ▼
//!        SnapshotStore (RocksDB / memory)
//! ```
//!
//! ## Modules
//!
//! - [`document`]: CRDT document with origin-tagged change notifications
//! - [`awareness`]: Per-participant presence, last-writer-wins by clock
//! - [`protocol`]: Binary envelope for channel messages
//! - [`transport`]: Pub/sub transport trait and in-process channel
//! - [`storage`]: Snapshot stores (RocksDB, in-memory)
//! - [`persistence`]: Load on connect, periodic and final saves
//! - [`session`]: Session lifecycle and handshake
//! - [`reconnect`]: Resynchronization after connectivity changes
//! - [`subscription`]: Handler lists with explicit unsubscribe

pub mod awareness;
pub mod document;
pub mod persistence;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod storage;
pub mod subscription;
pub mod transport;

// Re-exports for convenience
pub use awareness::{
    AwarenessChange, AwarenessEntry, AwarenessError, AwarenessRegistry, AwarenessUpdate,
    CursorColor, ParticipantId, ParticipantState, Selection,
};
pub use document::{DocError, DocumentChange, Origin, ReplicatedDocument, StateVector, Update};
pub use persistence::PersistenceController;
pub use protocol::{MessageKind, PeerInfo, ProtocolError, SyncMessage, SyncStep};
pub use reconnect::{ConnectionObserver, ReconnectionController};
pub use session::{SessionConfig, SessionError, SessionState, SyncSession};
pub use storage::{
    MemorySnapshotStore, PersistedSnapshot, RocksSnapshotStore, SnapshotStore, StoreConfig,
    StoreError,
};
pub use subscription::SubscriptionId;
pub use transport::{ConnectionState, MemoryHub, MemoryTransport, Transport, TransportError};
