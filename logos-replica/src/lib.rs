//! # logos-replica: replicated document sync
//!
//! Clients keep a content-addressed commit graph per document and exchange
//! commits through a relay that sequences and rebroadcasts them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ Coordinator  │ ◄─────────────────► │ SyncServer   │
//! │ (per client) │     JSON events     │ (relay)      │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ CommitGraph  │                     │ DocumentRelay│
//! │ MergeEngine  │                     │ (per doc)    │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ Commit       │                     │ DocStore     │
//! │ Repository   │                     │ (mem/rocks)  │
//! └──────────────┘                     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`hash`]: content refs for commits
//! - [`delta`]: structural JSON deltas (diff / patch / flatten)
//! - [`graph`]: commit DAG, heads, batch validation
//! - [`merge`]: deterministic convergence of divergent heads
//! - [`coordinator`]: client-side orchestration
//! - [`protocol`]: wire events shared by client and relay
//! - [`storage`]: server-side document stores
//! - [`relay`] / [`connection`] / [`server`]: the relay

pub mod auth;
pub mod client;
pub mod commit;
pub mod connection;
pub mod coordinator;
pub mod delta;
pub mod error;
pub mod graph;
pub mod hash;
pub mod merge;
pub mod metadata;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod repository;
pub mod server;
pub mod storage;
pub mod subscription;

// Re-exports for convenience
pub use auth::{AllowAnonymous, AuthError, Authenticator, Identity, StaticTokens};
pub use client::{RemoteConfig, WebSocketConnector};
pub use commit::{AckCommit, Commit, RefError, ServerMetadata, Snapshot, SyncId};
pub use coordinator::{
    Coordinator, CoordinatorConfig, Phase, Remote, RemoteConnector, RemoteParams,
};
pub use delta::{Delta, DeltaError};
pub use error::{ErrorCode, SyncError};
pub use graph::{validate_batch, CommitGraph, GraphError};
pub use hash::{compute_ref, RefScheme};
pub use merge::{merge_fn, KeyWiseMerge, MergeEngine, MergeFn};
pub use metadata::MetaValue;
pub use protocol::{
    ClientInfo, ConnectState, ProtocolError, ReadState, SaveState, SyncEvent, SyncStatus,
};
pub use registry::{CoordinatorRegistry, SessionKey};
pub use relay::{DocumentRelay, RelayRegistry, RelayStats};
pub use repository::{CommitRepository, MemoryRepository};
pub use server::{LocalConnector, ServerConfig, ServerError, SyncServer};
pub use storage::{
    DocStore, DocStoreFactory, MemoryDocStore, MemoryStoreFactory, RocksDocStore,
    RocksStoreFactory, StoreConfig, StoreError,
};
pub use subscription::Subscription;
