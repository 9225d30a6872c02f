//! Client-resident synchronization engine for a sparse, sector-partitioned pixel grid.
//!
//! The engine is single-threaded: shared state lives behind `Rc`/`RefCell`, and the
//! only suspension points are storage and network I/O. Browser bindings for the
//! service traits are in [`web`] on `wasm32` targets.

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod ingest;
pub mod loader;
pub mod services;
pub mod session;
pub mod store;
pub mod sync;

#[cfg(target_arch = "wasm32")]
pub mod web;

#[cfg(test)]
mod support;

pub use clock::{Clock, SleepFn, SystemClock};
pub use config::EngineConfig;
pub use error::{PersistenceError, SubscriberError, TransportError};
pub use events::{ChangeAction, DirtyRegion, EventBus, Origin, PixelChange};
pub use ingest::{RemoteSink, UpdateIngest};
pub use loader::{LoadOptions, LoadSource, Loader, LoadingState};
pub use services::{
    FrameScheduler, MemoryStorage, NetworkClient, RealtimeTransport, StorageService,
    TransportEvent,
};
pub use session::{Session, SessionServices};
pub use store::{PixelStore, SharedStore};
pub use sync::{ConnectionStatus, SaveOutcome, SyncEngine, SyncState};
