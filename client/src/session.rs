use std::cell::Cell;
use std::rc::Rc;

use pixelgrid_shared::SectorCoord;
use tracing::{info, warn};

use crate::clock::{Clock, SleepFn};
use crate::config::EngineConfig;
use crate::events::DirtyRegion;
use crate::ingest::UpdateIngest;
use crate::loader::{LoadOptions, Loader};
use crate::services::{
    FrameScheduler, NetworkClient, RealtimeTransport, StorageService, TransportEvent,
};
use crate::store::SharedStore;
use crate::sync::{SaveOutcome, SyncEngine};

/// Composition root: one store, loader, sync engine and ingest pipeline over a
/// single set of services.
pub struct Session<S, N, T> {
    config: EngineConfig,
    store: Rc<SharedStore>,
    loader: Loader<S, N>,
    sync: Rc<SyncEngine<S, T>>,
    ingest: UpdateIngest,
    sleep: Rc<SleepFn>,
    focus: Cell<Option<SectorCoord>>,
}

pub struct SessionServices<S, N, T> {
    pub clock: Rc<dyn Clock>,
    pub storage: Rc<S>,
    pub network: Rc<N>,
    pub transport: Rc<T>,
    pub frames: Rc<dyn FrameScheduler>,
    pub sleep: Rc<SleepFn>,
}

impl<S, N, T> Session<S, N, T>
where
    S: StorageService + 'static,
    N: NetworkClient,
    T: RealtimeTransport + 'static,
{
    pub fn new(config: EngineConfig, services: SessionServices<S, N, T>) -> Self {
        let store = Rc::new(SharedStore::new(
            config.store.clone(),
            Rc::clone(&services.clock),
        ));
        let loader = Loader::new(
            Rc::clone(&store),
            Rc::clone(&services.storage),
            services.network,
            config.loader.clone(),
        );
        let sync = Rc::new(SyncEngine::new(
            Rc::clone(&store),
            services.storage,
            services.transport,
            config.sync.clone(),
            config.reconnect.clone(),
        ));
        let ingest = UpdateIngest::new(
            sync.clone(),
            services.frames,
            services.clock,
            config.ingest.clone(),
        );
        Self {
            config,
            store,
            loader,
            sync,
            ingest,
            sleep: services.sleep,
            focus: Cell::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Rc<SharedStore> {
        &self.store
    }

    pub fn loader(&self) -> &Loader<S, N> {
        &self.loader
    }

    pub fn sync(&self) -> &SyncEngine<S, T> {
        &self.sync
    }

    pub fn ingest(&self) -> &UpdateIngest {
        &self.ingest
    }

    /// Initial bulk load followed by the first transport connect. Returns the pixels loaded.
    pub async fn start(&self) -> usize {
        let loaded = self
            .loader
            .load_data(LoadOptions::from_config(&self.config.loader))
            .await;
        self.connect().await;
        info!(loaded, "session started");
        loaded
    }

    /// Open (or reopen) the transport, retrying on the reconnect schedule.
    pub async fn connect(&self) -> bool {
        self.sync.connect(&*self.sleep).await
    }

    pub async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.sync.on_connected().await,
            TransportEvent::Close => {
                self.sync.on_disconnected();
                self.sync.reconnect(&*self.sleep).await;
            }
            TransportEvent::Error(reason) => {
                warn!(%reason, "transport error");
                self.sync.on_disconnected();
                self.sync.reconnect(&*self.sleep).await;
            }
            TransportEvent::Message(message) => {
                self.ingest.receive(&message);
            }
        }
    }

    /// Frame-scheduler callback.
    pub fn on_frame(&self) -> Option<DirtyRegion> {
        self.ingest.on_frame()
    }

    /// Point inbound updates at `sector`, pin it against eviction and make sure it is loaded.
    pub async fn set_focus_sector(&self, sector: SectorCoord) -> usize {
        if let Some(previous) = self.focus.replace(Some(sector))
            && previous != sector
        {
            self.store.unpin(previous);
        }
        self.ingest.set_focus(sector);
        self.store.pin(sector);
        self.loader.lazy_load_sector(sector).await
    }

    /// Replace the pinned set with what the presentation layer currently shows.
    /// The focus sector stays pinned.
    pub fn set_visible_sectors(&self, sectors: impl IntoIterator<Item = SectorCoord>) {
        self.store
            .set_pinned_sectors(sectors.into_iter().chain(self.focus.get()));
    }

    pub async fn run_autosave(&self) {
        self.sync.run_autosave(&*self.sleep).await;
    }

    pub async fn run_offline_flush(&self) {
        self.sync.run_offline_flush(&*self.sleep).await;
    }

    /// Stop the background loops and save whatever is still dirty.
    pub async fn shutdown(&self) -> SaveOutcome {
        self.sync.shutdown();
        let outcome = self.sync.save_immediately().await;
        info!(?outcome, "session shut down");
        outcome
    }
}
