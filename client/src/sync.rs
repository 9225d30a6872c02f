//! Persistence, delivery and conflict handling for local and remote pixel updates.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;

use pixelgrid_shared::codec::encode;
use pixelgrid_shared::{InboundUpdate, LocalCoord, PixelKey, SectorCoord, WireUpdate};
use tracing::{debug, info, warn};

use crate::clock::SleepFn;
use crate::config::{ACTIVE_SECTORS_ITEM, ReconnectPolicy, SyncConfig};
use crate::error::TransportError;
use crate::ingest::RemoteSink;
use crate::services::{RealtimeTransport, StorageService};
use crate::store::{PendingUpdate, SharedStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Saving,
    /// Idle, with undelivered batches waiting in the offline queue.
    OfflineQueued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Live,
    Reconnecting,
    /// Reconnect attempts exhausted. A later `connect` or `reconnect` starts a fresh schedule.
    Failed,
}

/// Encoded-ready updates for one sector channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundBatch {
    pub sector: SectorCoord,
    pub updates: Vec<WireUpdate>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub persisted_sectors: usize,
    pub failed_sectors: usize,
    pub cleared: usize,
    pub sent_updates: usize,
    pub queued_updates: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved(SaveReport),
    NothingToSave,
    /// Another save or flush cycle was already running.
    Busy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub saves: u64,
    pub rejected_saves: u64,
    pub persisted_sectors: u64,
    pub failed_persists: u64,
    pub sent_updates: u64,
    pub queued_updates: u64,
    pub dropped_updates: u64,
    pub loopback_suppressed: u64,
    pub stale_discarded: u64,
    pub remote_applied: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncState {
    pub phase: SyncPhase,
    pub connection: ConnectionStatus,
    pub dirty_count: usize,
    pub offline_batches: usize,
    pub offline_updates: usize,
    pub last_save_ms: Option<i64>,
    pub last_error: Option<String>,
    pub stats: SyncStats,
}

#[derive(Debug, Default)]
struct SyncInner {
    offline: VecDeque<OutboundBatch>,
    offline_updates: usize,
    last_save_ms: Option<i64>,
    last_error: Option<String>,
    stats: SyncStats,
}

/// Holds the single-flight flag for one save or flush cycle.
struct FlightGuard<'a>(&'a Cell<bool>);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a Cell<bool>) -> Option<Self> {
        if flag.replace(true) {
            return None;
        }
        Some(Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

pub struct SyncEngine<S, T> {
    store: Rc<SharedStore>,
    storage: Rc<S>,
    transport: Rc<T>,
    config: SyncConfig,
    reconnect: ReconnectPolicy,
    in_flight: Cell<bool>,
    connection: Cell<ConnectionStatus>,
    shutdown: Cell<bool>,
    inner: RefCell<SyncInner>,
}

impl<S: StorageService, T: RealtimeTransport> SyncEngine<S, T> {
    pub fn new(
        store: Rc<SharedStore>,
        storage: Rc<S>,
        transport: Rc<T>,
        config: SyncConfig,
        reconnect: ReconnectPolicy,
    ) -> Self {
        Self {
            store,
            storage,
            transport,
            config,
            reconnect,
            in_flight: Cell::new(false),
            connection: Cell::new(ConnectionStatus::Disconnected),
            shutdown: Cell::new(false),
            inner: RefCell::new(SyncInner::default()),
        }
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.get()
    }

    pub fn get_sync_state(&self) -> SyncState {
        let inner = self.inner.borrow();
        let phase = if self.in_flight.get() {
            SyncPhase::Saving
        } else if !inner.offline.is_empty() {
            SyncPhase::OfflineQueued
        } else {
            SyncPhase::Idle
        };
        SyncState {
            phase,
            connection: self.connection.get(),
            dirty_count: self.store.read(|s| s.dirty_count()),
            offline_batches: inner.offline.len(),
            offline_updates: inner.offline_updates,
            last_save_ms: inner.last_save_ms,
            last_error: inner.last_error.clone(),
            stats: inner.stats,
        }
    }

    /// Stop the autosave and flush loops after their current sleep.
    pub fn shutdown(&self) {
        self.shutdown.set(true);
    }

    /// Persist every dirty sector, then deliver the persisted updates.
    ///
    /// Rejected with [`SaveOutcome::Busy`] while another save or flush is running.
    pub async fn save_changes(&self) -> SaveOutcome {
        let Some(_flight) = FlightGuard::acquire(&self.in_flight) else {
            debug!("save rejected, another cycle is in flight");
            self.inner.borrow_mut().stats.rejected_saves += 1;
            return SaveOutcome::Busy;
        };

        let dirty = self.store.get_dirty();
        if dirty.is_empty() {
            return SaveOutcome::NothingToSave;
        }

        let mut by_sector: BTreeMap<SectorCoord, Vec<PendingUpdate>> = BTreeMap::new();
        for update in dirty {
            by_sector.entry(update.key.sector).or_default().push(update);
        }

        let mut report = SaveReport::default();
        let mut persisted = Vec::new();
        let mut now_filled = BTreeSet::new();
        let mut now_empty = BTreeSet::new();
        for (sector, updates) in by_sector {
            let snapshot = self.store.get_sector_pixels(sector);
            match self.storage.save_sector_data(sector, &snapshot).await {
                Ok(()) => {
                    report.persisted_sectors += 1;
                    if snapshot.is_empty() {
                        now_empty.insert(sector);
                    } else {
                        now_filled.insert(sector);
                    }
                    persisted.extend(updates);
                }
                Err(e) => {
                    report.failed_sectors += 1;
                    warn!(sector = %sector, error = %e, "failed to persist sector, keeping it dirty");
                    self.inner.borrow_mut().last_error = Some(e.to_string());
                }
            }
        }

        report.cleared = self.store.mark_clean(&persisted);
        if report.persisted_sectors > 0 {
            self.persist_sector_list(&now_filled, &now_empty).await;
        }

        let batches = self.outbound_batches(&persisted);
        let (sent, queued) = self.deliver(batches).await;
        report.sent_updates = sent;
        report.queued_updates = queued;

        {
            let mut inner = self.inner.borrow_mut();
            inner.last_save_ms = Some(self.store.now_ms());
            inner.stats.saves += 1;
            inner.stats.persisted_sectors += report.persisted_sectors as u64;
            inner.stats.failed_persists += report.failed_sectors as u64;
        }
        info!(
            persisted = report.persisted_sectors,
            failed = report.failed_sectors,
            sent = report.sent_updates,
            queued = report.queued_updates,
            "save cycle finished"
        );
        SaveOutcome::Saved(report)
    }

    /// Save now, ignoring the autosave debounce.
    pub async fn save_immediately(&self) -> SaveOutcome {
        self.save_changes().await
    }

    /// One autosave decision: save when dirty and no local edit happened within the debounce window.
    pub async fn autosave_tick(&self) -> Option<SaveOutcome> {
        let latest = self.store.latest_dirty_timestamp()?;
        let quiet_for = self.store.now_ms() - latest;
        if quiet_for < self.config.save_debounce_ms as i64 {
            return None;
        }
        Some(self.save_changes().await)
    }

    pub async fn run_autosave(&self, sleep: &SleepFn) {
        let interval = self.config.autosave_interval();
        loop {
            sleep(interval).await;
            if self.shutdown.get() {
                break;
            }
            self.autosave_tick().await;
        }
        debug!("autosave loop stopped");
    }

    pub async fn run_offline_flush(&self, sleep: &SleepFn) {
        let interval = self.config.offline_flush_interval();
        loop {
            sleep(interval).await;
            if self.shutdown.get() {
                break;
            }
            if self.transport.is_open() && self.offline_len() > 0 {
                self.flush_offline_queue().await;
            }
        }
        debug!("offline flush loop stopped");
    }

    /// Resend queued batches in order. A batch that fails again goes back to the
    /// front and the flush stops. Returns the number of updates delivered.
    pub async fn flush_offline_queue(&self) -> usize {
        if !self.transport.is_open() {
            return 0;
        }
        let Some(_flight) = FlightGuard::acquire(&self.in_flight) else {
            return 0;
        };

        let mut delivered = 0;
        loop {
            let Some(batch) = self.pop_offline() else {
                break;
            };
            match self.send_batch(&batch).await {
                Ok(()) => delivered += batch.updates.len(),
                Err(e) => {
                    warn!(sector = %batch.sector, error = %e, "offline flush failed, requeueing");
                    self.requeue_front(batch);
                    break;
                }
            }
        }
        if delivered > 0 {
            info!(delivered, remaining = self.offline_len(), "flushed offline queue");
        }
        delivered
    }

    pub async fn on_connected(&self) {
        if self.connection.replace(ConnectionStatus::Live) == ConnectionStatus::Live {
            return;
        }
        info!("realtime transport connected");
        self.flush_offline_queue().await;
    }

    /// Only a live connection drops to `Disconnected`. A pending connect or retry
    /// loop sees the failure itself and keeps ownership of the schedule.
    pub fn on_disconnected(&self) {
        if self.connection.get() == ConnectionStatus::Live {
            warn!("realtime transport disconnected");
            self.connection.set(ConnectionStatus::Disconnected);
        }
    }

    /// Open the transport, falling back to the reconnect schedule on failure.
    pub async fn connect(&self, sleep: &SleepFn) -> bool {
        self.connection.set(ConnectionStatus::Connecting);
        match self.transport.connect().await {
            Ok(()) => {
                self.on_connected().await;
                true
            }
            Err(e) => {
                warn!(error = %e, "initial connect failed");
                self.inner.borrow_mut().last_error = Some(e.to_string());
                self.retry_connect(sleep).await
            }
        }
    }

    /// Retry with bounded exponential backoff. No-op while a connect is already underway.
    pub async fn reconnect(&self, sleep: &SleepFn) -> bool {
        match self.connection.get() {
            ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => false,
            ConnectionStatus::Live if self.transport.is_open() => true,
            _ => self.retry_connect(sleep).await,
        }
    }

    async fn retry_connect(&self, sleep: &SleepFn) -> bool {
        self.connection.set(ConnectionStatus::Reconnecting);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(delay) = self.reconnect.delay_for(attempt) else {
                warn!(attempts = attempt - 1, "giving up on reconnect");
                self.connection.set(ConnectionStatus::Failed);
                return false;
            };
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            sleep(delay).await;
            if self.shutdown.get() {
                self.connection.set(ConnectionStatus::Disconnected);
                return false;
            }
            match self.transport.connect().await {
                Ok(()) => {
                    self.on_connected().await;
                    return true;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    self.inner.borrow_mut().last_error = Some(e.to_string());
                }
            }
        }
    }

    fn outbound_batches(&self, persisted: &[PendingUpdate]) -> Vec<OutboundBatch> {
        let mut by_sector: BTreeMap<SectorCoord, Vec<WireUpdate>> = BTreeMap::new();
        for update in persisted {
            // The wire format has no tombstone; removals only reach storage.
            if let Some(color) = update.color {
                by_sector
                    .entry(update.key.sector)
                    .or_default()
                    .push(WireUpdate::from_local(update.key.local, color));
            }
        }
        let batch_size = self.config.send_batch_size.max(1);
        by_sector
            .into_iter()
            .flat_map(|(sector, updates)| {
                updates
                    .chunks(batch_size)
                    .map(|chunk| OutboundBatch {
                        sector,
                        updates: chunk.to_vec(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Send each batch, queueing the ones that cannot be delivered. Returns (sent, queued).
    async fn deliver(&self, batches: Vec<OutboundBatch>) -> (usize, usize) {
        let mut sent = 0;
        let mut queued = 0;
        for batch in batches {
            if !self.transport.is_open() {
                queued += batch.updates.len();
                self.enqueue_offline(batch);
                continue;
            }
            match self.send_batch(&batch).await {
                Ok(()) => sent += batch.updates.len(),
                Err(e) => {
                    warn!(sector = %batch.sector, error = %e, "send failed, queueing batch");
                    queued += batch.updates.len();
                    self.enqueue_offline(batch);
                }
            }
        }
        (sent, queued)
    }

    async fn send_batch(&self, batch: &OutboundBatch) -> Result<(), TransportError> {
        self.transport
            .send(batch.sector, encode(&batch.updates))
            .await?;
        self.inner.borrow_mut().stats.sent_updates += batch.updates.len() as u64;
        Ok(())
    }

    async fn persist_sector_list(
        &self,
        filled: &BTreeSet<SectorCoord>,
        emptied: &BTreeSet<SectorCoord>,
    ) {
        let mut listed: BTreeSet<SectorCoord> = match self.storage.get_item(ACTIVE_SECTORS_ITEM).await
        {
            Ok(Some(raw)) => serde_json::from_str::<Vec<String>>(&raw)
                .map(|keys| keys.iter().filter_map(|key| key.parse().ok()).collect())
                .unwrap_or_else(|e| {
                    warn!(error = %e, "stored sector list is corrupt, rebuilding it");
                    BTreeSet::new()
                }),
            Ok(None) => BTreeSet::new(),
            Err(e) => {
                // Never shrink the list to this cycle's sectors.
                warn!(error = %e, "could not read sector list, leaving it unchanged");
                self.inner.borrow_mut().last_error = Some(e.to_string());
                return;
            }
        };
        listed.extend(filled.iter().copied());
        listed.retain(|sector| !emptied.contains(sector));

        let keys: Vec<String> = listed.iter().map(ToString::to_string).collect();
        let result = match serde_json::to_string(&keys) {
            Ok(raw) => self.storage.set_item(ACTIVE_SECTORS_ITEM, &raw).await,
            Err(e) => {
                warn!(error = %e, "could not serialize sector list");
                return;
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "could not persist sector list");
            self.inner.borrow_mut().last_error = Some(e.to_string());
        }
    }

    fn offline_len(&self) -> usize {
        self.inner.borrow().offline.len()
    }

    fn pop_offline(&self) -> Option<OutboundBatch> {
        let mut inner = self.inner.borrow_mut();
        let batch = inner.offline.pop_front()?;
        inner.offline_updates -= batch.updates.len();
        Some(batch)
    }

    fn requeue_front(&self, batch: OutboundBatch) {
        let mut inner = self.inner.borrow_mut();
        inner.offline_updates += batch.updates.len();
        inner.offline.push_front(batch);
    }

    /// Append to the offline queue, compacting the oldest updates once over the limit.
    fn enqueue_offline(&self, batch: OutboundBatch) {
        let mut inner = self.inner.borrow_mut();
        let added = batch.updates.len();
        inner.offline_updates += added;
        inner.stats.queued_updates += added as u64;
        inner.offline.push_back(batch);

        let limit = self.config.offline_queue_limit;
        let mut dropped = 0;
        while inner.offline_updates > limit {
            let excess = inner.offline_updates - limit;
            let Some(front) = inner.offline.front_mut() else {
                break;
            };
            if front.updates.len() <= excess {
                let removed = front.updates.len();
                inner.offline.pop_front();
                inner.offline_updates -= removed;
                dropped += removed;
            } else {
                front.updates.drain(..excess);
                inner.offline_updates -= excess;
                dropped += excess;
            }
        }
        if dropped > 0 {
            inner.stats.dropped_updates += dropped as u64;
            warn!(dropped, limit, "offline queue full, compacted oldest updates");
        }
    }
}

impl<S: StorageService, T: RealtimeTransport> RemoteSink for SyncEngine<S, T> {
    /// Write remote updates straight into the store. Loopback echoes and updates
    /// older than a still-dirty local write are discarded.
    fn apply_remote_updates(
        &self,
        sector: SectorCoord,
        updates: &[InboundUpdate],
    ) -> Vec<LocalCoord> {
        let mut changed = Vec::new();
        let mut loopback = 0;
        let mut stale = 0;

        for inbound in updates {
            if !self.config.user_id.is_empty()
                && inbound.user_id.as_deref() == Some(self.config.user_id.as_str())
            {
                loopback += 1;
                continue;
            }
            let Ok(local) = inbound.update.local() else {
                continue;
            };
            let key = PixelKey::new(sector, local);
            if let (Some(entry), Some(timestamp)) = (self.store.dirty_entry(key), inbound.timestamp)
                && timestamp < entry.timestamp
            {
                stale += 1;
                continue;
            }
            if self.store.apply_remote(key, inbound.update.color).is_some() {
                changed.push(local);
            }
        }

        if !changed.is_empty() {
            self.store.optimize_cache();
        }
        if stale > 0 {
            debug!(sector = %sector, stale, "discarded remote updates older than local edits");
        }
        let mut inner = self.inner.borrow_mut();
        inner.stats.loopback_suppressed += loopback;
        inner.stats.stale_discarded += stale;
        inner.stats.remote_applied += changed.len() as u64;
        changed
    }
}
