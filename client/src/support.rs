//! In-crate fakes shared by the unit tests.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use futures::future::LocalBoxFuture;
use pixelgrid_shared::{PixelRow, SectorCoord, WireUpdate, codec};

use crate::clock::Clock;
use crate::error::{PersistenceError, TransportError};
use crate::services::{
    FrameScheduler, MemoryStorage, NetworkClient, RealtimeTransport, SectorPixels,
    StorageService,
};

pub struct ManualClock {
    now: Cell<i64>,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: Cell::new(now),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.get()
    }
}

/// Sleep function that resolves immediately and records every requested delay.
pub fn recording_sleeper(
    log: Rc<RefCell<Vec<Duration>>>,
) -> impl Fn(Duration) -> LocalBoxFuture<'static, ()> {
    move |delay| {
        log.borrow_mut().push(delay);
        Box::pin(async {})
    }
}

/// Storage wrapper whose reads and writes can be made to fail.
#[derive(Default)]
pub struct FlakyStorage {
    pub inner: MemoryStorage,
    pub fail_reads: Cell<bool>,
    pub fail_writes: Cell<bool>,
    pub failing_sectors: RefCell<HashSet<SectorCoord>>,
    /// Suspend once inside every sector save so concurrent callers can interleave.
    pub slow: Cell<bool>,
    pub saves: RefCell<Vec<SectorCoord>>,
}

impl StorageService for FlakyStorage {
    async fn get_sector_data(
        &self,
        sector: SectorCoord,
    ) -> Result<Option<SectorPixels>, PersistenceError> {
        if self.fail_reads.get() || self.failing_sectors.borrow().contains(&sector) {
            return Err(PersistenceError::Read {
                key: PersistenceError::sector_key(sector),
                reason: "injected".into(),
            });
        }
        self.inner.get_sector_data(sector).await
    }

    async fn save_sector_data(
        &self,
        sector: SectorCoord,
        pixels: &SectorPixels,
    ) -> Result<(), PersistenceError> {
        if self.slow.get() {
            tokio::task::yield_now().await;
        }
        if self.fail_writes.get() || self.failing_sectors.borrow().contains(&sector) {
            return Err(PersistenceError::Write {
                key: PersistenceError::sector_key(sector),
                reason: "injected".into(),
            });
        }
        self.saves.borrow_mut().push(sector);
        self.inner.save_sector_data(sector, pixels).await
    }

    async fn get_item(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        if self.fail_reads.get() {
            return Err(PersistenceError::Read {
                key: key.to_string(),
                reason: "injected".into(),
            });
        }
        self.inner.get_item(key).await
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        if self.fail_writes.get() {
            return Err(PersistenceError::Write {
                key: key.to_string(),
                reason: "injected".into(),
            });
        }
        self.inner.set_item(key, value).await
    }
}

/// Transport that records sent messages and fails on demand.
#[derive(Default)]
pub struct ScriptedTransport {
    pub open: Cell<bool>,
    pub fail_sends: Cell<bool>,
    /// Number of upcoming `connect` calls that fail before one succeeds.
    pub connect_failures: Cell<u32>,
    pub connect_calls: Cell<u32>,
    /// Suspend once inside every `connect` so transport events can arrive meanwhile.
    pub slow_connect: Cell<bool>,
    pub sent: RefCell<Vec<(SectorCoord, Vec<u8>)>>,
}

impl ScriptedTransport {
    pub fn sent_updates(&self) -> Vec<(SectorCoord, WireUpdate)> {
        self.sent
            .borrow()
            .iter()
            .flat_map(|(sector, payload)| {
                codec::decode(payload)
                    .into_iter()
                    .map(move |update| (*sector, update))
            })
            .collect()
    }
}

impl RealtimeTransport for ScriptedTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connect_calls.set(self.connect_calls.get() + 1);
        if self.slow_connect.get() {
            tokio::task::yield_now().await;
        }
        if self.connect_failures.get() > 0 {
            self.connect_failures.set(self.connect_failures.get() - 1);
            return Err(TransportError::Connect("refused".into()));
        }
        self.open.set(true);
        Ok(())
    }

    async fn send(&self, sector: SectorCoord, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.open.get() {
            return Err(TransportError::NotConnected);
        }
        if self.fail_sends.get() {
            return Err(TransportError::Send("injected".into()));
        }
        self.sent.borrow_mut().push((sector, payload));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.get()
    }
}

/// Network client serving a fixed row list with offset pagination and per-sector lookups.
#[derive(Default)]
pub struct ScriptedNetwork {
    pub rows: Vec<PixelRow>,
    pub sector_rows: HashMap<SectorCoord, Vec<PixelRow>>,
    pub failing_sectors: HashSet<SectorCoord>,
    pub fail_batches: Cell<bool>,
    /// Serve twice as many rows as requested.
    pub oversized_pages: bool,
    pub batch_calls: RefCell<Vec<(usize, usize)>>,
    pub sector_calls: RefCell<VecDeque<SectorCoord>>,
}

impl NetworkClient for ScriptedNetwork {
    async fn get_pixels_batch(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PixelRow>, TransportError> {
        self.batch_calls.borrow_mut().push((offset, limit));
        if self.fail_batches.get() {
            return Err(TransportError::Request("HTTP 503".into()));
        }
        let take = if self.oversized_pages { limit * 2 } else { limit };
        Ok(self.rows.iter().skip(offset).take(take).copied().collect())
    }

    async fn get_sector_pixels(&self, sector: SectorCoord) -> Result<Vec<PixelRow>, TransportError> {
        self.sector_calls.borrow_mut().push_back(sector);
        if self.failing_sectors.contains(&sector) {
            return Err(TransportError::Request("HTTP 500".into()));
        }
        Ok(self.sector_rows.get(&sector).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct RecordingFrames {
    pub requests: Cell<u32>,
}

impl FrameScheduler for RecordingFrames {
    fn request_frame(&self) {
        self.requests.set(self.requests.get() + 1);
    }
}

pub fn row(sx: i32, sy: i32, lx: u32, ly: u32, color: u8) -> PixelRow {
    PixelRow {
        sector_x: sx,
        sector_y: sy,
        local_x: lx,
        local_y: ly,
        color,
    }
}
