use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use pixelgrid_shared::SectorCoord;
use tracing::{debug, info, warn};

use crate::config::{ACTIVE_SECTORS_ITEM, LoaderConfig};
use crate::services::{NetworkClient, StorageService};
use crate::store::SharedStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Storage,
    Network,
    StorageThenNetwork,
}

impl LoadSource {
    fn uses_storage(self) -> bool {
        matches!(self, Self::Storage | Self::StorageThenNetwork)
    }

    fn uses_network(self) -> bool {
        matches!(self, Self::Network | Self::StorageThenNetwork)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub source: LoadSource,
    /// Keep paging through the network until an empty page or the budget. `false` fetches one page.
    pub progressive: bool,
    pub batch_size: usize,
    pub max_pixels: usize,
}

impl LoadOptions {
    pub fn from_config(config: &LoaderConfig) -> Self {
        Self {
            source: LoadSource::StorageThenNetwork,
            progressive: true,
            batch_size: config.batch_size,
            max_pixels: config.max_pixels,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Range,
    Preload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSession {
    pub id: u64,
    pub kind: SessionKind,
    pub total: usize,
    pub completed: usize,
}

impl LoadSession {
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.completed as f64 / self.total as f64
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadingState {
    pub sessions: Vec<LoadSession>,
    pub total_loaded: usize,
    pub last_error: Option<String>,
}

impl LoadingState {
    pub fn is_loading(&self) -> bool {
        !self.sessions.is_empty()
    }
}

#[derive(Debug, Default)]
struct LoaderInner {
    sessions: Vec<LoadSession>,
    next_session_id: u64,
    total_loaded: usize,
    last_error: Option<String>,
}

/// Feeds the store from persistent storage first and the network second.
///
/// Every storage or network failure is caught at the call that made it and counts
/// as zero pixels loaded; nothing here returns an error to the caller.
pub struct Loader<S, N> {
    store: Rc<SharedStore>,
    storage: Rc<S>,
    network: Rc<N>,
    config: LoaderConfig,
    inner: Rc<RefCell<LoaderInner>>,
}

impl<S: StorageService, N: NetworkClient> Loader<S, N> {
    pub fn new(
        store: Rc<SharedStore>,
        storage: Rc<S>,
        network: Rc<N>,
        config: LoaderConfig,
    ) -> Self {
        Self {
            store,
            storage,
            network,
            config,
            inner: Rc::new(RefCell::new(LoaderInner::default())),
        }
    }

    pub fn get_loading_state(&self) -> LoadingState {
        let inner = self.inner.borrow();
        LoadingState {
            sessions: inner.sessions.clone(),
            total_loaded: inner.total_loaded,
            last_error: inner.last_error.clone(),
        }
    }

    /// Bulk load. Returns the number of pixels received from all sources.
    pub async fn load_data(&self, options: LoadOptions) -> usize {
        let mut loaded = 0;
        if options.source.uses_storage() {
            loaded += self.load_from_storage(options.max_pixels).await;
        }
        if options.source.uses_network() && loaded < options.max_pixels {
            loaded += self
                .load_from_network(options, options.max_pixels - loaded)
                .await;
        }
        info!(loaded, source = ?options.source, "bulk load finished");
        loaded
    }

    async fn load_from_storage(&self, budget: usize) -> usize {
        let listed = match self.storage.get_item(ACTIVE_SECTORS_ITEM).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return 0,
            Err(e) => {
                self.record_error(format!("reading sector list: {e}"));
                return 0;
            }
        };
        let sectors: Vec<SectorCoord> = match serde_json::from_str::<Vec<String>>(&listed) {
            Ok(keys) => keys.iter().filter_map(|key| key.parse().ok()).collect(),
            Err(e) => {
                self.record_error(format!("sector list is not valid JSON: {e}"));
                return 0;
            }
        };

        let mut loaded = 0;
        for sector in sectors {
            if loaded >= budget {
                break;
            }
            match self.storage.get_sector_data(sector).await {
                Ok(Some(pixels)) => {
                    self.store.load_sector(sector, &pixels);
                    loaded += pixels.len();
                }
                Ok(None) => {}
                Err(e) => self.record_error(format!("reading sector {sector}: {e}")),
            }
        }
        self.add_loaded(loaded);
        loaded
    }

    async fn load_from_network(&self, options: LoadOptions, budget: usize) -> usize {
        let batch_size = options.batch_size.max(1);
        let mut offset = 0;
        let mut loaded = 0;

        loop {
            let limit = batch_size.min(budget.saturating_sub(loaded));
            if limit == 0 {
                break;
            }
            match self.network.get_pixels_batch(offset, limit).await {
                Ok(rows) if rows.is_empty() => break,
                Ok(mut rows) => {
                    if rows.len() > limit {
                        warn!(
                            limit,
                            received = rows.len(),
                            "server returned an oversized page, truncating"
                        );
                        rows.truncate(limit);
                    }
                    self.store.load_rows(&rows);
                    loaded += rows.len();
                    offset += rows.len();
                    debug!(offset, page = rows.len(), "loaded pixel page");
                }
                Err(e) => {
                    self.record_error(format!("fetching pixels at offset {offset}: {e}"));
                    break;
                }
            }
            if !options.progressive {
                break;
            }
        }
        self.add_loaded(loaded);
        loaded
    }

    /// Load one sector: storage first, one network fetch on a miss or a storage failure.
    pub async fn load_sector(&self, sector: SectorCoord) -> usize {
        match self.storage.get_sector_data(sector).await {
            Ok(Some(pixels)) => {
                self.store.load_sector(sector, &pixels);
                self.add_loaded(pixels.len());
                return pixels.len();
            }
            Ok(None) => {}
            Err(e) => {
                self.record_error(format!("reading sector {sector}: {e}"));
            }
        }

        match self.network.get_sector_pixels(sector).await {
            Ok(rows) => {
                self.store.load_rows(&rows);
                self.add_loaded(rows.len());
                rows.len()
            }
            Err(e) => {
                self.record_error(format!("fetching sector {sector}: {e}"));
                0
            }
        }
    }

    /// No-op when the sector already has resident pixels.
    pub async fn lazy_load_sector(&self, sector: SectorCoord) -> usize {
        if self.store.is_active(sector) {
            return 0;
        }
        self.load_sector(sector).await
    }

    /// Load every sector in the inclusive rectangle spanned by `from` and `to`, row by row.
    pub async fn load_sector_range(&self, from: SectorCoord, to: SectorCoord) -> usize {
        let (min_x, max_x) = (from.x.min(to.x), from.x.max(to.x));
        let (min_y, max_y) = (from.y.min(to.y), from.y.max(to.y));
        let targets: Vec<SectorCoord> = (min_y..=max_y)
            .flat_map(|y| (min_x..=max_x).map(move |x| SectorCoord::new(x, y)))
            .collect();
        self.run_session(SessionKind::Range, targets, false).await
    }

    /// Load the square of sectors within `radius` of `center`, nearest first.
    /// Sectors that are already resident are skipped.
    pub async fn preload_sectors(&self, center: SectorCoord, radius: u32) -> usize {
        let r = radius.min(i32::MAX as u32) as i32;
        let mut targets: Vec<SectorCoord> = (center.y.saturating_sub(r)..=center.y.saturating_add(r))
            .flat_map(|y| {
                (center.x.saturating_sub(r)..=center.x.saturating_add(r))
                    .map(move |x| SectorCoord::new(x, y))
            })
            .collect();
        targets.sort_by(|a, b| {
            a.distance_sq(&center)
                .cmp(&b.distance_sq(&center))
                .then_with(|| (a.y, a.x).cmp(&(b.y, b.x)))
        });
        self.run_session(SessionKind::Preload, targets, true).await
    }

    async fn run_session(&self, kind: SessionKind, targets: Vec<SectorCoord>, lazy: bool) -> usize {
        let session = self.begin_session(kind, targets.len());
        let yield_every = self.config.yield_every.max(1);
        let mut loaded = 0;

        for (index, sector) in targets.into_iter().enumerate() {
            loaded += if lazy {
                self.lazy_load_sector(sector).await
            } else {
                self.load_sector(sector).await
            };
            session.advance();
            if (index + 1) % yield_every == 0 {
                yield_now().await;
            }
        }
        loaded
    }

    fn begin_session(&self, kind: SessionKind, total: usize) -> SessionGuard {
        let mut inner = self.inner.borrow_mut();
        inner.next_session_id += 1;
        let id = inner.next_session_id;
        inner.sessions.push(LoadSession {
            id,
            kind,
            total,
            completed: 0,
        });
        SessionGuard {
            id,
            inner: Rc::clone(&self.inner),
        }
    }

    fn add_loaded(&self, count: usize) {
        self.inner.borrow_mut().total_loaded += count;
    }

    fn record_error(&self, message: String) {
        warn!("load failed: {message}");
        self.inner.borrow_mut().last_error = Some(message);
    }
}

/// Removes its session from the loading state when the load finishes or is dropped.
struct SessionGuard {
    id: u64,
    inner: Rc<RefCell<LoaderInner>>,
}

impl SessionGuard {
    fn advance(&self) {
        let mut inner = self.inner.borrow_mut();
        if let Some(session) = inner.sessions.iter_mut().find(|s| s.id == self.id) {
            session.completed = (session.completed + 1).min(session.total);
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.inner
            .borrow_mut()
            .sessions
            .retain(|session| session.id != self.id);
    }
}

/// Cooperative suspension point: returns `Pending` once so other tasks get to run.
fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
