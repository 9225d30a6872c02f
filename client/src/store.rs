//! Sparse, sector-partitioned pixel store.
//!
//! Pixels live in a per-sector map, which doubles as the sector index: a sector's
//! pixel count is the length of its map, and the set of active sectors is exactly
//! the set of keys with a non-empty map. A sector entry is dropped the moment its
//! last pixel goes, so counts and the active set can never drift from the data.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use pixelgrid_shared::{Color, LocalCoord, PixelKey, PixelRow, SectorCoord, ValidationError};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::StoreConfig;
use crate::events::{EventBus, Origin, PixelChange};

/// Bookkeeping for a pixel with an unsaved local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyEntry {
    pub timestamp: i64,
    pub seq: u64,
}

/// A mutation waiting to be persisted and delivered (local), or applied (remote).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub key: PixelKey,
    /// `None` for a removal.
    pub color: Option<Color>,
    pub timestamp: i64,
    pub origin: Origin,
    pub user_id: Option<String>,
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub evicted_pixels: usize,
    pub evicted_sectors: usize,
}

#[derive(Debug, Default)]
struct SectorState {
    pixels: HashMap<LocalCoord, Color>,
    last_touched: u64,
}

#[derive(Debug)]
pub struct PixelStore {
    sectors: HashMap<SectorCoord, SectorState>,
    dirty: HashMap<PixelKey, DirtyEntry>,
    dirty_per_sector: HashMap<SectorCoord, usize>,
    pinned: HashSet<SectorCoord>,
    resident: usize,
    next_seq: u64,
    touch_tick: u64,
    config: StoreConfig,
}

impl PixelStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            sectors: HashMap::new(),
            dirty: HashMap::new(),
            dirty_per_sector: HashMap::new(),
            pinned: HashSet::new(),
            resident: 0,
            next_seq: 0,
            touch_tick: 0,
            config,
        }
    }

    pub fn get_pixel(&self, key: PixelKey) -> Option<Color> {
        self.sectors
            .get(&key.sector)
            .and_then(|state| state.pixels.get(&key.local))
            .copied()
    }

    /// Local write. Returns the change, or `None` when the pixel already has `color`.
    pub fn set_pixel(&mut self, key: PixelKey, color: Color, now_ms: i64) -> Option<PixelChange> {
        let old = self.write(key, color)?;
        self.mark_dirty(key, now_ms);
        Some(PixelChange::between(key, old, Some(color), Origin::Local))
    }

    /// Local removal. Returns `None` when the pixel was not set.
    pub fn remove_pixel(&mut self, key: PixelKey, now_ms: i64) -> Option<PixelChange> {
        let old = self.erase(key)?;
        self.mark_dirty(key, now_ms);
        Some(PixelChange::between(key, Some(old), None, Origin::Local))
    }

    pub fn set_multiple_pixels(
        &mut self,
        batch: &[(PixelKey, Color)],
        now_ms: i64,
    ) -> Vec<PixelChange> {
        batch
            .iter()
            .filter_map(|&(key, color)| self.set_pixel(key, color, now_ms))
            .collect()
    }

    /// Remote write: never marks the pixel dirty, and emits nothing when the color is unchanged.
    /// Callers only apply updates that won over local edits, so any unsaved local edit of
    /// the pixel is dropped and will not be sent.
    pub fn apply_remote(&mut self, key: PixelKey, color: Color) -> Option<PixelChange> {
        self.clear_dirty(key);
        let old = self.write(key, color)?;
        Some(PixelChange::between(key, old, Some(color), Origin::Remote))
    }

    /// Loader write. Pixels with an unsaved local edit keep the local color.
    pub fn load_pixel(&mut self, key: PixelKey, color: Color) -> Option<PixelChange> {
        if self.dirty.contains_key(&key) {
            return None;
        }
        let old = self.write(key, color)?;
        Some(PixelChange::between(key, old, Some(color), Origin::Load))
    }

    /// Copy of one sector's pixels. Cost is proportional to the sector, not the store.
    pub fn sector_pixels(&self, sector: SectorCoord) -> HashMap<LocalCoord, Color> {
        self.sectors
            .get(&sector)
            .map(|state| state.pixels.clone())
            .unwrap_or_default()
    }

    pub fn sector_count(&self, sector: SectorCoord) -> usize {
        self.sectors
            .get(&sector)
            .map_or(0, |state| state.pixels.len())
    }

    pub fn is_active(&self, sector: SectorCoord) -> bool {
        self.sectors.contains_key(&sector)
    }

    pub fn active_sectors(&self) -> Vec<SectorCoord> {
        let mut sectors: Vec<_> = self.sectors.keys().copied().collect();
        sectors.sort();
        sectors
    }

    pub fn resident_count(&self) -> usize {
        self.resident
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn dirty_entry(&self, key: PixelKey) -> Option<DirtyEntry> {
        self.dirty.get(&key).copied()
    }

    /// Timestamp of the most recent unsaved local mutation.
    pub fn latest_dirty_timestamp(&self) -> Option<i64> {
        self.dirty.values().map(|entry| entry.timestamp).max()
    }

    /// Unsaved local mutations in the order they were made.
    pub fn get_dirty(&self) -> Vec<PendingUpdate> {
        let mut pending: Vec<_> = self
            .dirty
            .iter()
            .map(|(&key, entry)| PendingUpdate {
                key,
                color: self.get_pixel(key),
                timestamp: entry.timestamp,
                origin: Origin::Local,
                user_id: None,
                seq: entry.seq,
            })
            .collect();
        pending.sort_by_key(|update| update.seq);
        pending
    }

    /// Clear dirty flags for persisted updates. An entry rewritten since it was read
    /// (different `seq`) stays dirty. Returns how many flags were cleared.
    pub fn mark_clean(&mut self, persisted: &[PendingUpdate]) -> usize {
        let mut cleared = 0;
        for update in persisted {
            let matches = self
                .dirty
                .get(&update.key)
                .is_some_and(|entry| entry.seq == update.seq);
            if matches && self.clear_dirty(update.key) {
                cleared += 1;
            }
        }
        cleared
    }

    pub fn pin(&mut self, sector: SectorCoord) {
        self.pinned.insert(sector);
    }

    pub fn unpin(&mut self, sector: SectorCoord) -> bool {
        self.pinned.remove(&sector)
    }

    pub fn set_pinned_sectors(&mut self, sectors: impl IntoIterator<Item = SectorCoord>) {
        self.pinned = sectors.into_iter().collect();
    }

    pub fn is_pinned(&self, sector: SectorCoord) -> bool {
        self.pinned.contains(&sector)
    }

    pub fn cache_limit(&self) -> usize {
        self.config.cache_max_pixels
    }

    /// Evict whole sectors, least recently touched first, until the resident count is
    /// within budget. Pinned sectors and sectors holding dirty pixels are never evicted.
    pub fn optimize_cache(&mut self) -> EvictionReport {
        let mut report = EvictionReport::default();
        if self.resident <= self.config.cache_max_pixels {
            return report;
        }

        let mut candidates: Vec<(u64, SectorCoord)> = self
            .sectors
            .iter()
            .filter(|(sector, _)| {
                !self.pinned.contains(sector) && !self.dirty_per_sector.contains_key(sector)
            })
            .map(|(sector, state)| (state.last_touched, *sector))
            .collect();
        candidates.sort();

        for (_, sector) in candidates {
            if self.resident <= self.config.cache_max_pixels {
                break;
            }
            if let Some(state) = self.sectors.remove(&sector) {
                self.resident -= state.pixels.len();
                report.evicted_pixels += state.pixels.len();
                report.evicted_sectors += 1;
            }
        }

        if self.resident > self.config.cache_max_pixels {
            warn!(
                resident = self.resident,
                limit = self.config.cache_max_pixels,
                "cache over budget with no evictable sectors left"
            );
        } else if report.evicted_sectors > 0 {
            debug!(
                evicted_pixels = report.evicted_pixels,
                evicted_sectors = report.evicted_sectors,
                "evicted idle sectors"
            );
        }
        report
    }

    fn write(&mut self, key: PixelKey, color: Color) -> Option<Option<Color>> {
        self.touch_tick += 1;
        let tick = self.touch_tick;
        let state = self.sectors.entry(key.sector).or_default();
        let old = state.pixels.get(&key.local).copied();
        if old == Some(color) {
            return None;
        }
        state.pixels.insert(key.local, color);
        state.last_touched = tick;
        if old.is_none() {
            self.resident += 1;
        }
        Some(old)
    }

    fn erase(&mut self, key: PixelKey) -> Option<Color> {
        let state = self.sectors.get_mut(&key.sector)?;
        let old = state.pixels.remove(&key.local)?;
        self.resident -= 1;
        if state.pixels.is_empty() {
            self.sectors.remove(&key.sector);
        }
        Some(old)
    }

    fn clear_dirty(&mut self, key: PixelKey) -> bool {
        if self.dirty.remove(&key).is_none() {
            return false;
        }
        if let Some(count) = self.dirty_per_sector.get_mut(&key.sector) {
            *count -= 1;
            if *count == 0 {
                self.dirty_per_sector.remove(&key.sector);
            }
        }
        true
    }

    fn mark_dirty(&mut self, key: PixelKey, now_ms: i64) {
        self.next_seq += 1;
        let entry = DirtyEntry {
            timestamp: now_ms,
            seq: self.next_seq,
        };
        if self.dirty.insert(key, entry).is_none() {
            *self.dirty_per_sector.entry(key.sector).or_insert(0) += 1;
        }
    }
}

/// Shared handle around [`PixelStore`] for the single-threaded runtime.
///
/// Every mutation runs to completion inside one `RefCell` borrow; change events are
/// dispatched only after that borrow is released, so subscribers may read the store.
pub struct SharedStore {
    inner: RefCell<PixelStore>,
    changes: EventBus<PixelChange>,
    clock: Rc<dyn Clock>,
}

impl SharedStore {
    pub fn new(config: StoreConfig, clock: Rc<dyn Clock>) -> Self {
        Self {
            inner: RefCell::new(PixelStore::new(config)),
            changes: EventBus::new(),
            clock,
        }
    }

    pub fn changes(&self) -> &EventBus<PixelChange> {
        &self.changes
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Read access to the underlying store.
    pub fn read<R>(&self, f: impl FnOnce(&PixelStore) -> R) -> R {
        f(&self.inner.borrow())
    }

    pub fn set_pixel(
        &self,
        sx: i32,
        sy: i32,
        lx: u32,
        ly: u32,
        color: Color,
    ) -> Result<bool, ValidationError> {
        let key = PixelKey::from_parts(sx, sy, lx, ly)?;
        Ok(self.set_key(key, color))
    }

    pub fn set_key(&self, key: PixelKey, color: Color) -> bool {
        let now = self.clock.now_ms();
        let change = self.inner.borrow_mut().set_pixel(key, color, now);
        self.dispatch(change.into_iter())
    }

    pub fn remove_pixel(&self, sx: i32, sy: i32, lx: u32, ly: u32) -> Result<bool, ValidationError> {
        let key = PixelKey::from_parts(sx, sy, lx, ly)?;
        let now = self.clock.now_ms();
        let change = self.inner.borrow_mut().remove_pixel(key, now);
        Ok(self.dispatch(change.into_iter()))
    }

    pub fn get_pixel(&self, sx: i32, sy: i32, lx: u32, ly: u32) -> Result<Option<Color>, ValidationError> {
        let key = PixelKey::from_parts(sx, sy, lx, ly)?;
        Ok(self.inner.borrow().get_pixel(key))
    }

    pub fn get_sector_pixels(&self, sector: SectorCoord) -> HashMap<LocalCoord, Color> {
        self.inner.borrow().sector_pixels(sector)
    }

    pub fn set_multiple_pixels(&self, batch: &[(PixelKey, Color)]) -> Vec<PixelChange> {
        let now = self.clock.now_ms();
        let changes = self.inner.borrow_mut().set_multiple_pixels(batch, now);
        self.dispatch(changes.iter().copied());
        changes
    }

    pub fn get_dirty(&self) -> Vec<PendingUpdate> {
        self.inner.borrow().get_dirty()
    }

    pub fn mark_clean(&self, persisted: &[PendingUpdate]) -> usize {
        self.inner.borrow_mut().mark_clean(persisted)
    }

    pub fn dirty_entry(&self, key: PixelKey) -> Option<DirtyEntry> {
        self.inner.borrow().dirty_entry(key)
    }

    pub fn latest_dirty_timestamp(&self) -> Option<i64> {
        self.inner.borrow().latest_dirty_timestamp()
    }

    pub fn apply_remote(&self, key: PixelKey, color: Color) -> Option<PixelChange> {
        let change = self.inner.borrow_mut().apply_remote(key, color);
        self.dispatch(change.into_iter());
        change
    }

    /// Write loader rows, then trim the cache back to budget. Returns how many rows were applied.
    pub fn load_rows(&self, rows: &[PixelRow]) -> usize {
        let changes: Vec<PixelChange> = {
            let mut store = self.inner.borrow_mut();
            let changes: Vec<PixelChange> = rows
                .iter()
                .filter_map(|row| match row.key() {
                    Ok(key) => store.load_pixel(key, row.color),
                    Err(e) => {
                        warn!(error = %e, "skipping out-of-range row");
                        None
                    }
                })
                .collect();
            store.optimize_cache();
            changes
        };
        self.dispatch(changes.iter().copied());
        changes.len()
    }

    pub fn load_sector(&self, sector: SectorCoord, pixels: &HashMap<LocalCoord, Color>) -> usize {
        let rows: Vec<PixelRow> = pixels
            .iter()
            .map(|(&local, &color)| PixelRow::from_key(PixelKey::new(sector, local), color))
            .collect();
        self.load_rows(&rows)
    }

    pub fn optimize_cache(&self) -> EvictionReport {
        self.inner.borrow_mut().optimize_cache()
    }

    pub fn is_active(&self, sector: SectorCoord) -> bool {
        self.inner.borrow().is_active(sector)
    }

    pub fn pin(&self, sector: SectorCoord) {
        self.inner.borrow_mut().pin(sector);
    }

    pub fn unpin(&self, sector: SectorCoord) -> bool {
        self.inner.borrow_mut().unpin(sector)
    }

    pub fn set_pinned_sectors(&self, sectors: impl IntoIterator<Item = SectorCoord>) {
        self.inner.borrow_mut().set_pinned_sectors(sectors);
    }

    fn dispatch(&self, changes: impl Iterator<Item = PixelChange>) -> bool {
        let mut any = false;
        for change in changes {
            any = true;
            self.changes.emit(&change);
        }
        any
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    use pixelgrid_shared::{PixelKey, PixelRow, SectorCoord, ValidationError};

    use super::{PixelStore, SharedStore};
    use crate::config::StoreConfig;
    use crate::events::{ChangeAction, Origin};
    use crate::support::ManualClock;

    fn key(sx: i32, sy: i32, lx: u32, ly: u32) -> PixelKey {
        PixelKey::from_parts(sx, sy, lx, ly).unwrap()
    }

    fn store() -> PixelStore {
        PixelStore::new(StoreConfig::default())
    }

    fn shared() -> SharedStore {
        SharedStore::new(StoreConfig::default(), Rc::new(ManualClock::new(1_000)))
    }

    #[test]
    fn set_pixel_add_repeat_update() {
        let store = shared();
        let origin = SectorCoord::new(0, 0);

        assert_eq!(store.set_pixel(0, 0, 5, 5, 3), Ok(true));
        assert_eq!(store.read(|s| s.sector_count(origin)), 1);

        assert_eq!(store.set_pixel(0, 0, 5, 5, 3), Ok(false));
        assert_eq!(store.read(|s| s.sector_count(origin)), 1);

        assert_eq!(store.set_pixel(0, 0, 5, 5, 7), Ok(true));
        assert_eq!(store.read(|s| s.sector_count(origin)), 1);
        assert_eq!(store.get_pixel(0, 0, 5, 5), Ok(Some(7)));
    }

    #[test]
    fn repeat_write_emits_no_second_event() {
        let store = shared();
        let actions = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&actions);
        store.changes().subscribe("recorder", move |change| {
            sink.borrow_mut().push(change.action);
            Ok(())
        });

        store.set_pixel(1, 1, 0, 0, 4).unwrap();
        store.set_pixel(1, 1, 0, 0, 4).unwrap();
        store.set_pixel(1, 1, 0, 0, 5).unwrap();
        store.remove_pixel(1, 1, 0, 0).unwrap();

        assert_eq!(
            *actions.borrow(),
            vec![ChangeAction::Add, ChangeAction::Update, ChangeAction::Remove]
        );
    }

    #[test]
    fn out_of_range_coordinates_are_rejected() {
        let store = shared();
        assert!(matches!(
            store.set_pixel(0, 0, 256, 0, 1),
            Err(ValidationError::LocalOutOfRange { .. })
        ));
        assert!(store.remove_pixel(0, 0, 0, 999).is_err());
        assert!(store.get_pixel(0, 0, 300, 300).is_err());
        assert_eq!(store.read(|s| s.resident_count()), 0);
    }

    #[test]
    fn remove_drops_sector_from_active_set_at_zero() {
        let mut store = store();
        let sector = SectorCoord::new(2, -3);
        store.set_pixel(key(2, -3, 1, 1), 1, 0);
        store.set_pixel(key(2, -3, 1, 2), 1, 0);
        assert!(store.is_active(sector));

        assert!(store.remove_pixel(key(2, -3, 1, 1), 0).is_some());
        assert!(store.is_active(sector));
        assert!(store.remove_pixel(key(2, -3, 1, 1), 0).is_none());
        assert!(store.remove_pixel(key(2, -3, 1, 2), 0).is_some());
        assert!(!store.is_active(sector));
        assert_eq!(store.sector_count(sector), 0);
        assert!(store.active_sectors().is_empty());
    }

    #[test]
    fn sector_counts_track_set_pixels_under_mixed_sequences() {
        let mut store = store();
        let mut expected: HashMap<PixelKey, u8> = HashMap::new();
        let mut seed: u64 = 0x2545_F491_4F6C_DD1D;

        for step in 0..2_000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let k = key(
                (seed % 3) as i32 - 1,
                ((seed >> 8) % 2) as i32,
                ((seed >> 16) % 6) as u32,
                ((seed >> 24) % 6) as u32,
            );
            if (seed >> 40) % 3 == 0 {
                let removed = store.remove_pixel(k, step).is_some();
                assert_eq!(removed, expected.remove(&k).is_some());
            } else {
                let color = ((seed >> 32) % 4) as u8;
                let changed = store.set_pixel(k, color, step).is_some();
                assert_eq!(changed, expected.insert(k, color) != Some(color));
            }

            for sx in -1..=1 {
                for sy in 0..=1 {
                    let sector = SectorCoord::new(sx, sy);
                    let count = expected.keys().filter(|k| k.sector == sector).count();
                    assert_eq!(store.sector_count(sector), count);
                    assert_eq!(store.is_active(sector), count > 0);
                }
            }
            assert_eq!(store.resident_count(), expected.len());
        }
    }

    #[test]
    fn dirty_is_ordered_and_includes_removals() {
        let mut store = store();
        store.set_pixel(key(0, 0, 3, 3), 1, 10);
        store.set_pixel(key(0, 0, 1, 1), 2, 11);
        store.remove_pixel(key(0, 0, 3, 3), 12);

        let dirty = store.get_dirty();
        assert_eq!(dirty.len(), 2);
        assert_eq!(dirty[0].key, key(0, 0, 1, 1));
        assert_eq!(dirty[0].color, Some(2));
        assert_eq!(dirty[1].key, key(0, 0, 3, 3));
        assert_eq!(dirty[1].color, None);
        assert_eq!(dirty[1].timestamp, 12);
        assert!(dirty[0].seq < dirty[1].seq);
    }

    #[test]
    fn mark_clean_keeps_data_and_skips_rewritten_entries() {
        let mut store = store();
        store.set_pixel(key(0, 0, 0, 0), 1, 0);
        store.set_pixel(key(0, 0, 0, 1), 1, 0);
        let snapshot = store.get_dirty();

        store.set_pixel(key(0, 0, 0, 1), 2, 5);
        assert_eq!(store.mark_clean(&snapshot), 1);

        assert_eq!(store.get_pixel(key(0, 0, 0, 0)), Some(1));
        assert_eq!(store.dirty_count(), 1);
        assert_eq!(store.get_dirty()[0].color, Some(2));
    }

    #[test]
    fn remote_write_is_not_dirty_and_short_circuits() {
        let mut store = store();
        let change = store.apply_remote(key(0, 0, 9, 9), 4).unwrap();
        assert_eq!(change.origin, Origin::Remote);
        assert_eq!(change.action, ChangeAction::Add);
        assert_eq!(store.dirty_count(), 0);
        assert!(store.apply_remote(key(0, 0, 9, 9), 4).is_none());
        assert_eq!(store.sector_count(SectorCoord::new(0, 0)), 1);
    }

    #[test]
    fn remote_write_supersedes_unsaved_local_edit() {
        let mut store = PixelStore::new(StoreConfig {
            cache_max_pixels: 1,
        });
        store.set_pixel(key(0, 0, 5, 5), 9, 0);
        store.set_pixel(key(0, 0, 6, 6), 9, 0);
        store.set_pixel(key(3, 3, 0, 0), 2, 0);

        assert!(store.apply_remote(key(0, 0, 5, 5), 1).is_some());
        assert!(store.apply_remote(key(3, 3, 0, 0), 2).is_none());

        assert_eq!(store.get_pixel(key(0, 0, 5, 5)), Some(1));
        let dirty: Vec<_> = store.get_dirty().into_iter().map(|update| update.key).collect();
        assert_eq!(dirty, vec![key(0, 0, 6, 6)]);

        // 3:3 holds no dirty pixels any more, so it is evictable.
        store.optimize_cache();
        assert!(!store.is_active(SectorCoord::new(3, 3)));
        assert!(store.is_active(SectorCoord::new(0, 0)));
    }

    #[test]
    fn load_does_not_clobber_unsaved_local_edit() {
        let mut store = store();
        store.set_pixel(key(0, 0, 2, 2), 7, 0);
        assert!(store.load_pixel(key(0, 0, 2, 2), 1).is_none());
        assert_eq!(store.get_pixel(key(0, 0, 2, 2)), Some(7));
        assert!(store.load_pixel(key(0, 0, 2, 3), 1).is_some());
        assert_eq!(store.dirty_count(), 1);
    }

    #[test]
    fn sector_pixels_returns_only_that_sector() {
        let mut store = store();
        store.set_pixel(key(0, 0, 1, 1), 1, 0);
        store.set_pixel(key(0, 0, 2, 2), 2, 0);
        store.set_pixel(key(1, 0, 1, 1), 3, 0);

        let pixels = store.sector_pixels(SectorCoord::new(0, 0));
        assert_eq!(pixels.len(), 2);
        assert_eq!(pixels.get(&key(0, 0, 2, 2).local), Some(&2));
        assert!(store.sector_pixels(SectorCoord::new(5, 5)).is_empty());
    }

    #[test]
    fn set_multiple_pixels_matches_repeated_set() {
        let mut store = store();
        let batch = [(key(0, 0, 0, 0), 1), (key(0, 0, 0, 0), 1), (key(0, 0, 0, 1), 2)];
        let changes = store.set_multiple_pixels(&batch, 0);
        assert_eq!(changes.len(), 2);
        assert_eq!(store.resident_count(), 2);
    }

    #[test]
    fn optimize_cache_never_evicts_dirty_or_pinned_sectors() {
        let mut store = PixelStore::new(StoreConfig {
            cache_max_pixels: 2,
        });
        let dirty_sector = SectorCoord::new(0, 0);
        let pinned_sector = SectorCoord::new(1, 0);
        let idle_sector = SectorCoord::new(2, 0);

        store.set_pixel(key(0, 0, 0, 0), 1, 0);
        store.load_pixel(key(1, 0, 0, 0), 1);
        store.load_pixel(key(1, 0, 0, 1), 1);
        store.load_pixel(key(2, 0, 0, 0), 1);
        store.load_pixel(key(2, 0, 0, 1), 1);
        store.pin(pinned_sector);

        let report = store.optimize_cache();
        assert_eq!(report.evicted_sectors, 1);
        assert_eq!(report.evicted_pixels, 2);
        assert!(!store.is_active(idle_sector));
        assert!(store.is_active(dirty_sector));
        assert!(store.is_active(pinned_sector));

        // Still over budget, but nothing left is eligible.
        assert_eq!(store.resident_count(), 3);
        assert_eq!(store.optimize_cache().evicted_pixels, 0);
        assert_eq!(store.get_pixel(key(0, 0, 0, 0)), Some(1));
    }

    #[test]
    fn optimize_cache_evicts_least_recently_touched_first() {
        let mut store = PixelStore::new(StoreConfig {
            cache_max_pixels: 1,
        });
        store.load_pixel(key(5, 5, 0, 0), 1);
        store.load_pixel(key(6, 6, 0, 0), 1);
        store.load_pixel(key(5, 5, 0, 0), 2);

        store.optimize_cache();
        assert!(store.is_active(SectorCoord::new(5, 5)));
        assert!(!store.is_active(SectorCoord::new(6, 6)));
    }

    #[test]
    fn subscriber_can_read_store_during_dispatch() {
        let store = Rc::new(shared());
        let observed = Rc::new(RefCell::new(None));
        let reader = Rc::clone(&store);
        let sink = Rc::clone(&observed);
        store.changes().subscribe("reader", move |change| {
            *sink.borrow_mut() = reader.read(|s| s.get_pixel(change.key));
            Ok(())
        });

        store.set_pixel(0, 0, 1, 1, 6).unwrap();
        assert_eq!(*observed.borrow(), Some(6));
    }

    #[test]
    fn load_rows_skips_invalid_and_enforces_budget() {
        let store = SharedStore::new(
            StoreConfig {
                cache_max_pixels: 1,
            },
            Rc::new(ManualClock::new(0)),
        );
        let rows = [
            PixelRow {
                sector_x: 0,
                sector_y: 0,
                local_x: 1,
                local_y: 1,
                color: 1,
            },
            PixelRow {
                sector_x: 0,
                sector_y: 0,
                local_x: 900,
                local_y: 1,
                color: 1,
            },
            PixelRow {
                sector_x: 3,
                sector_y: 3,
                local_x: 1,
                local_y: 1,
                color: 1,
            },
        ];
        assert_eq!(store.load_rows(&rows), 2);
        assert_eq!(store.read(|s| s.resident_count()), 1);
    }
}
