//! Real-time delta ingestion.
//!
//! Inbound messages are decoded into a fixed-capacity ring buffer and drained at most
//! once per frame. A drain keeps only the newest update per pixel, applies the
//! survivors through a [`RemoteSink`], and announces one [`DirtyRegion`].

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

use pixelgrid_shared::codec::decode_message;
use pixelgrid_shared::{GRID_SIZE, InboundMessage, InboundUpdate, LocalCoord, SectorCoord};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::IngestConfig;
use crate::events::{DirtyRegion, EventBus};
use crate::services::FrameScheduler;

/// Receives deduplicated remote updates for one sector and reports which
/// local coordinates actually changed.
pub trait RemoteSink {
    fn apply_remote_updates(&self, sector: SectorCoord, updates: &[InboundUpdate])
    -> Vec<LocalCoord>;
}

/// Fixed-capacity circular buffer. Pushing into a full buffer overwrites the oldest slot.
#[derive(Debug)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the overwritten item when the buffer was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let capacity = self.capacity();
        let tail = (self.head + self.len) % capacity;
        let evicted = self.slots[tail].replace(item);
        if self.len == capacity {
            self.head = (self.head + 1) % capacity;
        } else {
            self.len += 1;
        }
        evicted
    }

    /// Empty the buffer, oldest item first.
    pub fn take_all(&mut self) -> Vec<T> {
        let capacity = self.capacity();
        let items = (0..self.len)
            .filter_map(|offset| self.slots[(self.head + offset) % capacity].take())
            .collect();
        self.head = 0;
        self.len = 0;
        items
    }
}

#[derive(Debug, Clone)]
struct Buffered {
    update: InboundUpdate,
    timestamp: i64,
    arrival: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub received: u64,
    pub overwritten: u64,
    pub rejected: u64,
    pub decode_errors: u64,
    pub drains: u64,
    pub applied: u64,
}

pub struct UpdateIngest {
    sink: Rc<dyn RemoteSink>,
    frames: Rc<dyn FrameScheduler>,
    clock: Rc<dyn Clock>,
    config: IngestConfig,
    buffer: RefCell<RingBuffer<Buffered>>,
    focus: Cell<SectorCoord>,
    frame_pending: Cell<bool>,
    last_drain_ms: Cell<Option<i64>>,
    next_arrival: Cell<u64>,
    regions: EventBus<DirtyRegion>,
    stats: Cell<IngestStats>,
}

impl UpdateIngest {
    pub fn new(
        sink: Rc<dyn RemoteSink>,
        frames: Rc<dyn FrameScheduler>,
        clock: Rc<dyn Clock>,
        config: IngestConfig,
    ) -> Self {
        Self {
            sink,
            frames,
            clock,
            buffer: RefCell::new(RingBuffer::with_capacity(config.capacity)),
            config,
            focus: Cell::new(SectorCoord::new(0, 0)),
            frame_pending: Cell::new(false),
            last_drain_ms: Cell::new(None),
            next_arrival: Cell::new(0),
            regions: EventBus::new(),
            stats: Cell::new(IngestStats::default()),
        }
    }

    /// Dirty-region notifications, one per drain that changed something.
    pub fn regions(&self) -> &EventBus<DirtyRegion> {
        &self.regions
    }

    pub fn focus(&self) -> SectorCoord {
        self.focus.get()
    }

    pub fn stats(&self) -> IngestStats {
        self.stats.get()
    }

    pub fn pending(&self) -> usize {
        self.buffer.borrow().len()
    }

    /// Re-target inbound updates. Anything buffered for the previous sector is drained first.
    pub fn set_focus(&self, sector: SectorCoord) {
        if sector == self.focus.get() {
            return;
        }
        if !self.buffer.borrow().is_empty() {
            self.drain();
        }
        self.focus.set(sector);
    }

    /// Decode and buffer one transport message. Returns how many updates were buffered.
    /// A malformed message is logged and dropped without affecting anything else.
    pub fn receive(&self, message: &InboundMessage) -> usize {
        let updates = match decode_message(message) {
            Ok(updates) => updates,
            Err(e) => {
                warn!(error = %e, "dropping undecodable inbound message");
                self.bump(|stats| stats.decode_errors += 1);
                return 0;
            }
        };

        let now = self.clock.now_ms();
        let mut buffered = 0;
        let mut overwritten = 0;
        let mut rejected = 0;
        {
            let mut buffer = self.buffer.borrow_mut();
            for update in updates {
                if update.update.local().is_err() {
                    rejected += 1;
                    continue;
                }
                let arrival = self.next_arrival.get();
                self.next_arrival.set(arrival + 1);
                let timestamp = update.timestamp.unwrap_or(now);
                if buffer
                    .push(Buffered {
                        update,
                        timestamp,
                        arrival,
                    })
                    .is_some()
                {
                    overwritten += 1;
                }
                buffered += 1;
            }
        }

        if rejected > 0 {
            warn!(rejected, "inbound updates outside the sector grid");
        }
        if overwritten > 0 {
            debug!(overwritten, "ingest buffer full, oldest updates overwritten");
        }
        self.bump(|stats| {
            stats.received += buffered as u64;
            stats.overwritten += overwritten;
            stats.rejected += rejected;
        });
        if buffered > 0 {
            self.schedule_frame();
        }
        buffered
    }

    /// Frame callback. Drains unless the previous drain was within the throttle
    /// window, in which case another frame is requested.
    pub fn on_frame(&self) -> Option<DirtyRegion> {
        self.frame_pending.set(false);
        if self.buffer.borrow().is_empty() {
            return None;
        }
        let now = self.clock.now_ms();
        if let Some(last) = self.last_drain_ms.get()
            && now - last < self.config.throttle_ms
        {
            self.schedule_frame();
            return None;
        }
        self.drain()
    }

    /// Apply everything buffered now. Returns the emitted region, if any pixel changed.
    pub fn drain(&self) -> Option<DirtyRegion> {
        let mut pending = self.buffer.borrow_mut().take_all();
        self.last_drain_ms.set(Some(self.clock.now_ms()));
        if pending.is_empty() {
            return None;
        }

        pending.sort_by_key(|item| (item.timestamp, item.arrival));
        let mut seen = HashSet::new();
        let mut survivors: Vec<InboundUpdate> = pending
            .into_iter()
            .rev()
            .filter(|item| seen.insert(item.update.update.packed_key()))
            .map(|item| InboundUpdate {
                timestamp: Some(item.timestamp),
                ..item.update
            })
            .collect();
        survivors.reverse();

        let sector = self.focus.get();
        let changed = self.sink.apply_remote_updates(sector, &survivors);
        self.bump(|stats| {
            stats.drains += 1;
            stats.applied += changed.len() as u64;
        });

        let region = bounding_region(sector, &changed, self.config.dirty_margin)?;
        debug!(
            sector = %sector,
            applied = changed.len(),
            candidates = survivors.len(),
            "drained inbound updates"
        );
        self.regions.emit(&region);
        Some(region)
    }

    fn schedule_frame(&self) {
        if !self.frame_pending.replace(true) {
            self.frames.request_frame();
        }
    }

    fn bump(&self, f: impl FnOnce(&mut IngestStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }
}

/// Bounding box of `points`, padded by `margin` and clamped to the sector.
fn bounding_region(sector: SectorCoord, points: &[LocalCoord], margin: u16) -> Option<DirtyRegion> {
    let first = points.first()?;
    let (mut min_x, mut min_y) = (first.x(), first.y());
    let (mut max_x, mut max_y) = (min_x, min_y);
    for point in &points[1..] {
        min_x = min_x.min(point.x());
        min_y = min_y.min(point.y());
        max_x = max_x.max(point.x());
        max_y = max_y.max(point.y());
    }
    let edge = GRID_SIZE - 1;
    Some(DirtyRegion {
        sector,
        min_x: min_x.saturating_sub(margin),
        min_y: min_y.saturating_sub(margin),
        max_x: max_x.saturating_add(margin).min(edge),
        max_y: max_y.saturating_add(margin).min(edge),
    })
}
