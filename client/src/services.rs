//! Seams to the outside world: persistence, realtime delivery, bulk HTTP fetches,
//! and the presentation layer's frame clock.

#![allow(async_fn_in_trait)]

use std::cell::RefCell;
use std::collections::HashMap;

use pixelgrid_shared::{Color, InboundMessage, LocalCoord, PixelRow, SectorCoord};

use crate::error::{PersistenceError, TransportError};

pub type SectorPixels = HashMap<LocalCoord, Color>;

/// Durable key/value persistence. Implementations must survive a process restart.
pub trait StorageService {
    async fn get_sector_data(
        &self,
        sector: SectorCoord,
    ) -> Result<Option<SectorPixels>, PersistenceError>;

    /// Replace the stored snapshot of `sector` with `pixels`.
    async fn save_sector_data(
        &self,
        sector: SectorCoord,
        pixels: &SectorPixels,
    ) -> Result<(), PersistenceError>;

    async fn get_item(&self, key: &str) -> Result<Option<String>, PersistenceError>;

    async fn set_item(&self, key: &str, value: &str) -> Result<(), PersistenceError>;
}

/// Bidirectional realtime channel. Outbound messages are routed per sector;
/// inbound traffic arrives as [`TransportEvent`]s through the session.
pub trait RealtimeTransport {
    /// Resolves once the channel is open.
    async fn connect(&self) -> Result<(), TransportError>;

    async fn send(&self, sector: SectorCoord, payload: Vec<u8>) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}

/// Bulk pixel fetches over HTTP.
pub trait NetworkClient {
    async fn get_pixels_batch(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PixelRow>, TransportError>;

    async fn get_sector_pixels(&self, sector: SectorCoord) -> Result<Vec<PixelRow>, TransportError>;
}

/// Requests a callback at the next rendering opportunity. Repeated requests before
/// that tick must coalesce into one.
pub trait FrameScheduler {
    fn request_frame(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Close,
    Error(String),
    Message(InboundMessage),
}

/// Process-local storage. Nothing survives a restart; used by headless hosts and tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    sectors: RefCell<HashMap<SectorCoord, SectorPixels>>,
    items: RefCell<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sector_count(&self) -> usize {
        self.sectors.borrow().len()
    }
}

impl StorageService for MemoryStorage {
    async fn get_sector_data(
        &self,
        sector: SectorCoord,
    ) -> Result<Option<SectorPixels>, PersistenceError> {
        Ok(self.sectors.borrow().get(&sector).cloned())
    }

    async fn save_sector_data(
        &self,
        sector: SectorCoord,
        pixels: &SectorPixels,
    ) -> Result<(), PersistenceError> {
        self.sectors.borrow_mut().insert(sector, pixels.clone());
        Ok(())
    }

    async fn get_item(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.items.borrow().get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        self.items
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
