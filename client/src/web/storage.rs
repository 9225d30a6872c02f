use gloo_storage::errors::StorageError;
use gloo_storage::{LocalStorage, Storage};
use pixelgrid_shared::{Color, LocalCoord, SectorCoord};

use crate::error::PersistenceError;
use crate::services::{SectorPixels, StorageService};

/// `localStorage`-backed persistence. Sector snapshots are stored as
/// `[[x, y, color], ...]` under `{prefix}sector_{sx}:{sy}`.
pub struct BrowserStorage {
    prefix: String,
}

impl BrowserStorage {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}{name}", self.prefix)
    }
}

fn read<T: serde::de::DeserializeOwned>(key: &str) -> Result<Option<T>, PersistenceError> {
    match LocalStorage::get::<T>(key) {
        Ok(value) => Ok(Some(value)),
        Err(StorageError::KeyNotFound(_)) => Ok(None),
        Err(StorageError::SerdeError(e)) => Err(PersistenceError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        }),
        Err(e) => Err(PersistenceError::Read {
            key: key.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn write<T: serde::Serialize>(key: &str, value: T) -> Result<(), PersistenceError> {
    LocalStorage::set(key, value).map_err(|e| PersistenceError::Write {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

impl StorageService for BrowserStorage {
    async fn get_sector_data(
        &self,
        sector: SectorCoord,
    ) -> Result<Option<SectorPixels>, PersistenceError> {
        let key = self.key(&PersistenceError::sector_key(sector));
        let Some(records) = read::<Vec<(u16, u16, Color)>>(&key)? else {
            return Ok(None);
        };
        records
            .into_iter()
            .map(|(x, y, color)| {
                LocalCoord::new(x as u32, y as u32)
                    .map(|local| (local, color))
                    .map_err(|e| PersistenceError::Corrupt {
                        key: key.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect::<Result<SectorPixels, _>>()
            .map(Some)
    }

    async fn save_sector_data(
        &self,
        sector: SectorCoord,
        pixels: &SectorPixels,
    ) -> Result<(), PersistenceError> {
        let records: Vec<(u16, u16, Color)> = pixels
            .iter()
            .map(|(local, color)| (local.x(), local.y(), *color))
            .collect();
        write(&self.key(&PersistenceError::sector_key(sector)), records)
    }

    async fn get_item(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        read::<String>(&self.key(key))
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        write(&self.key(key), value)
    }
}
