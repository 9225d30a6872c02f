use pixelgrid_shared::SectorCoord;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("storage read failed for {key}: {reason}")]
    Read { key: String, reason: String },
    #[error("storage write failed for {key}: {reason}")]
    Write { key: String, reason: String },
    #[error("stored value for {key} is not valid: {reason}")]
    Corrupt { key: String, reason: String },
}

impl PersistenceError {
    pub fn sector_key(sector: SectorCoord) -> String {
        format!("sector_{sector}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("request failed: {0}")]
    Request(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("subscriber {subscriber} failed: {reason}")]
pub struct SubscriberError {
    pub subscriber: &'static str,
    pub reason: String,
}

impl SubscriberError {
    pub fn new(subscriber: &'static str, reason: impl Into<String>) -> Self {
        Self {
            subscriber,
            reason: reason.into(),
        }
    }
}
