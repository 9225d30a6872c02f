use gloo_net::http::Request;
use pixelgrid_shared::{PixelRow, SectorCoord};

use crate::error::TransportError;
use crate::services::NetworkClient;

/// HTTP pixel API client.
pub struct HttpNetwork {
    base_url: String,
}

impl HttpNetwork {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

async fn fetch_rows(url: &str) -> Result<Vec<PixelRow>, TransportError> {
    let resp = Request::get(url)
        .send()
        .await
        .map_err(|e| TransportError::Request(format!("fetch error: {e}")))?;

    if !resp.ok() {
        return Err(TransportError::Request(format!("HTTP {}", resp.status())));
    }

    resp.json::<Vec<PixelRow>>()
        .await
        .map_err(|e| TransportError::Request(format!("parse error: {e}")))
}

impl NetworkClient for HttpNetwork {
    async fn get_pixels_batch(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PixelRow>, TransportError> {
        fetch_rows(&format!(
            "{}/api/pixels?offset={offset}&limit={limit}",
            self.base_url
        ))
        .await
    }

    async fn get_sector_pixels(&self, sector: SectorCoord) -> Result<Vec<PixelRow>, TransportError> {
        fetch_rows(&format!(
            "{}/api/sectors/{}/{}/pixels",
            self.base_url, sector.x, sector.y
        ))
        .await
    }
}
