use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Width and height of one sector, in pixels.
pub const GRID_SIZE: u16 = 256;

/// 8-bit palette index.
pub type Color = u8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("local coordinate ({x}, {y}) is outside the sector grid")]
    LocalOutOfRange { x: u32, y: u32 },
    #[error("global coordinate ({x}, {y}) maps outside the addressable sector range")]
    GlobalOutOfRange { x: i64, y: i64 },
    #[error("malformed key {0:?}")]
    MalformedKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SectorCoord {
    pub x: i32,
    pub y: i32,
}

impl SectorCoord {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Squared distance between sector origins, used for nearest-first ordering.
    pub fn distance_sq(&self, other: &SectorCoord) -> i64 {
        let dx = self.x as i64 - other.x as i64;
        let dy = self.y as i64 - other.y as i64;
        dx * dx + dy * dy
    }
}

impl fmt::Display for SectorCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.x, self.y)
    }
}

impl FromStr for SectorCoord {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ValidationError::MalformedKey(s.to_string());
        let (x, y) = s.split_once(':').ok_or_else(malformed)?;
        Ok(Self {
            x: x.parse().map_err(|_| malformed())?,
            y: y.parse().map_err(|_| malformed())?,
        })
    }
}

/// Pixel position within a sector. Only constructible in range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LocalCoord {
    x: u16,
    y: u16,
}

impl LocalCoord {
    pub fn new(x: u32, y: u32) -> Result<Self, ValidationError> {
        if x >= GRID_SIZE as u32 || y >= GRID_SIZE as u32 {
            return Err(ValidationError::LocalOutOfRange { x, y });
        }
        Ok(Self {
            x: x as u16,
            y: y as u16,
        })
    }

    pub const fn x(&self) -> u16 {
        self.x
    }

    pub const fn y(&self) -> u16 {
        self.y
    }

    /// Packed `x << 16 | y` key. Unique for any coordinate pair that fits the wire format.
    pub const fn packed(&self) -> u32 {
        ((self.x as u32) << 16) | self.y as u32
    }
}

impl<'de> Deserialize<'de> for LocalCoord {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            x: u32,
            y: u32,
        }

        let raw = Raw::deserialize(deserializer)?;
        LocalCoord::new(raw.x, raw.y).map_err(serde::de::Error::custom)
    }
}

/// Canonical identity of one pixel: its sector plus the local coordinate inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PixelKey {
    pub sector: SectorCoord,
    pub local: LocalCoord,
}

impl PixelKey {
    pub const fn new(sector: SectorCoord, local: LocalCoord) -> Self {
        Self { sector, local }
    }

    pub fn from_parts(sx: i32, sy: i32, lx: u32, ly: u32) -> Result<Self, ValidationError> {
        Ok(Self {
            sector: SectorCoord::new(sx, sy),
            local: LocalCoord::new(lx, ly)?,
        })
    }

    /// Map a world coordinate onto its sector and local position.
    /// Negative coordinates land in negative sectors (floor division).
    pub fn from_global(gx: i64, gy: i64) -> Result<Self, ValidationError> {
        let size = GRID_SIZE as i64;
        let sx = i32::try_from(gx.div_euclid(size))
            .map_err(|_| ValidationError::GlobalOutOfRange { x: gx, y: gy })?;
        let sy = i32::try_from(gy.div_euclid(size))
            .map_err(|_| ValidationError::GlobalOutOfRange { x: gx, y: gy })?;
        let local = LocalCoord::new(gx.rem_euclid(size) as u32, gy.rem_euclid(size) as u32)?;
        Ok(Self {
            sector: SectorCoord::new(sx, sy),
            local,
        })
    }

    pub fn to_global(&self) -> (i64, i64) {
        let size = GRID_SIZE as i64;
        (
            self.sector.x as i64 * size + self.local.x as i64,
            self.sector.y as i64 * size + self.local.y as i64,
        )
    }
}

impl fmt::Display for PixelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.sector.x, self.sector.y, self.local.x, self.local.y
        )
    }
}

impl FromStr for PixelKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ValidationError::MalformedKey(s.to_string());
        let mut parts = s.split(':');
        let mut next = || parts.next().ok_or_else(malformed);
        let sx = next()?.parse::<i32>().map_err(|_| malformed())?;
        let sy = next()?.parse::<i32>().map_err(|_| malformed())?;
        let lx = next()?.parse::<u32>().map_err(|_| malformed())?;
        let ly = next()?.parse::<u32>().map_err(|_| malformed())?;
        if parts.next().is_some() {
            return Err(malformed());
        }
        Self::from_parts(sx, sy, lx, ly)
    }
}

/// One set pixel as exchanged with storage and the HTTP API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PixelRow {
    pub sector_x: i32,
    pub sector_y: i32,
    pub local_x: u32,
    pub local_y: u32,
    pub color: Color,
}

impl PixelRow {
    pub fn from_key(key: PixelKey, color: Color) -> Self {
        Self {
            sector_x: key.sector.x,
            sector_y: key.sector.y,
            local_x: key.local.x as u32,
            local_y: key.local.y as u32,
            color,
        }
    }

    pub fn key(&self) -> Result<PixelKey, ValidationError> {
        PixelKey::from_parts(self.sector_x, self.sector_y, self.local_x, self.local_y)
    }
}

#[cfg(test)]
mod tests {
    use super::{GRID_SIZE, LocalCoord, PixelKey, PixelRow, SectorCoord, ValidationError};

    #[test]
    fn local_coord_rejects_out_of_range() {
        assert!(LocalCoord::new(0, 0).is_ok());
        assert!(LocalCoord::new(255, 255).is_ok());
        assert_eq!(
            LocalCoord::new(GRID_SIZE as u32, 3),
            Err(ValidationError::LocalOutOfRange { x: 256, y: 3 })
        );
        assert!(LocalCoord::new(3, 1_000).is_err());
    }

    #[test]
    fn pixel_key_string_roundtrip() {
        let key = PixelKey::from_parts(-3, 12, 5, 250).unwrap();
        let text = key.to_string();
        assert_eq!(text, "-3:12:5:250");
        assert_eq!(text.parse::<PixelKey>().unwrap(), key);
    }

    #[test]
    fn pixel_key_parse_rejects_garbage() {
        assert!("1:2:3".parse::<PixelKey>().is_err());
        assert!("1:2:3:4:5".parse::<PixelKey>().is_err());
        assert!("a:2:3:4".parse::<PixelKey>().is_err());
        assert!("0:0:300:4".parse::<PixelKey>().is_err());
    }

    #[test]
    fn sector_key_roundtrip() {
        let sector = SectorCoord::new(7, -2);
        assert_eq!(sector.to_string(), "7:-2");
        assert_eq!("7:-2".parse::<SectorCoord>().unwrap(), sector);
        assert!("7".parse::<SectorCoord>().is_err());
    }

    #[test]
    fn global_coordinates_use_floor_division() {
        let key = PixelKey::from_global(-1, 257).unwrap();
        assert_eq!(key.sector, SectorCoord::new(-1, 1));
        assert_eq!((key.local.x(), key.local.y()), (255, 1));
        assert_eq!(key.to_global(), (-1, 257));
    }

    #[test]
    fn packed_key_is_x_high_y_low() {
        let local = LocalCoord::new(2, 3).unwrap();
        assert_eq!(local.packed(), (2 << 16) | 3);
    }

    #[test]
    fn deserializing_local_coord_validates_range() {
        let ok: LocalCoord = serde_json::from_str(r#"{"x":4,"y":9}"#).unwrap();
        assert_eq!((ok.x(), ok.y()), (4, 9));
        assert!(serde_json::from_str::<LocalCoord>(r#"{"x":400,"y":9}"#).is_err());
    }

    #[test]
    fn pixel_row_uses_camel_case_fields() {
        let row: PixelRow = serde_json::from_str(
            r#"{"sectorX":1,"sectorY":-1,"localX":10,"localY":20,"color":4}"#,
        )
        .unwrap();
        let key = row.key().unwrap();
        assert_eq!(key.sector, SectorCoord::new(1, -1));
        assert_eq!(PixelRow::from_key(key, 4), row);
    }
}
