use std::fmt;

use crate::error::{HgtError, Result};

/// Axis-aligned geographic bounding box, (min_lon, min_lat, max_lon, max_lat).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bbox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl Bbox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    /// Parses an `--area` string, `LEFT:BOTTOM:RIGHT:TOP`.
    pub fn parse_area(area: &str) -> Result<Self> {
        let parts: Vec<&str> = area.split(':').collect();
        if parts.len() != 4 {
            return Err(HgtError::InvalidOptions(format!(
                "invalid area {area:?}: expected LEFT:BOTTOM:RIGHT:TOP"
            )));
        }
        let mut bounds = [0.0f64; 4];
        for (i, part) in parts.iter().enumerate() {
            bounds[i] = part.parse().map_err(|_| {
                HgtError::InvalidOptions(format!("invalid area coordinate {part:?} in {area:?}"))
            })?;
        }
        Ok(Self::new(bounds[0], bounds[1], bounds[2], bounds[3]))
    }

    /// Union of two boxes.
    pub fn extend(&self, other: &Bbox) -> Bbox {
        Bbox::new(
            self.min_lon.min(other.min_lon),
            self.min_lat.min(other.min_lat),
            self.max_lon.max(other.max_lon),
            self.max_lat.max(other.max_lat),
        )
    }

    /// Filename middle part, `lon<min>_<max>lat<min>_<max>` with 2 decimals.
    pub fn to_file_name_part(&self) -> String {
        format!(
            "lon{:.2}_{:.2}lat{:.2}_{:.2}",
            self.min_lon, self.max_lon, self.min_lat, self.max_lat
        )
    }

    /// OSM XML bounds tag with 7 decimal places.
    pub fn to_bounds_tag(&self) -> String {
        format!(
            "<bounds minlat=\"{:.7}\" minlon=\"{:.7}\" maxlat=\"{:.7}\" maxlon=\"{:.7}\"/>",
            self.min_lat, self.min_lon, self.max_lat, self.max_lon
        )
    }
}

impl fmt::Display for Bbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:.5}, {:.5}, {:.5}, {:.5})",
            self.min_lon, self.min_lat, self.max_lon, self.max_lat
        )
    }
}
