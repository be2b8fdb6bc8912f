use lazy_static::lazy_static;
use maplit::hashmap;
use regex::Regex;
use std::collections::HashMap;

use crate::error::{HgtError, Result};

lazy_static! {
    /// SRS names as found in the first `|`-separated token of GeoTIFF
    /// geo_params, mapped to their EPSG codes.
    static ref KNOWN_SRS: HashMap<&'static str, u16> = hashmap! {
        "WGS 84" => 4326,
        "WGS84" => 4326,
        "WGS 84 / Pseudo-Mercator" => 3857,
        "WGS 84 / World Mercator" => 3395,
        "ETRS89" => 4258,
        "ETRS89 / UTM zone 32N" => 25832,
        "ETRS89 / UTM zone 33N" => 25833,
        "WGS 84 / UTM zone 32N" => 32632,
        "WGS 84 / UTM zone 33N" => 32633,
        "NAD83" => 4269,
    };
    static ref EPSG_CODE: Regex = Regex::new(r"(?i)EPSG[:\s]*(\d{4,5})").unwrap();
}

/// Resolves GeoTIFF SRS descriptions to EPSG codes.
///
/// Descriptions come from the tiff geo_params tag, e.g.
/// `"ETRS89 / UTM zone 32N|ETRS89|"`.  Only the projected/geographic CRS
/// name before the first `|` is relevant.
pub struct SrsResolver;

impl SrsResolver {
    pub fn new() -> Self {
        SrsResolver
    }

    pub fn get_epsg(&self, geo_params: &str) -> Result<u16> {
        let name = geo_params.split('|').next().unwrap_or("").trim();
        if let Some(&code) = KNOWN_SRS.get(name) {
            return Ok(code);
        }
        if let Some(caps) = EPSG_CODE.captures(name) {
            if let Ok(code) = caps[1].parse::<u16>() {
                return Ok(code);
            }
        }
        Err(HgtError::UnsupportedProjection(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_wgs84() {
        let resolver = SrsResolver::new();
        assert_eq!(resolver.get_epsg("WGS 84|WGS 84|").unwrap(), 4326);
    }

    #[test]
    fn test_resolve_utm() {
        let resolver = SrsResolver::new();
        assert_eq!(
            resolver.get_epsg("ETRS89 / UTM zone 32N|ETRS89|").unwrap(),
            25832
        );
    }

    #[test]
    fn test_resolve_epsg_literal() {
        let resolver = SrsResolver::new();
        assert_eq!(resolver.get_epsg("EPSG:3857").unwrap(), 3857);
        assert_eq!(resolver.get_epsg("epsg 4326").unwrap(), 4326);
    }

    #[test]
    fn test_resolve_unknown() {
        let resolver = SrsResolver::new();
        assert!(matches!(
            resolver.get_epsg("Interrupted Goode Homolosine"),
            Err(HgtError::UnsupportedProjection(_))
        ));
    }
}
