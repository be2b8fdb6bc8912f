use proj4rs::Proj;

use crate::bbox::Bbox;
use crate::error::{HgtError, Result};

pub const WGS84_EPSG: u16 = 4326;

/// Coordinate transform between two EPSG-coded reference systems.
///
/// Only the codes are stored; `proj4rs` projection objects are built per
/// batch so the transform stays trivially `Send + Sync` for the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transform {
    src_epsg: u16,
    dst_epsg: u16,
}

impl Transform {
    /// Transform from `src_epsg` into EPSG:4326. Returns `None` when the
    /// source already is EPSG:4326.
    pub fn to_wgs84(src_epsg: u16) -> Option<Self> {
        if src_epsg == WGS84_EPSG {
            None
        } else {
            Some(Self {
                src_epsg,
                dst_epsg: WGS84_EPSG,
            })
        }
    }

    /// The reverse transform, EPSG:4326 back into `dst_epsg`.
    pub fn reversed(&self) -> Self {
        Self {
            src_epsg: self.dst_epsg,
            dst_epsg: self.src_epsg,
        }
    }

    fn projections(&self) -> Result<(Proj, Proj)> {
        let src = Proj::from_epsg_code(self.src_epsg)
            .map_err(|e| HgtError::UnsupportedProjection(format!("EPSG:{}: {e}", self.src_epsg)))?;
        let dst = Proj::from_epsg_code(self.dst_epsg)
            .map_err(|e| HgtError::UnsupportedProjection(format!("EPSG:{}: {e}", self.dst_epsg)))?;
        Ok((src, dst))
    }

    pub fn apply(&self, lon: f64, lat: f64) -> Result<(f64, f64)> {
        let (src, dst) = self.projections()?;
        transform_point(&src, &dst, lon, lat)
    }

    /// Transforms each point, keeping positions; points the projection
    /// cannot map become `None`.
    pub fn apply_each(&self, points: &[(f64, f64)]) -> Result<Vec<Option<(f64, f64)>>> {
        let (src, dst) = self.projections()?;
        Ok(points
            .iter()
            .map(|&(lon, lat)| match transform_point(&src, &dst, lon, lat) {
                Ok(p) if p.0.is_finite() && p.1.is_finite() => Some(p),
                _ => None,
            })
            .collect())
    }

    /// Transforms points in place, dropping points the projection cannot map.
    pub fn apply_points(&self, points: &mut Vec<(f64, f64)>) -> Result<()> {
        let (src, dst) = self.projections()?;
        let mut transformed = Vec::with_capacity(points.len());
        for &(lon, lat) in points.iter() {
            if let Ok(point) = transform_point(&src, &dst, lon, lat) {
                if point.0.is_finite() && point.1.is_finite() {
                    transformed.push(point);
                }
            }
        }
        *points = transformed;
        Ok(())
    }
}

fn transform_point(src: &Proj, dst: &Proj, lon: f64, lat: f64) -> Result<(f64, f64)> {
    let mut point = (lon, lat, 0.);

    if src.is_latlong() {
        point.0 = point.0.to_radians();
        point.1 = point.1.to_radians();
    }

    proj4rs::transform::transform(src, dst, &mut point)
        .map_err(|e| HgtError::UnsupportedProjection(e.to_string()))?;

    if dst.is_latlong() {
        point.0 = point.0.to_degrees();
        point.1 = point.1.to_degrees();
    }

    Ok((point.0, point.1))
}

/// Transforms a bbox by mapping its four corners and taking the envelope.
pub fn transform_bbox(bbox: &Bbox, transform: Option<&Transform>) -> Result<Bbox> {
    let transform = match transform {
        None => return Ok(*bbox),
        Some(t) => t,
    };
    let mut corners = vec![
        (bbox.min_lon, bbox.min_lat),
        (bbox.max_lon, bbox.max_lat),
        (bbox.min_lon, bbox.max_lat),
        (bbox.max_lon, bbox.min_lat),
    ];
    transform.apply_points(&mut corners)?;
    if corners.len() != 4 {
        return Err(HgtError::UnsupportedProjection(
            "bbox corner does not map into the target system".to_string(),
        ));
    }
    let lons: Vec<f64> = corners.iter().map(|c| c.0).collect();
    let lats: Vec<f64> = corners.iter().map(|c| c.1).collect();
    Ok(Bbox::new(
        lons.iter().cloned().fold(f64::INFINITY, f64::min),
        lats.iter().cloned().fold(f64::INFINITY, f64::min),
        lons.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        lats.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
    ))
}
