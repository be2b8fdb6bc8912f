use std::path::Path;

use geo::{BooleanOps, Contains, LineString, MultiPolygon, Point, Polygon};
use itertools::Itertools;
use log::debug;

use crate::bbox::Bbox;
use crate::error::{HgtError, Result};
use crate::raster::Mask;
use crate::transform::Transform;

/// Clip-polygon bbox expansion in degrees.  Grid points can end up exactly
/// on the bbox cut lines otherwise, where point-in-polygon results are
/// undefined.
const BBOX_EXPAND_EPSILON: f64 = 0.1;

/// Reads a clip polygon file: vertex lines of whitespace-separated
/// `lon lat`, grouped into sections by numeric headers and terminated by
/// `END`, with a final `END` closing the file.  Returns the overall bbox
/// of all vertices and the polygons.
pub fn parse_polygon_file(path: &Path) -> Result<(Bbox, Vec<Polygon<f64>>)> {
    let content = std::fs::read_to_string(path).map_err(|_| {
        HgtError::InvalidOptions(format!("couldn't find polygon file: {}", path.display()))
    })?;

    let mut polygons: Vec<Polygon<f64>> = Vec::new();
    let mut current: Vec<(f64, f64)> = Vec::new();
    for line in content.lines() {
        let line = line.trim().to_lowercase();
        if line.is_empty() {
            continue;
        }
        if line == "end" {
            if !current.is_empty() {
                polygons.push(Polygon::new(LineString::from(current.clone()), vec![]));
                current.clear();
            }
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() == 1 {
            // only a numeric section header begins a new polygon; other
            // single-word lines (e.g. the region name) are ignored
            if tokens[0].parse::<u64>().is_ok() {
                current.clear();
            }
            continue;
        }
        if tokens.len() == 2 {
            if let (Ok(lon), Ok(lat)) = (tokens[0].parse::<f64>(), tokens[1].parse::<f64>()) {
                current.push((lon, lat));
            }
        }
    }

    let vertices: Vec<(f64, f64)> = polygons
        .iter()
        .flat_map(|p| p.exterior().points().map(|pt| (pt.x(), pt.y())))
        .collect();
    if vertices.is_empty() {
        return Err(HgtError::InvalidOptions(format!(
            "polygon file {} contains no polygon",
            path.display()
        )));
    }
    let (min_lon, max_lon) = vertices
        .iter()
        .map(|v| v.0)
        .minmax_by(|a, b| a.total_cmp(b))
        .into_option()
        .unwrap();
    let (min_lat, max_lat) = vertices
        .iter()
        .map(|v| v.1)
        .minmax_by(|a, b| a.total_cmp(b))
        .into_option()
        .unwrap();
    Ok((Bbox::new(min_lon, min_lat, max_lon, max_lat), polygons))
}

/// Computes the clip mask of a tile against `polygons` (EPSG:4326).
///
/// `x_axis`/`y_axis` are the tile's 1-D longitude and latitude axes in the
/// tile's own reference system; `transform` maps them into EPSG:4326 when
/// the systems differ.  The returned mask is `true` where a grid point lies
/// outside every polygon.  When no polygon intersects the tile at all, a
/// 1x1 all-true mask is returned.
pub fn polygon_mask(
    x_axis: &[f64],
    y_axis: &[f64],
    polygons: &[Polygon<f64>],
    transform: Option<&Transform>,
) -> Result<Mask> {
    let x_min = x_axis.iter().cloned().fold(f64::INFINITY, f64::min);
    let x_max = x_axis.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let y_min = y_axis.iter().cloned().fold(f64::INFINITY, f64::min);
    let y_max = y_axis.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mut bbox_ring = vec![
        (x_min - BBOX_EXPAND_EPSILON, y_min - BBOX_EXPAND_EPSILON),
        (x_min - BBOX_EXPAND_EPSILON, y_max + BBOX_EXPAND_EPSILON),
        (x_max + BBOX_EXPAND_EPSILON, y_max + BBOX_EXPAND_EPSILON),
        (x_max + BBOX_EXPAND_EPSILON, y_min - BBOX_EXPAND_EPSILON),
        (x_min - BBOX_EXPAND_EPSILON, y_min - BBOX_EXPAND_EPSILON),
    ];

    let rows = y_axis.len();
    let cols = x_axis.len();
    let mut grid_points: Vec<(f64, f64)> = Vec::with_capacity(rows * cols);
    for &y in y_axis {
        for &x in x_axis {
            grid_points.push((x, y));
        }
    }

    let transformed: Vec<Option<(f64, f64)>> = match transform {
        None => grid_points.into_iter().map(Some).collect(),
        Some(t) => {
            t.apply_points(&mut bbox_ring)?;
            t.apply_each(&grid_points)?
        }
    };

    // clip the polygons to the expanded tile bbox first; point-in-polygon
    // over the full grid is the expensive part
    let bbox_shape = Polygon::new(LineString::from(bbox_ring), vec![]);
    let mut clipped: Vec<Polygon<f64>> = Vec::new();
    for polygon in polygons {
        let intersection: MultiPolygon<f64> = polygon.intersection(&bbox_shape);
        for part in intersection {
            if part.exterior().0.len() >= 4 {
                clipped.push(part);
            }
        }
    }
    if clipped.is_empty() {
        debug!("no clip polygon intersects the tile, masking it entirely");
        return Ok(Mask::filled(1, 1, true));
    }

    let mut mask = Mask::filled(rows, cols, true);
    for r in 0..rows {
        for c in 0..cols {
            match transformed[r * cols + c] {
                None => {}
                Some((lon, lat)) => {
                    let point = Point::new(lon, lat);
                    if clipped.iter().any(|p| p.contains(&point)) {
                        mask.set(r, c, false);
                    }
                }
            }
        }
    }
    Ok(mask)
}
