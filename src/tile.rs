use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use log::warn;

use crate::bbox::Bbox;
use crate::contour::{is_closed, simplify_path, split_path, trace_level, PathSplit, Polyline};
use crate::error::{HgtError, Result};
use crate::raster::{estimate_nodes, Grid, Mask};
use crate::transform::{transform_bbox, Transform};

/// A simplified contour polyline together with its emission plan.
#[derive(Debug)]
pub struct Contour {
    pub points: Polyline,
    pub split: PathSplit,
}

/// All contours of one sub-tile, keyed by elevation, plus the exact node
/// and way counts their emission will consume.  The counts drive id range
/// pre-allocation, so they must match the encoders' output.
#[derive(Debug, Default)]
pub struct TileContours {
    pub contours: BTreeMap<i32, Vec<Contour>>,
    pub nb_nodes: u64,
    pub nb_ways: u64,
}

/// A contiguous row slab of a loaded raster, aligned to the parent grid.
pub struct SubTile {
    grid: Arc<Grid>,
    void_mask: Arc<Mask>,
    clip_mask: Option<Mask>,
    rows: Range<usize>,
    bbox: Bbox,
    lon_increment: f64,
    lat_increment: f64,
    transform: Option<Transform>,
}

impl SubTile {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        grid: Arc<Grid>,
        void_mask: Arc<Mask>,
        clip_mask: Option<Mask>,
        rows: Range<usize>,
        bbox: Bbox,
        lon_increment: f64,
        lat_increment: f64,
        transform: Option<Transform>,
    ) -> Self {
        Self {
            grid,
            void_mask,
            clip_mask,
            rows,
            bbox,
            lon_increment,
            lat_increment,
            transform,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows.len()
    }

    pub fn cols(&self) -> usize {
        self.grid.cols()
    }

    /// Bbox in the raster's own reference system.
    pub fn bbox(&self) -> Bbox {
        self.bbox
    }

    /// Bbox in EPSG:4326.
    pub fn bbox_wgs84(&self) -> Result<Bbox> {
        transform_bbox(&self.bbox, self.transform.as_ref())
    }

    pub fn estimate(&self, step: u32) -> f64 {
        estimate_nodes(&self.grid, &self.void_mask, self.rows.clone(), step)
    }

    pub fn get_stats(&self) -> String {
        format!(
            "tile with {} x {} points, bbox: {}",
            self.rows(),
            self.cols(),
            self.bbox
        )
    }

    fn x_axis(&self) -> Vec<f64> {
        (0..self.cols())
            .map(|c| self.bbox.min_lon + c as f64 * self.lon_increment)
            .collect()
    }

    fn y_axis(&self) -> Vec<f64> {
        (0..self.rows())
            .map(|r| self.bbox.max_lat - r as f64 * self.lat_increment)
            .collect()
    }

    #[inline]
    fn masked(&self, row: usize, col: usize) -> bool {
        self.void_mask.get(self.rows.start + row, col)
            || self
                .clip_mask
                .as_ref()
                .map_or(false, |m| m.get(row, col))
    }

    /// Minimum and maximum elevation over non-masked cells, `None` when
    /// every cell is masked.
    pub fn elevation_range(&self) -> Option<(f64, f64)> {
        let mut range: Option<(f64, f64)> = None;
        for r in 0..self.rows() {
            for c in 0..self.cols() {
                if self.masked(r, c) {
                    continue;
                }
                let z = self.grid.get(self.rows.start + r, c) as f64;
                range = Some(match range {
                    None => (z, z),
                    Some((min, max)) => (min.min(z), max.max(z)),
                });
            }
        }
        range
    }

    /// Traces, simplifies and pre-splits all contours of this sub-tile.
    ///
    /// Contour elevations run from `min_cont` (or the smallest multiple of
    /// `step` at or above the tile minimum) up to, excluding, `max_cont`
    /// (or the smallest multiple of `step` at or above the tile maximum).
    /// Fails with [`HgtError::UniformGrid`] when all valid cells hold one
    /// single value.
    pub fn get_contours(
        &self,
        step: u32,
        min_cont: Option<i32>,
        max_cont: Option<i32>,
        no_zero: bool,
        rdp_epsilon: Option<f64>,
        max_nodes_per_way: usize,
    ) -> Result<TileContours> {
        let (min_ele, max_ele) = match self.elevation_range() {
            None => {
                warn!("{}: all cells are masked, nothing to trace", self.get_stats());
                return Ok(TileContours::default());
            }
            Some(range) => range,
        };
        if min_ele == max_ele {
            return Err(HgtError::UniformGrid);
        }

        let lower = min_cont.unwrap_or_else(|| contour_limit(min_ele, step));
        let upper = max_cont.unwrap_or_else(|| contour_limit(max_ele, step));
        let x_axis = self.x_axis();
        let y_axis = self.y_axis();
        let union_mask = self.build_union_mask();

        let mut tile_contours = TileContours::default();
        let mut elevation = lower;
        while elevation < upper {
            if no_zero && elevation == 0 {
                elevation += step as i32;
                continue;
            }
            let raw_paths = trace_level(
                &self.grid,
                self.rows.start,
                self.rows(),
                union_mask.as_ref(),
                &x_axis,
                &y_axis,
                elevation as f64,
            );
            let mut contours: Vec<Contour> = Vec::with_capacity(raw_paths.len());
            for mut path in raw_paths {
                if let Some(transform) = &self.transform {
                    transform.apply_points(&mut path)?;
                }
                let path = simplify_path(&path, rdp_epsilon);
                let split = split_path(path.len(), is_closed(&path), max_nodes_per_way);
                if split.nb_nodes == 0 {
                    continue;
                }
                tile_contours.nb_nodes += split.nb_nodes;
                tile_contours.nb_ways += split.chunks.len() as u64;
                contours.push(Contour {
                    points: path,
                    split,
                });
            }
            if !contours.is_empty() {
                tile_contours.contours.insert(elevation, contours);
            }
            elevation += step as i32;
        }
        Ok(tile_contours)
    }

    /// The tracer's exclusion mask: void cells joined with the clip mask,
    /// `None` when nothing is masked at all.
    fn build_union_mask(&self) -> Option<Mask> {
        let mut mask: Option<Mask> = None;
        for r in 0..self.rows() {
            for c in 0..self.cols() {
                if self.masked(r, c) {
                    mask.get_or_insert_with(|| Mask::filled(self.rows(), self.cols(), false))
                        .set(r, c, true);
                }
            }
        }
        mask
    }
}

/// Smallest multiple of `step` at or above `elevation`.
fn contour_limit(elevation: f64, step: u32) -> i32 {
    let step = step as i64;
    let elevation = elevation.ceil() as i64;
    (elevation.div_euclid(step) + i64::from(elevation.rem_euclid(step) != 0)) as i32 * step as i32
}
