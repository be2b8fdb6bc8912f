use std::fs::File;
use std::io::BufReader;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bit_vec::BitVec;
use byteorder::{BigEndian, ReadBytesExt};
use geo::Polygon;
use georaster::geotiff::{GeoTiffReader, RasterValue};
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;

use crate::bbox::Bbox;
use crate::error::{HgtError, Result};
use crate::polygon::polygon_mask;
use crate::srs::SrsResolver;
use crate::tile::SubTile;
use crate::transform::{transform_bbox, Transform};

pub const METERS_TO_FEET: f64 = 1.0 / 0.3048;

/// Tolerance for the axis-alignment check of transformed tile corners, in
/// degrees.  One order of magnitude below the 100-nanodegree output quantum.
const AXIS_ALIGNMENT_EPSILON: f64 = 1e-8;

lazy_static! {
    static ref HGT_FILENAME: Regex = Regex::new(r"^(?i)([NS])(\d{2})([EW])(\d{3})\.hgt$").unwrap();
}

/// Row-major elevation grid.  Row 0 is the northernmost row.
#[derive(Debug, Clone)]
pub struct Grid {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Grid {
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(rows * cols, data.len());
        Self { rows, cols, data }
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Copies a rectangular window into a new grid.
    pub fn window(&self, rows: Range<usize>, cols: Range<usize>) -> Grid {
        let mut data = Vec::with_capacity(rows.len() * cols.len());
        for r in rows.clone() {
            let offset = r * self.cols;
            data.extend_from_slice(&self.data[offset + cols.start..offset + cols.end]);
        }
        Grid::new(rows.len(), cols.len(), data)
    }
}

/// Row-major boolean mask; `true` marks a cell as excluded.
#[derive(Debug, Clone)]
pub struct Mask {
    rows: usize,
    cols: usize,
    bits: BitVec,
}

impl Mask {
    pub fn filled(rows: usize, cols: usize, value: bool) -> Self {
        Self {
            rows,
            cols,
            bits: BitVec::from_elem(rows * cols, value),
        }
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> bool {
        self.bits.get(row * self.cols + col).unwrap_or(false)
    }

    pub fn set(&mut self, row: usize, col: usize, value: bool) {
        self.bits.set(row * self.cols + col, value);
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn any(&self) -> bool {
        self.bits.any()
    }

    pub fn all(&self) -> bool {
        self.bits.all()
    }

    pub fn window(&self, rows: Range<usize>, cols: Range<usize>) -> Mask {
        let mut mask = Mask::filled(rows.len(), cols.len(), false);
        for (ri, r) in rows.clone().enumerate() {
            for (ci, c) in cols.clone().enumerate() {
                if self.get(r, c) {
                    mask.set(ri, ci, true);
                }
            }
        }
        mask
    }
}

/// Extracts the 1x1 degree bbox encoded in an SRTM filename,
/// `[NS]YY[EW]XXX.hgt`, YY/XXX giving the southwest corner.
pub fn parse_hgt_filename(path: &Path) -> Result<Bbox> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| HgtError::BadFilename(path.to_path_buf()))?;
    let caps = HGT_FILENAME
        .captures(name)
        .ok_or_else(|| HgtError::BadFilename(path.to_path_buf()))?;
    let lat: f64 = caps[2].parse().unwrap();
    let lon: f64 = caps[4].parse().unwrap();
    let min_lat = if caps[1].eq_ignore_ascii_case("N") {
        lat
    } else {
        -lat
    };
    let min_lon = if caps[3].eq_ignore_ascii_case("E") {
        lon
    } else {
        -lon
    };
    Ok(Bbox::new(min_lon, min_lat, min_lon + 1.0, min_lat + 1.0))
}

fn file_extension(path: &Path) -> Result<String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .ok_or_else(|| HgtError::UnsupportedExtension(path.to_path_buf()))?;
    match ext.as_str() {
        "hgt" | "tif" | "tiff" | "vrt" => Ok(ext),
        _ => Err(HgtError::UnsupportedExtension(path.to_path_buf())),
    }
}

fn raster_value_to_f32(value: RasterValue) -> f32 {
    match value {
        RasterValue::U8(v) => v as f32,
        RasterValue::U16(v) => v as f32,
        RasterValue::U32(v) => v as f32,
        RasterValue::U64(v) => v as f32,
        RasterValue::I8(v) => v as f32,
        RasterValue::I16(v) => v as f32,
        RasterValue::I32(v) => v as f32,
        RasterValue::I64(v) => v as f32,
        RasterValue::F32(v) => v,
        RasterValue::F64(v) => v as f32,
        // No data and color values end up below any void threshold
        _ => f32::MIN,
    }
}

struct GeotiffHeader {
    rows: usize,
    cols: usize,
    lon_increment: f64,
    lat_increment: f64,
    /// Bbox over pixel centers, in the file's own reference system.
    bbox: Bbox,
    epsg: u16,
}

fn read_geotiff_header(path: &Path) -> Result<(GeotiffHeader, GeoTiffReader<BufReader<File>>)> {
    let file = File::open(path).map_err(|e| HgtError::read_error(path, e))?;
    let reader = GeoTiffReader::open(BufReader::new(file))
        .map_err(|e| HgtError::read_error(path, format!("not a readable tiff: {e}")))?;

    // georaster only models axis-aligned geo transforms; a raster with
    // rotation terms surfaces here as missing origin or pixel size.
    let origin = reader.origin().ok_or_else(|| {
        HgtError::UnsupportedProjection(format!("{path:?} has no axis-aligned geo transform"))
    })?;
    let pixel_size = reader.pixel_size().ok_or_else(|| {
        HgtError::UnsupportedProjection(format!("{path:?} has no axis-aligned pixel scale"))
    })?;
    let geo_params = reader
        .geo_params
        .clone()
        .ok_or_else(|| HgtError::UnsupportedProjection(format!("{path:?} carries no SRS info")))?;
    let dimensions = reader
        .images()
        .first()
        .and_then(|img| img.dimensions)
        .ok_or_else(|| HgtError::read_error(path, "no image in tiff"))?;

    let epsg = SrsResolver::new().get_epsg(&geo_params)?;
    let cols = dimensions.0 as usize;
    let rows = dimensions.1 as usize;
    let lon_increment = pixel_size[0];
    let lat_increment = -pixel_size[1];
    // bbox over pixel centers
    let min_lon = origin[0] + 0.5 * pixel_size[0];
    let max_lat = origin[1] + 0.5 * pixel_size[1];
    let min_lat = max_lat + (rows as f64 - 1.0) * pixel_size[1];
    let max_lon = min_lon + (cols as f64 - 1.0) * pixel_size[0];

    Ok((
        GeotiffHeader {
            rows,
            cols,
            lon_increment,
            lat_increment,
            bbox: Bbox::new(min_lon, min_lat, max_lon, max_lat),
            epsg,
        },
        reader,
    ))
}

/// Parses the bbox of any supported input file without loading its samples.
/// With `do_transform`, the bbox is returned in EPSG:4326; otherwise in the
/// file's own reference system, with the lon/lat corrections applied in
/// EPSG:4326 and round-tripped.
pub fn parse_file_bbox(path: &Path, corrx: f64, corry: f64, do_transform: bool) -> Result<Bbox> {
    let ext = file_extension(path)?;
    if ext == "hgt" {
        let bbox = parse_hgt_filename(path)?;
        return Ok(Bbox::new(
            bbox.min_lon + corrx,
            bbox.min_lat + corry,
            bbox.max_lon + corrx,
            bbox.max_lat + corry,
        ));
    }
    let (header, _) = read_geotiff_header(path)?;
    let transform = Transform::to_wgs84(header.epsg);
    let wgs84 = transform_bbox(&header.bbox, transform.as_ref())?;
    let corrected = Bbox::new(
        wgs84.min_lon + corrx,
        wgs84.min_lat + corry,
        wgs84.max_lon + corrx,
        wgs84.max_lat + corry,
    );
    if do_transform || transform.is_none() {
        Ok(corrected)
    } else {
        transform_bbox(&corrected, transform.map(|t| t.reversed()).as_ref())
    }
}

/// Overall bbox of a batch of input files, in EPSG:4326.
pub fn calc_hgt_area(files: &[(PathBuf, bool)], corrx: f64, corry: f64) -> Result<Bbox> {
    let mut area: Option<Bbox> = None;
    for (path, _) in files {
        let bbox = parse_file_bbox(path, corrx, corry, true)?;
        area = Some(match area {
            None => bbox,
            Some(a) => a.extend(&bbox),
        });
    }
    area.ok_or_else(|| HgtError::InvalidOptions("no input files".to_string()))
}

/// An elevation raster loaded from an HGT or GeoTIFF file, with its void
/// mask, grid geometry and optional reference-system transforms.
pub struct HgtFile {
    pub path: PathBuf,
    grid: Arc<Grid>,
    void_mask: Arc<Mask>,
    pub bbox: Bbox,
    pub lon_increment: f64,
    pub lat_increment: f64,
    pub transform: Option<Transform>,
    pub reverse_transform: Option<Transform>,
    polygons: Option<Arc<Vec<Polygon<f64>>>>,
}

impl HgtFile {
    /// Opens `path` and reads its samples.
    ///
    /// `corrx`/`corry` are lon/lat corrections in degrees.  Any elevation
    /// at or below `void_max` is masked as void.  `smooth_ratio` != 1
    /// supersamples the grid.  `polygons` is only attached when
    /// `check_poly` is set.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        path: &Path,
        corrx: f64,
        corry: f64,
        polygons: Option<Arc<Vec<Polygon<f64>>>>,
        check_poly: bool,
        void_max: i32,
        feet: bool,
        smooth_ratio: f64,
    ) -> Result<Self> {
        let ext = file_extension(path)?;
        let mut file = if ext == "hgt" {
            Self::open_hgt(path, corrx, corry, void_max, feet, smooth_ratio)?
        } else {
            Self::open_geotiff(path, corrx, corry, void_max, feet, smooth_ratio)?
        };
        file.polygons = if check_poly { polygons } else { None };

        let stats_bbox = transform_bbox(&file.bbox, file.transform.as_ref())?;
        info!(
            "{} file {:?}: {} x {} points, bbox: {}{}",
            ext,
            path,
            file.grid.cols(),
            file.grid.rows(),
            stats_bbox,
            if file.polygons.is_some() {
                ", checking polygon borders"
            } else {
                ""
            }
        );
        Ok(file)
    }

    fn open_hgt(
        path: &Path,
        corrx: f64,
        corry: f64,
        void_max: i32,
        feet: bool,
        smooth_ratio: f64,
    ) -> Result<Self> {
        let bbox = parse_hgt_filename(path)?;
        let size = std::fs::metadata(path)
            .map_err(|e| HgtError::read_error(path, e))?
            .len();
        let n = ((size / 2) as f64).sqrt() as usize;
        if n < 2 || (n * n * 2) as u64 != size {
            return Err(HgtError::read_error(
                path,
                format!("file size {size} is not 2*N*N for a square grid"),
            ));
        }
        let file = File::open(path).map_err(|e| HgtError::read_error(path, e))?;
        let mut reader = BufReader::new(file);
        let mut data = Vec::with_capacity(n * n);
        for _ in 0..n * n {
            let sample = reader
                .read_i16::<BigEndian>()
                .map_err(|e| HgtError::read_error(path, e))?;
            data.push(sample as f32);
        }
        let (grid, void_mask) =
            Self::prepare_grid(Grid::new(n, n, data), void_max, feet, smooth_ratio);
        let lon_increment = 1.0 / (grid.cols() as f64 - 1.0);
        let lat_increment = 1.0 / (grid.rows() as f64 - 1.0);
        Ok(Self {
            path: path.to_path_buf(),
            grid: Arc::new(grid),
            void_mask: Arc::new(void_mask),
            bbox: Bbox::new(
                bbox.min_lon + corrx,
                bbox.min_lat + corry,
                bbox.max_lon + corrx,
                bbox.max_lat + corry,
            ),
            lon_increment,
            lat_increment,
            transform: None,
            reverse_transform: None,
            polygons: None,
        })
    }

    fn open_geotiff(
        path: &Path,
        corrx: f64,
        corry: f64,
        void_max: i32,
        feet: bool,
        smooth_ratio: f64,
    ) -> Result<Self> {
        let (header, mut reader) = read_geotiff_header(path)?;
        let transform = Transform::to_wgs84(header.epsg);
        if let Some(t) = &transform {
            check_axis_alignment(path, &header.bbox, t)?;
        }

        let mut data = Vec::with_capacity(header.rows * header.cols);
        for y in 0..header.rows as u32 {
            for x in 0..header.cols as u32 {
                data.push(raster_value_to_f32(reader.read_pixel(x, y)));
            }
        }
        let (grid, void_mask) = Self::prepare_grid(
            Grid::new(header.rows, header.cols, data),
            void_max,
            feet,
            smooth_ratio,
        );
        // supersampling changes the grid shape; keep the increments
        // consistent with the unchanged bbox
        let lon_increment = if grid.cols() == header.cols {
            header.lon_increment
        } else {
            (header.bbox.max_lon - header.bbox.min_lon) / (grid.cols() as f64 - 1.0)
        };
        let lat_increment = if grid.rows() == header.rows {
            header.lat_increment
        } else {
            (header.bbox.max_lat - header.bbox.min_lat) / (grid.rows() as f64 - 1.0)
        };

        let bbox = match &transform {
            None => Bbox::new(
                header.bbox.min_lon + corrx,
                header.bbox.min_lat + corry,
                header.bbox.max_lon + corrx,
                header.bbox.max_lat + corry,
            ),
            Some(t) => {
                // corrections are EPSG:4326 values: transform, add, round-trip
                let wgs84 = transform_bbox(&header.bbox, Some(t))?;
                let corrected = Bbox::new(
                    wgs84.min_lon + corrx,
                    wgs84.min_lat + corry,
                    wgs84.max_lon + corrx,
                    wgs84.max_lat + corry,
                );
                transform_bbox(&corrected, Some(&t.reversed()))?
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            grid: Arc::new(grid),
            void_mask: Arc::new(void_mask),
            bbox,
            lon_increment,
            lat_increment,
            transform,
            reverse_transform: transform.map(|t| t.reversed()),
            polygons: None,
        })
    }

    /// Mask computation must run on the raw samples, before supersampling
    /// (interpolation smears void sentinels over their neighborhood) and
    /// before the feet conversion (the threshold is defined in raw units).
    fn prepare_grid(grid: Grid, void_max: i32, feet: bool, smooth_ratio: f64) -> (Grid, Mask) {
        let mut void_mask = Mask::filled(grid.rows(), grid.cols(), false);
        for r in 0..grid.rows() {
            for c in 0..grid.cols() {
                if grid.get(r, c) <= void_max as f32 {
                    void_mask.set(r, c, true);
                }
            }
        }
        let (mut grid, void_mask) = if smooth_ratio != 1.0 {
            super_sample(&grid, &void_mask, smooth_ratio)
        } else {
            (grid, void_mask)
        };
        if feet {
            let factor = METERS_TO_FEET as f32;
            let mut data = Vec::with_capacity(grid.rows() * grid.cols());
            for r in 0..grid.rows() {
                for c in 0..grid.cols() {
                    data.push(grid.get(r, c) * factor);
                }
            }
            grid = Grid::new(grid.rows(), grid.cols(), data);
        }
        (grid, void_mask)
    }

    pub fn grid(&self) -> &Arc<Grid> {
        &self.grid
    }

    pub fn void_mask(&self) -> &Arc<Mask> {
        &self.void_mask
    }

    /// Crops grid and bbox to `area` (given in EPSG:4326); the resulting
    /// bbox snaps outward to grid indices.
    fn truncate(&self, area: Option<&Bbox>) -> Result<(Bbox, Arc<Grid>, Arc<Mask>)> {
        let area = match area {
            None => {
                return Ok((self.bbox, self.grid.clone(), self.void_mask.clone()));
            }
            Some(area) => {
                if let Some(reverse) = &self.reverse_transform {
                    transform_bbox(area, Some(reverse))?
                } else {
                    *area
                }
            }
        };

        let mut bbox_min_lon = area.min_lon;
        let mut bbox_max_lon = area.max_lon;
        let mut bbox_min_lat = area.min_lat;
        let mut bbox_max_lat = area.max_lat;
        if bbox_min_lon > bbox_max_lon {
            // area covers the W180/E180 longitude
            if self.bbox.min_lon < 0.0 || self.bbox.min_lon < bbox_max_lon {
                // we are right of W180
                bbox_min_lon = self.bbox.min_lon;
                if bbox_max_lon >= self.bbox.max_lon {
                    bbox_max_lon = self.bbox.max_lon;
                }
            } else {
                // we are left of E180
                bbox_max_lon = self.bbox.max_lon;
                if bbox_min_lon <= self.bbox.min_lon {
                    bbox_min_lon = self.bbox.min_lon;
                }
            }
        } else {
            bbox_min_lon = bbox_min_lon.max(self.bbox.min_lon);
            bbox_max_lon = bbox_max_lon.min(self.bbox.max_lon);
        }
        bbox_min_lat = bbox_min_lat.max(self.bbox.min_lat);
        bbox_max_lat = bbox_max_lat.min(self.bbox.max_lat);

        let lon_extent = self.bbox.max_lon - self.bbox.min_lon;
        let lat_extent = self.bbox.max_lat - self.bbox.min_lat;
        let min_lon_index =
            ((bbox_min_lon - self.bbox.min_lon) / lon_extent / self.lon_increment) as i64;
        let max_lon_index =
            ((bbox_max_lon - self.bbox.max_lon) / lon_extent / self.lon_increment) as i64;
        let min_lat_index =
            -(((bbox_min_lat - self.bbox.min_lat) / lat_extent / self.lat_increment) as i64);
        let max_lat_index =
            -(((bbox_max_lat - self.bbox.max_lat) / lat_extent / self.lat_increment) as i64);

        let rows = self.grid.rows() as i64;
        let cols = self.grid.cols() as i64;
        let col_start = min_lon_index.clamp(0, cols);
        let col_end = (cols + max_lon_index).clamp(col_start, cols);
        let row_start = max_lat_index.clamp(0, rows);
        let row_end = (rows + min_lat_index).clamp(row_start, rows);

        let real_bbox = Bbox::new(
            self.bbox.min_lon + min_lon_index as f64 * self.lon_increment,
            self.bbox.min_lat - min_lat_index as f64 * self.lat_increment,
            self.bbox.max_lon + max_lon_index as f64 * self.lon_increment,
            self.bbox.max_lat - max_lat_index as f64 * self.lat_increment,
        );
        let rows = row_start as usize..row_end as usize;
        let cols = col_start as usize..col_end as usize;
        Ok((
            real_bbox,
            Arc::new(self.grid.window(rows.clone(), cols.clone())),
            Arc::new(self.void_mask.window(rows, cols)),
        ))
    }

    /// Chops the (area-cropped) grid into sub-tiles whose estimated node
    /// count fits `max_nodes`, and attaches clip masks where polygon
    /// checking is active.  `max_nodes` 0 disables chopping.
    pub fn make_tiles(
        &self,
        area: Option<&Bbox>,
        max_nodes: u64,
        step: u32,
    ) -> Result<Vec<SubTile>> {
        let (bbox, grid, void_mask) = self.truncate(area)?;
        if grid.rows() < 2 || grid.cols() < 2 {
            warn!(
                "{:?}: area of interest leaves a {} x {} grid, nothing to contour",
                self.path,
                grid.cols(),
                grid.rows()
            );
            return Ok(Vec::new());
        }

        let mut tiles = Vec::new();
        let mut stack = vec![(bbox, 0..grid.rows())];
        while let Some((bbox, rows)) = stack.pop() {
            if fully_void(&void_mask, rows.clone()) {
                debug!("discarding fully void rows {rows:?} of {:?}", self.path);
                continue;
            }
            let estimate = estimate_nodes(&grid, &void_mask, rows.clone(), step);
            if max_nodes > 0 && estimate > max_nodes as f64 && rows.len() >= 3 {
                // halve along the row axis; the shared row is duplicated
                // to avoid gaps between the halves
                let mid = rows.len() / 2;
                let chop_lat = bbox.max_lat - mid as f64 * self.lat_increment;
                let upper_bbox = Bbox::new(bbox.min_lon, chop_lat, bbox.max_lon, bbox.max_lat);
                let lower_bbox = Bbox::new(bbox.min_lon, bbox.min_lat, bbox.max_lon, chop_lat);
                stack.push((upper_bbox, rows.start..rows.start + mid + 1));
                stack.push((lower_bbox, rows.start + mid..rows.end));
                continue;
            }

            let clip_mask = match &self.polygons {
                None => None,
                Some(polygons) => {
                    let x_axis: Vec<f64> = (0..grid.cols())
                        .map(|c| bbox.min_lon + c as f64 * self.lon_increment)
                        .collect();
                    let y_axis: Vec<f64> = (0..rows.len())
                        .map(|r| bbox.max_lat - r as f64 * self.lat_increment)
                        .collect();
                    let mask = polygon_mask(&x_axis, &y_axis, polygons, self.transform.as_ref())?;
                    if mask.all() {
                        debug!(
                            "discarding rows {rows:?} of {:?}: outside of all clip polygons",
                            self.path
                        );
                        continue;
                    } else if !mask.any() {
                        None
                    } else {
                        Some(mask)
                    }
                }
            };
            tiles.push(SubTile::new(
                grid.clone(),
                void_mask.clone(),
                clip_mask,
                rows,
                bbox,
                self.lon_increment,
                self.lat_increment,
                self.transform,
            ));
        }
        Ok(tiles)
    }
}

fn check_axis_alignment(path: &Path, bbox: &Bbox, transform: &Transform) -> Result<()> {
    let mut corners = vec![
        (bbox.min_lon, bbox.max_lat),
        (bbox.max_lon, bbox.max_lat),
        (bbox.min_lon, bbox.min_lat),
        (bbox.max_lon, bbox.min_lat),
    ];
    transform.apply_points(&mut corners)?;
    if corners.len() != 4 {
        return Err(HgtError::NonAxisAlignedTile(path.to_path_buf()));
    }
    let (tl, tr, bl, br) = (corners[0], corners[1], corners[2], corners[3]);
    let aligned = (tl.0 - bl.0).abs() <= AXIS_ALIGNMENT_EPSILON
        && (tr.0 - br.0).abs() <= AXIS_ALIGNMENT_EPSILON
        && (tl.1 - tr.1).abs() <= AXIS_ALIGNMENT_EPSILON
        && (bl.1 - br.1).abs() <= AXIS_ALIGNMENT_EPSILON;
    if aligned {
        Ok(())
    } else {
        Err(HgtError::NonAxisAlignedTile(path.to_path_buf()))
    }
}

fn fully_void(void_mask: &Mask, rows: Range<usize>) -> bool {
    for r in rows {
        for c in 0..void_mask.cols() {
            if !void_mask.get(r, c) {
                return false;
            }
        }
    }
    true
}

/// Heuristic node count for a row slab: the sum of the absolute first
/// differences of the elevation grid, horizontal and vertical, divided by
/// the contour step.  Void neighbors contribute nothing, which still
/// overestimates voided areas by up to ~50%.
pub fn estimate_nodes(grid: &Grid, void_mask: &Mask, rows: Range<usize>, step: u32) -> f64 {
    let step = step as f64;
    let mut estimate = 0.0;
    for r in rows.clone() {
        for c in 0..grid.cols() {
            if void_mask.get(r, c) {
                continue;
            }
            let z = grid.get(r, c) as f64;
            if c + 1 < grid.cols() && !void_mask.get(r, c + 1) {
                estimate += (grid.get(r, c + 1) as f64 - z).abs() / step;
            }
            if r + 1 < rows.end && !void_mask.get(r + 1, c) {
                estimate += (grid.get(r + 1, c) as f64 - z).abs() / step;
            }
        }
    }
    estimate
}

/// Supersamples `grid` by `ratio` with a cubic kernel (values rounded to
/// whole units) and the mask with nearest-neighbor lookups.
pub fn super_sample(grid: &Grid, mask: &Mask, ratio: f64) -> (Grid, Mask) {
    debug!("smoothing input by a ratio of {ratio}");
    let out_rows = ((grid.rows() as f64 * ratio).round() as usize).max(2);
    let out_cols = ((grid.cols() as f64 * ratio).round() as usize).max(2);

    let src_row = |r: usize| r as f64 * (grid.rows() - 1) as f64 / (out_rows - 1) as f64;
    let src_col = |c: usize| c as f64 * (grid.cols() - 1) as f64 / (out_cols - 1) as f64;

    let mut data = Vec::with_capacity(out_rows * out_cols);
    for r in 0..out_rows {
        let y = src_row(r);
        for c in 0..out_cols {
            let x = src_col(c);
            data.push(cubic_sample(grid, x, y).round() as f32);
        }
    }

    let mut out_mask = Mask::filled(out_rows, out_cols, false);
    for r in 0..out_rows {
        let nearest_row = src_row(r).round() as usize;
        for c in 0..out_cols {
            let nearest_col = src_col(c).round() as usize;
            if mask.get(nearest_row, nearest_col) {
                out_mask.set(r, c, true);
            }
        }
    }
    (Grid::new(out_rows, out_cols, data), out_mask)
}

fn catmull_rom(p0: f64, p1: f64, p2: f64, p3: f64, t: f64) -> f64 {
    let t2 = t * t;
    let t3 = t2 * t;
    0.5 * (2.0 * p1
        + (p2 - p0) * t
        + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * t2
        + (3.0 * (p1 - p2) + p3 - p0) * t3)
}

fn cubic_sample(grid: &Grid, x: f64, y: f64) -> f64 {
    let clamp_row = |r: i64| r.clamp(0, grid.rows() as i64 - 1) as usize;
    let clamp_col = |c: i64| c.clamp(0, grid.cols() as i64 - 1) as usize;
    let row0 = y.floor() as i64;
    let col0 = x.floor() as i64;
    let ty = y - row0 as f64;
    let tx = x - col0 as f64;

    let mut column_samples = [0.0f64; 4];
    for (i, sample) in column_samples.iter_mut().enumerate() {
        let r = clamp_row(row0 - 1 + i as i64);
        let p0 = grid.get(r, clamp_col(col0 - 1)) as f64;
        let p1 = grid.get(r, clamp_col(col0)) as f64;
        let p2 = grid.get(r, clamp_col(col0 + 1)) as f64;
        let p3 = grid.get(r, clamp_col(col0 + 2)) as f64;
        *sample = catmull_rom(p0, p1, p2, p3, tx);
    }
    catmull_rom(
        column_samples[0],
        column_samples[1],
        column_samples[2],
        column_samples[3],
        ty,
    )
}
