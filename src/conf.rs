use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use geo::Polygon;
use log::warn;

use crate::bbox::Bbox;
use crate::error::{HgtError, Result};
use crate::output::ElevClassifier;
use crate::polygon::parse_polygon_file;

const KNOWN_SOURCE_PREFIXES: [&str; 4] = ["view1", "view3", "srtm1", "srtm3"];

/// Generates contour lines from NASA SRTM and similar elevation data as
/// well as from GeoTiff data in OSM formats.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "rusty-hgt-contours",
    version,
    about = "Generates OSM contour line data (XML, PBF or O5M) from HGT and GeoTiff elevation files."
)]
pub struct Config {
    /// Bounding box to generate contour data for, in degrees of longitude
    /// and latitude
    #[arg(
        short = 'a',
        long,
        allow_hyphen_values = true,
        value_name = "LEFT:BOTTOM:RIGHT:TOP"
    )]
    pub area: Option<String>,

    /// Use a polygon file as bounds for the output contour data; takes
    /// precedence over --area
    #[arg(long, value_name = "FILENAME")]
    pub polygon: Option<PathBuf>,

    /// Only fetch needed files, don't write contour data
    #[arg(long = "download-only", default_value_t = false)]
    pub download_only: bool,

    /// Contour line step size in meters, or feet with --feet
    #[arg(short = 's', long = "step", default_value_t = 20, value_name = "STEP")]
    pub contour_step_size: u32,

    /// Output contour lines in feet steps rather than in meters
    #[arg(short = 'f', long = "feet", default_value_t = false)]
    pub contour_feet: bool,

    /// Omit the sea level contour line (0 m) from the output
    #[arg(short = '0', long = "no-zero-contour", default_value_t = false)]
    pub no_zero: bool,

    /// Prefix for the filenames of the output files
    #[arg(short = 'o', long = "output-prefix", value_name = "PREFIX")]
    pub output_prefix: Option<String>,

    /// Major and medium elevation categories used for the contour_ext tag
    #[arg(
        short = 'c',
        long = "line-cat",
        default_value = "200,100",
        value_name = "ELEVATION_MAJOR,ELEVATION_MEDIUM"
    )]
    pub line_cats: String,

    /// Number of jobs to be run in parallel
    #[arg(short = 'j', long = "jobs", default_value_t = 1, value_name = "N")]
    pub jobs: usize,

    /// OSM API version of the output
    #[arg(long = "osm-version", default_value_t = 0.6, value_name = "OSM-VERSION")]
    pub osm_version: f64,

    /// Write the timestamp attribute of node and way elements in OSM XML
    /// and o5m output; in o5m, also write changeset and user information
    #[arg(long = "write-timestamp", default_value_t = false)]
    pub write_timestamp: bool,

    /// Id of the first written node
    #[arg(
        long = "start-node-id",
        default_value_t = 10_000_000,
        value_name = "NODE-ID"
    )]
    pub start_node_id: u64,

    /// Id of the first written way
    #[arg(
        long = "start-way-id",
        default_value_t = 10_000_000,
        value_name = "WAY-ID"
    )]
    pub start_way_id: u64,

    /// Maximum number of nodes per generated tile; 0 produces a single
    /// output file and disables parallelization
    #[arg(
        long = "max-nodes-per-tile",
        default_value_t = 1_000_000,
        value_name = "N"
    )]
    pub max_nodes_per_tile: u64,

    /// Maximum number of nodes per way; 0 keeps ways unsplit
    #[arg(long = "max-nodes-per-way", default_value_t = 2000, value_name = "N")]
    pub max_nodes_per_way: usize,

    /// Simplify contour lines with the Ramer-Douglas-Peucker algorithm and
    /// this epsilon, interpreted in the input's coordinate units; 0.0 only
    /// removes duplicate points and points on straight lines
    #[arg(
        long = "simplifyContoursEpsilon",
        default_value_t = 0.0,
        value_name = "EPSILON"
    )]
    pub rdp_epsilon: f64,

    /// Fully disable contour simplification
    #[arg(long = "disableRDP", default_value_t = false)]
    pub disable_rdp: bool,

    /// Smooth input data by supersampling it with this zoom ratio
    #[arg(long = "smooth", default_value_t = 1.0, value_name = "RATIO")]
    pub smooth_ratio: f64,

    /// Gzip compression level (1-9) for OSM XML output files
    #[arg(long = "gzip", default_value_t = 0, value_name = "COMPRESSLEVEL")]
    pub gzip: u32,

    /// Write protobuf binary files instead of OSM XML
    #[arg(long = "pbf", default_value_t = false)]
    pub pbf: bool,

    /// Write o5m binary files instead of OSM XML
    #[arg(long = "o5m", default_value_t = false)]
    pub o5m: bool,

    /// SRTM resolution in arc seconds (1 or 3)
    #[arg(long = "srtm", default_value_t = 3, value_name = "SRTM-RESOLUTION")]
    pub srtm_resolution: u32,

    /// SRTM data version (2.1 or 3)
    #[arg(long = "srtm-version", default_value_t = 3.0, value_name = "VERSION")]
    pub srtm_version: f64,

    /// Mask SRTM data with viewfinderpanoramas data of this resolution
    /// (1 or 3; 0 disables masking)
    #[arg(
        long = "viewfinder-mask",
        default_value_t = 0,
        value_name = "VIEWFINDER-RESOLUTION"
    )]
    pub viewfinder: u32,

    /// Comma-separated preference list of data sources (srtm1, srtm3,
    /// view1, view3)
    #[arg(long = "source", alias = "data-source", value_name = "DATA-SOURCE")]
    pub data_source: Option<String>,

    /// Longitude correction applied to the contour lines
    #[arg(long = "corrx", default_value_t = 0.0, allow_hyphen_values = true, value_name = "SRTM-CORRX")]
    pub corrx: f64,

    /// Latitude correction applied to the contour lines
    #[arg(long = "corry", default_value_t = 0.0, allow_hyphen_values = true, value_name = "SRTM-CORRY")]
    pub corry: f64,

    /// Cache directory for hgt files
    #[arg(long = "hgtdir", value_name = "DIRECTORY")]
    pub hgtdir: Option<PathBuf>,

    /// Rewrite the tile index files and exit
    #[arg(long = "rewrite-indices", default_value_t = false)]
    pub rewrite_indices: bool,

    /// Treat all elevations up to this value as data voids
    #[arg(
        long = "void-range-max",
        default_value_t = -0x8000,
        allow_hyphen_values = true,
        value_name = "MINIMUM_PLAUSIBLE_HEIGHT_VALUE"
    )]
    pub void_max: i32,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log",
        default_value = "WARN",
        value_name = "LOG-LEVEL"
    )]
    pub log_level: String,

    /// Input elevation files (.hgt, .tif, .tiff, .vrt)
    #[arg(value_name = "FILE")]
    pub files: Vec<PathBuf>,

    /// Validated --area / polygon-file bbox.
    #[arg(skip)]
    pub area_bbox: Option<Bbox>,

    /// Clip polygons read from the polygon file.
    #[arg(skip)]
    pub polygons: Option<Arc<Vec<Polygon<f64>>>>,

    /// Validated data source list, e.g. ["view3", "srtm3v3.0"].
    #[arg(skip)]
    pub data_source_list: Vec<String>,

    #[arg(skip)]
    line_cats_parsed: (i32, i32),
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_from(["rusty-hgt-contours"])
    }
}

impl Config {
    /// Semantic validation of the parsed command line.  Every failure maps
    /// to [`HgtError::InvalidOptions`] and exit code 1.
    pub fn validate(&mut self) -> Result<()> {
        if self.pbf && self.gzip > 0 {
            return Err(HgtError::InvalidOptions(
                "you can't combine the --gzip and --pbf options".to_string(),
            ));
        }
        if self.o5m && self.gzip > 0 {
            return Err(HgtError::InvalidOptions(
                "you can't combine the --gzip and --o5m options".to_string(),
            ));
        }
        if self.o5m && self.pbf {
            return Err(HgtError::InvalidOptions(
                "you can't combine the --pbf and --o5m options".to_string(),
            ));
        }
        if self.gzip > 9 {
            return Err(HgtError::InvalidOptions(format!(
                "invalid --gzip level {}: specify an integer between 1 and 9",
                self.gzip
            )));
        }
        if self.srtm_version != 2.1 && self.srtm_version != 3.0 {
            return Err(HgtError::InvalidOptions(format!(
                "unsupported SRTM data version '{:.1}'",
                self.srtm_version
            )));
        }
        if !matches!(self.srtm_resolution, 1 | 3) {
            warn!("the --srtm option can only take '1' or '3' as values, defaulting to 3");
            self.srtm_resolution = 3;
        }
        if !matches!(self.viewfinder, 0 | 1 | 3) {
            warn!(
                "the --viewfinder-mask option can only take '1' or '3' as values, \
                 won't use viewfinder data"
            );
            self.viewfinder = 0;
        }
        if self.max_nodes_per_way == 1 {
            return Err(HgtError::InvalidOptions(
                "--max-nodes-per-way must be 0 or at least 2".to_string(),
            ));
        }
        if self.contour_step_size == 0 {
            self.contour_step_size = 20;
        }
        if self.smooth_ratio <= 0.0 {
            return Err(HgtError::InvalidOptions(
                "--smooth ratio must be positive".to_string(),
            ));
        }
        self.line_cats_parsed = parse_line_cats(&self.line_cats)?;
        self.data_source_list = self.parse_data_sources()?;

        for file in &self.files {
            let ext = file
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_lowercase());
            match ext.as_deref() {
                Some("hgt" | "tif" | "tiff" | "vrt") => {}
                _ => {
                    return Err(HgtError::InvalidOptions(format!(
                        "unsupported input file {}: expected .hgt, .tif, .tiff or .vrt",
                        file.display()
                    )));
                }
            }
        }

        if let Some(polygon_file) = &self.polygon {
            let (bbox, polygons) = parse_polygon_file(polygon_file)?;
            self.area_bbox = Some(bbox);
            self.polygons = Some(Arc::new(polygons));
        } else if let Some(area) = &self.area {
            self.area_bbox = Some(Bbox::parse_area(area)?);
        }

        if self.files.is_empty() && self.area_bbox.is_none() {
            return Err(HgtError::InvalidOptions(
                "specify input files or one of the --area and --polygon options".to_string(),
            ));
        }
        Ok(())
    }

    fn parse_data_sources(&self) -> Result<Vec<String>> {
        match &self.data_source {
            Some(source) => {
                let mut sources = Vec::new();
                for entry in source.to_lowercase().split(',') {
                    let entry = entry.trim();
                    if !KNOWN_SOURCE_PREFIXES.iter().any(|p| entry.starts_with(p)) {
                        return Err(HgtError::InvalidOptions(format!(
                            "unknown data source: {entry}"
                        )));
                    }
                    if entry == "srtm1" || entry == "srtm3" {
                        sources.push(format!("{entry}v{:.1}", self.srtm_version));
                    } else {
                        sources.push(entry.to_string());
                    }
                }
                Ok(sources)
            }
            None => {
                if self.area.is_none() && self.polygon.is_none() {
                    // files come from the command line
                    return Ok(Vec::new());
                }
                let mut sources = Vec::new();
                if self.viewfinder != 0 {
                    sources.push(format!("view{}", self.viewfinder));
                }
                sources.push(format!(
                    "srtm{}v{:.1}",
                    self.srtm_resolution, self.srtm_version
                ));
                Ok(sources)
            }
        }
    }

    /// RDP epsilon after applying --disableRDP.
    pub fn effective_rdp_epsilon(&self) -> Option<f64> {
        if self.disable_rdp {
            None
        } else {
            Some(self.rdp_epsilon)
        }
    }

    pub fn elev_classifier(&self) -> ElevClassifier {
        let (major, medium) = if self.line_cats_parsed == (0, 0) {
            // not validated yet
            parse_line_cats(&self.line_cats).unwrap_or((200, 100))
        } else {
            self.line_cats_parsed
        };
        ElevClassifier::new(major, medium)
    }
}

fn parse_line_cats(line_cats: &str) -> Result<(i32, i32)> {
    let parts: Vec<&str> = line_cats.split(',').collect();
    if parts.len() == 2 {
        if let (Ok(major), Ok(medium)) = (parts[0].trim().parse(), parts[1].trim().parse()) {
            if major > 0 && medium > 0 {
                return Ok((major, medium));
            }
        }
    }
    Err(HgtError::InvalidOptions(format!(
        "invalid --line-cat {line_cats:?}: expected two positive integers like 200,100"
    )))
}
