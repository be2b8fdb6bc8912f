pub mod o5m;
pub mod pbf;
pub mod varint;
pub mod xml;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::debug;

use crate::bbox::Bbox;
use crate::conf::Config;
use crate::tile::TileContours;

/// Summary of one emitted way: `nb_nodes` consecutive node ids starting at
/// `first_node_id`; closed ways additionally repeat the first reference at
/// the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WayRecord {
    pub first_node_id: u64,
    pub nb_nodes: u64,
    pub closed_loop: bool,
    pub elevation: i32,
}

impl WayRecord {
    /// The full node reference list of this way.
    pub fn node_refs(&self) -> Vec<u64> {
        let mut refs: Vec<u64> =
            (self.first_node_id..self.first_node_id + self.nb_nodes).collect();
        if self.closed_loop {
            refs.push(self.first_node_id);
        }
        refs
    }
}

/// Buckets an elevation into the `contour_ext` rendering categories.
#[derive(Debug, Clone, Copy)]
pub struct ElevClassifier {
    pub major: i32,
    pub medium: i32,
}

impl ElevClassifier {
    pub fn new(major: i32, medium: i32) -> Self {
        Self { major, medium }
    }

    pub fn classify(&self, elevation: i32) -> &'static str {
        if elevation % self.major == 0 {
            "elevation_major"
        } else if elevation % self.medium == 0 {
            "elevation_medium"
        } else {
            "elevation_minor"
        }
    }
}

/// One OSM output container.
///
/// `write_nodes` emits the node elements of a sub-tile using ids
/// `start_node_id..` and returns the next free node id plus the ways the
/// nodes make up.  `write_ways` only buffers: ways belong after all nodes,
/// so they are flushed by `done()`, which also finalizes the container.
pub trait Output: Send {
    fn write_nodes(
        &mut self,
        tile_contours: &TileContours,
        timestamp_string: &str,
        start_node_id: u64,
        osm_version: f64,
    ) -> anyhow::Result<(u64, Vec<WayRecord>)>;

    fn write_ways(&mut self, ways: Vec<WayRecord>, start_way_id: u64);

    fn done(&mut self) -> anyhow::Result<()>;

    fn flush(&mut self) -> anyhow::Result<()>;

    fn timestamp_string(&self) -> String {
        String::new()
    }
}

/// Shared node/way bookkeeping of all encoders: walks the contours in
/// elevation order, hands every node to `emit` with its id, and collects
/// the way records over the assigned id ranges.
pub(crate) fn for_each_node_way(
    tile_contours: &TileContours,
    start_node_id: u64,
    mut emit: impl FnMut(u64, f64, f64) -> anyhow::Result<()>,
) -> anyhow::Result<(u64, Vec<WayRecord>)> {
    let mut next_id = start_node_id;
    let mut ways = Vec::new();
    for (&elevation, contour_list) in &tile_contours.contours {
        for contour in contour_list {
            let nb_nodes = contour.split.nb_nodes as usize;
            for (i, &(lon, lat)) in contour.points[..nb_nodes].iter().enumerate() {
                emit(next_id + i as u64, lon, lat)?;
            }
            for chunk in &contour.split.chunks {
                ways.push(WayRecord {
                    first_node_id: next_id + chunk.offset as u64,
                    nb_nodes: chunk.len as u64,
                    closed_loop: chunk.closed,
                    elevation,
                });
            }
            next_id += nb_nodes as u64;
        }
    }
    Ok((next_id, ways))
}

pub(crate) fn generator_string() -> String {
    format!("pyhgtmap {}", env!("CARGO_PKG_VERSION"))
}

/// UTC timestamp for the XML `timestamp` attribute.
pub fn make_utc_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Seconds since the epoch, as stored in the O5M timestamp dataset.
pub fn epoch_timestamp() -> i64 {
    Utc::now().timestamp()
}

const SOURCE_PREFIXES: [&str; 4] = ["srtm1", "srtm3", "view1", "view3"];

/// Builds the output file name from the bbox of the emitted data, the
/// configured prefix/encoding, and a source tag derived from the input
/// files' parent directories (`local-source` for plain command line paths).
pub fn make_osm_filename(bounds: &Bbox, conf: &Config, input_files: &[&Path]) -> PathBuf {
    let prefix = match &conf.output_prefix {
        Some(prefix) => format!("{prefix}_"),
        None => String::new(),
    };
    let src_middles: BTreeSet<String> = input_files
        .iter()
        .filter_map(|path| {
            path.parent()
                .and_then(|dir| dir.file_name())
                .and_then(|name| name.to_str())
                .map(|name| name.to_lowercase())
        })
        .collect();
    let from_source_dirs = !src_middles.is_empty()
        && src_middles
            .iter()
            .all(|middle| SOURCE_PREFIXES.iter().any(|p| middle.starts_with(p)));

    let mut name = format!("{prefix}{}", bounds.to_file_name_part());
    if from_source_dirs && !conf.data_source_list.is_empty() {
        let src_tag = conf
            .data_source_list
            .iter()
            .filter(|source| src_middles.contains(*source))
            .cloned()
            .collect::<Vec<_>>()
            .join(",");
        if !src_tag.is_empty() {
            name.push('_');
            name.push_str(&src_tag);
        }
    } else if conf.data_source_list.is_empty() {
        name.push_str("_local-source");
    }
    name.push_str(".osm");
    if conf.gzip > 0 {
        name.push_str(".gz");
    } else if conf.pbf {
        name.push_str(".pbf");
    } else if conf.o5m {
        name.truncate(name.len() - 4);
        name.push_str(".o5m");
    }
    PathBuf::from(name)
}

/// Instantiates the encoder selected by the configuration, writing to a
/// file named after `bounds`.
pub fn get_osm_output(
    conf: &Config,
    input_files: &[&Path],
    bounds: Bbox,
) -> anyhow::Result<Box<dyn Output>> {
    let file_name = make_osm_filename(&bounds, conf, input_files);
    debug!("opening output {file_name:?}");
    let classifier = conf.elev_classifier();
    let output: Box<dyn Output> = if conf.pbf {
        Box::new(pbf::PbfOutput::create(&file_name, bounds, classifier)?)
    } else if conf.o5m {
        Box::new(o5m::O5mOutput::create(
            &file_name,
            bounds,
            classifier,
            conf.write_timestamp,
        )?)
    } else {
        Box::new(xml::XmlOutput::create(
            &file_name,
            conf.osm_version,
            &bounds.to_bounds_tag(),
            conf.gzip,
            classifier,
            conf.write_timestamp,
        )?)
    };
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifier() {
        let classifier = ElevClassifier::new(200, 100);
        assert_eq!(classifier.classify(0), "elevation_major");
        assert_eq!(classifier.classify(200), "elevation_major");
        assert_eq!(classifier.classify(100), "elevation_medium");
        assert_eq!(classifier.classify(20), "elevation_minor");
        assert_eq!(classifier.classify(-100), "elevation_medium");
        assert_eq!(classifier.classify(-400), "elevation_major");
    }

    #[test]
    fn test_classifier_line_cats_100_50() {
        let classifier = ElevClassifier::new(100, 50);
        assert_eq!(classifier.classify(0), "elevation_major");
        assert_eq!(classifier.classify(100), "elevation_major");
        assert_eq!(classifier.classify(50), "elevation_medium");
        assert_eq!(classifier.classify(30), "elevation_minor");
    }

    #[test]
    fn test_way_record_refs() {
        let open = WayRecord {
            first_node_id: 10,
            nb_nodes: 3,
            closed_loop: false,
            elevation: 20,
        };
        assert_eq!(open.node_refs(), vec![10, 11, 12]);
        let closed = WayRecord {
            first_node_id: 10,
            nb_nodes: 4,
            closed_loop: true,
            elevation: 20,
        };
        assert_eq!(closed.node_refs(), vec![10, 11, 12, 13, 10]);
    }

    #[test]
    fn test_make_osm_filename_local_source() {
        let conf = Config::default();
        let bounds = Bbox::new(6.0, 43.0, 7.0, 44.0);
        let name = make_osm_filename(&bounds, &conf, &[Path::new("/data/dem/N43E006.hgt")]);
        assert_eq!(
            name,
            PathBuf::from("lon6.00_7.00lat43.00_44.00_local-source.osm")
        );
    }

    #[test]
    fn test_make_osm_filename_prefix_and_encodings() {
        let mut conf = Config::default();
        conf.output_prefix = Some("alps".to_string());
        conf.o5m = true;
        let bounds = Bbox::new(6.0, 43.0, 7.0, 44.0);
        let name = make_osm_filename(&bounds, &conf, &[Path::new("N43E006.hgt")]);
        assert_eq!(
            name,
            PathBuf::from("alps_lon6.00_7.00lat43.00_44.00_local-source.o5m")
        );

        conf.o5m = false;
        conf.gzip = 5;
        let name = make_osm_filename(&bounds, &conf, &[Path::new("N43E006.hgt")]);
        assert_eq!(
            name,
            PathBuf::from("alps_lon6.00_7.00lat43.00_44.00_local-source.osm.gz")
        );
    }

    #[test]
    fn test_make_osm_filename_source_tag() {
        let mut conf = Config::default();
        conf.data_source_list = vec!["view3".to_string(), "srtm3v3.0".to_string()];
        let bounds = Bbox::new(6.0, 43.0, 7.0, 44.0);
        let name = make_osm_filename(
            &bounds,
            &conf,
            &[
                Path::new("hgt/srtm3v3.0/N43E006.hgt"),
                Path::new("hgt/view3/N43E007.hgt"),
            ],
        );
        assert_eq!(
            name,
            PathBuf::from("lon6.00_7.00lat43.00_44.00_view3,srtm3v3.0.osm")
        );
    }
}
