use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::output::{
    for_each_node_way, generator_string, make_utc_timestamp, ElevClassifier, Output, WayRecord,
};
use crate::tile::TileContours;

enum XmlWriter {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Write for XmlWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            XmlWriter::Plain(w) => w.write(buf),
            XmlWriter::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            XmlWriter::Plain(w) => w.flush(),
            XmlWriter::Gzip(w) => w.flush(),
        }
    }
}

impl XmlWriter {
    fn finish(&mut self) -> std::io::Result<()> {
        match self {
            XmlWriter::Plain(w) => w.flush(),
            XmlWriter::Gzip(w) => {
                w.try_finish()?;
                w.get_mut().flush()
            }
        }
    }
}

/// OSM XML output, optionally gzip-compressed (levels 1-9).
pub struct XmlOutput {
    writer: XmlWriter,
    osm_version: String,
    version_attr: &'static str,
    timestamp: String,
    elev_classifier: ElevClassifier,
    pending_ways: Vec<(Vec<WayRecord>, u64)>,
}

impl XmlOutput {
    pub fn create(
        path: &Path,
        osm_version: f64,
        bounds_tag: &str,
        gzip: u32,
        elev_classifier: ElevClassifier,
        write_timestamp: bool,
    ) -> anyhow::Result<Self> {
        let file = File::create(path).with_context(|| format!("creating {path:?}"))?;
        let buffered = BufWriter::new(file);
        let writer = if (1..10).contains(&gzip) {
            XmlWriter::Gzip(GzEncoder::new(buffered, Compression::new(gzip)))
        } else {
            XmlWriter::Plain(buffered)
        };
        let timestamp = if write_timestamp {
            format!(" timestamp=\"{}\"", make_utc_timestamp())
        } else {
            String::new()
        };
        let mut output = Self {
            writer,
            osm_version: format!("{osm_version:.1}"),
            version_attr: Self::version_string(osm_version),
            timestamp,
            elev_classifier,
            pending_ways: Vec::new(),
        };
        output.write_preamble(bounds_tag)?;
        Ok(output)
    }

    fn write_preamble(&mut self, bounds_tag: &str) -> anyhow::Result<()> {
        write!(
            self.writer,
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<osm version=\"{}\" generator=\"{}\">\n{}\n",
            self.osm_version,
            generator_string(),
            bounds_tag
        )?;
        Ok(())
    }

    fn version_string(osm_version: f64) -> &'static str {
        if osm_version > 0.5 {
            " version=\"1\""
        } else {
            ""
        }
    }

    fn write_way(&mut self, way: &WayRecord, way_id: u64, version_string: &str) -> anyhow::Result<()> {
        let mut node_refs = String::new();
        for node_ref in way.node_refs() {
            node_refs.push_str(&format!("<nd ref=\"{node_ref}\"/>\n"));
        }
        write!(
            self.writer,
            "<way id=\"{}\"{}{}>{}<tag k=\"ele\" v=\"{}\"/><tag k=\"contour\" v=\"elevation\"/><tag k=\"contour_ext\" v=\"{}\"/></way>\n",
            way_id,
            version_string,
            self.timestamp,
            node_refs,
            way.elevation,
            self.elev_classifier.classify(way.elevation)
        )?;
        Ok(())
    }
}

impl Output for XmlOutput {
    fn write_nodes(
        &mut self,
        tile_contours: &TileContours,
        timestamp_string: &str,
        start_node_id: u64,
        osm_version: f64,
    ) -> anyhow::Result<(u64, Vec<WayRecord>)> {
        let version_string = Self::version_string(osm_version);
        let writer = &mut self.writer;
        for_each_node_way(tile_contours, start_node_id, |id, lon, lat| {
            write!(
                writer,
                "<node id=\"{id}\" lat=\"{lat:.7}\" lon=\"{lon:.7}\"{version_string}{timestamp_string}/>\n"
            )?;
            Ok(())
        })
    }

    fn write_ways(&mut self, ways: Vec<WayRecord>, start_way_id: u64) {
        self.pending_ways.push((ways, start_way_id));
    }

    fn done(&mut self) -> anyhow::Result<()> {
        let version_string = self.version_attr;
        for (ways, start_way_id) in std::mem::take(&mut self.pending_ways) {
            for (i, way) in ways.iter().enumerate() {
                self.write_way(way, start_way_id + i as u64, version_string)?;
            }
        }
        self.writer.write_all(b"</osm>\n")?;
        self.writer.finish()?;
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn timestamp_string(&self) -> String {
        self.timestamp.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bbox::Bbox;
    use crate::contour::{split_path, PathSplit};
    use crate::tile::{Contour, TileContours};
    use std::path::PathBuf;

    fn contours_from(paths: Vec<(i32, Vec<(f64, f64)>)>, max_nodes_per_way: usize) -> TileContours {
        let mut tile_contours = TileContours::default();
        for (elevation, points) in paths {
            let closed = points.len() > 1 && points.first() == points.last();
            let split: PathSplit = split_path(points.len(), closed, max_nodes_per_way);
            tile_contours.nb_nodes += split.nb_nodes;
            tile_contours.nb_ways += split.chunks.len() as u64;
            tile_contours
                .contours
                .entry(elevation)
                .or_default()
                .push(Contour { points, split });
        }
        tile_contours
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(name)
    }

    #[test]
    fn test_closed_contour_xml() {
        let path = temp_path("xml_closed_test.osm");
        let bounds = Bbox::new(0.0, 0.0, 1.0, 1.0);
        let mut output = XmlOutput::create(
            &path,
            0.6,
            &bounds.to_bounds_tag(),
            0,
            ElevClassifier::new(100, 50),
            false,
        )
        .unwrap();
        let tile_contours = contours_from(
            vec![(
                50,
                vec![(0.0, 0.5), (0.5, 1.0), (1.0, 0.5), (0.5, 0.0), (0.0, 0.5)],
            )],
            2000,
        );
        let (next_id, ways) = output.write_nodes(&tile_contours, "", 1000, 0.6).unwrap();
        assert_eq!(next_id, 1004);
        assert_eq!(ways.len(), 1);
        output.write_ways(ways, 2000);
        output.done().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<osm version=\"0.6\" generator=\"pyhgtmap"
        ));
        assert!(content.contains(
            "<bounds minlat=\"0.0000000\" minlon=\"0.0000000\" maxlat=\"1.0000000\" maxlon=\"1.0000000\"/>"
        ));
        assert!(content
            .contains("<node id=\"1000\" lat=\"0.5000000\" lon=\"0.0000000\" version=\"1\"/>"));
        assert!(content
            .contains("<node id=\"1003\" lat=\"0.0000000\" lon=\"0.5000000\" version=\"1\"/>"));
        // exactly 4 nodes for the closed ring
        assert_eq!(content.matches("<node ").count(), 4);
        assert!(content.contains("<way id=\"2000\" version=\"1\">"));
        assert!(content.contains(
            "<nd ref=\"1000\"/>\n<nd ref=\"1001\"/>\n<nd ref=\"1002\"/>\n<nd ref=\"1003\"/>\n<nd ref=\"1000\"/>\n"
        ));
        assert!(content.contains("<tag k=\"ele\" v=\"50\"/>"));
        assert!(content.contains("<tag k=\"contour\" v=\"elevation\"/>"));
        assert!(content.contains("<tag k=\"contour_ext\" v=\"elevation_medium\"/>"));
        assert!(content.ends_with("</osm>\n"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_way_split_shares_node_ids() {
        let path = temp_path("xml_split_test.osm");
        let mut output = XmlOutput::create(
            &path,
            0.6,
            &Bbox::new(0.0, 0.0, 1.0, 1.0).to_bounds_tag(),
            0,
            ElevClassifier::new(200, 100),
            false,
        )
        .unwrap();
        let tile_contours = contours_from(
            vec![(
                20,
                vec![(0.0, 0.0), (0.1, 0.0), (0.2, 0.0), (0.3, 0.0), (0.4, 0.0)],
            )],
            3,
        );
        assert_eq!(tile_contours.nb_nodes, 5);
        assert_eq!(tile_contours.nb_ways, 2);
        let (next_id, ways) = output.write_nodes(&tile_contours, "", 100, 0.6).unwrap();
        assert_eq!(next_id, 105);
        assert_eq!(ways.len(), 2);
        assert_eq!(ways[0].node_refs(), vec![100, 101, 102]);
        assert_eq!(ways[1].node_refs(), vec![102, 103, 104]);
        output.write_ways(ways, 500);
        output.done().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("<node ").count(), 5);
        assert!(content.contains("<way id=\"500\""));
        assert!(content.contains("<way id=\"501\""));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_osm_version_05_omits_version_attribute() {
        let path = temp_path("xml_v05_test.osm");
        let mut output = XmlOutput::create(
            &path,
            0.5,
            &Bbox::new(0.0, 0.0, 1.0, 1.0).to_bounds_tag(),
            0,
            ElevClassifier::new(200, 100),
            false,
        )
        .unwrap();
        let tile_contours = contours_from(vec![(20, vec![(0.0, 0.0), (1.0, 1.0)])], 0);
        let (_, ways) = output.write_nodes(&tile_contours, "", 1, 0.5).unwrap();
        output.write_ways(ways, 10);
        output.done().unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("version=\"1\""));
        assert!(content.contains("<osm version=\"0.5\""));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_gzip_output_is_gzip() {
        let path = temp_path("xml_gzip_test.osm.gz");
        let mut output = XmlOutput::create(
            &path,
            0.6,
            &Bbox::new(0.0, 0.0, 1.0, 1.0).to_bounds_tag(),
            9,
            ElevClassifier::new(200, 100),
            false,
        )
        .unwrap();
        let tile_contours = contours_from(vec![(20, vec![(0.0, 0.0), (1.0, 1.0)])], 0);
        let (_, ways) = output.write_nodes(&tile_contours, "", 1, 0.6).unwrap();
        output.write_ways(ways, 10);
        output.done().unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..2], &[0x1f, 0x8b]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_timestamp_attribute_present() {
        let path = temp_path("xml_ts_test.osm");
        let mut output = XmlOutput::create(
            &path,
            0.6,
            &Bbox::new(0.0, 0.0, 1.0, 1.0).to_bounds_tag(),
            0,
            ElevClassifier::new(200, 100),
            true,
        )
        .unwrap();
        let timestamp = output.timestamp_string();
        assert!(timestamp.starts_with(" timestamp=\""));
        assert!(timestamp.ends_with("Z\""));
        let tile_contours = contours_from(vec![(20, vec![(0.0, 0.0), (1.0, 1.0)])], 0);
        let (_, ways) = output
            .write_nodes(&tile_contours, &timestamp, 1, 0.6)
            .unwrap();
        output.write_ways(ways, 10);
        output.done().unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("timestamp=\""));
        std::fs::remove_file(&path).ok();
    }
}
