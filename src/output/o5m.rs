use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;

use crate::bbox::Bbox;
use crate::output::varint::{int2str, sint2str};
use crate::output::{epoch_timestamp, for_each_node_way, ElevClassifier, Output, WayRecord};
use crate::tile::TileContours;

const RESET: u8 = 0xff;
const EOF: u8 = 0xfe;
const NODE_DATASET: u8 = 0x10;
const WAY_DATASET: u8 = 0x11;
const BBOX_DATASET: u8 = 0xdb;
const TIMESTAMP_DATASET: u8 = 0xdc;
const HEADER_DATASET: u8 = 0xe0;

const HUNDRED_NANO: f64 = 1e7;
const MAX_STRING_REF: usize = 15_000;
/// Strings longer than this bypass the reference table.
const MAX_TABLE_STRING_LEN: usize = 250;

/// The o5m string reference table: recently written strings are referenced
/// by their back-distance instead of being repeated.  The table drops its
/// oldest entry once it exceeds 15,000 entries.
struct StringTable {
    table: VecDeque<Vec<u8>>,
    sequence: HashMap<Vec<u8>, u64>,
    pushed: u64,
}

impl StringTable {
    fn new() -> Self {
        Self {
            table: VecDeque::new(),
            sequence: HashMap::new(),
            pushed: 0,
        }
    }

    fn string_or_index(&mut self, string: &[u8]) -> Vec<u8> {
        if string.len() > MAX_TABLE_STRING_LEN {
            return string.to_vec();
        }
        if let Some(&seq) = self.sequence.get(string) {
            // back-distance: the most recently written string is 1
            return int2str(self.pushed - seq + 1);
        }
        self.pushed += 1;
        self.table.push_back(string.to_vec());
        self.sequence.insert(string.to_vec(), self.pushed);
        if self.table.len() > MAX_STRING_REF {
            if let Some(oldest) = self.table.pop_front() {
                self.sequence.remove(&oldest);
            }
        }
        string.to_vec()
    }

    fn reset(&mut self) {
        self.table.clear();
        self.sequence.clear();
        self.pushed = 0;
    }
}

/// An o5m key/value pair, `\0key\0value\0`.
fn string_pair(key: &str, value: &str) -> Vec<u8> {
    let mut pair = Vec::with_capacity(key.len() + value.len() + 3);
    pair.push(0);
    pair.extend_from_slice(key.as_bytes());
    pair.push(0);
    pair.extend_from_slice(value.as_bytes());
    pair.push(0);
    pair
}

/// O5M output (format dataset `o5m2`).
pub struct O5mOutput {
    writer: BufWriter<File>,
    string_table: StringTable,
    elev_classifier: ElevClassifier,
    write_timestamp: bool,
    timestamp: i64,
    last_node_id: i64,
    pending_ways: Vec<(Vec<WayRecord>, u64)>,
}

impl O5mOutput {
    pub fn create(
        path: &Path,
        bbox: Bbox,
        elev_classifier: ElevClassifier,
        write_timestamp: bool,
    ) -> anyhow::Result<Self> {
        let file = File::create(path).with_context(|| format!("creating {path:?}"))?;
        let mut output = Self {
            writer: BufWriter::new(file),
            string_table: StringTable::new(),
            elev_classifier,
            write_timestamp,
            timestamp: epoch_timestamp(),
            last_node_id: 0,
            pending_ways: Vec::new(),
        };
        output.write_header(&bbox)?;
        Ok(output)
    }

    fn write_reset(&mut self) -> anyhow::Result<()> {
        self.writer.write_all(&[RESET])?;
        self.last_node_id = 0;
        self.string_table.reset();
        Ok(())
    }

    fn write_header(&mut self, bbox: &Bbox) -> anyhow::Result<()> {
        self.write_reset()?;
        // file format dataset: 0xe0, length, "o5m2"
        self.writer.write_all(&[HEADER_DATASET, 0x04])?;
        self.writer.write_all(b"o5m2")?;
        // timestamp dataset
        let timestamp_data = sint2str(self.timestamp);
        self.writer.write_all(&[TIMESTAMP_DATASET])?;
        self.writer.write_all(&int2str(timestamp_data.len() as u64))?;
        self.writer.write_all(&timestamp_data)?;
        // bounding box dataset, (left, bottom, right, top) at 1e-7 degrees
        let mut bbox_data = Vec::new();
        for coord in [bbox.min_lon, bbox.min_lat, bbox.max_lon, bbox.max_lat] {
            bbox_data.extend_from_slice(&sint2str((coord * HUNDRED_NANO).round() as i64));
        }
        self.writer.write_all(&[BBOX_DATASET])?;
        self.writer.write_all(&int2str(bbox_data.len() as u64))?;
        self.writer.write_all(&bbox_data)?;
        Ok(())
    }

    /// Version 1 plus a delta-coded timestamp; with timestamps enabled the
    /// chunk also carries the changeset delta and an empty uid/user pair.
    fn version_chunk(&mut self, first: bool) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&int2str(1));
        if first && self.write_timestamp {
            data.extend_from_slice(&sint2str(self.timestamp));
        } else {
            data.extend_from_slice(&sint2str(0));
        }
        if self.write_timestamp {
            data.extend_from_slice(&sint2str(i64::from(first)));
            data.extend_from_slice(&self.string_table.string_or_index(&[0, 0, 0]));
        }
        data
    }

    fn write_node(
        &mut self,
        id_delta: i64,
        first: bool,
        lon_delta: i64,
        lat_delta: i64,
    ) -> anyhow::Result<()> {
        let mut body = Vec::new();
        body.extend_from_slice(&sint2str(id_delta));
        body.extend_from_slice(&self.version_chunk(first));
        body.extend_from_slice(&sint2str(lon_delta));
        body.extend_from_slice(&sint2str(lat_delta));
        self.writer.write_all(&[NODE_DATASET])?;
        self.writer.write_all(&int2str(body.len() as u64))?;
        self.writer.write_all(&body)?;
        Ok(())
    }

    fn write_way(&mut self, way: &WayRecord, id_delta: i64, first: bool) -> anyhow::Result<()> {
        let mut reference_section = Vec::new();
        reference_section
            .extend_from_slice(&sint2str(way.first_node_id as i64 - self.last_node_id));
        for _ in 0..way.nb_nodes - 1 {
            reference_section.extend_from_slice(&sint2str(1));
        }
        if way.closed_loop {
            reference_section.extend_from_slice(&sint2str(-(way.nb_nodes as i64 - 1)));
            self.last_node_id = way.first_node_id as i64;
        } else {
            self.last_node_id = (way.first_node_id + way.nb_nodes - 1) as i64;
        }

        let mut body = Vec::new();
        body.extend_from_slice(&sint2str(id_delta));
        body.extend_from_slice(&self.version_chunk(first));
        body.extend_from_slice(&int2str(reference_section.len() as u64));
        body.extend_from_slice(&reference_section);
        let ele_tag = string_pair("ele", &way.elevation.to_string());
        let contour_tag = string_pair("contour", "elevation");
        let ext_tag = string_pair("contour_ext", self.elev_classifier.classify(way.elevation));
        body.extend_from_slice(&self.string_table.string_or_index(&ele_tag));
        body.extend_from_slice(&self.string_table.string_or_index(&contour_tag));
        body.extend_from_slice(&self.string_table.string_or_index(&ext_tag));

        self.writer.write_all(&[WAY_DATASET])?;
        self.writer.write_all(&int2str(body.len() as u64))?;
        self.writer.write_all(&body)?;
        Ok(())
    }

    fn write_ways_batch(&mut self, ways: &[WayRecord], start_way_id: u64) -> anyhow::Result<()> {
        if ways.is_empty() {
            return Ok(());
        }
        self.write_reset()?;
        for (i, way) in ways.iter().enumerate() {
            let id_delta = if i == 0 { start_way_id as i64 } else { 1 };
            self.write_way(way, id_delta, i == 0)?;
        }
        Ok(())
    }
}

impl Output for O5mOutput {
    fn write_nodes(
        &mut self,
        tile_contours: &TileContours,
        _timestamp_string: &str,
        start_node_id: u64,
        _osm_version: f64,
    ) -> anyhow::Result<(u64, Vec<WayRecord>)> {
        if tile_contours.nb_nodes == 0 {
            return Ok((start_node_id, Vec::new()));
        }
        self.write_reset()?;
        // coordinates are stored as signed 7-decimal-digit integers,
        // delta-coded against the previously written node
        let mut nodes: Vec<(u64, i64, i64)> = Vec::new();
        let result = for_each_node_way(tile_contours, start_node_id, |id, lon, lat| {
            nodes.push((
                id,
                (lon * HUNDRED_NANO).round() as i64,
                (lat * HUNDRED_NANO).round() as i64,
            ));
            Ok(())
        })?;
        let mut last: Option<(u64, i64, i64)> = None;
        for &(id, lon, lat) in &nodes {
            match last {
                None => self.write_node(id as i64, true, lon, lat)?,
                Some((_, last_lon, last_lat)) => {
                    self.write_node(1, false, lon - last_lon, lat - last_lat)?
                }
            }
            last = Some((id, lon, lat));
        }
        Ok(result)
    }

    fn write_ways(&mut self, ways: Vec<WayRecord>, start_way_id: u64) {
        self.pending_ways.push((ways, start_way_id));
    }

    fn done(&mut self) -> anyhow::Result<()> {
        for (ways, start_way_id) in std::mem::take(&mut self.pending_ways) {
            self.write_ways_batch(&ways, start_way_id)?;
        }
        self.writer.write_all(&[EOF])?;
        self.writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contour::split_path;
    use crate::tile::Contour;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(name)
    }

    fn contours_from(paths: Vec<(i32, Vec<(f64, f64)>)>, max_nodes_per_way: usize) -> TileContours {
        let mut tile_contours = TileContours::default();
        for (elevation, points) in paths {
            let closed = points.len() > 1 && points.first() == points.last();
            let split = split_path(points.len(), closed, max_nodes_per_way);
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

    #[test]
    fn test_header_byte_prefix() {
        let path = temp_path("o5m_header_test.o5m");
        let output = O5mOutput::create(
            &path,
            Bbox::new(1.0, 2.0, 3.0, 4.0),
            ElevClassifier::new(200, 100),
            false,
        )
        .unwrap();
        let timestamp = output.timestamp;
        drop(output);

        let bytes = std::fs::read(&path).unwrap();
        let mut expected = vec![0xff, 0xe0, 0x04];
        expected.extend_from_slice(b"o5m2");
        let timestamp_data = sint2str(timestamp);
        expected.push(0xdc);
        expected.extend_from_slice(&int2str(timestamp_data.len() as u64));
        expected.extend_from_slice(&timestamp_data);
        let mut bbox_data = Vec::new();
        bbox_data.extend_from_slice(&sint2str(10_000_000));
        bbox_data.extend_from_slice(&sint2str(20_000_000));
        bbox_data.extend_from_slice(&sint2str(30_000_000));
        bbox_data.extend_from_slice(&sint2str(40_000_000));
        expected.push(0xdb);
        expected.extend_from_slice(&int2str(bbox_data.len() as u64));
        expected.extend_from_slice(&bbox_data);
        assert_eq!(&bytes[..expected.len()], &expected[..]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_reset_before_nodes_and_trailing_eof() {
        let path = temp_path("o5m_stream_test.o5m");
        let mut output = O5mOutput::create(
            &path,
            Bbox::new(0.0, 0.0, 1.0, 1.0),
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
        output.flush().unwrap();
        let header_len = std::fs::read(&path).unwrap().len();
        let (next_id, ways) = output.write_nodes(&tile_contours, "", 1000, 0.6).unwrap();
        assert_eq!(next_id, 1004);
        output.write_ways(ways, 2000);
        output.done().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        // stream-start reset, then a reset right before the node stream
        assert_eq!(bytes[0], 0xff);
        assert_eq!(bytes[header_len], 0xff);
        assert_eq!(bytes[header_len + 1], 0x10);
        assert_eq!(*bytes.last().unwrap(), 0xfe);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_first_node_dataset_bytes() {
        let path = temp_path("o5m_node_test.o5m");
        let mut output = O5mOutput::create(
            &path,
            Bbox::new(0.0, 0.0, 1.0, 1.0),
            ElevClassifier::new(100, 50),
            false,
        )
        .unwrap();
        output.flush().unwrap();
        let header_len = std::fs::read(&path).unwrap().len();
        let tile_contours = contours_from(vec![(50, vec![(0.25, 0.5), (0.5, 0.75)])], 0);
        output.write_nodes(&tile_contours, "", 1000, 0.6).unwrap();
        output.flush().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let stream = &bytes[header_len..];
        assert_eq!(stream[0], 0xff);
        assert_eq!(stream[1], 0x10);
        let mut body = Vec::new();
        body.extend_from_slice(&sint2str(1000)); // id delta from reset base 0
        body.extend_from_slice(&int2str(1)); // version 1
        body.extend_from_slice(&sint2str(0)); // no timestamp
        body.extend_from_slice(&sint2str(2_500_000)); // lon
        body.extend_from_slice(&sint2str(5_000_000)); // lat
        assert_eq!(stream[2] as usize, body.len());
        assert_eq!(&stream[3..3 + body.len()], &body[..]);
        // second node is delta coded
        let second = &stream[3 + body.len()..];
        assert_eq!(second[0], 0x10);
        let mut second_body = Vec::new();
        second_body.extend_from_slice(&sint2str(1));
        second_body.extend_from_slice(&int2str(1));
        second_body.extend_from_slice(&sint2str(0));
        second_body.extend_from_slice(&sint2str(2_500_000));
        second_body.extend_from_slice(&sint2str(2_500_000));
        assert_eq!(second[1] as usize, second_body.len());
        assert_eq!(&second[2..2 + second_body.len()], &second_body[..]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_closed_way_reference_section() {
        let path = temp_path("o5m_way_test.o5m");
        let mut output = O5mOutput::create(
            &path,
            Bbox::new(0.0, 0.0, 1.0, 1.0),
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
        let (_, ways) = output.write_nodes(&tile_contours, "", 1000, 0.6).unwrap();
        output.write_ways(ways, 2000);
        output.done().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        // locate the way dataset: last reset byte, then 0x11
        let last_reset = bytes.iter().rposition(|&b| b == 0xff).unwrap();
        assert_eq!(bytes[last_reset + 1], 0x11);
        let body = &bytes[last_reset + 3..];
        let mut expected = Vec::new();
        expected.extend_from_slice(&sint2str(2000)); // way id delta after reset
        expected.extend_from_slice(&int2str(1)); // version
        expected.extend_from_slice(&sint2str(0)); // timestamp
        let mut refs = Vec::new();
        refs.extend_from_slice(&sint2str(1000)); // first ref, delta from 0
        refs.extend_from_slice(&sint2str(1));
        refs.extend_from_slice(&sint2str(1));
        refs.extend_from_slice(&sint2str(1));
        refs.extend_from_slice(&sint2str(-3)); // close the loop
        expected.extend_from_slice(&int2str(refs.len() as u64));
        expected.extend_from_slice(&refs);
        expected.extend_from_slice(&string_pair("ele", "50"));
        expected.extend_from_slice(&string_pair("contour", "elevation"));
        expected.extend_from_slice(&string_pair("contour_ext", "elevation_medium"));
        assert_eq!(&body[..expected.len()], &expected[..]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_repeated_tags_use_string_references() {
        let path = temp_path("o5m_strtable_test.o5m");
        let mut output = O5mOutput::create(
            &path,
            Bbox::new(0.0, 0.0, 1.0, 1.0),
            ElevClassifier::new(100, 50),
            false,
        )
        .unwrap();
        let tile_contours = contours_from(
            vec![
                (50, vec![(0.0, 0.0), (0.5, 0.0)]),
                (50, vec![(0.0, 0.5), (0.5, 0.5)]),
            ],
            0,
        );
        let (_, ways) = output.write_nodes(&tile_contours, "", 1, 0.6).unwrap();
        assert_eq!(ways.len(), 2);
        output.write_ways(ways, 100);
        output.done().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        // "contour" appears spelled out exactly twice: once in the
        // contour=elevation pair and once in the contour_ext pair of the
        // first way; the second way references both
        let needle = b"\x00contour\x00";
        let count = bytes
            .windows(needle.len())
            .filter(|window| window == needle)
            .count();
        assert_eq!(count, 1);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_string_table_back_references() {
        let mut table = StringTable::new();
        let a = string_pair("ele", "100");
        let b = string_pair("contour", "elevation");
        assert_eq!(table.string_or_index(&a), a);
        assert_eq!(table.string_or_index(&b), b);
        // back distances: b was pushed last
        assert_eq!(table.string_or_index(&b), int2str(1));
        assert_eq!(table.string_or_index(&a), int2str(2));
    }

    #[test]
    fn test_string_table_eviction() {
        let mut table = StringTable::new();
        let first = string_pair("ele", "0");
        table.string_or_index(&first);
        for i in 1..=MAX_STRING_REF {
            table.string_or_index(&string_pair("ele", &i.to_string()));
        }
        // first entry fell out and is written in full again
        assert_eq!(table.string_or_index(&first), first);
    }

    #[test]
    fn test_long_strings_bypass_table() {
        let mut table = StringTable::new();
        let long = vec![b'x'; 300];
        assert_eq!(table.string_or_index(&long), long);
        assert_eq!(table.string_or_index(&long), long);
    }

    #[test]
    fn test_version_chunk_with_timestamp() {
        let path = temp_path("o5m_ts_test.o5m");
        let mut output = O5mOutput::create(
            &path,
            Bbox::new(0.0, 0.0, 1.0, 1.0),
            ElevClassifier::new(100, 50),
            true,
        )
        .unwrap();
        let chunk = output.version_chunk(true);
        let mut expected = Vec::new();
        expected.extend_from_slice(&int2str(1));
        expected.extend_from_slice(&sint2str(output.timestamp));
        expected.extend_from_slice(&sint2str(1));
        expected.extend_from_slice(&[0, 0, 0]);
        assert_eq!(chunk, expected);
        let follow_up = output.version_chunk(false);
        let mut expected = Vec::new();
        expected.extend_from_slice(&int2str(1));
        expected.extend_from_slice(&sint2str(0));
        expected.extend_from_slice(&sint2str(0));
        expected.extend_from_slice(&int2str(1)); // uid/user pair by reference
        assert_eq!(follow_up, expected);
        std::fs::remove_file(&path).ok();
    }
}
