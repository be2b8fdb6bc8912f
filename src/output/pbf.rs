use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use byteorder::{BigEndian, WriteBytesExt};
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::bbox::Bbox;
use crate::output::varint::{write_int, zigzag};
use crate::output::{for_each_node_way, generator_string, ElevClassifier, Output, WayRecord};
use crate::tile::TileContours;

/// Coordinate granularity in nanodegrees: 100 nanodegrees, so raw values
/// are signed 7-decimal-digit integers like in the o5m output.
const GRANULARITY: i64 = 100;
const NANO: f64 = 1e9;
const HUNDRED_NANO: f64 = 1e7;

const MAX_NODES_PER_BLOCK: usize = 8000;
const MAX_WAYS_PER_BLOCK: usize = 32000;

const WIRE_VARINT: u64 = 0;
const WIRE_LEN: u64 = 2;

fn pb_key(buf: &mut Vec<u8>, field: u64, wire: u64) {
    write_int(buf, (field << 3) | wire);
}

fn pb_varint(buf: &mut Vec<u8>, field: u64, value: u64) {
    pb_key(buf, field, WIRE_VARINT);
    write_int(buf, value);
}

fn pb_sint(buf: &mut Vec<u8>, field: u64, value: i64) {
    pb_key(buf, field, WIRE_VARINT);
    write_int(buf, zigzag(value));
}

fn pb_bytes(buf: &mut Vec<u8>, field: u64, data: &[u8]) {
    pb_key(buf, field, WIRE_LEN);
    write_int(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

fn pb_packed_sint(buf: &mut Vec<u8>, field: u64, values: &[i64]) {
    let mut packed = Vec::with_capacity(values.len() * 2);
    for &value in values {
        write_int(&mut packed, zigzag(value));
    }
    pb_bytes(buf, field, &packed);
}

fn pb_packed_uint(buf: &mut Vec<u8>, field: u64, values: &[u64]) {
    let mut packed = Vec::with_capacity(values.len() * 2);
    for &value in values {
        write_int(&mut packed, value);
    }
    pb_bytes(buf, field, &packed);
}

/// Per-block string table; index 0 is the reserved empty string.
struct BlockStrings {
    strings: Vec<Vec<u8>>,
    index: HashMap<Vec<u8>, u64>,
}

impl BlockStrings {
    fn new() -> Self {
        Self {
            strings: vec![Vec::new()],
            index: HashMap::new(),
        }
    }

    fn intern(&mut self, string: &str) -> u64 {
        let bytes = string.as_bytes().to_vec();
        if let Some(&i) = self.index.get(&bytes) {
            return i;
        }
        let i = self.strings.len() as u64;
        self.strings.push(bytes.clone());
        self.index.insert(bytes, i);
        i
    }

    fn encode(&self) -> Vec<u8> {
        let mut table = Vec::new();
        for string in &self.strings {
            pb_bytes(&mut table, 1, string);
        }
        table
    }
}

/// OSM PBF output: a bbox header blob followed by zlib-compressed
/// primitive blocks with dense, delta-coded nodes.
pub struct PbfOutput {
    writer: BufWriter<File>,
    elev_classifier: ElevClassifier,
    pending_ways: Vec<(Vec<WayRecord>, u64)>,
}

impl PbfOutput {
    pub fn create(path: &Path, bbox: Bbox, elev_classifier: ElevClassifier) -> anyhow::Result<Self> {
        let file = File::create(path).with_context(|| format!("creating {path:?}"))?;
        let mut output = Self {
            writer: BufWriter::new(file),
            elev_classifier,
            pending_ways: Vec::new(),
        };
        output.write_header_blob(&bbox)?;
        Ok(output)
    }

    fn write_blob(&mut self, blob_type: &str, block: &[u8]) -> anyhow::Result<()> {
        let mut compressor = ZlibEncoder::new(Vec::new(), Compression::default());
        compressor.write_all(block)?;
        let compressed = compressor.finish()?;

        let mut blob = Vec::with_capacity(compressed.len() + 16);
        pb_varint(&mut blob, 2, block.len() as u64);
        pb_bytes(&mut blob, 3, &compressed);

        let mut blob_header = Vec::new();
        pb_bytes(&mut blob_header, 1, blob_type.as_bytes());
        pb_varint(&mut blob_header, 3, blob.len() as u64);

        self.writer
            .write_u32::<BigEndian>(blob_header.len() as u32)?;
        self.writer.write_all(&blob_header)?;
        self.writer.write_all(&blob)?;
        Ok(())
    }

    fn write_header_blob(&mut self, bbox: &Bbox) -> anyhow::Result<()> {
        let mut header_bbox = Vec::new();
        pb_sint(&mut header_bbox, 1, (bbox.min_lon * NANO).round() as i64);
        pb_sint(&mut header_bbox, 2, (bbox.max_lon * NANO).round() as i64);
        pb_sint(&mut header_bbox, 3, (bbox.max_lat * NANO).round() as i64);
        pb_sint(&mut header_bbox, 4, (bbox.min_lat * NANO).round() as i64);

        let mut header = Vec::new();
        pb_bytes(&mut header, 1, &header_bbox);
        pb_bytes(&mut header, 4, b"OsmSchema-V0.6");
        pb_bytes(&mut header, 4, b"DenseNodes");
        pb_bytes(&mut header, 16, generator_string().as_bytes());
        self.write_blob("OSMHeader", &header)
    }

    fn write_dense_block(&mut self, nodes: &[(u64, i64, i64)]) -> anyhow::Result<()> {
        let mut ids = Vec::with_capacity(nodes.len());
        let mut lons = Vec::with_capacity(nodes.len());
        let mut lats = Vec::with_capacity(nodes.len());
        let (mut last_id, mut last_lon, mut last_lat) = (0i64, 0i64, 0i64);
        for &(id, lon, lat) in nodes {
            ids.push(id as i64 - last_id);
            lons.push(lon - last_lon);
            lats.push(lat - last_lat);
            last_id = id as i64;
            last_lon = lon;
            last_lat = lat;
        }

        let mut dense = Vec::new();
        pb_packed_sint(&mut dense, 1, &ids);
        pb_packed_sint(&mut dense, 8, &lats);
        pb_packed_sint(&mut dense, 9, &lons);

        let mut group = Vec::new();
        pb_bytes(&mut group, 2, &dense);

        let strings = BlockStrings::new();
        let mut block = Vec::new();
        pb_bytes(&mut block, 1, &strings.encode());
        pb_bytes(&mut block, 2, &group);
        pb_varint(&mut block, 17, GRANULARITY as u64);
        self.write_blob("OSMData", &block)
    }

    fn write_ways_block(&mut self, ways: &[(u64, WayRecord)]) -> anyhow::Result<()> {
        let mut strings = BlockStrings::new();
        let mut group = Vec::new();
        for (way_id, way) in ways {
            let keys = [
                strings.intern("ele"),
                strings.intern("contour"),
                strings.intern("contour_ext"),
            ];
            let vals = [
                strings.intern(&way.elevation.to_string()),
                strings.intern("elevation"),
                strings.intern(self.elev_classifier.classify(way.elevation)),
            ];
            let mut ref_deltas = Vec::with_capacity(way.nb_nodes as usize + 1);
            ref_deltas.push(way.first_node_id as i64);
            for _ in 0..way.nb_nodes - 1 {
                ref_deltas.push(1);
            }
            if way.closed_loop {
                ref_deltas.push(-(way.nb_nodes as i64 - 1));
            }

            let mut way_msg = Vec::new();
            pb_varint(&mut way_msg, 1, *way_id);
            pb_packed_uint(&mut way_msg, 2, &keys);
            pb_packed_uint(&mut way_msg, 3, &vals);
            pb_packed_sint(&mut way_msg, 8, &ref_deltas);
            pb_bytes(&mut group, 3, &way_msg);
        }

        let mut block = Vec::new();
        pb_bytes(&mut block, 1, &strings.encode());
        pb_bytes(&mut block, 2, &group);
        pb_varint(&mut block, 17, GRANULARITY as u64);
        self.write_blob("OSMData", &block)
    }
}

impl Output for PbfOutput {
    fn write_nodes(
        &mut self,
        tile_contours: &TileContours,
        _timestamp_string: &str,
        start_node_id: u64,
        _osm_version: f64,
    ) -> anyhow::Result<(u64, Vec<WayRecord>)> {
        let mut nodes: Vec<(u64, i64, i64)> = Vec::with_capacity(tile_contours.nb_nodes as usize);
        let result = for_each_node_way(tile_contours, start_node_id, |id, lon, lat| {
            nodes.push((
                id,
                (lon * HUNDRED_NANO).round() as i64,
                (lat * HUNDRED_NANO).round() as i64,
            ));
            Ok(())
        })?;
        for chunk in nodes.chunks(MAX_NODES_PER_BLOCK) {
            self.write_dense_block(chunk)?;
        }
        Ok(result)
    }

    fn write_ways(&mut self, ways: Vec<WayRecord>, start_way_id: u64) {
        self.pending_ways.push((ways, start_way_id));
    }

    fn done(&mut self) -> anyhow::Result<()> {
        let mut identified: Vec<(u64, WayRecord)> = Vec::new();
        for (ways, start_way_id) in std::mem::take(&mut self.pending_ways) {
            for (i, way) in ways.into_iter().enumerate() {
                identified.push((start_way_id + i as u64, way));
            }
        }
        for chunk in identified.chunks(MAX_WAYS_PER_BLOCK) {
            self.write_ways_block(chunk)?;
        }
        self.writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
