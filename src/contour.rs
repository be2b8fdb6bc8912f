use std::collections::{HashMap, VecDeque};

use geo::{LineString, Simplify};

use crate::raster::{Grid, Mask};

pub type Polyline = Vec<(f64, f64)>;

/// A grid edge between two adjacent grid points.  `horizontal` edges run
/// from (row, col) to (row, col+1), vertical ones from (row, col) to
/// (row+1, col).  Contour vertices live on these edges, so keying them this
/// way makes the two cells sharing an edge agree on the vertex bit-exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct EdgeKey {
    row: u32,
    col: u32,
    horizontal: bool,
}

struct TraceGrid<'a> {
    grid: &'a Grid,
    row_offset: usize,
    rows: usize,
    mask: Option<&'a Mask>,
    x_axis: &'a [f64],
    y_axis: &'a [f64],
}

impl<'a> TraceGrid<'a> {
    #[inline]
    fn z(&self, row: usize, col: usize) -> f64 {
        self.grid.get(self.row_offset + row, col) as f64
    }

    #[inline]
    fn masked(&self, row: usize, col: usize) -> bool {
        self.mask.map_or(false, |m| m.get(row, col))
    }

    fn edge_point(&self, key: &EdgeKey, level: f64) -> (f64, f64) {
        let (row, col) = (key.row as usize, key.col as usize);
        if key.horizontal {
            let z0 = self.z(row, col);
            let z1 = self.z(row, col + 1);
            let t = ((level - z0) / (z1 - z0)).clamp(0.0, 1.0);
            (
                self.x_axis[col] + t * (self.x_axis[col + 1] - self.x_axis[col]),
                self.y_axis[row],
            )
        } else {
            let z0 = self.z(row, col);
            let z1 = self.z(row + 1, col);
            let t = ((level - z0) / (z1 - z0)).clamp(0.0, 1.0);
            (
                self.x_axis[col],
                self.y_axis[row] + t * (self.y_axis[row + 1] - self.y_axis[row]),
            )
        }
    }
}

/// Traces the iso-elevation lines of `level` over a row slab of `grid`.
///
/// `mask` is slab-local; cells with a masked corner are treated as unknown
/// and never crossed.  Coordinates come from the axes; a polyline is closed
/// iff its first and last points are equal.
pub fn trace_level(
    grid: &Grid,
    row_offset: usize,
    rows: usize,
    mask: Option<&Mask>,
    x_axis: &[f64],
    y_axis: &[f64],
    level: f64,
) -> Vec<Polyline> {
    let view = TraceGrid {
        grid,
        row_offset,
        rows,
        mask,
        x_axis,
        y_axis,
    };
    let cols = grid.cols();
    let mut segments: Vec<(EdgeKey, EdgeKey)> = Vec::new();

    for r in 0..view.rows.saturating_sub(1) {
        for c in 0..cols - 1 {
            if view.masked(r, c)
                || view.masked(r, c + 1)
                || view.masked(r + 1, c)
                || view.masked(r + 1, c + 1)
            {
                continue;
            }
            let tl = view.z(r, c) > level;
            let tr = view.z(r, c + 1) > level;
            let bl = view.z(r + 1, c) > level;
            let br = view.z(r + 1, c + 1) > level;
            let index = (tl as u8) << 3 | (tr as u8) << 2 | (br as u8) << 1 | bl as u8;
            if index == 0 || index == 15 {
                continue;
            }

            let top = EdgeKey {
                row: r as u32,
                col: c as u32,
                horizontal: true,
            };
            let bottom = EdgeKey {
                row: (r + 1) as u32,
                col: c as u32,
                horizontal: true,
            };
            let left = EdgeKey {
                row: r as u32,
                col: c as u32,
                horizontal: false,
            };
            let right = EdgeKey {
                row: r as u32,
                col: (c + 1) as u32,
                horizontal: false,
            };

            match index {
                1 => segments.push((left, bottom)),
                2 => segments.push((bottom, right)),
                3 => segments.push((left, right)),
                4 => segments.push((top, right)),
                6 => segments.push((top, bottom)),
                7 => segments.push((top, left)),
                8 => segments.push((top, left)),
                9 => segments.push((top, bottom)),
                11 => segments.push((top, right)),
                12 => segments.push((left, right)),
                13 => segments.push((bottom, right)),
                14 => segments.push((left, bottom)),
                5 | 10 => {
                    // saddle cell, resolved by the center value
                    let center = (view.z(r, c)
                        + view.z(r, c + 1)
                        + view.z(r + 1, c)
                        + view.z(r + 1, c + 1))
                        / 4.0
                        > level;
                    let tr_bl_connected = (index == 5) == center;
                    if tr_bl_connected {
                        segments.push((top, left));
                        segments.push((bottom, right));
                    } else {
                        segments.push((top, right));
                        segments.push((left, bottom));
                    }
                }
                _ => unreachable!(),
            }
        }
    }

    join_segments(&view, &segments, level)
}

fn join_segments(view: &TraceGrid, segments: &[(EdgeKey, EdgeKey)], level: f64) -> Vec<Polyline> {
    let mut adjacency: HashMap<EdgeKey, Vec<usize>> = HashMap::new();
    for (i, (a, b)) in segments.iter().enumerate() {
        adjacency.entry(*a).or_default().push(i);
        adjacency.entry(*b).or_default().push(i);
    }

    let mut used = vec![false; segments.len()];
    let take_next = |used: &mut Vec<bool>, adjacency: &HashMap<EdgeKey, Vec<usize>>,
                     key: &EdgeKey|
     -> Option<EdgeKey> {
        let candidates = adjacency.get(key)?;
        for &i in candidates {
            if !used[i] {
                used[i] = true;
                let (a, b) = segments[i];
                return Some(if a == *key { b } else { a });
            }
        }
        None
    };

    let mut paths = Vec::new();
    for i in 0..segments.len() {
        if used[i] {
            continue;
        }
        used[i] = true;
        let (a, b) = segments[i];
        let mut chain: VecDeque<EdgeKey> = VecDeque::new();
        chain.push_back(a);
        chain.push_back(b);
        while chain.back() != chain.front() || chain.len() <= 2 {
            let tail = *chain.back().unwrap();
            match take_next(&mut used, &adjacency, &tail) {
                None => break,
                Some(next) => chain.push_back(next),
            }
        }
        if chain.back() != chain.front() {
            // open so far; extend from the head too
            loop {
                let head = *chain.front().unwrap();
                match take_next(&mut used, &adjacency, &head) {
                    None => break,
                    Some(next) => chain.push_front(next),
                }
            }
        }
        paths.push(
            chain
                .iter()
                .map(|key| view.edge_point(key, level))
                .collect(),
        );
    }
    paths
}

/// Removes consecutive duplicate points, then applies Ramer-Douglas-Peucker
/// when an epsilon is given.  An epsilon of 0.0 only removes collinear
/// interior points; `None` skips simplification entirely.
pub fn simplify_path(path: &[(f64, f64)], rdp_epsilon: Option<f64>) -> Polyline {
    let mut deduped: Polyline = Vec::with_capacity(path.len());
    for &point in path {
        if deduped.last() != Some(&point) {
            deduped.push(point);
        }
    }
    match rdp_epsilon {
        None => deduped,
        Some(epsilon) => {
            let line: LineString<f64> = LineString::from(deduped);
            line.simplify(&epsilon)
                .0
                .into_iter()
                .map(|c| (c.x, c.y))
                .collect()
        }
    }
}

/// One emitted way: a window into a path's node id block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WayChunk {
    /// Node index offset within the path's id block.
    pub offset: usize,
    /// Number of distinct node references.
    pub len: usize,
    /// Closed ways repeat their first node reference at the end.
    pub closed: bool,
}

/// How a polyline is cut into ways of at most `max_nodes_per_way` nodes
/// (0 disables splitting).
///
/// Consecutive chunks share their boundary node, so an open polyline of L
/// points costs exactly L node ids no matter how often it is split.  A
/// closed polyline fitting into a single way drops its duplicate end point
/// and closes by reference instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSplit {
    pub nb_nodes: u64,
    pub chunks: Vec<WayChunk>,
}

pub fn split_path(path_len: usize, closed: bool, max_nodes_per_way: usize) -> PathSplit {
    if path_len < 2 {
        return PathSplit {
            nb_nodes: 0,
            chunks: Vec::new(),
        };
    }
    let max = max_nodes_per_way;
    if max == 0 || path_len <= max {
        if closed {
            return PathSplit {
                nb_nodes: (path_len - 1) as u64,
                chunks: vec![WayChunk {
                    offset: 0,
                    len: path_len - 1,
                    closed: true,
                }],
            };
        }
        return PathSplit {
            nb_nodes: path_len as u64,
            chunks: vec![WayChunk {
                offset: 0,
                len: path_len,
                closed: false,
            }],
        };
    }
    // a split path is emitted as a plain point sequence, closed ones
    // included; every point gets exactly one node id
    debug_assert!(max >= 2);
    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < path_len - 1 {
        let len = max.min(path_len - offset);
        chunks.push(WayChunk {
            offset,
            len,
            closed: false,
        });
        offset += max - 1;
    }
    PathSplit {
        nb_nodes: path_len as u64,
        chunks,
    }
}

pub fn is_closed(path: &[(f64, f64)]) -> bool {
    path.len() > 1 && path.first() == path.last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Grid;

    fn axes(bbox: (f64, f64, f64, f64), rows: usize, cols: usize) -> (Vec<f64>, Vec<f64>) {
        let (min_lon, min_lat, max_lon, max_lat) = bbox;
        let lon_inc = (max_lon - min_lon) / (cols - 1) as f64;
        let lat_inc = (max_lat - min_lat) / (rows - 1) as f64;
        (
            (0..cols).map(|c| min_lon + c as f64 * lon_inc).collect(),
            (0..rows).map(|r| max_lat - r as f64 * lat_inc).collect(),
        )
    }

    fn peak_grid() -> Grid {
        Grid::new(
            3,
            3,
            vec![0.0, 50.0, 0.0, 50.0, 100.0, 50.0, 0.0, 50.0, 0.0],
        )
    }

    #[test]
    fn test_trace_closed_ring_around_peak() {
        let grid = peak_grid();
        let (x, y) = axes((0.0, 0.0, 1.0, 1.0), 3, 3);
        let paths = trace_level(&grid, 0, 3, None, &x, &y, 50.0);
        assert_eq!(paths.len(), 1);
        let path = &paths[0];
        assert_eq!(path.len(), 5);
        assert_eq!(path.first(), path.last());
        let mut distinct: Vec<(f64, f64)> = path[..4].to_vec();
        distinct.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(
            distinct,
            vec![(0.0, 0.5), (0.5, 0.0), (0.5, 1.0), (1.0, 0.5)]
        );
    }

    #[test]
    fn test_trace_level_on_grid_values_is_degenerate() {
        // at level 0, every crossing collapses onto the zero corners;
        // after dedup nothing longer than a single point remains
        let grid = peak_grid();
        let (x, y) = axes((0.0, 0.0, 1.0, 1.0), 3, 3);
        let paths = trace_level(&grid, 0, 3, None, &x, &y, 0.0);
        for path in paths {
            assert!(simplify_path(&path, None).len() < 2);
        }
    }

    #[test]
    fn test_trace_open_line() {
        // monotonous west-east slope crossing 15 between the two columns
        let grid = Grid::new(2, 2, vec![10.0, 20.0, 10.0, 20.0]);
        let (x, y) = axes((0.0, 0.0, 1.0, 1.0), 2, 2);
        let paths = trace_level(&grid, 0, 2, None, &x, &y, 15.0);
        assert_eq!(paths.len(), 1);
        let path = &paths[0];
        assert_eq!(path.len(), 2);
        assert_ne!(path.first(), path.last());
        for &(lon, _) in path {
            assert!((lon - 0.5).abs() < 1e-12);
        }
    }

    #[test]
    fn test_trace_row_slab_offset() {
        // slab covering the lower two rows of the peak grid only
        let grid = peak_grid();
        let (x, y) = axes((0.0, 0.0, 1.0, 0.5), 2, 3);
        let paths = trace_level(&grid, 1, 2, None, &x, &y, 50.0);
        assert_eq!(paths.len(), 1);
        assert_ne!(paths[0].first(), paths[0].last());
    }

    #[test]
    fn test_trace_masked_cells_are_not_crossed() {
        let grid = peak_grid();
        let (x, y) = axes((0.0, 0.0, 1.0, 1.0), 3, 3);
        let mut mask = Mask::filled(3, 3, false);
        mask.set(2, 2, true);
        let paths = trace_level(&grid, 0, 3, Some(&mask), &x, &y, 50.0);
        // the south-east cell is gone; the ring is torn open
        assert_eq!(paths.len(), 1);
        assert_ne!(paths[0].first(), paths[0].last());
        assert_eq!(paths[0].len(), 4);
    }

    #[test]
    fn test_trace_fully_masked_emits_nothing() {
        let grid = peak_grid();
        let (x, y) = axes((0.0, 0.0, 1.0, 1.0), 3, 3);
        let mask = Mask::filled(3, 3, true);
        assert!(trace_level(&grid, 0, 3, Some(&mask), &x, &y, 50.0).is_empty());
    }

    #[test]
    fn test_trace_saddle_is_resolved_consistently() {
        // high corners on one diagonal, center below level: two open arcs
        let grid = Grid::new(2, 2, vec![100.0, 0.0, 0.0, 100.0]);
        let (x, y) = axes((0.0, 0.0, 1.0, 1.0), 2, 2);
        let paths = trace_level(&grid, 0, 2, None, &x, &y, 60.0);
        assert_eq!(paths.len(), 2);
        for path in &paths {
            assert_eq!(path.len(), 2);
        }
    }

    #[test]
    fn test_simplify_dedup() {
        let path = vec![(0.0, 0.0), (0.0, 0.0), (1.0, 0.0), (1.0, 0.0), (1.0, 1.0)];
        assert_eq!(
            simplify_path(&path, None),
            vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0)]
        );
    }

    #[test]
    fn test_simplify_rdp() {
        let path = vec![(0.0, 0.0), (0.5, 0.5), (1.0, 1.0), (1.09, 0.2), (1.0, 0.0)];
        assert_eq!(
            simplify_path(&path, Some(0.1)),
            vec![(0.0, 0.0), (1.0, 1.0), (1.0, 0.0)]
        );
    }

    #[test]
    fn test_simplify_rdp_zero_removes_collinear_only() {
        let path = vec![(0.0, 0.0), (0.5, 0.5), (1.0, 1.0), (1.0, 0.5), (1.0, 0.0)];
        assert_eq!(
            simplify_path(&path, Some(0.0)),
            vec![(0.0, 0.0), (1.0, 1.0), (1.0, 0.0)]
        );
    }

    #[test]
    fn test_simplify_rdp_idempotent() {
        let path = vec![
            (0.0, 0.0),
            (0.1, 0.31),
            (0.2, 0.57),
            (0.5, 0.9),
            (0.8, 0.6),
            (1.0, 0.0),
        ];
        let once = simplify_path(&path, Some(0.05));
        let twice = simplify_path(&once, Some(0.05));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_split_short_path_is_dropped() {
        assert_eq!(split_path(1, false, 3).nb_nodes, 0);
        assert!(split_path(0, false, 3).chunks.is_empty());
    }

    #[test]
    fn test_split_no_limit() {
        let split = split_path(5, false, 0);
        assert_eq!(split.nb_nodes, 5);
        assert_eq!(
            split.chunks,
            vec![WayChunk {
                offset: 0,
                len: 5,
                closed: false
            }]
        );
    }

    #[test]
    fn test_split_open_path_shares_boundary_nodes() {
        let split = split_path(5, false, 3);
        assert_eq!(split.nb_nodes, 5);
        assert_eq!(
            split.chunks,
            vec![
                WayChunk {
                    offset: 0,
                    len: 3,
                    closed: false
                },
                WayChunk {
                    offset: 2,
                    len: 3,
                    closed: false
                },
            ]
        );
    }

    #[test]
    fn test_split_uneven_tail_keeps_two_nodes() {
        let split = split_path(6, false, 3);
        assert_eq!(split.nb_nodes, 6);
        assert_eq!(split.chunks.len(), 3);
        assert_eq!(
            split.chunks[2],
            WayChunk {
                offset: 4,
                len: 2,
                closed: false
            }
        );
    }

    #[test]
    fn test_split_closed_path_drops_duplicate_point() {
        // 5 points, first == last: 4 nodes, one closed way
        let split = split_path(5, true, 2000);
        assert_eq!(split.nb_nodes, 4);
        assert_eq!(
            split.chunks,
            vec![WayChunk {
                offset: 0,
                len: 4,
                closed: true
            }]
        );
    }

    #[test]
    fn test_split_long_closed_path_degrades_to_open_chunks() {
        let split = split_path(9, true, 4);
        assert_eq!(split.nb_nodes, 9);
        assert!(split.chunks.iter().all(|c| !c.closed));
        // chunk windows cover the whole path with shared boundaries
        let last = split.chunks.last().unwrap();
        assert_eq!(last.offset + last.len, 9);
    }
}
