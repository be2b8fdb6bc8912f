use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::{debug, error, warn};
use rayon::ThreadPoolBuilder;

use crate::bbox::Bbox;
use crate::conf::Config;
use crate::error::HgtError;
use crate::output::{get_osm_output, Output};
use crate::raster::HgtFile;
use crate::tile::SubTile;

/// Drives contour generation for a batch of input files.
///
/// Sub-tiles are independent tasks sharing only the two id counters and,
/// in single-output mode, the one encoder.  Id ranges are reserved with an
/// atomic fetch-and-add before emission, so output files stay internally
/// consistent no matter how tasks are scheduled.
pub struct HgtFilesProcessor<'a> {
    conf: &'a Config,
    /// Overall area, used for truncation and the single-output bounds.
    area: Bbox,
    next_node_id: AtomicU64,
    next_way_id: AtomicU64,
    single_output: Option<Mutex<Box<dyn Output>>>,
    failures: Mutex<Vec<String>>,
}

impl<'a> HgtFilesProcessor<'a> {
    pub fn new(
        conf: &'a Config,
        area: Bbox,
        input_files: &[(PathBuf, bool)],
    ) -> anyhow::Result<Self> {
        let single_output = if conf.max_nodes_per_tile == 0 {
            let paths: Vec<&Path> = input_files.iter().map(|(path, _)| path.as_path()).collect();
            Some(Mutex::new(get_osm_output(conf, &paths, area)?))
        } else {
            None
        };
        Ok(Self {
            conf,
            area,
            next_node_id: AtomicU64::new(conf.start_node_id),
            next_way_id: AtomicU64::new(conf.start_way_id),
            single_output,
            failures: Mutex::new(Vec::new()),
        })
    }

    /// Atomically reads `counter` and advances it by `inc_value`.  This is
    /// the only critical section between sub-tile tasks.
    fn get_and_inc_counter(counter: &AtomicU64, inc_value: u64) -> u64 {
        counter.fetch_add(inc_value, Ordering::SeqCst)
    }

    pub fn next_node_id(&self) -> u64 {
        self.next_node_id.load(Ordering::SeqCst)
    }

    pub fn next_way_id(&self) -> u64 {
        self.next_way_id.load(Ordering::SeqCst)
    }

    fn record_failure(&self, unit: &Path, err: anyhow::Error) {
        error!("{}: {err:#}", unit.display());
        self.failures
            .lock()
            .expect("failure list poisoned")
            .push(format!("{}: {err:#}", unit.display()));
    }

    /// Processes one sub-tile: trace, reserve id ranges, emit.
    pub(crate) fn process_sub_tile(&self, file_path: &Path, tile: &SubTile) -> anyhow::Result<()> {
        debug!("process_sub_tile {}", tile.get_stats());
        let tile_contours = match tile.get_contours(
            self.conf.contour_step_size,
            None,
            None,
            self.conf.no_zero,
            self.conf.effective_rdp_epsilon(),
            self.conf.max_nodes_per_way,
        ) {
            Err(HgtError::UniformGrid) => {
                warn!("discarding invalid {}", tile.get_stats());
                return Ok(());
            }
            result => result?,
        };
        if tile_contours.nb_nodes == 0 {
            debug!(
                "{}: no contour nodes, no output written",
                tile.get_stats()
            );
            return Ok(());
        }

        let node_start =
            Self::get_and_inc_counter(&self.next_node_id, tile_contours.nb_nodes);
        let way_start = Self::get_and_inc_counter(&self.next_way_id, tile_contours.nb_ways);

        match &self.single_output {
            Some(shared) => {
                let mut output = shared.lock().expect("output lock poisoned");
                let timestamp = output.timestamp_string();
                let (new_start_id, ways) = output.write_nodes(
                    &tile_contours,
                    &timestamp,
                    node_start,
                    self.conf.osm_version,
                )?;
                check_id_accounting(&tile_contours, node_start, new_start_id, ways.len());
                output.write_ways(ways, way_start);
            }
            None => {
                let bounds = tile.bbox_wgs84()?;
                let mut output = get_osm_output(self.conf, &[file_path], bounds)?;
                let timestamp = output.timestamp_string();
                let (new_start_id, ways) = output.write_nodes(
                    &tile_contours,
                    &timestamp,
                    node_start,
                    self.conf.osm_version,
                )?;
                check_id_accounting(&tile_contours, node_start, new_start_id, ways.len());
                output.write_ways(ways, way_start);
                output.done()?;
            }
        }
        Ok(())
    }

    fn load_and_tile(&self, path: &Path, check_poly: bool) -> anyhow::Result<Vec<SubTile>> {
        debug!("process_file {}", path.display());
        let hgt_file = HgtFile::open(
            path,
            self.conf.corrx,
            self.conf.corry,
            self.conf.polygons.clone(),
            check_poly,
            self.conf.void_max,
            self.conf.contour_feet,
            self.conf.smooth_ratio,
        )?;
        let tiles = hgt_file.make_tiles(
            Some(&self.area),
            self.conf.max_nodes_per_tile,
            self.conf.contour_step_size,
        )?;
        debug!("tiles built; nb tiles: {}", tiles.len());
        for tile in &tiles {
            debug!("  {}", tile.get_stats());
        }
        Ok(tiles)
    }

    /// Runs the whole batch.  With more than one job and per-tile outputs,
    /// file loading and sub-tile processing fan out onto a worker pool;
    /// single-output mode and -j1 run everything in the caller.
    pub fn process_files(&self, files: &'a [(PathBuf, bool)]) -> anyhow::Result<()> {
        let parallel = self.conf.jobs > 1 && self.single_output.is_none();
        if parallel {
            let pool = ThreadPoolBuilder::new()
                .num_threads(self.conf.jobs)
                .build()?;
            pool.scope(|scope| {
                for (path, check_poly) in files {
                    scope.spawn(move |scope| match self.load_and_tile(path, *check_poly) {
                        Err(err) => self.record_failure(path, err),
                        Ok(tiles) => {
                            for tile in tiles {
                                scope.spawn(move |_| {
                                    if let Err(err) = self.process_sub_tile(path, &tile) {
                                        self.record_failure(path, err);
                                    }
                                });
                            }
                        }
                    });
                }
            });
        } else {
            for (path, check_poly) in files {
                match self.load_and_tile(path, *check_poly) {
                    Err(err) => self.record_failure(path, err),
                    Ok(tiles) => {
                        for tile in tiles {
                            if let Err(err) = self.process_sub_tile(path, &tile) {
                                self.record_failure(path, err);
                            }
                        }
                    }
                }
            }
        }

        if let Some(shared) = &self.single_output {
            shared.lock().expect("output lock poisoned").done()?;
        }

        let failures = self.failures.lock().expect("failure list poisoned");
        if failures.is_empty() {
            Ok(())
        } else {
            error!(
                "some processing unit(s) failed:\n - {}",
                failures.join("\n - ")
            );
            Err(HgtError::WorkerFailure(failures.len()).into())
        }
    }
}

fn check_id_accounting(
    tile_contours: &crate::tile::TileContours,
    node_start: u64,
    new_start_id: u64,
    nb_ways_written: usize,
) {
    if new_start_id != node_start + tile_contours.nb_nodes {
        warn!(
            "new_start_id mismatch! new_start_id: {new_start_id} - expected: {}",
            node_start + tile_contours.nb_nodes
        );
    }
    if nb_ways_written as u64 != tile_contours.nb_ways {
        warn!(
            "way count mismatch! written: {nb_ways_written} - expected: {}",
            tile_contours.nb_ways
        );
    }
}
