pub mod bbox;
pub mod conf;
pub mod contour;
pub mod error;
pub mod output;
pub mod polygon;
pub mod processor;
pub mod raster;
pub mod srs;
pub mod tile;
pub mod transform;

use anyhow::Context;
use log::info;

use crate::conf::Config;
use crate::processor::HgtFilesProcessor;

/// Runs the contour pipeline for a validated configuration.
pub fn run(config: Config) -> anyhow::Result<()> {
    if config.rewrite_indices {
        // tile indices belong to the external downloader
        info!("no tile index files to rewrite, exiting");
        return Ok(());
    }
    let check_poly = config.polygons.is_some();
    let files: Vec<(std::path::PathBuf, bool)> = config
        .files
        .iter()
        .map(|file| (file.clone(), check_poly))
        .collect();

    if files.is_empty() {
        // downloading tiles from remote archives is handled outside of
        // this tool; an area alone is not enough to work with
        if config.download_only {
            info!("nothing to download, all inputs must be given as files");
            return Ok(());
        }
        anyhow::bail!(
            "no input files given for area {}; download the tiles first and pass them as files",
            config.area.as_deref().unwrap_or("?")
        );
    }
    if config.download_only {
        info!("--download-only: input files are already present, nothing to do");
        return Ok(());
    }

    // parses every input file's bbox, so bad HGT names and unreadable
    // rasters fail the run here, before any output is written
    let derived_area = raster::calc_hgt_area(&files, config.corrx, config.corry)
        .context("checking the input files")?;
    let area = config.area_bbox.unwrap_or(derived_area);
    info!("processing {} file(s), overall bbox {}", files.len(), area);

    let processor = HgtFilesProcessor::new(&config, area, &files)?;
    processor.process_files(&files)
}
