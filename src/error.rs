use std::path::PathBuf;

/// Error kinds surfaced by the contour pipeline.
///
/// CLI validation failures map to [`HgtError::InvalidOptions`] and exit
/// code 1.  During processing, per-sub-tile errors are logged and the
/// sub-tile is skipped; file-level errors abort the current file only.
#[derive(Debug, thiserror::Error)]
pub enum HgtError {
    #[error("bad filename {0:?}: expected [NS]YY[EW]XXX.hgt")]
    BadFilename(PathBuf),

    #[error("unsupported extension for input file {0:?}")]
    UnsupportedExtension(PathBuf),

    #[error("unsupported projection: {0}")]
    UnsupportedProjection(String),

    #[error("tile of {0:?} does not map to an axis-aligned EPSG:4326 rectangle")]
    NonAxisAlignedTile(PathBuf),

    #[error("could not read {path:?}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("tile has the same value on every element")]
    UniformGrid,

    #[error("{0} worker(s) failed; check earlier logs for details")]
    WorkerFailure(usize),

    #[error("{0}")]
    InvalidOptions(String),
}

impl HgtError {
    pub fn read_error(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        HgtError::ReadError {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HgtError>;
