mod errors;
pub mod align;
pub mod astrometry;
pub mod coadd;
pub mod config;
pub mod coords;
pub mod geom;
pub mod header;
pub mod io;
pub mod resample;
pub mod table;
pub mod wcs;
#[cfg(feature = "python")]
mod python;

pub use crate::coadd::{run_coadd, CancelToken, CoaddInput, CoaddProduct, CoaddStage, Coadder};
pub use crate::config::CoaddConfig;
pub use crate::errors::{IfuError, Result};
pub use crate::geom::Vec2D;
pub use crate::header::{Header, Keyword};
pub use crate::io::Cube;
pub use crate::wcs::{CelestialWcs, SkyProjection};

use std::path::PathBuf;

/// Expand glob patterns into a sorted, de-duplicated list of paths.
pub fn expand_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<PathBuf>> {
    let mut paths = vec![];
    for pattern in patterns {
        for path in glob::glob(pattern.as_ref())? {
            paths.push(path?);
        }
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}

/// Load every cube matching a glob pattern.
pub fn load_cubes(pattern: &str) -> Result<Vec<Cube>> {
    glob::glob(pattern)?
        .map(|path| Cube::from_fits(path?))
        .collect::<Result<Vec<Cube>>>()
}
