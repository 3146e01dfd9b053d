use env_logger::Env;
use pyo3::prelude::*;

use crate::align::DataKind;
use crate::{expand_patterns, run_coadd, CoaddConfig, Cube};

/// Python bindings, built with the `python` feature.
#[pymodule]
fn ifucoadd(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(coadd_files, m)?)?;
    m.add_function(wrap_pyfunction!(xcor_crpix3, m)?)?;
    m.add_function(wrap_pyfunction!(fit_crpix12, m)?)?;
    m.add_function(wrap_pyfunction!(rebin, m)?)?;
    m.add_function(wrap_pyfunction!(wavelength_to_index, m)?)?;
    Ok(())
}

/// Coadd the cubes matching `patterns` and write the mosaic beside the first
/// input. Returns the paths written.
#[pyfunction]
#[pyo3(signature = (patterns, pxthresh=0.5, expthresh=0.1, pa=0.0, vardata=false, flatcorr=false, verbose=false))]
fn coadd_files(
    patterns: Vec<String>,
    pxthresh: f64,
    expthresh: f64,
    pa: f64,
    vardata: bool,
    flatcorr: bool,
    verbose: bool,
) -> PyResult<(String, Option<String>)> {
    if verbose {
        // a logger may already be installed by an earlier call
        let _ = env_logger::Builder::from_env(Env::default().default_filter_or("debug")).try_init();
    }
    let config = CoaddConfig {
        pixel_threshold: pxthresh,
        exposure_threshold: expthresh,
        position_angle: pa,
        propagate_variance: vardata,
        flat_correction: flatcorr,
        verbose,
        ..Default::default()
    };
    let paths = expand_patterns(&patterns)?;
    let (out, var_out) = run_coadd(&paths, &config)?;
    Ok((
        out.display().to_string(),
        var_out.map(|p| p.display().to_string()),
    ))
}

/// corrected CRPIX3 of each sky cube
#[pyfunction]
#[pyo3(signature = (paths, xmargin=2, ymargin=2))]
fn xcor_crpix3(paths: Vec<String>, xmargin: usize, ymargin: usize) -> PyResult<Vec<f64>> {
    let cubes = paths
        .iter()
        .map(Cube::from_fits)
        .collect::<crate::Result<Vec<Cube>>>()?;
    Ok(crate::align::xcor_crpix3(&cubes, xmargin, ymargin)?)
}

/// 1-based CRPIX1/2 registering the source at `ra`, `dec` in a cube
#[pyfunction]
#[pyo3(signature = (path, ra, dec, box_size=10.0))]
fn fit_crpix12(path: &str, ra: f64, dec: f64, box_size: f64) -> PyResult<(f64, f64)> {
    let cube = Cube::from_fits(path)?;
    Ok(crate::astrometry::fit_crpix12(&cube, (ra, dec), box_size)?)
}

/// Bin the cube at `path` and write the result to `out`.
#[pyfunction]
#[pyo3(signature = (path, out, xybin=1, zbin=1, vardata=false))]
fn rebin(path: &str, out: &str, xybin: usize, zbin: usize, vardata: bool) -> PyResult<()> {
    let kind = if vardata {
        DataKind::Variance
    } else {
        DataKind::Intensity
    };
    Cube::from_fits(path)?.rebin(xybin, zbin, kind)?.to_fits(out)?;
    Ok(())
}

#[pyfunction]
fn wavelength_to_index(path: &str, w0: f64, w1: f64) -> PyResult<(i64, i64)> {
    let cube = Cube::from_fits(path)?;
    Ok(crate::coords::wavelength_to_index(w0, w1, &cube.header)?)
}
