//! Coaddition of IFU cubes into a single mosaic.
//!
//! A run moves through the stages of [`CoaddStage`]: the inputs are put on a
//! common wavelength axis, a canvas covering all of their footprints is
//! sized, every cube is drizzled onto it with exposure-time weighting, the
//! result is normalised by the summed exposure and finally trimmed to the
//! well-exposed region.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::{Array1, Array3, Axis};
use rayon::prelude::*;

use crate::align::{covered_layers, resample_wavelength_axis, DataKind};
use crate::resample::{accumulate, Canvas, Contribution, Coverage};
use crate::wcs::{orientation, CelestialWcs, SkyProjection};
use crate::{CoaddConfig, Cube, Header, IfuError, Result, Vec2D};

/// Progress of a [`Coadder`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoaddStage {
    Init,
    WavelengthAligned,
    CanvasSized,
    Accumulating { index: usize, total: usize },
    Normalized,
    Trimmed,
    Done,
}

/// Shared flag used to abandon a coadd between input cubes.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// An intensity cube and, optionally, its variance cube.
#[derive(Clone, Debug)]
pub struct CoaddInput {
    pub intensity: Cube,
    pub variance: Option<Cube>,
}

impl From<Cube> for CoaddInput {
    fn from(intensity: Cube) -> Self {
        Self {
            intensity,
            variance: None,
        }
    }
}

/// Inclusive index ranges of the canvas kept by trimming.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrimWindow {
    pub x: (usize, usize),
    pub y: (usize, usize),
    pub w: (usize, usize),
}

/// Result of a coadd run.
#[derive(Clone, Debug)]
pub struct CoaddProduct {
    pub cube: Cube,
    pub variance: Option<Cube>,
    /// summed exposure time of every output pixel
    pub exposure: Array3<f64>,
    /// window of the untrimmed canvas kept in the output
    pub trim: TrimWindow,
}

pub struct Coadder {
    config: CoaddConfig,
    cancel: CancelToken,
    stage: CoaddStage,
}

/// Snap values within rounding error of a whole pixel onto it.
fn snap(v: f64) -> f64 {
    if (v - v.round()).abs() < 1e-6 {
        v.round()
    } else {
        v
    }
}

/// first..=last index of `profile` exceeding `threshold` times its maximum
fn span_above(profile: &Array1<f64>, threshold: f64) -> Result<(usize, usize)> {
    let peak = profile.fold(0.0f64, |a, &b| a.max(b));
    if peak <= 0.0 {
        return Err(IfuError::Geometry(
            "no canvas pixel received any exposure".to_string(),
        ));
    }
    let mut above = profile
        .iter()
        .enumerate()
        .filter(|&(_, &p)| p / peak > threshold)
        .map(|(i, _)| i);
    let first = above.next().ok_or(IfuError::Geometry(
        "exposure threshold rejects the whole canvas".to_string(),
    ))?;
    let last = above.last().unwrap_or(first);
    Ok((first, last))
}

fn report(config: &CoaddConfig, i: usize, total: usize, input: &Contribution, coverage: &Coverage) {
    log::info!("cube {}/{}: {} pixels covered", i + 1, total, coverage.covered);
    if config.verbose {
        log::info!(
            "cube {}/{}: exposure {} s, layers {}..={}, {} spaxels skipped",
            i + 1,
            total,
            input.exposure,
            input.layers.0,
            input.layers.1,
            coverage.skipped
        );
    }
}

impl Coadder {
    pub fn new(config: CoaddConfig) -> Self {
        Self {
            config,
            cancel: CancelToken::new(),
            stage: CoaddStage::Init,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// the stage reached by the last (or current) run
    pub fn stage(&self) -> CoaddStage {
        self.stage
    }

    pub fn config(&self) -> &CoaddConfig {
        &self.config
    }

    /// Coadd `inputs` into a mosaic.
    ///
    /// The first cube provides the output header and spatial frame.
    pub fn run(&mut self, inputs: Vec<CoaddInput>) -> Result<CoaddProduct> {
        self.stage = CoaddStage::Init;
        self.config.validate()?;
        let (inputs, exposures, counts) = self.prepare(inputs)?;

        let (inputs, layers) = self.align_wavelengths(inputs)?;
        self.stage = CoaddStage::WavelengthAligned;

        let (canvas_wcs, (nyc, nxc)) = self.size_canvas(&inputs)?;
        self.stage = CoaddStage::CanvasSized;
        let nw = inputs[0].intensity.shape().0;
        log::info!("canvas is {} x {} x {} (x, y, w)", nxc, nyc, nw);

        let contributions: Vec<Contribution> = inputs
            .iter()
            .zip(exposures.iter())
            .zip(layers.iter())
            .map(|((input, &exposure), &layers)| Contribution {
                cube: &input.intensity,
                variance: input.variance.as_ref(),
                exposure,
                layers,
            })
            .collect();
        let canvas = self.accumulate_all(&contributions, &canvas_wcs, (nw, nyc, nxc))?;

        let Canvas {
            mut data,
            exposure,
            mut variance,
        } = canvas;
        let weight = exposure.mapv(|e| if e == 0.0 { 1.0 } else { e });
        data /= &weight;
        if let Some(var) = variance.as_mut() {
            *var /= &weight.mapv(|w| w * w);
        }
        self.stage = CoaddStage::Normalized;

        let mut header = inputs[0].intensity.header.clone();
        canvas_wcs.to_header(&mut header);
        header.set("NCOADD", inputs.len());
        if counts {
            header.set("BUNIT", "electrons/sec");
        }
        let trim = self.trim_window(&exposure)?;
        let untrimmed = Cube::new(data, header.clone());
        let cube = untrimmed.subcube(trim.w, trim.y, trim.x);
        let variance = variance.map(|var| {
            let mut var_header = header.clone();
            if let Some(unit) = inputs[0]
                .variance
                .as_ref()
                .and_then(|v| v.header.text("BUNIT"))
            {
                var_header.set("BUNIT", unit);
            }
            Cube::new(var, var_header).subcube(trim.w, trim.y, trim.x)
        });
        let exposure = Cube::new(exposure, header)
            .subcube(trim.w, trim.y, trim.x)
            .data;
        self.stage = CoaddStage::Trimmed;
        log::info!(
            "trimmed to x {}..={}, y {}..={}, w {}..={}",
            trim.x.0,
            trim.x.1,
            trim.y.0,
            trim.y.1,
            trim.w.0,
            trim.w.1
        );

        self.stage = CoaddStage::Done;
        Ok(CoaddProduct {
            cube,
            variance,
            exposure,
            trim,
        })
    }

    /// Validate inputs, read exposure times and convert counts to rates.
    fn prepare(&self, inputs: Vec<CoaddInput>) -> Result<(Vec<CoaddInput>, Vec<f64>, bool)> {
        if inputs.is_empty() {
            return Err(IfuError::Geometry("no input cubes to coadd".to_string()));
        }
        let dw = inputs[0].intensity.spectral_axis()?.cdelt;
        for (i, input) in inputs.iter().enumerate() {
            let cdelt = input.intensity.spectral_axis()?.cdelt;
            if (cdelt - dw).abs() > 1e-9 * dw.abs() {
                return Err(IfuError::WavelengthScale(format!(
                    "wavelength axes must be equal in scale, cube {} has CD3_3={} but cube 0 has {}",
                    i, cdelt, dw
                )));
            }
            match (&input.variance, self.config.propagate_variance) {
                (Some(var), true) if var.shape() != input.intensity.shape() => {
                    return Err(IfuError::Geometry(format!(
                        "variance of cube {} has shape {:?}, expected {:?}",
                        i,
                        var.shape(),
                        input.intensity.shape()
                    )))
                }
                (None, true) => {
                    return Err(IfuError::Geometry(format!(
                        "no variance cube for input {}",
                        i
                    )))
                }
                _ => (),
            }
        }

        let mut exposures = Vec::with_capacity(inputs.len());
        let mut counts = false;
        let mut prepared = Vec::with_capacity(inputs.len());
        for mut input in inputs {
            let exposure = input.intensity.exposure_time()?;
            if !self.config.propagate_variance {
                input.variance = None;
            }
            if input.intensity.in_counts() {
                counts = true;
                input.intensity.data /= exposure;
                input.intensity.header.set("BUNIT", "electrons/sec");
                if let Some(var) = input.variance.as_mut() {
                    var.data /= exposure * exposure;
                    var.header.set("BUNIT", "electrons/sec");
                }
            }
            exposures.push(exposure);
            prepared.push(input);
        }
        Ok((prepared, exposures, counts))
    }

    /// Resample every cube onto the wavelength axis spanning all inputs.
    fn align_wavelengths(
        &self,
        inputs: Vec<CoaddInput>,
    ) -> Result<(Vec<CoaddInput>, Vec<(usize, usize)>)> {
        let axes = inputs
            .iter()
            .map(|input| input.intensity.spectral_axis())
            .collect::<Result<Vec<_>>>()?;
        let dw = axes[0].cdelt;
        let w_start = axes.iter().map(|a| a.start()).fold(f64::INFINITY, f64::min);
        let w_end = axes.iter().map(|a| a.end()).fold(f64::NEG_INFINITY, f64::max);
        let n = ((w_end - w_start) / dw - 1e-6).ceil().max(0.0) as usize + 1;
        log::info!(
            "aligning {} cubes to {} layers from {:.3} in steps of {}",
            inputs.len(),
            n,
            w_start,
            dw
        );

        let mut layers = Vec::with_capacity(inputs.len());
        let mut aligned = Vec::with_capacity(inputs.len());
        for (i, input) in inputs.iter().enumerate() {
            let range = covered_layers(&input.intensity, w_start, dw, n)?.ok_or(
                IfuError::Geometry(format!("cube {} covers no layer of the common axis", i)),
            )?;
            let intensity =
                resample_wavelength_axis(&input.intensity, w_start, dw, n, DataKind::Intensity)?;
            let variance = match &input.variance {
                Some(var) => Some(resample_wavelength_axis(var, w_start, dw, n, DataKind::Variance)?),
                None => None,
            };
            layers.push(range);
            aligned.push(CoaddInput { intensity, variance });
        }
        Ok((aligned, layers))
    }

    /// Canvas frame and `(ny, nx)` size covering every input footprint.
    fn size_canvas(&self, inputs: &[CoaddInput]) -> Result<(CelestialWcs, (usize, usize))> {
        let reference: &Header = &inputs[0].intensity.header;
        let mut canvas_wcs = CelestialWcs::from_header(reference)?;
        canvas_wcs.equalize_aspect()?;
        let pa = self.config.position_angle;
        canvas_wcs.rotate(orientation(reference, pa) - pa)?;

        // outer spaxel edges, so edge spaxels land on the canvas whole
        let mut lo = Vec2D::new(f64::INFINITY, f64::INFINITY);
        let mut hi = Vec2D::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (i, input) in inputs.iter().enumerate() {
            let (_, ny, nx) = input.intensity.shape();
            let wcs = input.intensity.celestial_wcs()?;
            for corner in wcs.outer_footprint(nx, ny) {
                let p = canvas_wcs.sky_to_pixel(corner).ok_or(IfuError::Geometry(format!(
                    "footprint of cube {} cannot be projected onto the canvas",
                    i
                )))?;
                lo = Vec2D::new(lo.x.min(p.x), lo.y.min(p.y));
                hi = Vec2D::new(hi.x.max(p.x), hi.y.max(p.y));
            }
        }
        // first and last canvas pixels whose squares the edges reach
        let first = Vec2D::new(snap(lo.x + 0.5).floor(), snap(lo.y + 0.5).floor());
        let last = Vec2D::new(snap(hi.x - 0.5).ceil(), snap(hi.y - 0.5).ceil());
        let nx = (last.x - first.x + 1.0) as usize;
        let ny = (last.y - first.y + 1.0) as usize;

        // keep the tangent point, move the first pixel onto the footprint minimum
        canvas_wcs.crpix = [canvas_wcs.crpix[0] - first.x, canvas_wcs.crpix[1] - first.y];
        Ok((canvas_wcs, (ny, nx)))
    }

    fn accumulate_all(
        &mut self,
        contributions: &[Contribution],
        canvas_wcs: &CelestialWcs,
        shape: (usize, usize, usize),
    ) -> Result<Canvas> {
        let total = contributions.len();
        let with_variance = self.config.propagate_variance;
        if self.config.parallel_inputs {
            self.stage = CoaddStage::Accumulating { index: 0, total };
            let (config, cancel) = (&self.config, &self.cancel);
            let canvases = contributions
                .par_iter()
                .enumerate()
                .map(|(i, contribution)| -> Result<Canvas> {
                    if cancel.is_cancelled() {
                        return Err(IfuError::Cancelled);
                    }
                    let mut canvas = Canvas::new(shape, with_variance);
                    let coverage = accumulate(&mut canvas, canvas_wcs, contribution, config)?;
                    report(config, i, total, contribution, &coverage);
                    Ok(canvas)
                })
                .collect::<Result<Vec<Canvas>>>()?;
            let mut canvas = Canvas::new(shape, with_variance);
            for other in &canvases {
                canvas.merge(other);
            }
            self.stage = CoaddStage::Accumulating { index: total, total };
            return Ok(canvas);
        }

        let mut canvas = Canvas::new(shape, with_variance);
        for (i, contribution) in contributions.iter().enumerate() {
            self.stage = CoaddStage::Accumulating { index: i, total };
            if self.cancel.is_cancelled() {
                return Err(IfuError::Cancelled);
            }
            let coverage = accumulate(&mut canvas, canvas_wcs, contribution, &self.config)?;
            report(&self.config, i, total, contribution, &coverage);
        }
        self.stage = CoaddStage::Accumulating { index: total, total };
        Ok(canvas)
    }

    /// Window of the canvas whose mean exposure profiles exceed the exposure
    /// threshold along every axis.
    fn trim_window(&self, exposure: &Array3<f64>) -> Result<TrimWindow> {
        let threshold = self.config.exposure_threshold;
        let profile_x = exposure.sum_axis(Axis(0)).sum_axis(Axis(0));
        let profile_y = exposure.sum_axis(Axis(0)).sum_axis(Axis(1));
        let profile_w = exposure.sum_axis(Axis(2)).sum_axis(Axis(1));
        Ok(TrimWindow {
            x: span_above(&profile_x, threshold)?,
            y: span_above(&profile_y, threshold)?,
            w: span_above(&profile_w, threshold)?,
        })
    }
}

/// Variance cube path of an intensity cube path (`icube` → `vcube`).
pub fn variance_path<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
    let path = path.as_ref();
    let name = path.file_name()?.to_str()?;
    if !name.contains("icube") {
        return None;
    }
    Some(path.with_file_name(name.replace("icube", "vcube")))
}

/// Output paths `<stem>.coadd.fits` and `<stem>.coadd.var.fits` beside `first`.
pub fn output_paths<P: AsRef<Path>>(first: P) -> (PathBuf, PathBuf) {
    let first = first.as_ref();
    let name = first
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("cube.fits");
    let stem = name.strip_suffix(".fits").unwrap_or(name);
    (
        first.with_file_name(format!("{}.coadd.fits", stem)),
        first.with_file_name(format!("{}.coadd.var.fits", stem)),
    )
}

/// Load cubes from `paths`, coadd them and write the mosaic beside the first
/// input.
///
/// Returns the paths written. Nothing is written if any stage fails.
pub fn run_coadd<P: AsRef<Path>>(
    paths: &[P],
    config: &CoaddConfig,
) -> Result<(PathBuf, Option<PathBuf>)> {
    let first = paths
        .first()
        .ok_or(IfuError::Geometry("no input cubes to coadd".to_string()))?;
    let mut inputs = Vec::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        log::debug!("loading {}", path.display());
        let intensity = Cube::from_fits(path)?;
        let variance = if config.propagate_variance {
            let var_path = variance_path(path).ok_or(IfuError::InvalidFITS(format!(
                "cannot derive a variance cube name from {}",
                path.display()
            )))?;
            log::debug!("loading {}", var_path.display());
            Some(Cube::from_fits(var_path)?)
        } else {
            None
        };
        inputs.push(CoaddInput {
            intensity,
            variance,
        });
    }

    let product = Coadder::new(config.clone()).run(inputs)?;

    let (out, var_out) = output_paths(first);
    product.cube.to_fits(&out)?;
    log::info!("wrote {}", out.display());
    let var_out = match &product.variance {
        Some(var) => {
            var.to_fits(&var_out)?;
            log::info!("wrote {}", var_out.display());
            Some(var_out)
        }
        None => None,
    };
    Ok((out, var_out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_span_is_contiguous() {
        let profile = Array1::from(vec![0.0, 0.05, 1.0, 0.02, 0.5, 0.0]);
        assert_eq!(span_above(&profile, 0.1).unwrap(), (2, 4));
        assert_eq!(span_above(&profile, 0.0).unwrap(), (1, 4));
        assert!(matches!(
            span_above(&Array1::zeros(3), 0.1),
            Err(IfuError::Geometry(_))
        ));
    }

    #[test]
    fn derived_paths() {
        assert_eq!(
            variance_path("/data/kb1_icubes.fits"),
            Some(PathBuf::from("/data/kb1_vcubes.fits"))
        );
        assert_eq!(variance_path("/data/kb1_cube.fits"), None);
        let (out, var) = output_paths("/data/kb1_icubes.fits");
        assert_eq!(out, PathBuf::from("/data/kb1_icubes.coadd.fits"));
        assert_eq!(var, PathBuf::from("/data/kb1_icubes.coadd.var.fits"));
    }

    #[test]
    fn cancelled_before_accumulation() {
        let token = CancelToken::new();
        token.cancel();
        let mut hdr = Header::new();
        hdr.set("CRVAL1", 150.0);
        hdr.set("CRVAL2", 2.0);
        hdr.set("CRPIX1", 1.0);
        hdr.set("CRPIX2", 1.0);
        hdr.set("CD1_1", -1e-4);
        hdr.set("CD2_2", 1e-4);
        hdr.set("CRVAL3", 4000.0);
        hdr.set("CRPIX3", 1.0);
        hdr.set("CD3_3", 1.0);
        hdr.set("EXPTIME", 10.0);
        let cube = Cube::new(Array3::ones((2, 3, 3)), hdr);
        let mut coadder = Coadder::new(CoaddConfig::default()).with_cancel(token);
        assert!(matches!(
            coadder.run(vec![cube.into()]),
            Err(IfuError::Cancelled)
        ));
        assert_eq!(coadder.stage(), CoaddStage::Accumulating { index: 0, total: 1 });
    }
}
