//! Exact-area spatial resampling of cubes onto a mosaic canvas.
//!
//! Every input spaxel is treated as a unit square, mapped corner by corner
//! through the sky into the canvas pixel grid, and clipped against each
//! canvas pixel it touches. The clipped area divided by the area of the
//! projected spaxel is the fraction of the spaxel's value given to that
//! canvas pixel.
use ndarray::{Array2, Array3, ArrayView2, Axis, Zip};
use rayon::prelude::*;

use crate::geom::{Clip, Polygon, Rect, DEGENERATE_AREA};
use crate::wcs::{CelestialWcs, SkyProjection};
use crate::{CoaddConfig, Cube, IfuError, Result, Vec2D};

/// Overlap fractions below this are discarded.
const MIN_FRACTION: f64 = 1e-9;

/// Accumulators of a coadd run, all indexed `(wavelength, y, x)`.
#[derive(Clone, Debug)]
pub struct Canvas {
    /// exposure-weighted intensity
    pub data: Array3<f64>,
    /// summed exposure time of the inputs covering each pixel
    pub exposure: Array3<f64>,
    /// variance weighted by exposure time squared
    pub variance: Option<Array3<f64>>,
}

impl Canvas {
    pub fn new(shape: (usize, usize, usize), with_variance: bool) -> Self {
        Self {
            data: Array3::zeros(shape),
            exposure: Array3::zeros(shape),
            variance: with_variance.then(|| Array3::zeros(shape)),
        }
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Add another canvas of the same shape into this one.
    pub fn merge(&mut self, other: &Canvas) {
        self.data += &other.data;
        self.exposure += &other.exposure;
        if let (Some(var), Some(other_var)) = (self.variance.as_mut(), other.variance.as_ref()) {
            *var += other_var;
        }
    }
}

/// One wavelength-aligned input cube ready to be drizzled onto a canvas.
#[derive(Clone, Copy, Debug)]
pub struct Contribution<'a> {
    pub cube: &'a Cube,
    pub variance: Option<&'a Cube>,
    /// exposure time weight
    pub exposure: f64,
    /// inclusive range of layers the cube actually samples
    pub layers: (usize, usize),
}

/// Share of one input spaxel landing on one canvas pixel.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Overlap {
    input: (usize, usize),
    output: (usize, usize),
    fraction: f64,
}

enum Spaxel {
    Overlaps(Vec<Overlap>),
    Degenerate,
    Unprojectable,
}

/// Summary of one cube's accumulation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Coverage {
    /// spaxels skipped because their projection had no area or could not be
    /// computed
    pub skipped: usize,
    /// canvas pixels (per layer) that passed the pixel threshold
    pub covered: usize,
}

/// Clip the projected spaxel `(yi, xi)` against the canvas pixels it touches.
fn spaxel_overlaps(
    input_wcs: &CelestialWcs,
    canvas_wcs: &CelestialWcs,
    (yi, xi): (usize, usize),
    (nyc, nxc): (usize, usize),
) -> Spaxel {
    let (x, y) = (xi as f64, yi as f64);
    let corners = [
        Vec2D::new(x - 0.5, y - 0.5),
        Vec2D::new(x - 0.5, y + 0.5),
        Vec2D::new(x + 0.5, y + 0.5),
        Vec2D::new(x + 0.5, y - 0.5),
    ];
    let projected: Option<Vec<Vec2D>> = corners
        .iter()
        .map(|&c| input_wcs.reproject(c, canvas_wcs))
        .collect();
    let polygon = match projected {
        Some(vertices) => Polygon::new(vertices),
        None => return Spaxel::Unprojectable,
    };
    let Some((x0, y0, x1, y1)) = polygon.pixel_bounds() else {
        return Spaxel::Unprojectable;
    };
    let area = polygon.area();
    let (x0, y0) = (x0.max(0), y0.max(0));
    let (x1, y1) = (x1.min(nxc as i64 - 1), y1.min(nyc as i64 - 1));

    let mut overlaps = vec![];
    for yo in y0..=y1 {
        for xo in x0..=x1 {
            match polygon.clip_area(&Rect::pixel(xo as f64, yo as f64)) {
                Clip::Degenerate => return Spaxel::Degenerate,
                Clip::Area(a) => {
                    let fraction = a / area;
                    if fraction >= MIN_FRACTION {
                        overlaps.push(Overlap {
                            input: (yi, xi),
                            output: (yo as usize, xo as usize),
                            fraction,
                        });
                    }
                }
            }
        }
    }
    if overlaps.is_empty() && area < DEGENERATE_AREA {
        return Spaxel::Degenerate;
    }
    Spaxel::Overlaps(overlaps)
}

/// Spread one layer of input values over a canvas plane, weighting each
/// value by its overlap fraction raised to `power`.
fn splat(overlaps: &[Overlap], layer: ArrayView2<f64>, shape: (usize, usize), power: i32) -> Array2<f64> {
    let mut plane = Array2::zeros(shape);
    for o in overlaps {
        plane[o.output] += o.fraction.powi(power) * layer[o.input];
    }
    plane
}

/// Drizzle one input cube onto `canvas`, whose spatial frame is
/// `canvas_wcs`.
///
/// Canvas pixels whose flat-field coverage (summed overlap fraction,
/// normalised by the canvas/input pixel-area ratio) falls below
/// `config.pixel_threshold` receive nothing from this cube. Covered pixels
/// get the overlap-weighted input values with weight `exposure` (variance
/// with `exposure²`), and `exposure` is added to their exposure time.
///
/// With `config.flat_correction` the values are also divided by the flat
/// (variance by its square). That restores partially covered edge pixels to
/// full surface brightness but no longer conserves total flux.
pub fn accumulate(
    canvas: &mut Canvas,
    canvas_wcs: &CelestialWcs,
    input: &Contribution,
    config: &CoaddConfig,
) -> Result<Coverage> {
    let (nw, nyc, nxc) = canvas.shape();
    let (nwi, ny, nx) = input.cube.shape();
    if nwi != nw {
        return Err(IfuError::Geometry(format!(
            "cube has {} layers but canvas has {}",
            nwi, nw
        )));
    }
    if let Some(var) = input.variance {
        if var.shape() != input.cube.shape() {
            return Err(IfuError::Geometry(format!(
                "variance shape {:?} does not match cube shape {:?}",
                var.shape(),
                input.cube.shape()
            )));
        }
    }
    let input_wcs = input.cube.celestial_wcs()?;

    let spaxels: Vec<Spaxel> = (0..ny * nx)
        .into_par_iter()
        .map(|i| spaxel_overlaps(&input_wcs, canvas_wcs, (i / nx, i % nx), (nyc, nxc)))
        .collect();

    let mut overlaps = vec![];
    let mut skipped = 0;
    for (i, spaxel) in spaxels.into_iter().enumerate() {
        match spaxel {
            Spaxel::Overlaps(o) => overlaps.extend(o),
            Spaxel::Degenerate => {
                if config.verbose {
                    log::debug!("spaxel ({}, {}) projects to a degenerate polygon", i / nx, i % nx);
                }
                skipped += 1;
            }
            Spaxel::Unprojectable => {
                if config.verbose {
                    log::debug!("spaxel ({}, {}) cannot be projected onto the canvas", i / nx, i % nx);
                }
                skipped += 1;
            }
        }
    }
    if skipped > 0 {
        log::warn!("skipped {} of {} spaxels with no usable projection", skipped, ny * nx);
    }

    let area_ratio = canvas_wcs.pixel_area() / input_wcs.pixel_area();
    let mut flat = Array2::<f64>::zeros((nyc, nxc));
    for o in &overlaps {
        flat[o.output] += o.fraction;
    }
    flat /= area_ratio;
    // zero marks an uncovered pixel from here on
    flat.mapv_inplace(|f| if f > 0.0 && f >= config.pixel_threshold { f } else { 0.0 });
    let covered_plane = flat.iter().filter(|&&f| f > 0.0).count();
    // divisor applied to covered pixels
    let divisor = if config.flat_correction {
        flat.clone()
    } else {
        flat.mapv(|f| if f > 0.0 { 1.0 } else { 0.0 })
    };

    let (w0, w1) = input.layers;
    let exposure = input.exposure;
    Zip::indexed(canvas.data.axis_iter_mut(Axis(0)))
        .and(canvas.exposure.axis_iter_mut(Axis(0)))
        .par_for_each(|w, mut data, mut weight| {
            if w < w0 || w > w1 {
                return;
            }
            let build = splat(&overlaps, input.cube.data.index_axis(Axis(0), w), (nyc, nxc), 1);
            Zip::from(&mut data)
                .and(&mut weight)
                .and(&build)
                .and(&divisor)
                .for_each(|d, e, &b, &f| {
                    if f > 0.0 {
                        *d += exposure * b / f;
                        *e += exposure;
                    }
                });
        });

    if let (Some(var_canvas), Some(var)) = (canvas.variance.as_mut(), input.variance) {
        Zip::indexed(var_canvas.axis_iter_mut(Axis(0))).par_for_each(|w, mut plane| {
            if w < w0 || w > w1 {
                return;
            }
            let build = splat(&overlaps, var.data.index_axis(Axis(0), w), (nyc, nxc), 2);
            Zip::from(&mut plane).and(&build).and(&divisor).for_each(|v, &b, &f| {
                if f > 0.0 {
                    *v += exposure * exposure * b / (f * f);
                }
            });
        });
    }

    let layers = if w1 >= w0 { w1 - w0 + 1 } else { 0 };
    Ok(Coverage {
        skipped,
        covered: covered_plane * layers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Header;
    use approx::assert_relative_eq;

    const SCALE: f64 = 0.3 / 3600.0;

    fn threshold(pixel_threshold: f64) -> CoaddConfig {
        CoaddConfig {
            pixel_threshold,
            ..Default::default()
        }
    }

    fn wcs(crpix: [f64; 2], rotation: f64) -> CelestialWcs {
        wcs_at([150.0, 2.0], crpix, SCALE, rotation)
    }

    fn wcs_at(crval: [f64; 2], crpix: [f64; 2], scale: f64, rotation: f64) -> CelestialWcs {
        let mut hdr = Header::new();
        hdr.set("NAXIS", 3i64);
        hdr.set("CRVAL1", crval[0]);
        hdr.set("CRVAL2", crval[1]);
        hdr.set("CRPIX1", crpix[0]);
        hdr.set("CRPIX2", crpix[1]);
        hdr.set("CD1_1", -scale);
        hdr.set("CD2_2", scale);
        CelestialWcs::from_header(&hdr).unwrap().rotated(rotation).unwrap()
    }

    fn cube(nw: usize, ny: usize, nx: usize, crpix: [f64; 2], rotation: f64) -> Cube {
        let mut hdr = Header::new();
        hdr.set("CRVAL3", 4000.0);
        hdr.set("CRPIX3", 1.0);
        hdr.set("CD3_3", 1.0);
        wcs(crpix, rotation).to_header(&mut hdr);
        Cube::new(Array3::from_elem((nw, ny, nx), 1.0), hdr)
    }

    #[test]
    fn rotated_spaxel_fractions_sum_to_one() {
        let input = wcs([1.0, 1.0], 30.0);
        let canvas = wcs([10.0, 10.0], 0.0);
        for spaxel in [(0, 0), (3, 7), (5, 2)] {
            match spaxel_overlaps(&input, &canvas, spaxel, (40, 40)) {
                Spaxel::Overlaps(o) => {
                    assert!(o.len() > 1);
                    let total: f64 = o.iter().map(|o| o.fraction).sum();
                    assert_relative_eq!(total, 1.0, epsilon = 1e-9);
                }
                _ => panic!("spaxel {:?} should project", spaxel),
            }
        }
    }

    #[test]
    fn aligned_copy_is_exact() {
        let input = cube(3, 4, 5, [3.0, 2.0], 0.0);
        let canvas_wcs = input.celestial_wcs().unwrap();
        let mut canvas = Canvas::new((3, 4, 5), false);
        let contribution = Contribution {
            cube: &input,
            variance: None,
            exposure: 2.0,
            layers: (0, 2),
        };
        let coverage = accumulate(&mut canvas, &canvas_wcs, &contribution, &threshold(0.5)).unwrap();
        assert_eq!(coverage, Coverage { skipped: 0, covered: 60 });
        for (&d, &e) in canvas.data.iter().zip(canvas.exposure.iter()) {
            assert_relative_eq!(d, 2.0, epsilon = 1e-9);
            assert_relative_eq!(e, 2.0);
        }
    }

    #[test]
    fn layers_outside_range_untouched() {
        let input = cube(3, 2, 2, [1.0, 1.0], 0.0);
        let canvas_wcs = input.celestial_wcs().unwrap();
        let mut canvas = Canvas::new((3, 2, 2), false);
        let contribution = Contribution {
            cube: &input,
            variance: None,
            exposure: 1.0,
            layers: (1, 1),
        };
        accumulate(&mut canvas, &canvas_wcs, &contribution, &threshold(0.5)).unwrap();
        assert_eq!(canvas.data.index_axis(Axis(0), 0).sum(), 0.0);
        assert_relative_eq!(canvas.data.index_axis(Axis(0), 1).sum(), 4.0, epsilon = 1e-9);
        assert_eq!(canvas.exposure.index_axis(Axis(0), 2).sum(), 0.0);
    }

    #[test]
    fn half_pixel_shift_splits_and_thresholds() {
        // input shifted by half a canvas pixel along x
        let input = cube(1, 1, 1, [1.5, 1.0], 0.0);
        let canvas_wcs = wcs([1.0, 1.0], 0.0);
        let contribution = Contribution {
            cube: &input,
            variance: Some(&input),
            exposure: 1.0,
            layers: (0, 0),
        };

        let mut canvas = Canvas::new((1, 1, 2), true);
        accumulate(&mut canvas, &canvas_wcs, &contribution, &threshold(0.0)).unwrap();
        // each half keeps its share of the flux
        assert_relative_eq!(canvas.data[[0, 0, 0]], 0.5, epsilon = 1e-6);
        assert_relative_eq!(canvas.data[[0, 0, 1]], 0.0, epsilon = 1e-6);
        assert_relative_eq!(canvas.data.sum(), 0.5, epsilon = 1e-6);
        let var = canvas.variance.as_ref().unwrap();
        assert_relative_eq!(var[[0, 0, 0]], 0.25, epsilon = 1e-6);

        let config = CoaddConfig {
            pixel_threshold: 0.0,
            flat_correction: true,
            ..Default::default()
        };
        let mut canvas = Canvas::new((1, 1, 2), true);
        accumulate(&mut canvas, &canvas_wcs, &contribution, &config).unwrap();
        // flat correction restores the full surface brightness
        assert_relative_eq!(canvas.data[[0, 0, 0]], 1.0, epsilon = 1e-6);
        let var = canvas.variance.as_ref().unwrap();
        assert_relative_eq!(var[[0, 0, 0]], 1.0, epsilon = 1e-6);

        let mut canvas = Canvas::new((1, 1, 2), true);
        accumulate(&mut canvas, &canvas_wcs, &contribution, &threshold(0.6)).unwrap();
        assert_eq!(canvas.data[[0, 0, 0]], 0.0);
        assert_eq!(canvas.exposure[[0, 0, 0]], 0.0);
    }

    #[test]
    fn rotated_input_keeps_its_flux() {
        let input = cube(2, 6, 5, [3.0, 3.0], 30.0);
        let canvas_wcs = wcs([7.0, 7.0], 0.0);
        let contribution = Contribution {
            cube: &input,
            variance: None,
            exposure: 1.0,
            layers: (0, 1),
        };
        let mut canvas = Canvas::new((2, 14, 14), false);
        let coverage = accumulate(&mut canvas, &canvas_wcs, &contribution, &threshold(0.0)).unwrap();
        assert_eq!(coverage.skipped, 0);
        assert_relative_eq!(canvas.data.sum(), input.data.sum(), max_relative = 1e-6);
        // partially covered edge pixels hold less than a full spaxel
        assert!(canvas.data.iter().any(|&d| d > 0.0 && d < 0.99));
    }

    #[test]
    fn unusable_spaxels_are_skipped() {
        let input = cube(1, 3, 4, [2.0, 2.0], 0.0);
        let contribution = Contribution {
            cube: &input,
            variance: None,
            exposure: 1.0,
            layers: (0, 0),
        };

        // every spaxel lies behind the tangent plane of an antipodal canvas
        let antipode = wcs_at([330.0, -2.0], [1.0, 1.0], SCALE, 0.0);
        let mut canvas = Canvas::new((1, 4, 4), false);
        let coverage = accumulate(&mut canvas, &antipode, &contribution, &threshold(0.0)).unwrap();
        assert_eq!(coverage, Coverage { skipped: 12, covered: 0 });
        assert_eq!(canvas.data.sum(), 0.0);
        assert_eq!(canvas.exposure.sum(), 0.0);

        // spaxels far smaller than a canvas pixel have no usable area
        let coarse = wcs_at([150.0, 2.0], [1.0, 1.0], SCALE * 1e7, 0.0);
        let mut canvas = Canvas::new((1, 2, 2), false);
        let coverage = accumulate(&mut canvas, &coarse, &contribution, &threshold(0.0)).unwrap();
        assert_eq!(coverage.skipped, 12);
        assert_eq!(canvas.data.sum(), 0.0);
    }

    #[test]
    fn merge_sums_accumulators() {
        let mut a = Canvas::new((1, 2, 2), true);
        let mut b = Canvas::new((1, 2, 2), true);
        a.data.fill(1.0);
        b.data.fill(2.0);
        b.exposure.fill(3.0);
        if let Some(v) = b.variance.as_mut() {
            v.fill(4.0);
        }
        a.merge(&b);
        assert_eq!(a.data[[0, 1, 1]], 3.0);
        assert_eq!(a.exposure[[0, 0, 1]], 3.0);
        assert_eq!(a.variance.unwrap()[[0, 1, 0]], 4.0);
    }

    #[test]
    fn layer_mismatch_rejected() {
        let input = cube(3, 2, 2, [1.0, 1.0], 0.0);
        let canvas_wcs = input.celestial_wcs().unwrap();
        let mut canvas = Canvas::new((4, 2, 2), false);
        let contribution = Contribution {
            cube: &input,
            variance: None,
            exposure: 1.0,
            layers: (0, 2),
        };
        assert!(matches!(
            accumulate(&mut canvas, &canvas_wcs, &contribution, &threshold(0.5)),
            Err(IfuError::Geometry(_))
        ));
    }
}
