//! Spatial registration of cubes against a source of known sky position.
//!
//! The cube is collapsed into a white-light image over its well-calibrated
//! wavelength range, and the source's centre of gravity is iterated inside a
//! box around the position predicted by the cube's WCS.
use ndarray::{s, Array2, Axis, Zip};

use crate::wcs::SkyProjection;
use crate::{Cube, IfuError, Result, Vec2D};

/// Maximum centre-of-gravity iterations of a source fit.
const ITERATIONS: usize = 10;

/// A fit has converged once the centre moves less than this (pixels).
const CONVERGED: f64 = 1e-4;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Centroid {
    /// flux-weighted centre, 0-based pixels
    pub cog: Vec2D,
    /// positive white-light flux inside the final box
    pub flux: f64,
    /// predicted position the search started from
    pub pos: Vec2D,
}

fn median(values: impl Iterator<Item = f64>) -> f64 {
    let mut values: Vec<f64> = values.collect();
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// Sum of the layers strictly inside `WAVGOOD0..WAVGOOD1` (every layer when
/// either keyword is missing), median subtracted.
///
/// Non-finite values count as zero.
pub fn white_light_image(cube: &Cube) -> Result<Array2<f64>> {
    let axis = cube.spectral_axis()?;
    let good = match (
        cube.header.float_opt("WAVGOOD0"),
        cube.header.float_opt("WAVGOOD1"),
    ) {
        (Some(w0), Some(w1)) => Some((w0, w1)),
        _ => None,
    };
    let (_, ny, nx) = cube.shape();
    let mut image = Array2::<f64>::zeros((ny, nx));
    for (i, layer) in cube.data.axis_iter(Axis(0)).enumerate() {
        if let Some((w0, w1)) = good {
            let w = axis.wavelength(i as f64);
            if w <= w0 || w >= w1 {
                continue;
            }
        }
        Zip::from(&mut image).and(&layer).for_each(|sum, &v| {
            if v.is_finite() {
                *sum += v;
            }
        });
    }
    let background = median(image.iter().copied());
    image -= background;
    Ok(image)
}

/// inclusive index range of a box of half-width `half` around `centre`
fn window(centre: f64, half: f64, n: usize) -> Result<(usize, usize)> {
    let a = (centre - half).floor().max(0.0);
    let b = (centre + half).ceil().min(n as f64 - 1.0);
    if n == 0 || !(a <= b) {
        return Err(IfuError::Geometry(format!(
            "box around pixel {} lies outside the image",
            centre
        )));
    }
    Ok((a as usize, b as usize))
}

/// Iterate the centre of gravity of `image` in a box of half-widths `half`
/// (pixels), starting from `start` and re-centring the box each time.
///
/// Negative (below background) pixels carry no weight.
pub fn box_centroid(image: &Array2<f64>, start: Vec2D, half: Vec2D) -> Result<Centroid> {
    let (ny, nx) = image.dim();
    let mut centre = start;
    let mut flux = 0.0;
    for _ in 0..ITERATIONS {
        let (x0, x1) = window(centre.x, half.x, nx)?;
        let (y0, y1) = window(centre.y, half.y, ny)?;
        let (sumx, sumy, sum) = image
            .slice(s![y0..=y1, x0..=x1])
            .indexed_iter()
            .map(|((y, x), &v)| {
                let v = v.max(0.0);
                ((x + x0) as f64 * v, (y + y0) as f64 * v, v)
            })
            .fold((0.0, 0.0, 0.0), |a, b| (a.0 + b.0, a.1 + b.1, a.2 + b.2));
        if sum <= 0.0 {
            return Err(IfuError::Geometry(format!(
                "no source flux in the box around ({:.2}, {:.2})",
                centre.x, centre.y
            )));
        }
        let next = Vec2D::new(sumx / sum, sumy / sum);
        let step = next - centre;
        centre = next;
        flux = sum;
        if step.x.hypot(step.y) < CONVERGED {
            break;
        }
    }
    Ok(Centroid {
        cog: centre,
        flux,
        pos: start,
    })
}

/// Reference pixel `(CRPIX1, CRPIX2)`, 1-based, that puts the sky position
/// `radec` (degrees) on the measured centroid of the source there.
///
/// `box_arcsec` is the full width of the search box on the sky. Paired with
/// `CRVAL1/2 = radec` the result registers the cube on the source.
pub fn fit_crpix12(cube: &Cube, radec: (f64, f64), box_arcsec: f64) -> Result<(f64, f64)> {
    if !(box_arcsec > 0.0) {
        return Err(IfuError::Geometry(format!(
            "search box must be positive, got {} arcsec",
            box_arcsec
        )));
    }
    let wcs = cube.celestial_wcs()?;
    let start = wcs
        .sky_to_pixel(Vec2D::new(radec.0, radec.1))
        .ok_or(IfuError::Geometry(format!(
            "source at ({}, {}) cannot be projected onto the cube",
            radec.0, radec.1
        )))?;
    let (dx, dy) = wcs.axis_scales();
    let half = Vec2D::new(
        box_arcsec / 2.0 / (dx * 3600.0),
        box_arcsec / 2.0 / (dy * 3600.0),
    );
    let image = white_light_image(cube)?;
    let centroid = box_centroid(&image, start, half)?;
    log::debug!(
        "source predicted at ({:.2}, {:.2}), measured at ({:.2}, {:.2})",
        start.x,
        start.y,
        centroid.cog.x,
        centroid.cog.y
    );
    Ok((centroid.cog.x + 1.0, centroid.cog.y + 1.0))
}
