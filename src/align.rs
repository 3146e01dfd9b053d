//! Wavelength alignment of cubes: sky-spectrum cross-correlation and
//! resampling onto a shared wavelength axis.
use ndarray::{s, Array1, Array3, Axis};
use rayon::prelude::*;
use rustfft::{num_complex::Complex, FftPlanner};

use crate::{Cube, IfuError, Result};

/// Sub-pixel offsets closer than this to a whole pixel are snapped to it.
const SNAP: f64 = 1e-6;

/// Whether cube values are intensities or variances of intensities.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataKind {
    Intensity,
    Variance,
}

/// Shifts of each spectrum relative to the first, in pixels of the shared
/// grid, plus that grid's step.
fn correlation_lags(spectra: &[(Array1<f64>, Array1<f64>)]) -> Result<(Vec<isize>, f64)> {
    let mut w0 = f64::INFINITY;
    let mut w1 = f64::NEG_INFINITY;
    let mut dw_min = f64::INFINITY;
    for (wav, flux) in spectra {
        if wav.len() < 2 || wav.len() != flux.len() {
            return Err(IfuError::WavelengthScale(format!(
                "spectrum needs at least two samples and matching lengths, got {} and {}",
                wav.len(),
                flux.len()
            )));
        }
        w0 = w0.min(wav[0]);
        w1 = w1.max(wav[wav.len() - 1]);
        dw_min = dw_min.min(wav[1] - wav[0]);
    }
    if !(dw_min > 0.0) {
        return Err(IfuError::WavelengthScale(
            "wavelengths must be increasing".to_string(),
        ));
    }
    let n = ((w1 - w0) / dw_min) as usize + 1;
    let step = if n > 1 { (w1 - w0) / (n - 1) as f64 } else { dw_min };
    let grid = Array1::from_iter((0..n).map(|i| w0 + i as f64 * step));

    let m = (2 * n).next_power_of_two();
    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(m);
    let inverse = planner.plan_fft_inverse(m);
    let spectrum_fft = |wav: &Array1<f64>, flux: &Array1<f64>| {
        let mut buffer: Vec<Complex<f64>> = vec![Complex { re: 0.0, im: 0.0 }; m];
        for (b, &g) in buffer.iter_mut().zip(grid.iter()) {
            b.re = interpolate(wav, flux, g);
        }
        forward.process(&mut buffer);
        buffer
    };

    let reference = spectrum_fft(&spectra[0].0, &spectra[0].1);
    let lags = spectra
        .iter()
        .map(|(wav, flux)| {
            let mut buffer = spectrum_fft(wav, flux);
            for (b, r) in buffer.iter_mut().zip(reference.iter()) {
                *b *= r.conj();
            }
            inverse.process(&mut buffer);
            // first maximum wins
            let mut best = 0;
            for (k, c) in buffer.iter().enumerate() {
                if c.re > buffer[best].re {
                    best = k;
                }
            }
            if best < m / 2 {
                best as isize
            } else {
                best as isize - m as isize
            }
        })
        .collect();
    Ok((lags, step))
}

/// linear interpolation of `(wav, flux)` at `w`, zero outside the sampled range
fn interpolate(wav: &Array1<f64>, flux: &Array1<f64>, w: f64) -> f64 {
    let n = wav.len();
    if w < wav[0] || w > wav[n - 1] {
        return 0.0;
    }
    let hi = wav
        .iter()
        .position(|&x| x >= w)
        .unwrap_or(n - 1)
        .max(1);
    let lo = hi - 1;
    let t = (w - wav[lo]) / (wav[hi] - wav[lo]);
    flux[lo] * (1.0 - t) + flux[hi] * t
}

/// Cross-correlate spectra given as `(wavelength, flux)` pairs.
///
/// Every spectrum is interpolated onto a grid spanning all inputs at the
/// finest input sampling. The returned lag of spectrum `i` is how many grid
/// pixels its features sit above those of the first spectrum, so the first
/// lag is always zero.
pub fn cross_correlate_spectra(spectra: &[(Array1<f64>, Array1<f64>)]) -> Result<Vec<isize>> {
    if spectra.is_empty() {
        return Ok(vec![]);
    }
    Ok(correlation_lags(spectra)?.0)
}

/// Wavelength axis and normalised sky spectrum of a cube, summed over all
/// spaxels except `xmargin`/`ymargin` pixels at each edge.
pub fn sky_spectrum(cube: &Cube, xmargin: usize, ymargin: usize) -> Result<(Array1<f64>, Array1<f64>)> {
    let (_, ny, nx) = cube.shape();
    if 2 * xmargin >= nx || 2 * ymargin >= ny {
        return Err(IfuError::Geometry(format!(
            "margins ({}, {}) leave no spaxels in a {}x{} cube",
            xmargin, ymargin, nx, ny
        )));
    }
    let wav = cube.spectral_axis()?.wavelengths();
    let inner = cube
        .data
        .slice(s![.., ymargin..ny - ymargin, xmargin..nx - xmargin]);
    let mut sky: Array1<f64> = inner
        .axis_iter(Axis(0))
        .map(|plane| plane.iter().filter(|v| v.is_finite()).sum::<f64>())
        .collect();
    let peak = sky.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    if peak > 0.0 {
        sky /= peak;
    }
    Ok((wav, sky))
}

/// Corrected `CRPIX3` of every sky cube, aligning their sky spectra with the
/// first cube's.
pub fn xcor_crpix3(cubes: &[Cube], xmargin: usize, ymargin: usize) -> Result<Vec<f64>> {
    if cubes.is_empty() {
        return Ok(vec![]);
    }
    let spectra = cubes
        .iter()
        .map(|cube| sky_spectrum(cube, xmargin, ymargin))
        .collect::<Result<Vec<_>>>()?;
    let (lags, step) = correlation_lags(&spectra)?;
    cubes
        .iter()
        .zip(lags)
        .map(|(cube, lag)| -> Result<f64> {
            let axis = cube.spectral_axis()?;
            let shift = lag as f64 * step / axis.cdelt;
            log::debug!("crpix3 {} shifted by {:.3} px", axis.crpix, shift);
            Ok(axis.crpix + shift)
        })
        .collect()
}

/// Split a layer offset into its whole and fractional parts, snapping the
/// fraction to zero when within [`SNAP`] of a whole pixel.
fn split_offset(offset: f64) -> (isize, f64) {
    let mut k = offset.floor();
    let mut f = offset - k;
    if f > 1.0 - SNAP {
        k += 1.0;
        f = 0.0;
    } else if f < SNAP {
        f = 0.0;
    }
    (k as isize, f)
}

/// Resample a cube onto the wavelength axis `target_w0 + j * target_dw`,
/// `j < target_n`.
///
/// The cube is shifted by whole layers with zero padding, then the
/// sub-layer remainder `f` is applied with the linear-interpolation kernel
/// `[f, 1 - f]`. Variances use the squared kernel.
pub fn resample_wavelength_axis(
    cube: &Cube,
    target_w0: f64,
    target_dw: f64,
    target_n: usize,
    kind: DataKind,
) -> Result<Cube> {
    let axis = cube.spectral_axis()?;
    if (axis.cdelt - target_dw).abs() > 1e-9 * target_dw.abs() {
        return Err(IfuError::WavelengthScale(format!(
            "cube wavelength step {} does not match target step {}",
            axis.cdelt, target_dw
        )));
    }
    let (k, f) = split_offset((axis.start() - target_w0) / target_dw);
    let taps = match kind {
        DataKind::Intensity => [(0, 1.0 - f), (1, f)],
        DataKind::Variance => [(0, (1.0 - f).powi(2)), (1, f.powi(2))],
    };

    let (nw, ny, nx) = cube.shape();
    let mut data = Array3::<f64>::zeros((target_n, ny, nx));
    data.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(j, mut plane)| {
            for (delay, weight) in taps {
                let src = j as isize - k - delay;
                if weight == 0.0 || src < 0 || src >= nw as isize {
                    continue;
                }
                plane.scaled_add(weight, &cube.data.index_axis(Axis(0), src as usize));
            }
        });

    let mut header = cube.header.clone();
    header.set("CRVAL3", target_w0);
    header.set("CRPIX3", 1.0);
    Ok(Cube::new(data, header))
}

/// Layers of the axis `target_w0 + j * target_dw` that lie within the
/// wavelength range sampled by `cube`.
pub fn covered_layers(
    cube: &Cube,
    target_w0: f64,
    target_dw: f64,
    target_n: usize,
) -> Result<Option<(usize, usize)>> {
    let axis = cube.spectral_axis()?;
    let lo = ((axis.start() - target_w0) / target_dw - SNAP).ceil().max(0.0);
    let hi = ((axis.end() - target_w0) / target_dw + SNAP).floor();
    if target_n == 0 || hi < lo || lo >= target_n as f64 {
        return Ok(None);
    }
    Ok(Some((lo as usize, (hi as usize).min(target_n - 1))))
}
