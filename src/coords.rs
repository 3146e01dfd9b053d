//! Pixel ↔ wavelength and pixel ↔ sky relations derived from cube headers.
use ndarray::{Array1, Array2};

use crate::wcs::CelestialWcs;
use crate::{Header, IfuError, Result};

/// Regularly sampled wavelength axis of a cube or spectrum.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpectralAxis {
    pub crval: f64,
    /// reference pixel, 1-based
    pub crpix: f64,
    /// wavelength increment per pixel
    pub cdelt: f64,
    pub len: usize,
}

impl SpectralAxis {
    /// Read the wavelength axis of a 3D cube header (axis 3) or 1D spectrum
    /// header (axis 1).
    pub fn from_header(header: &Header) -> Result<Self> {
        let axis = match header.naxis()? {
            3 => 3,
            1 => 1,
            n => {
                return Err(IfuError::Dimensionality(format!(
                    "header must be 1D or 3D to get a wavelength axis, got NAXIS={}",
                    n
                )))
            }
        };
        let cd_key = format!("CD{0}_{0}", axis);
        let cdelt = match header.float_opt(&cd_key) {
            Some(cd) => cd,
            None => match header.float_opt(&format!("CDELT{}", axis)) {
                Some(cdelt) => cdelt * header.float_or(&format!("PC{0}_{0}", axis), 1.0),
                None => return Err(IfuError::MissingKeyword(cd_key)),
            },
        };
        Ok(Self {
            crval: header.float(&format!("CRVAL{}", axis))?,
            crpix: header.float(&format!("CRPIX{}", axis))?,
            cdelt,
            len: header.axis_len(axis)?,
        })
    }

    /// wavelength at (fractional) 0-based index `i`
    pub fn wavelength(&self, i: f64) -> f64 {
        self.crval + (i + 1.0 - self.crpix) * self.cdelt
    }

    /// fractional 0-based index of wavelength `w`
    pub fn index(&self, w: f64) -> f64 {
        (w - self.crval) / self.cdelt + self.crpix - 1.0
    }

    /// wavelength of the first layer
    pub fn start(&self) -> f64 {
        self.wavelength(0.0)
    }

    /// wavelength of the last layer
    pub fn end(&self) -> f64 {
        self.wavelength(self.len as f64 - 1.0)
    }

    pub fn wavelengths(&self) -> Array1<f64> {
        Array1::from_iter((0..self.len).map(|i| self.wavelength(i as f64)))
    }
}

/// Layer indices bounding the wavelength range `[w0, w1]`.
///
/// Indices are 0-based and are not clamped to the extent of the cube.
pub fn wavelength_to_index(w0: f64, w1: f64, header: &Header) -> Result<(i64, i64)> {
    let axis = SpectralAxis::from_header(header)?;
    Ok((axis.index(w0).floor() as i64, axis.index(w1).floor() as i64))
}

pub fn wavelength_axis(header: &Header) -> Result<Array1<f64>> {
    Ok(SpectralAxis::from_header(header)?.wavelengths())
}

fn spatial_wcs(header: &Header) -> Result<CelestialWcs> {
    match header.naxis()? {
        2 | 3 => CelestialWcs::from_header(header),
        n => Err(IfuError::Dimensionality(format!(
            "function only takes 2D or 3D input, got NAXIS={}",
            n
        ))),
    }
}

/// Spatial plate scales in arcsec/pixel (singular values of the CD matrix).
pub fn plate_scales_arcsec(header: &Header) -> Result<(f64, f64)> {
    let (a, b) = spatial_wcs(header)?.singular_scales();
    Ok((a * 3600.0, b * 3600.0))
}

/// On-sky area of one spaxel in square arcsec.
pub fn pixel_area_arcsec(header: &Header) -> Result<f64> {
    let (a, b) = plate_scales_arcsec(header)?;
    Ok(a * b)
}

/// Wavelength increment per layer of a 3D cube.
pub fn pixel_size_angstrom(header: &Header) -> Result<f64> {
    if header.naxis()? != 3 {
        return Err(IfuError::Dimensionality(
            "function only takes 3D input".to_string(),
        ));
    }
    Ok(SpectralAxis::from_header(header)?.cdelt)
}

/// Factor converting flux per spaxel per layer to surface brightness
/// (per Angstrom per square arcsec).
pub fn flam_to_sb(header: &Header) -> Result<f64> {
    Ok(pixel_size_angstrom(header)? / pixel_area_arcsec(header)?)
}

/// Drop the spectral axis of a 3D header.
pub fn header_2d(header3d: &Header) -> Result<Header> {
    if header3d.naxis()? != 3 {
        return Err(IfuError::Dimensionality("expected a 3D header".to_string()));
    }
    let mut hdr = header3d.clone();
    for key in header3d.keys() {
        if key.contains('3') {
            hdr.remove(&key);
        }
    }
    hdr.set("NAXIS", 2i64);
    hdr.set("WCSDIM", 2i64);
    Ok(hdr)
}

/// Drop the spatial axes of a 3D header, renumbering axis 3 as axis 1.
pub fn header_1d(header3d: &Header) -> Result<Header> {
    if header3d.naxis()? != 3 {
        return Err(IfuError::Dimensionality("expected a 3D header".to_string()));
    }
    let mut hdr = Header::new();
    for (key, value) in header3d.iter() {
        if key.contains('1') || key.contains('2') {
            continue;
        }
        hdr.set(&key.replace('3', "1"), value.clone());
    }
    hdr.set("NAXIS", 1i64);
    hdr.set("WCSDIM", 1i64);
    Ok(hdr)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistanceUnit {
    Pixel,
    Arcsec,
}

/// Distance of every spaxel of a 2D/3D header's spatial grid from `(x, y)`,
/// indexed `(y, x)`.
pub fn distance_map(header: &Header, x: f64, y: f64, unit: DistanceUnit) -> Result<Array2<f64>> {
    let wcs = spatial_wcs(header)?;
    let (nx, ny) = (header.axis_len(1)?, header.axis_len(2)?);
    let (sx, sy) = match unit {
        DistanceUnit::Pixel => (1.0, 1.0),
        DistanceUnit::Arcsec => {
            let (dx, dy) = wcs.axis_scales();
            (dx * 3600.0, dy * 3600.0)
        }
    };
    Ok(Array2::from_shape_fn((ny, nx), |(j, i)| {
        ((i as f64 - x) * sx).hypot((j as f64 - y) * sy)
    }))
}
