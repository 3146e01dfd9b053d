use std::path::Path;

use fitrs::{Fits, FitsData, Hdu, HeaderValue};
use ndarray::{s, Array3};

use crate::align::DataKind;
use crate::coords::SpectralAxis;
use crate::wcs::CelestialWcs;
use crate::{Header, IfuError, Keyword, Result};

/// Header keywords read from the primary HDU, beyond the `NAXISn` lengths.
///
/// `fitrs` only offers keyed lookup, so the carried-through header is limited
/// to this list.
const KNOWN_KEYWORDS: &[&str] = &[
    "CTYPE1", "CTYPE2", "CTYPE3", "CUNIT1", "CUNIT2", "CUNIT3", "CNAME1", "CNAME2",
    "CNAME3", "CRVAL1", "CRVAL2", "CRVAL3", "CRPIX1", "CRPIX2", "CRPIX3", "CD1_1",
    "CD1_2", "CD1_3", "CD2_1", "CD2_2", "CD2_3", "CD3_1", "CD3_2", "CD3_3", "PC1_1",
    "PC1_2", "PC2_1", "PC2_2", "PC3_3", "CDELT1", "CDELT2", "CDELT3", "WCSDIM",
    "RADESYS", "EQUINOX", "LONPOLE", "LATPOLE", "BUNIT", "EXPTIME", "TELAPSE",
    "ROTPA", "ROTPOSN", "WAVGOOD0", "WAVGOOD1", "WAVALL0", "WAVALL1", "WAVMID",
    "OBJECT", "TARGNAME", "INSTRUME", "TELESCOP", "IFUNAM", "BGRATNAM", "BNASNAM",
    "STATEID", "DATE-OBS", "MJD", "AIRMASS", "RA", "DEC", "NCOADD",
];

/// Keywords that `fitrs` manages itself when writing a primary HDU.
const STRUCTURAL_KEYWORDS: &[&str] = &["SIMPLE", "BITPIX", "EXTEND"];

fn keyword_from_fits(value: &HeaderValue) -> Option<Keyword> {
    match value {
        HeaderValue::IntegerNumber(a) => Some(Keyword::Int(*a as i64)),
        HeaderValue::RealFloatingNumber(a) => Some(Keyword::Float(*a)),
        HeaderValue::CharacterString(s) => Some(Keyword::Text(s.trim_end().to_string())),
        HeaderValue::Logical(b) => Some(Keyword::Bool(*b)),
        _ => None,
    }
}

/// Width of the value field `fitrs` writes a real number into.
const REAL_FIELD: usize = 20;

/// Mantissa/exponent rendering of a real number, exactly as `fitrs` writes it.
fn fits_real_repr(value: f64) -> String {
    let mut exp = 0;
    let mut f = value;
    if f.abs() >= 10.0 {
        while f.abs() >= 10.0 {
            f /= 10.0;
            exp += 1;
        }
    } else {
        while f.abs() < 1.0 {
            f *= 10.0;
            exp -= 1;
        }
    }
    if exp >= 0 {
        format!("{}E+{:02}", f, exp)
    } else {
        format!("{}E-{:02}", f, -exp)
    }
}

/// Round `value` to the most significant digits whose rendering still fits
/// the card's value field.
///
/// Zero is written as an integer since `fitrs` cannot render a zero real.
fn fits_real(key: &str, value: f64) -> Result<HeaderValue> {
    if !value.is_finite() {
        return Err(IfuError::InvalidFITS(format!(
            "{} has non-finite value {}",
            key, value
        )));
    }
    if value == 0.0 {
        return Ok(HeaderValue::IntegerNumber(0));
    }
    for digits in (1..=15).rev() {
        let rounded: f64 = format!("{:.*e}", digits - 1, value)
            .parse()
            .map_err(|_| IfuError::InvalidFITS(format!("cannot format {} for {}", value, key)))?;
        // fitrs rescales by repeated multiplication, so a neighbouring double
        // may render shorter than the rounded value itself
        let bits = rounded.to_bits();
        for step in 0..=8u64 {
            let candidates = [
                f64::from_bits(bits.saturating_sub(step)),
                f64::from_bits(bits + step),
            ];
            for candidate in candidates {
                if candidate != 0.0
                    && candidate.is_finite()
                    && fits_real_repr(candidate).len() <= REAL_FIELD
                {
                    return Ok(HeaderValue::RealFloatingNumber(candidate));
                }
            }
        }
    }
    Err(IfuError::InvalidFITS(format!(
        "{} value {} does not fit a header card",
        key, value
    )))
}

fn keyword_to_fits(key: &str, value: &Keyword) -> Result<HeaderValue> {
    Ok(match value {
        Keyword::Int(a) => match i32::try_from(*a) {
            Ok(a) => HeaderValue::IntegerNumber(a),
            Err(_) => fits_real(key, *a as f64)?,
        },
        Keyword::Float(a) => fits_real(key, *a)?,
        Keyword::Text(s) => HeaderValue::CharacterString(s.clone()),
        Keyword::Bool(b) => HeaderValue::Logical(*b),
    })
}

/// An IFU datacube: data indexed `(wavelength, y, x)` and its header.
#[derive(Clone, Debug, PartialEq)]
pub struct Cube {
    pub data: Array3<f64>,
    pub header: Header,
}

impl Cube {
    /// Build a cube, writing the data shape into the header's `NAXISn` keys.
    pub fn new(data: Array3<f64>, mut header: Header) -> Self {
        let (nw, ny, nx) = data.dim();
        header.set("NAXIS", 3i64);
        header.set("NAXIS1", nx);
        header.set("NAXIS2", ny);
        header.set("NAXIS3", nw);
        Self { data, header }
    }

    /// load cube from the primary HDU of a fits file
    pub fn from_fits<P: AsRef<Path>>(filename: P) -> Result<Cube> {
        let filename = filename.as_ref();
        let fits = Fits::open(filename)?;
        let hdu = fits.get(0).ok_or(IfuError::InvalidFITS(format!(
            "no primary hdu in {}",
            filename.display()
        )))?;
        match hdu.value("NAXIS") {
            Some(HeaderValue::IntegerNumber(3)) => (),
            Some(HeaderValue::IntegerNumber(n)) => {
                return Err(IfuError::Dimensionality(format!(
                    "expected NAXIS==3 in {}, got {}",
                    filename.display(),
                    n
                )))
            }
            _ => {
                return Err(IfuError::InvalidFITS(format!(
                    "invalid NAXIS in {}",
                    filename.display()
                )))
            }
        };
        let mut header = Header::new();
        header.set("NAXIS", 3i64);
        let mut shape = [0usize; 3];
        for (i, n) in shape.iter_mut().enumerate() {
            let key = format!("NAXIS{}", i + 1);
            match hdu.value(&key) {
                Some(HeaderValue::IntegerNumber(x)) if *x > 0 => *n = *x as usize,
                _ => {
                    return Err(IfuError::InvalidFITS(format!(
                        "invalid {} in {}",
                        key,
                        filename.display()
                    )))
                }
            }
            header.set(&key, *n);
        }
        for key in KNOWN_KEYWORDS {
            if let Some(value) = hdu.value(key).and_then(keyword_from_fits) {
                header.set(key, value);
            }
        }
        let data: Vec<f64> = match hdu.read_data() {
            FitsData::IntegersI32(array) => array
                .data
                .iter()
                .map(|x| x.map_or(f64::NAN, |x| x as f64))
                .collect(),
            FitsData::IntegersU32(array) => array
                .data
                .iter()
                .map(|x| x.map_or(f64::NAN, |x| x as f64))
                .collect(),
            FitsData::FloatingPoint32(array) => array.data.iter().map(|x| *x as f64).collect(),
            FitsData::FloatingPoint64(array) => array.data.iter().copied().collect(),
            FitsData::Characters(array) => array.data.iter().map(|x| *x as u8 as f64).collect(),
        };
        // FITS order is x fastest, which is row-major for (w, y, x)
        let [nx, ny, nw] = shape;
        let data = Array3::from_shape_vec((nw, ny, nx), data).map_err(|e| {
            IfuError::InvalidFITS(format!("bad data shape in {}: {}", filename.display(), e))
        })?;
        Ok(Cube { data, header })
    }

    /// save cube to a new fits file
    pub fn to_fits<P: AsRef<Path>>(&self, filename: P) -> Result<()> {
        let (nw, ny, nx) = self.data.dim();
        let data: Vec<f64> = self.data.iter().copied().collect();
        let mut hdu = Hdu::new(&[nx, ny, nw], data);
        for (key, value) in self.header.iter() {
            if key.starts_with("NAXIS") || STRUCTURAL_KEYWORDS.contains(&key) {
                continue;
            }
            hdu.insert(key, keyword_to_fits(key, value)?);
        }
        Fits::create(filename.as_ref(), hdu)?;
        Ok(())
    }

    /// `(nw, ny, nx)`
    pub fn shape(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Exposure time in seconds, `TELAPSE` if present else `EXPTIME`.
    pub fn exposure_time(&self) -> Result<f64> {
        match self.header.float_opt("TELAPSE") {
            Some(t) => Ok(t),
            None => self.header.float("EXPTIME"),
        }
    }

    pub fn spectral_axis(&self) -> Result<SpectralAxis> {
        SpectralAxis::from_header(&self.header)
    }

    pub fn celestial_wcs(&self) -> Result<CelestialWcs> {
        CelestialWcs::from_header(&self.header)
    }

    /// true if the flux unit is raw counts
    pub fn in_counts(&self) -> bool {
        self.header
            .text("BUNIT")
            .map(|u| u.to_ascii_lowercase().starts_with("electron") && !u.contains('/'))
            .unwrap_or(false)
    }

    /// Crop to pixel ranges `xcrop`, `ycrop` (0-based, inclusive) and the
    /// wavelength range `wcrop` (Angstrom), shifting the reference pixels.
    ///
    /// A `None` range keeps the whole axis; ranges are clamped to the cube.
    pub fn crop(
        &self,
        xcrop: Option<(usize, usize)>,
        ycrop: Option<(usize, usize)>,
        wcrop: Option<(f64, f64)>,
    ) -> Result<Cube> {
        let (nw, ny, nx) = self.shape();
        if nw == 0 || ny == 0 || nx == 0 {
            return Err(IfuError::Geometry(format!(
                "cannot crop a cube of shape {:?}",
                self.shape()
            )));
        }
        let clamp = |range: Option<(usize, usize)>, n: usize| -> Result<(usize, usize)> {
            let (a, b) = range.unwrap_or((0, n - 1));
            let (a, b) = (a.min(n - 1), b.min(n - 1));
            if a > b {
                return Err(IfuError::Geometry(format!("empty crop range {}..={}", a, b)));
            }
            Ok((a, b))
        };
        let (x0, x1) = clamp(xcrop, nx)?;
        let (y0, y1) = clamp(ycrop, ny)?;
        let (w0, w1) = match wcrop {
            Some((wa, wb)) => {
                let axis = self.spectral_axis()?;
                let ia = axis.index(wa).floor().max(0.0) as usize;
                let ib = axis.index(wb).floor().max(0.0) as usize;
                clamp(Some((ia, ib)), nw)?
            }
            None => (0, nw - 1),
        };
        Ok(self.subcube((w0, w1), (y0, y1), (x0, x1)))
    }

    /// Sum `xybin` × `xybin` blocks of spaxels and average every `zbin`
    /// layers, scaling the WCS to the binned pixels.
    ///
    /// Variance cubes take the variance of the layer average. Pixels left
    /// over at the high end of an axis are dropped.
    pub fn rebin(&self, xybin: usize, zbin: usize, kind: DataKind) -> Result<Cube> {
        let (nw, ny, nx) = self.shape();
        let shape = (nw / zbin.max(1), ny / xybin.max(1), nx / xybin.max(1));
        if xybin == 0 || zbin == 0 || shape.0 == 0 || shape.1 == 0 || shape.2 == 0 {
            return Err(IfuError::Geometry(format!(
                "cannot bin a cube of shape {:?} by {} spatially and {} spectrally",
                self.shape(),
                xybin,
                zbin
            )));
        }
        let norm = match kind {
            DataKind::Intensity => zbin as f64,
            DataKind::Variance => (zbin * zbin) as f64,
        };
        let data = Array3::from_shape_fn(shape, |(w, y, x)| {
            self.data
                .slice(s![
                    w * zbin..(w + 1) * zbin,
                    y * xybin..(y + 1) * xybin,
                    x * xybin..(x + 1) * xybin
                ])
                .sum()
                / norm
        });

        let mut header = self.header.clone();
        for (axis, bin) in [(1, xybin), (2, xybin), (3, zbin)] {
            let bin = bin as f64;
            // pixel edges stay fixed: old edge 0.5 is new edge 0.5
            let key = format!("CRPIX{}", axis);
            if let Some(crpix) = header.float_opt(&key) {
                header.set(&key, (crpix - 0.5) / bin + 0.5);
            }
            let mut keys = vec![format!("CDELT{}", axis)];
            keys.extend((1..=3).map(|i| format!("CD{}_{}", i, axis)));
            for key in keys {
                if let Some(v) = header.float_opt(&key) {
                    header.set(&key, v * bin);
                }
            }
        }
        Ok(Cube::new(data, header))
    }

    /// Inclusive index window of the cube with the reference pixels shifted
    /// to match.
    pub(crate) fn subcube(
        &self,
        (w0, w1): (usize, usize),
        (y0, y1): (usize, usize),
        (x0, x1): (usize, usize),
    ) -> Cube {
        let data = self.data.slice(s![w0..=w1, y0..=y1, x0..=x1]).to_owned();
        let mut header = self.header.clone();
        for (key, offset) in [("CRPIX1", x0), ("CRPIX2", y0), ("CRPIX3", w0)] {
            if let Some(crpix) = header.float_opt(key) {
                header.set(key, crpix - offset as f64);
            }
        }
        Cube::new(data, header)
    }
}
