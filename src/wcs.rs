//! Celestial world coordinate systems.
//!
//! Only the gnomonic (TAN) projection is modelled: pixel offsets from
//! `CRPIX` are mapped through a 2×2 linear part to intermediate world
//! coordinates in degrees, then deprojected about `CRVAL`.
use ndarray::arr2;
use ndarray_inverse::Inverse;

use crate::{Header, IfuError, Result, Vec2D};

const CD_KEYS: [[&str; 2]; 2] = [["CD1_1", "CD1_2"], ["CD2_1", "CD2_2"]];
const PC_KEYS: [[&str; 2]; 2] = [["PC1_1", "PC1_2"], ["PC2_1", "PC2_2"]];

/// Linear part of a celestial WCS, in whichever form the header used.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LinearTransform {
    /// full `CDi_j` matrix, degrees per pixel
    Cd([[f64; 2]; 2]),
    /// `PCi_j` rotation/skew with `CDELTi` scales
    Pc { pc: [[f64; 2]; 2], cdelt: [f64; 2] },
}

impl LinearTransform {
    /// Detect the representation present in a header.
    ///
    /// Fails with [`IfuError::UnsupportedWcs`] if neither a CD matrix nor
    /// CDELT scales are present.
    pub fn from_header(header: &Header) -> Result<Self> {
        if CD_KEYS.iter().flatten().any(|k| header.contains(k)) {
            let mut cd = [[0.0; 2]; 2];
            for (i, row) in CD_KEYS.iter().enumerate() {
                for (j, key) in row.iter().enumerate() {
                    cd[i][j] = header.float_or(key, 0.0);
                }
            }
            return Ok(LinearTransform::Cd(cd));
        }
        match (header.float_opt("CDELT1"), header.float_opt("CDELT2")) {
            (Some(c1), Some(c2)) => {
                let mut pc = [[1.0, 0.0], [0.0, 1.0]];
                for (i, row) in PC_KEYS.iter().enumerate() {
                    for (j, key) in row.iter().enumerate() {
                        if let Some(v) = header.float_opt(key) {
                            pc[i][j] = v;
                        }
                    }
                }
                Ok(LinearTransform::Pc { pc, cdelt: [c1, c2] })
            }
            _ => Err(IfuError::UnsupportedWcs(
                "need a CD matrix or PC matrix with CDELT".to_string(),
            )),
        }
    }

    /// effective CD matrix
    pub fn matrix(&self) -> [[f64; 2]; 2] {
        match self {
            LinearTransform::Cd(cd) => *cd,
            LinearTransform::Pc { pc, cdelt } => [
                [cdelt[0] * pc[0][0], cdelt[0] * pc[0][1]],
                [cdelt[1] * pc[1][0], cdelt[1] * pc[1][1]],
            ],
        }
    }

    fn rotate(&mut self, theta_deg: f64) {
        let (s, c) = theta_deg.to_radians().sin_cos();
        let rot = [[c, -s], [s, c]];
        match self {
            LinearTransform::Cd(m) | LinearTransform::Pc { pc: m, .. } => *m = matmul(&rot, m),
        }
    }

    fn scale_column(&mut self, col: usize, factor: f64) {
        match self {
            LinearTransform::Cd(m) | LinearTransform::Pc { pc: m, .. } => {
                m[0][col] *= factor;
                m[1][col] *= factor;
            }
        }
    }
}

fn matmul(a: &[[f64; 2]; 2], b: &[[f64; 2]; 2]) -> [[f64; 2]; 2] {
    [
        [
            a[0][0] * b[0][0] + a[0][1] * b[1][0],
            a[0][0] * b[0][1] + a[0][1] * b[1][1],
        ],
        [
            a[1][0] * b[0][0] + a[1][1] * b[1][0],
            a[1][0] * b[0][1] + a[1][1] * b[1][1],
        ],
    ]
}

/// Mapping between 0-based pixel coordinates and sky coordinates (degrees).
pub trait SkyProjection {
    fn pixel_to_sky(&self, pixel: Vec2D) -> Vec2D;

    /// `None` when the position cannot be projected (e.g. behind the tangent plane)
    fn sky_to_pixel(&self, sky: Vec2D) -> Option<Vec2D>;

    /// map a pixel of this frame through the sky into the pixel grid of `target`
    fn reproject<P: SkyProjection>(&self, pixel: Vec2D, target: &P) -> Option<Vec2D> {
        target.sky_to_pixel(self.pixel_to_sky(pixel))
    }

    /// sky positions of the four corner pixel centres of an `nx` × `ny` image
    fn footprint(&self, nx: usize, ny: usize) -> [Vec2D; 4] {
        let (x1, y1) = (nx as f64 - 1.0, ny as f64 - 1.0);
        [
            self.pixel_to_sky(Vec2D::new(0.0, 0.0)),
            self.pixel_to_sky(Vec2D::new(0.0, y1)),
            self.pixel_to_sky(Vec2D::new(x1, y1)),
            self.pixel_to_sky(Vec2D::new(x1, 0.0)),
        ]
    }

    /// sky positions of the outer edge corners of an `nx` × `ny` image
    fn outer_footprint(&self, nx: usize, ny: usize) -> [Vec2D; 4] {
        let (x1, y1) = (nx as f64 - 0.5, ny as f64 - 0.5);
        [
            self.pixel_to_sky(Vec2D::new(-0.5, -0.5)),
            self.pixel_to_sky(Vec2D::new(-0.5, y1)),
            self.pixel_to_sky(Vec2D::new(x1, y1)),
            self.pixel_to_sky(Vec2D::new(x1, -0.5)),
        ]
    }
}

/// Two-dimensional TAN world coordinate system.
#[derive(Clone, Debug, PartialEq)]
pub struct CelestialWcs {
    /// reference sky position (RA, Dec) in degrees
    pub crval: [f64; 2],
    /// reference pixel, 1-based as in FITS
    pub crpix: [f64; 2],
    linear: LinearTransform,
    inverse: [[f64; 2]; 2],
}

impl CelestialWcs {
    pub fn new(crval: [f64; 2], crpix: [f64; 2], linear: LinearTransform) -> Result<Self> {
        let inverse = invert(&linear.matrix())?;
        Ok(Self {
            crval,
            crpix,
            linear,
            inverse,
        })
    }

    /// Read the spatial axes of a 2D or 3D header.
    pub fn from_header(header: &Header) -> Result<Self> {
        let naxis = header.naxis()?;
        if naxis != 2 && naxis != 3 {
            return Err(IfuError::Dimensionality(format!(
                "celestial wcs needs a 2D or 3D header, got NAXIS={}",
                naxis
            )));
        }
        let linear = LinearTransform::from_header(header)?;
        Self::new(
            [header.float("CRVAL1")?, header.float("CRVAL2")?],
            [header.float("CRPIX1")?, header.float("CRPIX2")?],
            linear,
        )
    }

    /// Write reference and linear keywords, replacing the other representation.
    pub fn to_header(&self, header: &mut Header) {
        header.set("CRVAL1", self.crval[0]);
        header.set("CRVAL2", self.crval[1]);
        header.set("CRPIX1", self.crpix[0]);
        header.set("CRPIX2", self.crpix[1]);
        match &self.linear {
            LinearTransform::Cd(cd) => {
                for (i, row) in CD_KEYS.iter().enumerate() {
                    for (j, key) in row.iter().enumerate() {
                        header.set(key, cd[i][j]);
                        header.remove(PC_KEYS[i][j]);
                    }
                }
                header.remove("CDELT1");
                header.remove("CDELT2");
            }
            LinearTransform::Pc { pc, cdelt } => {
                for (i, row) in PC_KEYS.iter().enumerate() {
                    for (j, key) in row.iter().enumerate() {
                        header.set(key, pc[i][j]);
                        header.remove(CD_KEYS[i][j]);
                    }
                }
                header.set("CDELT1", cdelt[0]);
                header.set("CDELT2", cdelt[1]);
            }
        }
    }

    pub fn linear(&self) -> &LinearTransform {
        &self.linear
    }

    /// effective CD matrix in degrees per pixel
    pub fn cd(&self) -> [[f64; 2]; 2] {
        self.linear.matrix()
    }

    /// Rotate the linear part by `theta_deg`, left-multiplying by the
    /// standard rotation matrix.
    pub fn rotate(&mut self, theta_deg: f64) -> Result<()> {
        self.linear.rotate(theta_deg);
        self.inverse = invert(&self.linear.matrix())?;
        Ok(())
    }

    pub fn rotated(&self, theta_deg: f64) -> Result<Self> {
        let mut wcs = self.clone();
        wcs.rotate(theta_deg)?;
        Ok(wcs)
    }

    /// plate scale along each pixel axis (CD column norms), degrees per pixel
    pub fn axis_scales(&self) -> (f64, f64) {
        let m = self.cd();
        (m[0][0].hypot(m[1][0]), m[0][1].hypot(m[1][1]))
    }

    /// Shrink the coarser axis so both pixel axes have the finer plate scale.
    pub fn equalize_aspect(&mut self) -> Result<()> {
        let (dx, dy) = self.axis_scales();
        if dx > dy {
            self.linear.scale_column(0, dy / dx);
        } else if dy > dx {
            self.linear.scale_column(1, dx / dy);
        }
        self.inverse = invert(&self.linear.matrix())?;
        Ok(())
    }

    /// singular values of the CD matrix, largest first, degrees per pixel
    pub fn singular_scales(&self) -> (f64, f64) {
        let [[a, b], [c, d]] = self.cd();
        let s1 = a * a + b * b + c * c + d * d;
        let s2 = ((a * a + b * b - c * c - d * d).powi(2) + 4.0 * (a * c + b * d).powi(2)).sqrt();
        (
            ((s1 + s2) / 2.0).max(0.0).sqrt(),
            ((s1 - s2) / 2.0).max(0.0).sqrt(),
        )
    }

    /// on-sky pixel area in square degrees
    pub fn pixel_area(&self) -> f64 {
        let [[a, b], [c, d]] = self.cd();
        (a * d - b * c).abs()
    }
}

fn invert(m: &[[f64; 2]; 2]) -> Result<[[f64; 2]; 2]> {
    let inv = arr2(m).inv().ok_or(IfuError::Geometry(
        "celestial linear transform is singular".to_string(),
    ))?;
    Ok([[inv[[0, 0]], inv[[0, 1]]], [inv[[1, 0]], inv[[1, 1]]]])
}

impl SkyProjection for CelestialWcs {
    fn pixel_to_sky(&self, pixel: Vec2D) -> Vec2D {
        let u = pixel.x + 1.0 - self.crpix[0];
        let v = pixel.y + 1.0 - self.crpix[1];
        let m = self.cd();
        let xi = (m[0][0] * u + m[0][1] * v).to_radians();
        let eta = (m[1][0] * u + m[1][1] * v).to_radians();

        let ra0 = self.crval[0].to_radians();
        let (sin_d0, cos_d0) = self.crval[1].to_radians().sin_cos();
        let denom = cos_d0 - eta * sin_d0;
        let ra = ra0 + xi.atan2(denom);
        let dec = (sin_d0 + eta * cos_d0).atan2(xi.hypot(denom));
        Vec2D::new(ra.to_degrees().rem_euclid(360.0), dec.to_degrees())
    }

    fn sky_to_pixel(&self, sky: Vec2D) -> Option<Vec2D> {
        let dra = (sky.x - self.crval[0]).to_radians();
        let (sin_d, cos_d) = sky.y.to_radians().sin_cos();
        let (sin_d0, cos_d0) = self.crval[1].to_radians().sin_cos();
        let (sin_dra, cos_dra) = dra.sin_cos();

        let cos_c = sin_d0 * sin_d + cos_d0 * cos_d * cos_dra;
        if cos_c <= 0.0 {
            return None;
        }
        let xi = (cos_d * sin_dra / cos_c).to_degrees();
        let eta = ((cos_d0 * sin_d - sin_d0 * cos_d * cos_dra) / cos_c).to_degrees();

        let inv = &self.inverse;
        let u = inv[0][0] * xi + inv[0][1] * eta;
        let v = inv[1][0] * xi + inv[1][1] * eta;
        Some(Vec2D::new(u + self.crpix[0] - 1.0, v + self.crpix[1] - 1.0))
    }
}

/// Position angle of a cube's spatial axes.
///
/// Reads `ROTPA`, then `ROTPOSN`. When neither is present the `target` angle is
/// returned with a warning, so the input is treated as already aligned.
pub fn orientation(header: &Header, target: f64) -> f64 {
    for key in ["ROTPA", "ROTPOSN"] {
        if let Some(pa) = header.float_opt(key) {
            return pa;
        }
    }
    log::warn!(
        "no ROTPA or ROTPOSN keyword found; assuming position angle {} (output orientation not guaranteed)",
        target
    );
    target
}
