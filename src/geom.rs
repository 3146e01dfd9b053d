use std::ops::{Add, AddAssign, Mul, Sub};

use serde::{Deserialize, Serialize};

/// Polygons smaller than this (in squared output pixels) have no usable area.
pub const DEGENERATE_AREA: f64 = 1e-12;

#[derive(Clone, Debug, Copy, Deserialize, PartialEq, Serialize)]
pub struct Vec2D {
    pub x: f64,
    pub y: f64,
}

impl Vec2D {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn cross(&self, rhs: &Vec2D) -> f64 {
        self.x * rhs.y - self.y * rhs.x
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl AddAssign for Vec2D {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl Add for Vec2D {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self {
            x: self.x + rhs.x,
            y: self.y + rhs.y,
        }
    }
}

impl Sub for Vec2D {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            x: self.x - rhs.x,
            y: self.y - rhs.y,
        }
    }
}

impl Mul<f64> for Vec2D {
    type Output = Self;
    fn mul(self, rhs: f64) -> Self::Output {
        Self {
            x: self.x * rhs,
            y: self.y * rhs,
        }
    }
}

/// Axis-aligned rectangle, `[x0, x1] x [y0, y1]`.
#[derive(Clone, Debug, Copy, PartialEq)]
pub struct Rect {
    pub x0: f64,
    pub x1: f64,
    pub y0: f64,
    pub y1: f64,
}

impl Rect {
    /// unit square of the pixel centred on `(x, y)`
    pub fn pixel(x: f64, y: f64) -> Self {
        Self {
            x0: x - 0.5,
            x1: x + 0.5,
            y0: y - 0.5,
            y1: y + 0.5,
        }
    }
}

/// Result of clipping a polygon against a rectangle.
#[derive(Clone, Debug, Copy, PartialEq)]
pub enum Clip {
    /// area of the intersection (possibly zero)
    Area(f64),
    /// the subject polygon has no area, so no overlap fraction exists
    Degenerate,
}

/// Simple polygon given by its vertices in order (either winding).
#[derive(Clone, Debug, PartialEq)]
pub struct Polygon {
    pub vertices: Vec<Vec2D>,
}

impl Polygon {
    pub fn new(vertices: Vec<Vec2D>) -> Self {
        Self { vertices }
    }

    /// unsigned shoelace area
    pub fn area(&self) -> f64 {
        shoelace(&self.vertices).abs()
    }

    /// integer index bounds `(x0, y0, x1, y1)` of the pixels whose unit squares
    /// (centred on integer coordinates) may touch this polygon
    pub fn pixel_bounds(&self) -> Option<(i64, i64, i64, i64)> {
        if self.vertices.is_empty() || !self.vertices.iter().all(Vec2D::is_finite) {
            return None;
        }
        let (mut xmin, mut ymin) = (f64::INFINITY, f64::INFINITY);
        let (mut xmax, mut ymax) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for v in &self.vertices {
            xmin = xmin.min(v.x);
            xmax = xmax.max(v.x);
            ymin = ymin.min(v.y);
            ymax = ymax.max(v.y);
        }
        Some((
            (xmin + 0.5).floor() as i64,
            (ymin + 0.5).floor() as i64,
            (xmax + 0.5).floor() as i64,
            (ymax + 0.5).floor() as i64,
        ))
    }

    /// area of the intersection with `rect`, by Sutherland–Hodgman clipping
    pub fn clip_area(&self, rect: &Rect) -> Clip {
        if self.area() < DEGENERATE_AREA {
            return Clip::Degenerate;
        }
        let mut out = self.vertices.clone();
        out = clip_edge(&out, |v| v.x >= rect.x0, |a, b| lerp_x(a, b, rect.x0));
        out = clip_edge(&out, |v| v.x <= rect.x1, |a, b| lerp_x(a, b, rect.x1));
        out = clip_edge(&out, |v| v.y >= rect.y0, |a, b| lerp_y(a, b, rect.y0));
        out = clip_edge(&out, |v| v.y <= rect.y1, |a, b| lerp_y(a, b, rect.y1));
        Clip::Area(shoelace(&out).abs())
    }
}

fn shoelace(vertices: &[Vec2D]) -> f64 {
    let n = vertices.len();
    if n < 3 {
        return 0.0;
    }
    (0..n)
        .map(|i| vertices[i].cross(&vertices[(i + 1) % n]))
        .sum::<f64>()
        / 2.0
}

fn clip_edge<F, G>(input: &[Vec2D], inside: F, intersect: G) -> Vec<Vec2D>
where
    F: Fn(&Vec2D) -> bool,
    G: Fn(&Vec2D, &Vec2D) -> Vec2D,
{
    let mut output = Vec::with_capacity(input.len() + 2);
    let Some(mut prev) = input.last() else {
        return output;
    };
    for curr in input {
        match (inside(curr), inside(prev)) {
            (true, true) => output.push(*curr),
            (true, false) => {
                output.push(intersect(prev, curr));
                output.push(*curr);
            }
            (false, true) => output.push(intersect(prev, curr)),
            (false, false) => (),
        }
        prev = curr;
    }
    output
}

fn lerp_x(a: &Vec2D, b: &Vec2D, x: f64) -> Vec2D {
    let t = (x - a.x) / (b.x - a.x);
    Vec2D::new(x, a.y + t * (b.y - a.y))
}

fn lerp_y(a: &Vec2D, b: &Vec2D, y: f64) -> Vec2D {
    let t = (y - a.y) / (b.y - a.y);
    Vec2D::new(a.x + t * (b.x - a.x), y)
}
