use serde::{Deserialize, Serialize};
use std::ops;

use crate::config::BedEdge;
use crate::{Factor, Mm};

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Point2 {
    pub x: Mm,
    pub y: Mm,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Vec2 {
    pub x: Mm,
    pub y: Mm,
}

impl Point2 {
    pub const fn new(x: Mm, y: Mm) -> Point2 {
        Point2 { x, y }
    }

    pub fn distance(&self, other: Point2) -> Mm {
        (*self - other).norm()
    }

    /// Point a fraction `t` of the way from `self` to `other`.
    pub fn lerp(&self, other: Point2, t: Factor) -> Point2 {
        *self + (other - *self) * t
    }
}

impl Vec2 {
    pub fn norm(&self) -> Mm {
        (self.x * self.x + self.y * self.y).sqrt()
    }
}

impl ops::Add<Vec2> for Point2 {
    type Output = Point2;

    fn add(self, rhs: Vec2) -> Point2 {
        Point2 { x: self.x + rhs.x, y: self.y + rhs.y }
    }
}

impl ops::Sub<Point2> for Point2 {
    type Output = Vec2;

    fn sub(self, rhs: Point2) -> Vec2 {
        Vec2 { x: self.x - rhs.x, y: self.y - rhs.y }
    }
}

impl ops::Mul<Factor> for Vec2 {
    type Output = Vec2;

    fn mul(self, rhs: Factor) -> Vec2 {
        Vec2 { x: self.x * rhs, y: self.y * rhs }
    }
}

/// Axis-aligned rectangle. Also used as the tower footprint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: Point2,
    pub max: Point2,
}

impl BoundingBox {
    pub fn new(min_x: Mm, min_y: Mm, max_x: Mm, max_y: Mm) -> BoundingBox {
        BoundingBox {
            min: Point2::new(min_x, min_y),
            max: Point2::new(max_x, max_y),
        }
    }

    pub fn from_origin(origin: Point2, width: Mm, depth: Mm) -> BoundingBox {
        BoundingBox::new(origin.x, origin.y, origin.x + width, origin.y + depth)
    }

    pub fn width(&self) -> Mm {
        self.max.x - self.min.x
    }

    pub fn depth(&self) -> Mm {
        self.max.y - self.min.y
    }

    pub fn area(&self) -> Mm {
        self.width().max(0.0) * self.depth().max(0.0)
    }

    pub fn center(&self) -> Point2 {
        Point2::new((self.min.x + self.max.x) / 2.0, (self.min.y + self.max.y) / 2.0)
    }

    pub fn corners(&self) -> [Point2; 4] {
        [
            self.min,
            Point2::new(self.max.x, self.min.y),
            self.max,
            Point2::new(self.min.x, self.max.y),
        ]
    }

    pub fn include(&mut self, p: Point2) {
        self.min.x = self.min.x.min(p.x);
        self.min.y = self.min.y.min(p.y);
        self.max.x = self.max.x.max(p.x);
        self.max.y = self.max.y.max(p.y);
    }

    /// Grow (or with a negative offset, shrink) every side.
    pub fn offset(&self, by: Mm) -> BoundingBox {
        BoundingBox::new(self.min.x - by, self.min.y - by, self.max.x + by, self.max.y + by)
    }

    pub fn translate(&self, d: Vec2) -> BoundingBox {
        BoundingBox {
            min: self.min + d,
            max: self.max + d,
        }
    }

    pub fn contains(&self, p: Point2) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min.x < other.max.x
            && other.min.x < self.max.x
            && self.min.y < other.max.y
            && other.min.y < self.max.y
    }
}

/// Printable area of the bed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "shape")]
pub enum BedShape {
    Rectangular { min_x: Mm, min_y: Mm, max_x: Mm, max_y: Mm },
    Circular { center_x: Mm, center_y: Mm, diameter: Mm },
}

impl BedShape {
    pub fn center(&self) -> Point2 {
        match *self {
            BedShape::Rectangular { min_x, min_y, max_x, max_y } => {
                Point2::new((min_x + max_x) / 2.0, (min_y + max_y) / 2.0)
            }
            BedShape::Circular { center_x, center_y, .. } => Point2::new(center_x, center_y),
        }
    }

    pub fn bounds(&self) -> BoundingBox {
        match *self {
            BedShape::Rectangular { min_x, min_y, max_x, max_y } => {
                BoundingBox::new(min_x, min_y, max_x, max_y)
            }
            BedShape::Circular { center_x, center_y, diameter } => {
                let r = diameter / 2.0;
                BoundingBox::new(center_x - r, center_y - r, center_x + r, center_y + r)
            }
        }
    }

    /// Whether the rectangle lies on the bed at least `clearance` from its edge.
    pub fn holds(&self, rect: &BoundingBox, clearance: Mm) -> bool {
        match *self {
            BedShape::Rectangular { .. } => {
                let usable = self.bounds().offset(-clearance);
                usable.contains(rect.min) && usable.contains(rect.max)
            }
            BedShape::Circular { diameter, .. } => {
                let r = diameter / 2.0 - clearance;
                let c = self.center();
                r > 0.0 && rect.corners().iter().all(|p| p.distance(c) <= r)
            }
        }
    }

    /// Slide `rect` along one axis toward the bed center until it fits, if a
    /// position along that axis exists. `along_x` selects the axis.
    pub fn nudge(&self, rect: &BoundingBox, clearance: Mm, along_x: bool) -> Option<BoundingBox> {
        if self.holds(rect, clearance) {
            return Some(*rect);
        }
        let c = self.center();
        let rc = rect.center();
        let full = if along_x {
            Vec2 { x: c.x - rc.x, y: 0.0 }
        } else {
            Vec2 { x: 0.0, y: c.y - rc.y }
        };
        match *self {
            BedShape::Rectangular { .. } => {
                let usable = self.bounds().offset(-clearance);
                let shift = if along_x {
                    let dx = if rect.min.x < usable.min.x {
                        usable.min.x - rect.min.x
                    } else if rect.max.x > usable.max.x {
                        usable.max.x - rect.max.x
                    } else {
                        0.0
                    };
                    Vec2 { x: dx, y: 0.0 }
                } else {
                    let dy = if rect.min.y < usable.min.y {
                        usable.min.y - rect.min.y
                    } else if rect.max.y > usable.max.y {
                        usable.max.y - rect.max.y
                    } else {
                        0.0
                    };
                    Vec2 { x: 0.0, y: dy }
                };
                let moved = rect.translate(shift);
                self.holds(&moved, clearance).then_some(moved)
            }
            BedShape::Circular { .. } => {
                // The centered position is the best this axis can do.
                let centered = rect.translate(full);
                if !self.holds(&centered, clearance) {
                    return None;
                }
                let (mut lo, mut hi) = (0.0 as Factor, 1.0 as Factor);
                for _ in 0..24 {
                    let mid = (lo + hi) / 2.0;
                    if self.holds(&rect.translate(full * mid), clearance) {
                        hi = mid;
                    } else {
                        lo = mid;
                    }
                }
                Some(rect.translate(full * hi))
            }
        }
    }

    /// Endpoints of a purge line running along `edge`, `offset` inside it and
    /// kept `clearance` away from the neighbouring edges.
    pub fn edge_segment(&self, edge: BedEdge, offset: Mm, clearance: Mm) -> (Point2, Point2) {
        match *self {
            BedShape::Rectangular { min_x, min_y, max_x, max_y } => {
                let (x0, x1) = (min_x + clearance, max_x - clearance);
                let (y0, y1) = (min_y + clearance, max_y - clearance);
                match edge {
                    BedEdge::West => (Point2::new(min_x + offset, y0), Point2::new(min_x + offset, y1)),
                    BedEdge::East => (Point2::new(max_x - offset, y0), Point2::new(max_x - offset, y1)),
                    BedEdge::South => (Point2::new(x0, min_y + offset), Point2::new(x1, min_y + offset)),
                    BedEdge::North => (Point2::new(x0, max_y - offset), Point2::new(x1, max_y - offset)),
                }
            }
            BedShape::Circular { center_x, center_y, diameter } => {
                // A chord parallel to the edge tangent.
                let r = diameter / 2.0;
                let inset = r - offset;
                let half = (r * r - inset * inset).max(0.0).sqrt() - clearance;
                let half = half.max(0.0);
                match edge {
                    BedEdge::West => (
                        Point2::new(center_x - inset, center_y - half),
                        Point2::new(center_x - inset, center_y + half),
                    ),
                    BedEdge::East => (
                        Point2::new(center_x + inset, center_y - half),
                        Point2::new(center_x + inset, center_y + half),
                    ),
                    BedEdge::South => (
                        Point2::new(center_x - half, center_y - inset),
                        Point2::new(center_x + half, center_y - inset),
                    ),
                    BedEdge::North => (
                        Point2::new(center_x - half, center_y + inset),
                        Point2::new(center_x + half, center_y + inset),
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn box_offset_and_area() {
        let b = BoundingBox::new(0.0, 0.0, 10.0, 5.0);
        assert_relative_eq!(b.area(), 50.0);
        let g = b.offset(1.0);
        assert_relative_eq!(g.width(), 12.0);
        assert_relative_eq!(g.depth(), 7.0);
        assert!(!b.intersects(&BoundingBox::new(10.0, 0.0, 12.0, 5.0)));
        assert!(b.intersects(&BoundingBox::new(9.0, 4.0, 12.0, 8.0)));
    }

    #[test]
    fn rectangular_bed_nudges_back_inside() {
        let bed = BedShape::Rectangular { min_x: 0.0, min_y: 0.0, max_x: 100.0, max_y: 100.0 };
        let rect = BoundingBox::new(10.0, 90.0, 20.0, 110.0);
        assert!(!bed.holds(&rect, 5.0));
        let moved = bed.nudge(&rect, 5.0, false).unwrap();
        assert_relative_eq!(moved.max.y, 95.0);
        assert!(bed.holds(&moved, 5.0));
    }

    #[test]
    fn circular_bed_nudges_toward_center() {
        let bed = BedShape::Circular { center_x: 0.0, center_y: 0.0, diameter: 100.0 };
        let rect = BoundingBox::new(-30.0, 20.0, -20.0, 40.0);
        assert!(!bed.holds(&rect, 2.0));
        let moved = bed.nudge(&rect, 2.0, false).unwrap();
        assert!(bed.holds(&moved, 2.0));
        assert!(moved.max.y < 40.0);
        assert_relative_eq!(moved.min.x, -30.0);
    }

    #[test]
    fn edge_segment_respects_clearance() {
        let bed = BedShape::Rectangular { min_x: 0.0, min_y: 0.0, max_x: 200.0, max_y: 100.0 };
        let (a, b) = bed.edge_segment(BedEdge::West, 2.0, 10.0);
        assert_relative_eq!(a.x, 2.0);
        assert_relative_eq!(a.y, 10.0);
        assert_relative_eq!(b.y, 90.0);
    }
}
