use crate::types::{IonHit, Point3};

/// An axis-aligned bounding box described by two corner points.
///
/// A freshly constructed box starts in the "inverse limit" state, where the
/// low corner sits at `+inf` and the high corner at `-inf`; expanding it with
/// any point produces a valid box. Consumers of a box that may not have been
/// fed any points must check [`BoundingBox::is_valid`] first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub low: Point3,
    pub high: Point3,
}

impl BoundingBox {
    /// A box in the inverse-limit sentinel state.
    pub fn new_inverse() -> BoundingBox {
        BoundingBox {
            low: Point3::new(f32::INFINITY, f32::INFINITY, f32::INFINITY),
            high: Point3::new(f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY),
        }
    }

    pub fn from_corners(low: Point3, high: Point3) -> BoundingBox {
        BoundingBox { low, high }
    }

    /// True once every low bound lies at or below its matching high bound.
    pub fn is_valid(&self) -> bool {
        self.low.x <= self.high.x && self.low.y <= self.high.y && self.low.z <= self.high.z
    }

    /// Grows the box to include `p`.
    pub fn expand(&mut self, p: Point3) {
        self.low.x = self.low.x.min(p.x);
        self.low.y = self.low.y.min(p.y);
        self.low.z = self.low.z.min(p.z);
        self.high.x = self.high.x.max(p.x);
        self.high.y = self.high.y.max(p.y);
        self.high.z = self.high.z.max(p.z);
    }

    /// Grows the box to cover `other` as well.
    pub fn union(&mut self, other: &BoundingBox) {
        if other.is_valid() {
            self.expand(other.low);
            self.expand(other.high);
        }
    }

    pub fn contains(&self, p: Point3) -> bool {
        self.is_valid()
            && p.x >= self.low.x
            && p.x <= self.high.x
            && p.y >= self.low.y
            && p.y <= self.high.y
            && p.z >= self.low.z
            && p.z <= self.high.z
    }

    pub fn centre(&self) -> Point3 {
        (self.low + self.high).scaled(0.5)
    }

    /// Sweeps a set of ions for their spatial extents.
    pub fn bounds_of(ions: &[IonHit]) -> BoundingBox {
        let mut b = BoundingBox::new_inverse();
        for ion in ions {
            b.expand(ion.pos);
        }
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverse_box_is_invalid_until_expanded() {
        let mut b = BoundingBox::new_inverse();
        assert!(!b.is_valid());
        b.expand(Point3::new(1.0, 2.0, 3.0));
        assert!(b.is_valid());
        assert_eq!(b.low, b.high);
    }

    #[test]
    fn bounds_of_ions() {
        let ions = vec![
            IonHit::new(Point3::new(0.0, -1.0, 5.0), 1.0),
            IonHit::new(Point3::new(2.0, 4.0, -3.0), 2.0),
        ];
        let b = BoundingBox::bounds_of(&ions);
        assert_eq!(b.low, Point3::new(0.0, -1.0, -3.0));
        assert_eq!(b.high, Point3::new(2.0, 4.0, 5.0));
        assert!(b.contains(Point3::new(1.0, 0.0, 0.0)));
        assert!(!b.contains(Point3::new(3.0, 0.0, 0.0)));
    }
}
