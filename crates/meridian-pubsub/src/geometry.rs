//! Circle geometry for the 2D plane.

use serde::{Deserialize, Serialize};

use crate::{PubSubError, Result};

/// A circle: position and radius.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Circle {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
}

impl Circle {
    /// Create a circle, validating the radius.
    ///
    /// Radius must be finite and non-negative; zero is allowed and
    /// describes a point.
    pub fn new(x: f64, y: f64, radius: f64) -> Result<Self> {
        if !radius.is_finite() || radius < 0.0 {
            return Err(PubSubError::InvalidRegion { radius });
        }
        Ok(Self { x, y, radius })
    }

    /// A point with no extent.
    pub fn point(x: f64, y: f64) -> Self {
        Self { x, y, radius: 0.0 }
    }

    /// Euclidean distance between centers.
    pub fn center_distance(&self, other: &Circle) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// The intersection rule: two circles overlap iff the distance
    /// between centers is at most the sum of radii.
    pub fn intersects(&self, other: &Circle) -> bool {
        self.center_distance(other) <= self.radius + other.radius
    }

    /// Smallest-effort circle containing all of `circles`: centered on
    /// the centroid of their centers, radius stretched over the
    /// farthest rim. Not minimal, but a guaranteed superset, which is
    /// the property coverage gossip needs.
    pub fn enclosing(circles: &[Circle]) -> Option<Circle> {
        if circles.is_empty() {
            return None;
        }
        let n = circles.len() as f64;
        let cx = circles.iter().map(|c| c.x).sum::<f64>() / n;
        let cy = circles.iter().map(|c| c.y).sum::<f64>() / n;
        let center = Circle::point(cx, cy);
        let radius = circles
            .iter()
            .map(|c| center.center_distance(c) + c.radius)
            .fold(0.0f64, f64::max);
        Some(Circle {
            x: cx,
            y: cy,
            radius,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn negative_radius_rejected() {
        assert_eq!(
            Circle::new(0.0, 0.0, -1.0),
            Err(PubSubError::InvalidRegion { radius: -1.0 })
        );
    }

    #[test]
    fn non_finite_radius_rejected() {
        assert!(Circle::new(0.0, 0.0, f64::NAN).is_err());
        assert!(Circle::new(0.0, 0.0, f64::INFINITY).is_err());
    }

    #[test]
    fn spatial_match_rule() {
        // The contract's canonical cases: publish at (0,0) r=5 against
        // a subscription at (10,0).
        let publish = Circle::new(0.0, 0.0, 5.0).unwrap();

        let sub_narrow = Circle::new(10.0, 0.0, 4.0).unwrap();
        assert!(!publish.intersects(&sub_narrow)); // 10 > 5 + 4

        let sub_wide = Circle::new(10.0, 0.0, 6.0).unwrap();
        assert!(publish.intersects(&sub_wide)); // 10 <= 5 + 6
    }

    #[test]
    fn tangent_circles_intersect() {
        let a = Circle::new(0.0, 0.0, 5.0).unwrap();
        let b = Circle::new(10.0, 0.0, 5.0).unwrap();
        assert!(a.intersects(&b));
    }

    #[test]
    fn point_circles() {
        let a = Circle::point(1.0, 1.0);
        assert!(a.intersects(&Circle::point(1.0, 1.0)));
        assert!(!a.intersects(&Circle::point(1.0, 1.1)));
    }

    #[test]
    fn enclosing_of_nothing_is_none() {
        assert_eq!(Circle::enclosing(&[]), None);
    }

    #[test]
    fn enclosing_single_is_same_circle() {
        let c = Circle::new(3.0, -2.0, 1.5).unwrap();
        let enc = Circle::enclosing(&[c]).unwrap();
        assert_eq!(enc, c);
    }

    proptest! {
        #[test]
        fn intersection_is_symmetric(
            ax in -100.0..100.0f64, ay in -100.0..100.0f64, ar in 0.0..50.0f64,
            bx in -100.0..100.0f64, by in -100.0..100.0f64, br in 0.0..50.0f64,
        ) {
            let a = Circle::new(ax, ay, ar).unwrap();
            let b = Circle::new(bx, by, br).unwrap();
            prop_assert_eq!(a.intersects(&b), b.intersects(&a));
        }

        #[test]
        fn enclosing_contains_members(
            circles in proptest::collection::vec(
                (-100.0..100.0f64, -100.0..100.0f64, 0.0..50.0f64), 1..8)
        ) {
            let circles: Vec<Circle> = circles
                .into_iter()
                .map(|(x, y, r)| Circle::new(x, y, r).unwrap())
                .collect();
            let enc = Circle::enclosing(&circles).unwrap();
            // Anything intersecting a member intersects the enclosure,
            // allowing for float slack at the rim.
            for c in &circles {
                let rim = enc.center_distance(c) + c.radius;
                prop_assert!(rim <= enc.radius + 1e-9);
            }
        }
    }
}
