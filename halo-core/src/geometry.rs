use glam::{DVec3, IVec3};
use serde::{Deserialize, Serialize};

/// Axis-aligned simulation box with per-axis periodicity.
///
/// Shared and read-only from the decomposition's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxGeometry {
    length: DVec3,
    periodic: [bool; 3],
}

impl BoxGeometry {
    /// Fully periodic box. Lengths must be positive.
    pub fn new(length: DVec3) -> Self {
        Self::with_periodicity(length, [true; 3])
    }

    pub fn with_periodicity(length: DVec3, periodic: [bool; 3]) -> Self {
        debug_assert!(length.min_element() > 0.0, "box lengths must be positive");
        Self { length, periodic }
    }

    pub fn length(&self) -> DVec3 {
        self.length
    }

    pub fn periodic(&self, axis: usize) -> bool {
        self.periodic[axis]
    }

    /// Folds `pos` into the primary image along every periodic axis.
    ///
    /// Returns the folded position and the updated image counters such that
    /// `folded + image * length` equals the unfolded input, or `None` when
    /// the position is not finite or the image counter would leave `i32`.
    pub fn fold_position(&self, pos: DVec3, image_box: IVec3) -> Option<(DVec3, IVec3)> {
        let mut pos = pos.to_array();
        let mut image = image_box.to_array();
        let length = self.length.to_array();

        for axis in 0..3 {
            if self.periodic[axis] {
                let (p, i) = fold_coordinate(pos[axis], image[axis], length[axis])?;
                pos[axis] = p;
                image[axis] = i;
            }
        }

        Some((DVec3::from_array(pos), IVec3::from_array(image)))
    }

    /// Position in the unfolded (trajectory) frame.
    pub fn unfolded_position(&self, pos: DVec3, image_box: IVec3) -> DVec3 {
        pos + image_box.as_dvec3() * self.length
    }
}

/// Folds a single coordinate into `[0, length)`.
///
/// `None` if `pos` is not finite or the new image counter does not fit.
pub fn fold_coordinate(pos: f64, image: i32, length: f64) -> Option<(f64, i32)> {
    if !pos.is_finite() {
        return None;
    }
    let shift = (pos / length).floor();
    if shift < f64::from(i32::MIN) || shift > f64::from(i32::MAX) {
        return None;
    }
    let mut folded = pos - shift * length;
    let mut image = image.checked_add(shift as i32)?;

    // rounding can put a value just below zero exactly on the upper edge
    if folded >= length {
        folded -= length;
        image = image.checked_add(1)?;
    }
    if folded < 0.0 {
        folded = 0.0;
    }

    Some((folded, image))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-12;

    #[test]
    fn fold_keeps_unfolded_position() {
        let geo = BoxGeometry::new(DVec3::new(10.0, 5.0, 2.0));
        let cases = [
            (DVec3::new(23.5, -0.25, 1.0), IVec3::new(0, 0, 0)),
            (DVec3::new(-31.0, 12.0, -4.5), IVec3::new(2, -1, 3)),
            (DVec3::new(9.999, 4.0, 0.0), IVec3::new(-5, 0, 0)),
        ];

        for (pos, image) in cases {
            let before = geo.unfolded_position(pos, image);
            let (folded, new_image) = geo.fold_position(pos, image).unwrap();
            let after = geo.unfolded_position(folded, new_image);

            for axis in 0..3 {
                assert!(folded[axis] >= 0.0 && folded[axis] < geo.length()[axis]);
            }
            assert!((before - after).length() < EPS, "{before:?} vs {after:?}");
        }
    }

    #[test]
    fn folding_twice_is_noop() {
        let geo = BoxGeometry::new(DVec3::splat(3.0));
        let (once, img_once) = geo.fold_position(DVec3::new(-7.2, 8.9, 3.0), IVec3::ZERO).unwrap();
        let (twice, img_twice) = geo.fold_position(once, img_once).unwrap();
        assert_eq!(once, twice);
        assert_eq!(img_once, img_twice);
    }

    #[test]
    fn upper_edge_folds_to_zero() {
        assert_eq!(fold_coordinate(4.0, 0, 4.0), Some((0.0, 1)));
        assert_eq!(fold_coordinate(0.0, 0, 4.0), Some((0.0, 0)));
    }

    #[test]
    fn tiny_negative_stays_in_range() {
        let (folded, image) = fold_coordinate(-1e-17, 0, 1.0).unwrap();
        assert!((0.0..1.0).contains(&folded));
        assert!((folded + image as f64 - (-1e-17)).abs() < EPS);
    }

    #[test]
    fn non_periodic_axis_untouched() {
        let geo = BoxGeometry::with_periodicity(DVec3::splat(2.0), [true, false, true]);
        let (folded, image) = geo.fold_position(DVec3::new(3.0, 3.0, -1.0), IVec3::ZERO).unwrap();
        assert_eq!(folded, DVec3::new(1.0, 3.0, 1.0));
        assert_eq!(image, IVec3::new(1, 0, -1));
    }

    #[test]
    fn image_overflow_is_rejected() {
        assert_eq!(fold_coordinate(1e10, 0, 1.0), None);
        assert_eq!(fold_coordinate(5.0, i32::MAX, 1.0), None);
        assert_eq!(fold_coordinate(-1.0, i32::MIN, 1.0), None);
        assert_eq!(fold_coordinate(f64::NAN, 0, 1.0), None);
        assert_eq!(fold_coordinate(f64::INFINITY, 0, 1.0), None);
    }

    #[test]
    fn far_but_representable_position_folds() {
        let (folded, image) = fold_coordinate(1e6 + 0.25, 0, 1.0).unwrap();
        assert_eq!(image, 1_000_000);
        assert!((folded - 0.25).abs() < 1e-6);
    }

    #[test]
    fn unfoldable_axis_fails_whole_position() {
        let geo = BoxGeometry::new(DVec3::splat(1.0));
        assert!(geo.fold_position(DVec3::new(0.5, 1e12, 0.5), IVec3::ZERO).is_none());
    }
}
