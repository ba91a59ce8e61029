use serde::{Deserialize, Serialize};

/// Boundary condition that keeps coordinates inside one axis interval `[a1, a2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Boundary {
    /// Wrap around: `((x - a1) mod (a2 - a1)) + a1`.
    #[default]
    Periodic,
    /// Reflect once at the crossed wall.
    ///
    /// Only a single reflection is applied: a value displaced by more than one box
    /// width beyond a wall stays outside the interval.
    Mirror,
}

impl Boundary {
    /// Fold a single coordinate into `[a1, a2]`.
    #[inline]
    pub fn apply(self, x: f64, a1: f64, a2: f64) -> f64 {
        match self {
            Boundary::Periodic => (x - a1).rem_euclid(a2 - a1) + a1,
            Boundary::Mirror => {
                // upper wall first, then lower, on the already reflected value
                let x = if x > a2 { a2 - (x - a2) } else { x };
                if x < a1 {
                    a1 + (a1 - x)
                } else {
                    x
                }
            }
        }
    }

    /// Fold every coordinate of `values` in place.
    pub fn apply_slice(self, values: &mut [f64], a1: f64, a2: f64) {
        for v in values.iter_mut() {
            *v = self.apply(*v, a1, a2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn periodic_wraps_both_sides() {
        let b = Boundary::Periodic;
        assert_relative_eq!(b.apply(1.5, 0.0, 1.0), 0.5, epsilon = 1e-12);
        assert_relative_eq!(b.apply(-0.25, 0.0, 1.0), 0.75, epsilon = 1e-12);
        assert_relative_eq!(b.apply(-3.0, -2.0, 2.0), 1.0, epsilon = 1e-12);
        assert_relative_eq!(b.apply(0.3, 0.0, 1.0), 0.3, epsilon = 1e-12);
        // several widths away still folds
        assert_relative_eq!(b.apply(7.25, 0.0, 1.0), 0.25, epsilon = 1e-12);
    }

    #[test]
    fn mirror_reflects_once() {
        let b = Boundary::Mirror;
        assert_relative_eq!(b.apply(1.2, 0.0, 1.0), 0.8, epsilon = 1e-12);
        assert_relative_eq!(b.apply(-0.3, 0.0, 1.0), 0.3, epsilon = 1e-12);
        assert_relative_eq!(b.apply(0.4, 0.0, 1.0), 0.4, epsilon = 1e-12);
    }

    #[test]
    fn mirror_does_not_iterate() {
        // 2.5 -> 1 - 1.5 = -0.5 -> 0 + 0.5 = 0.5 (second fold comes from the lower check)
        assert_relative_eq!(Boundary::Mirror.apply(2.5, 0.0, 1.0), 0.5, epsilon = 1e-12);
        // -3.5 -> 3.5, above the box and left there
        assert_relative_eq!(Boundary::Mirror.apply(-3.5, 0.0, 1.0), 3.5, epsilon = 1e-12);
    }

    #[test]
    fn apply_slice_matches_scalar() {
        let mut v = vec![-0.1, 0.5, 1.1];
        Boundary::Periodic.apply_slice(&mut v, 0.0, 1.0);
        assert_relative_eq!(v[0], 0.9, epsilon = 1e-12);
        assert_relative_eq!(v[1], 0.5, epsilon = 1e-12);
        assert_relative_eq!(v[2], 0.1, epsilon = 1e-12);
    }
}
