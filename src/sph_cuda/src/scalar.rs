//! Floating-point scalar abstraction for the host evaluation engine.

use nalgebra::RealField;

/// Scalar type the host engine evaluates in.
///
/// Implemented for `f32` and `f64`. All constants are produced in `f64` and
/// converted once through [`SphScalar::cast_f64`], so low-degree values come
/// out bit-identical regardless of the maximum degree being evaluated.
pub trait SphScalar: RealField + Copy {
    /// Convert an `f64` constant to this precision.
    #[inline]
    fn cast_f64(value: f64) -> Self {
        nalgebra::convert::<f64, Self>(value)
    }

    /// Convert a small integer factor (degree, order, counts) to this precision.
    #[inline]
    fn cast_usize(value: usize) -> Self {
        Self::cast_f64(value as f64)
    }
}

impl SphScalar for f32 {}
impl SphScalar for f64 {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions() {
        assert_eq!(<f32 as SphScalar>::cast_f64(0.5), 0.5f32);
        assert_eq!(<f64 as SphScalar>::cast_usize(7), 7.0f64);
    }

    fn half_of<T: SphScalar>(count: usize) -> T {
        T::cast_usize(count) * T::cast_f64(0.5)
    }

    #[test]
    fn test_generic_conversions() {
        assert_eq!(half_of::<f32>(9), 4.5f32);
        assert_eq!(half_of::<f64>(3), 1.5f64);
    }
}
