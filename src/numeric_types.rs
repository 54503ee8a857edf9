//! Numeric type traits used for the grid index and coordinate generics of this crate

use std::fmt::Debug;
use std::hash::Hash;

/// Trait for flat grid index types (vertex and cube indices)
///
/// The grid stores cube indices as the flat index of the cube's minimum corner
/// vertex. Neighbor arithmetic is performed in `i64` to allow negative
/// intermediate offsets even for unsigned index types.
pub trait Index:
    Copy
    + Hash
    + Debug
    + Default
    + Eq
    + Ord
    + Send
    + Sync
    + num::Integer
    + num::NumCast
    + num::ToPrimitive
    + 'static
{
    /// Converts the index to `i64` for signed neighbor arithmetic
    fn to_i64(self) -> i64 {
        <i64 as num::NumCast>::from(self).expect("index does not fit into i64")
    }

    /// Converts a non-negative `i64` value back into the index type
    fn from_i64(value: i64) -> Self {
        <Self as num::NumCast>::from(value).expect("value does not fit into index type")
    }

    /// Converts the index to `usize` for slot addressing
    fn to_usize(self) -> usize {
        <usize as num::NumCast>::from(self).expect("index does not fit into usize")
    }

    /// Converts a `usize` value back into the index type
    fn from_usize(value: usize) -> Self {
        <Self as num::NumCast>::from(value).expect("value does not fit into index type")
    }
}

impl Index for i32 {}
impl Index for i64 {}
impl Index for u32 {}
impl Index for u64 {}
impl Index for usize {}

/// Trait for the scalar and coordinate type of the grid
pub trait Real:
    nalgebra::RealField + Copy + Debug + Default + num::ToPrimitive + num::NumCast + 'static
{
    /// Converts an `f64` constant into the real type
    fn from_f64(value: f64) -> Self {
        <Self as num::NumCast>::from(value).expect("value does not fit into real type")
    }

    /// Converts the value to `f64`
    fn to_f64(self) -> f64 {
        <f64 as num::NumCast>::from(self).expect("real value does not fit into f64")
    }

    /// Tries to convert the value to another [Real] type, returns None if the conversion fails
    fn try_convert<T: Real>(self) -> Option<T> {
        <T as num::NumCast>::from(self)
    }
}

impl Real for f32 {}
impl Real for f64 {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_roundtrip() {
        assert_eq!(<u32 as Index>::from_i64(17).to_i64(), 17);
        assert_eq!(<i64 as Index>::from_usize(42).to_usize(), 42);
    }

    #[test]
    fn test_real_conversion() {
        let x: f64 = 1.5;
        let y: Option<f32> = x.try_convert();
        assert_eq!(y, Some(1.5f32));
    }
}
