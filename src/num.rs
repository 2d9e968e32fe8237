use std::{
    fmt::{Debug, Display},
    ops::{Add, AddAssign, Mul, MulAssign, Neg, Sub},
};

use bytemuck::Pod;
use derive_more::Display;
use half::f16;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    F16,
    F32,
    F64,
    I32,
    I64,
}

pub trait Zero {
    fn zero() -> Self;
}

pub trait One {
    fn one() -> Self;
}

macro_rules! impl_zero_one {
    ($ty:ty, $zero:expr, $one:expr) => {
        impl Zero for $ty {
            #[inline]
            fn zero() -> Self {
                $zero
            }
        }

        impl One for $ty {
            #[inline]
            fn one() -> Self {
                $one
            }
        }
    };
}

impl_zero_one!(f16, f16::ZERO, f16::ONE);
impl_zero_one!(f32, 0.0, 1.0);
impl_zero_one!(f64, 0.0, 1.0);
impl_zero_one!(i32, 0, 1);
impl_zero_one!(i64, 0, 1);

/// Element type of a tile.
pub trait Scalar:
    Sized
    + Pod
    + Zero
    + One
    + PartialEq
    + Debug
    + Display
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + MulAssign
    + Send
    + Sync
    + 'static
    + sealed::Sealed
{
    const DATA_TYPE: DataType;
}

impl Scalar for f16 {
    const DATA_TYPE: DataType = DataType::F16;
}

impl Scalar for f32 {
    const DATA_TYPE: DataType = DataType::F32;
}

impl Scalar for f64 {
    const DATA_TYPE: DataType = DataType::F64;
}

impl Scalar for i32 {
    const DATA_TYPE: DataType = DataType::I32;
}

impl Scalar for i64 {
    const DATA_TYPE: DataType = DataType::I64;
}

mod sealed {
    use half::f16;

    pub trait Sealed {}

    impl Sealed for f16 {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
    impl Sealed for i32 {}
    impl Sealed for i64 {}
}
