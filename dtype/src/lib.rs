//! Tensor element types for the graft graph compiler.
//!
//! # Module Organization
//!
//! - [`cast`] - Safe casts and target legalization

pub mod cast;


/// Element type of a tensor flowing on a graph edge.
///
/// The names follow the numpy spelling used by model formats (`"float32"`, `"uint8"`, ...).
#[derive(Debug, Hash, PartialOrd, Ord)]
#[derive(strum::Display, strum::EnumString, strum::IntoStaticStr)]
#[derive(strum::EnumCount, strum::EnumIter, strum::VariantArray, strum::FromRepr)]
#[derive(enumset::EnumSetType)]
#[cfg_attr(any(test, feature = "proptest"), derive(proptest_derive::Arbitrary))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[enumset(repr = "u32")]
pub enum DType {
    Bool = 0,

    Int8 = 1,
    UInt8 = 2,
    Int16 = 3,
    UInt16 = 4,
    Int32 = 5,
    UInt32 = 6,
    Int64 = 7,
    UInt64 = 8,

    Float16 = 9,
    BFloat16 = 10,
    Float32 = 11,
    Float64 = 12,
}

impl DType {
    pub const fn bytes(&self) -> usize {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 | Self::Float16 | Self::BFloat16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    pub const fn is_bool(&self) -> bool {
        matches!(self, Self::Bool)
    }

    pub const fn is_signed(&self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    pub const fn is_unsigned(&self) -> bool {
        matches!(self, Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64)
    }

    pub const fn is_int(&self) -> bool {
        self.is_signed() || self.is_unsigned()
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Float16 | Self::BFloat16 | Self::Float32 | Self::Float64)
    }

    /// Inclusive value range of an integer type, as `f64`.
    ///
    /// Used when clamping requantized constants. Returns `None` for floats and bool.
    pub fn int_range(&self) -> Option<(f64, f64)> {
        let range = match self {
            Self::Int8 => (i8::MIN as f64, i8::MAX as f64),
            Self::UInt8 => (0.0, u8::MAX as f64),
            Self::Int16 => (i16::MIN as f64, i16::MAX as f64),
            Self::UInt16 => (0.0, u16::MAX as f64),
            Self::Int32 => (i32::MIN as f64, i32::MAX as f64),
            Self::UInt32 => (0.0, u32::MAX as f64),
            Self::Int64 => (i64::MIN as f64, i64::MAX as f64),
            Self::UInt64 => (0.0, u64::MAX as f64),
            _ => return None,
        };
        Some(range)
    }

    /// Numpy-style name, e.g. `"float32"`.
    pub fn name(&self) -> &'static str {
        self.into()
    }
}
