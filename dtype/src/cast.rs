use super::*;
use enumset::EnumSet;

/// Element types the target IR accepts on its tensors.
pub const TARGET_DTYPES: EnumSet<DType> = enumset::enum_set!(
    DType::Bool
        | DType::Int8
        | DType::UInt8
        | DType::Int16
        | DType::UInt16
        | DType::Int32
        | DType::UInt32
        | DType::Float16
        | DType::BFloat16
        | DType::Float32
);

impl DType {
    /// Check if casting from `self` to `to` is safe (preserves value).
    pub fn can_safe_cast(self, to: Self) -> bool {
        if self == to || matches!(self, Self::Bool) {
            return true;
        }

        let from_bytes = self.bytes();
        let to_bytes = to.bytes();
        match (self.is_unsigned(), self.is_signed(), self.is_float(), to.is_unsigned(), to.is_signed(), to.is_float()) {
            // Unsigned -> Unsigned: only if target is larger
            (true, _, _, true, _, _) => from_bytes < to_bytes,
            // Signed -> Signed: only if target is same size or larger
            (_, true, _, _, true, _) => from_bytes <= to_bytes,
            // Unsigned -> Signed: only if target is strictly larger
            (true, _, _, _, true, _) => from_bytes < to_bytes,
            // Integer -> Float: safe if integer is Int32 or smaller
            (_, _, false, _, _, true) => from_bytes <= Self::Int32.bytes(),
            // Float -> Float: only if target is larger
            (_, _, true, _, _, true) => from_bytes < to_bytes,
            _ => false,
        }
    }

    /// Whether the target IR accepts this element type as is.
    pub fn is_target_supported(self) -> bool {
        TARGET_DTYPES.contains(self)
    }

    /// Closest element type the target IR accepts.
    ///
    /// 64-bit types are narrowed to their 32-bit counterparts; everything else is kept.
    pub fn legalized(self) -> Self {
        match self {
            Self::Int64 => Self::Int32,
            Self::UInt64 => Self::UInt32,
            Self::Float64 => Self::Float32,
            other => other,
        }
    }
}
