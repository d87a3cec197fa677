use test_case::test_case;

use crate::DType;

#[test_case(DType::Int64, DType::Int32; "int64_narrowed")]
#[test_case(DType::UInt64, DType::UInt32; "uint64_narrowed")]
#[test_case(DType::Float64, DType::Float32; "float64_narrowed")]
#[test_case(DType::Float16, DType::Float16; "float16_kept")]
#[test_case(DType::Bool, DType::Bool; "bool_kept")]
fn test_legalized(input: DType, expected: DType) {
    assert_eq!(input.legalized(), expected);
}

#[test_case(DType::UInt8, DType::Int16, true; "uint8_to_int16")]
#[test_case(DType::UInt8, DType::Int8, false; "uint8_to_int8")]
#[test_case(DType::Int32, DType::Float32, true; "int32_to_float32")]
#[test_case(DType::Int64, DType::Float32, false; "int64_to_float32")]
#[test_case(DType::Float32, DType::Float16, false; "float32_to_float16")]
#[test_case(DType::Bool, DType::Float16, true; "bool_to_anything")]
fn test_can_safe_cast(from: DType, to: DType, expected: bool) {
    assert_eq!(from.can_safe_cast(to), expected);
}

#[test_case("float32", DType::Float32; "lowercase")]
#[test_case("UINT8", DType::UInt8; "uppercase")]
#[test_case("bfloat16", DType::BFloat16; "bfloat")]
fn test_parse(name: &str, expected: DType) {
    assert_eq!(name.parse::<DType>().ok(), Some(expected));
}
