//! Attribute maps consumed by [`Op::from_attrs`](super::Op::from_attrs) and produced by
//! [`Op::copied_attr`](super::Op::copied_attr).

use std::collections::BTreeMap;

use graft_dtype::DType;
use ndarray::IxDyn;

use crate::tensor::Array;

/// One attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Strs(Vec<String>),
    Tensor(Array),
    DType(DType),
}

/// Ordered string-keyed attribute map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attrs(BTreeMap<String, AttrValue>);

impl Attrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Chaining form of [`Attrs::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<AttrValue> {
        self.0.remove(key)
    }

    /// Typed read. `None` when absent or of the wrong kind.
    pub fn read<T: AttrField>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(T::decode)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Store a typed field, skipping empty optionals.
    pub fn set_field<T: AttrField>(&mut self, key: &str, value: &T) {
        if let Some(encoded) = value.encode() {
            self.0.insert(key.to_string(), encoded);
        }
    }

    /// Overlay every entry of `other` onto `self`.
    pub fn merge(mut self, other: Attrs) -> Self {
        self.0.extend(other.0);
        self
    }
}

impl<K: Into<String>, V: Into<AttrValue>> FromIterator<(K, V)> for Attrs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Typed operator field that round-trips through [`AttrValue`].
pub trait AttrField: Sized {
    /// Human readable kind, used in `AttributeType` errors.
    const EXPECTED: &'static str;

    fn decode(value: &AttrValue) -> Option<Self>;

    fn encode(&self) -> Option<AttrValue>;

    /// Value of a field whose attribute is absent and that declares no default.
    fn absent() -> Option<Self> {
        None
    }
}

impl<T: AttrField> AttrField for Option<T> {
    const EXPECTED: &'static str = T::EXPECTED;

    fn decode(value: &AttrValue) -> Option<Self> {
        T::decode(value).map(Some)
    }

    fn encode(&self) -> Option<AttrValue> {
        self.as_ref().and_then(T::encode)
    }

    fn absent() -> Option<Self> {
        Some(None)
    }
}

impl AttrField for i64 {
    const EXPECTED: &'static str = "int";

    fn decode(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::Int(v) => Some(*v),
            AttrValue::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }

    fn encode(&self) -> Option<AttrValue> {
        Some(AttrValue::Int(*self))
    }
}

impl AttrField for usize {
    const EXPECTED: &'static str = "non-negative int";

    fn decode(value: &AttrValue) -> Option<Self> {
        i64::decode(value).and_then(|v| usize::try_from(v).ok())
    }

    fn encode(&self) -> Option<AttrValue> {
        Some(AttrValue::Int(*self as i64))
    }
}

impl AttrField for f64 {
    const EXPECTED: &'static str = "float";

    fn decode(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::Float(v) => Some(*v),
            AttrValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    fn encode(&self) -> Option<AttrValue> {
        Some(AttrValue::Float(*self))
    }
}

impl AttrField for bool {
    const EXPECTED: &'static str = "bool";

    fn decode(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::Bool(v) => Some(*v),
            AttrValue::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    fn encode(&self) -> Option<AttrValue> {
        Some(AttrValue::Bool(*self))
    }
}

impl AttrField for String {
    const EXPECTED: &'static str = "string";

    fn decode(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::Str(v) => Some(v.clone()),
            _ => None,
        }
    }

    fn encode(&self) -> Option<AttrValue> {
        Some(AttrValue::Str(self.clone()))
    }
}

impl AttrField for Vec<i64> {
    const EXPECTED: &'static str = "int list";

    fn decode(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::Ints(v) => Some(v.clone()),
            AttrValue::Int(v) => Some(vec![*v]),
            _ => None,
        }
    }

    fn encode(&self) -> Option<AttrValue> {
        Some(AttrValue::Ints(self.clone()))
    }
}

impl AttrField for Vec<usize> {
    const EXPECTED: &'static str = "non-negative int list";

    fn decode(value: &AttrValue) -> Option<Self> {
        Vec::<i64>::decode(value)?.into_iter().map(|v| usize::try_from(v).ok()).collect()
    }

    fn encode(&self) -> Option<AttrValue> {
        Some(AttrValue::Ints(self.iter().map(|&v| v as i64).collect()))
    }
}

impl AttrField for Vec<f64> {
    const EXPECTED: &'static str = "float list";

    fn decode(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::Floats(v) => Some(v.clone()),
            AttrValue::Ints(v) => Some(v.iter().map(|&i| i as f64).collect()),
            AttrValue::Float(v) => Some(vec![*v]),
            _ => None,
        }
    }

    fn encode(&self) -> Option<AttrValue> {
        Some(AttrValue::Floats(self.clone()))
    }
}

impl AttrField for Vec<String> {
    const EXPECTED: &'static str = "string list";

    fn decode(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::Strs(v) => Some(v.clone()),
            _ => None,
        }
    }

    fn encode(&self) -> Option<AttrValue> {
        Some(AttrValue::Strs(self.clone()))
    }
}

impl AttrField for Array {
    const EXPECTED: &'static str = "tensor";

    fn decode(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::Tensor(v) => Some(v.clone()),
            AttrValue::Floats(v) => Array::from_shape_vec(IxDyn(&[v.len()]), v.clone()).ok(),
            AttrValue::Ints(v) => Array::from_shape_vec(IxDyn(&[v.len()]), v.iter().map(|&i| i as f64).collect()).ok(),
            AttrValue::Float(v) => Some(Array::from_elem(IxDyn(&[]), *v)),
            _ => None,
        }
    }

    fn encode(&self) -> Option<AttrValue> {
        Some(AttrValue::Tensor(self.clone()))
    }
}

impl AttrField for DType {
    const EXPECTED: &'static str = "dtype";

    fn decode(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::DType(v) => Some(*v),
            AttrValue::Str(v) => v.parse().ok(),
            _ => None,
        }
    }

    fn encode(&self) -> Option<AttrValue> {
        Some(AttrValue::DType(*self))
    }
}

/// Implements [`AttrField`] for string-valued enums through their strum `EnumString`/`Display` impls.
macro_rules! impl_str_attr_field {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::op::attr::AttrField for $ty {
                const EXPECTED: &'static str = stringify!($ty);

                fn decode(value: &$crate::op::attr::AttrValue) -> Option<Self> {
                    match value {
                        $crate::op::attr::AttrValue::Str(v) => v.parse().ok(),
                        _ => None,
                    }
                }

                fn encode(&self) -> Option<$crate::op::attr::AttrValue> {
                    Some($crate::op::attr::AttrValue::Str(self.to_string()))
                }
            }
        )*
    };
}
pub(crate) use impl_str_attr_field;

macro_rules! impl_into_attr_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for AttrValue {
            fn from(value: $ty) -> Self {
                Self::$variant(value.into())
            }
        })*
    };
}

impl_into_attr_value! {
    i64 => Int,
    i32 => Int,
    f64 => Float,
    bool => Bool,
    String => Str,
    &str => Str,
    Vec<i64> => Ints,
    Vec<f64> => Floats,
    Vec<String> => Strs,
    Array => Tensor,
    DType => DType,
}

impl From<usize> for AttrValue {
    fn from(value: usize) -> Self {
        Self::Int(value as i64)
    }
}

impl From<Vec<usize>> for AttrValue {
    fn from(value: Vec<usize>) -> Self {
        Self::Ints(value.into_iter().map(|v| v as i64).collect())
    }
}

impl From<&[i64]> for AttrValue {
    fn from(value: &[i64]) -> Self {
        Self::Ints(value.to_vec())
    }
}

impl From<&[usize]> for AttrValue {
    fn from(value: &[usize]) -> Self {
        Self::from(value.to_vec())
    }
}
