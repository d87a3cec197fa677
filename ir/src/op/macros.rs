/// Declares the operator vocabulary.
///
/// Every kind listed under `kinds` becomes
/// - a variant of the fieldless [`OpType`](crate::op::OpType) tag,
/// - a struct with one public field per attribute,
/// - an [`OpSchema`](crate::op::OpSchema) impl that reads the fields from an [`Attrs`](crate::op::Attrs) map
///   (fields with `= default` are optional, `Option<_>` fields are optional, everything else is required),
/// - a variant of the payload enum [`Op`](crate::op::Op).
///
/// Kinds under `custom` bring their own struct and `OpSchema` impl.
macro_rules! define_ops {
    (
        kinds {
            $(
                $(#[$meta:meta])*
                $kind:ident { $( $field:ident : $ty:ty $(= $default:expr)? ),* $(,)? }
            ),* $(,)?
        }
        custom {
            $( $(#[$cmeta:meta])* $ckind:ident($cty:ty) ),* $(,)?
        }
    ) => {
        /// Tag of an operator kind.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[derive(strum::Display, strum::EnumString, strum::IntoStaticStr, strum::EnumIter, strum::VariantArray)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub enum OpType {
            $($kind,)*
            $($ckind,)*
        }

        $(
            $(#[$meta])*
            #[derive(Debug, Clone, PartialEq)]
            pub struct $kind {
                $(pub $field: $ty,)*
            }

            impl $crate::op::OpSchema for $kind {
                const TYPE: OpType = OpType::$kind;

                #[allow(unused_variables)]
                fn from_attrs(attrs: &$crate::op::Attrs) -> $crate::Result<Self> {
                    Ok(Self {
                        $($field: $crate::op::macros::read_field!(attrs, $kind, $field, $ty $(, $default)?),)*
                    })
                }

                #[allow(unused_mut)]
                fn copied_attr(&self) -> $crate::op::Attrs {
                    let mut attrs = $crate::op::Attrs::new();
                    $(attrs.set_field(stringify!($field), &self.$field);)*
                    attrs
                }
            }

            impl From<$kind> for Op {
                fn from(op: $kind) -> Self {
                    Self::$kind(op)
                }
            }
        )*

        $(
            impl From<$cty> for Op {
                fn from(op: $cty) -> Self {
                    Self::$ckind(op)
                }
            }
        )*

        /// Operator payload held by a graph node.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Op {
            $($kind($kind),)*
            $($(#[$cmeta])* $ckind($cty),)*
        }

        impl Op {
            pub fn op_type(&self) -> OpType {
                match self {
                    $(Self::$kind(_) => OpType::$kind,)*
                    $(Self::$ckind(_) => OpType::$ckind,)*
                }
            }

            /// Construct a payload of kind `op_type` from an attribute map.
            ///
            /// Fails with `MissingAttribute` / `AttributeType` when the map does not satisfy the kind's schema.
            pub fn from_attrs(op_type: OpType, attrs: &$crate::op::Attrs) -> $crate::Result<Self> {
                use $crate::op::OpSchema;
                match op_type {
                    $(OpType::$kind => $kind::from_attrs(attrs).map(Self::$kind),)*
                    $(OpType::$ckind => <$cty>::from_attrs(attrs).map(Self::$ckind),)*
                }
            }

            /// Snapshot of the current attributes, suitable for building a related kind.
            pub fn copied_attr(&self) -> $crate::op::Attrs {
                use $crate::op::OpSchema;
                match self {
                    $(Self::$kind(op) => op.copied_attr(),)*
                    $(Self::$ckind(op) => op.copied_attr(),)*
                }
            }
        }
    };
}

macro_rules! read_field {
    ($attrs:ident, $kind:ident, $field:ident, $ty:ty, $default:expr) => {
        match $attrs.get(stringify!($field)) {
            Some(value) => <$ty as $crate::op::AttrField>::decode(value).context($crate::error::AttributeTypeSnafu {
                op: OpType::$kind,
                attr: stringify!($field),
                expected: <$ty as $crate::op::AttrField>::EXPECTED,
            })?,
            None => $default,
        }
    };
    ($attrs:ident, $kind:ident, $field:ident, $ty:ty) => {
        match $attrs.get(stringify!($field)) {
            Some(value) => <$ty as $crate::op::AttrField>::decode(value).context($crate::error::AttributeTypeSnafu {
                op: OpType::$kind,
                attr: stringify!($field),
                expected: <$ty as $crate::op::AttrField>::EXPECTED,
            })?,
            None => <$ty as $crate::op::AttrField>::absent()
                .context($crate::error::MissingAttributeSnafu { op: OpType::$kind, attr: stringify!($field) })?,
        }
    };
}

pub(crate) use define_ops;
pub(crate) use read_field;
