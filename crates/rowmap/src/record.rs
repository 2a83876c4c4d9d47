//! Self-describing record shapes.
//!
//! A record type describes its members once through [`Record::shape`] and
//! exposes path based accessors, so schema derivation and row
//! materialization never need runtime reflection. Paths are member indices,
//! one per nesting level, in the order returned by `shape`.

use rowmap_error::{MapperError, Result, fatal};

use crate::value::{FieldType, FieldValue, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum RecordShape {
    /// A struct-like record with named members.
    Struct {
        type_name: &'static str,
        members: Vec<Member>,
    },
    /// A lone scalar. Never valid as a table record.
    Scalar {
        type_name: &'static str,
        field_type: FieldType,
    },
}

impl RecordShape {
    pub fn record(type_name: &'static str, members: Vec<Member>) -> Self {
        RecordShape::Struct { type_name, members }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Struct { type_name, .. } | Self::Scalar { type_name, .. } => type_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub name: &'static str,
    /// Column this member maps to. `None` for members that only exist in
    /// memory.
    pub column: Option<&'static str>,
    pub kind: MemberKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MemberKind {
    Field(FieldType),
    /// A nested record whose members are flattened into the parent.
    Embedded(RecordShape),
}

impl Member {
    pub fn field(name: &'static str, column: Option<&'static str>, field_type: FieldType) -> Self {
        Member {
            name,
            column,
            kind: MemberKind::Field(field_type),
        }
    }

    pub fn embedded(name: &'static str, shape: RecordShape) -> Self {
        Member {
            name,
            column: None,
            kind: MemberKind::Embedded(shape),
        }
    }
}

/// A record that can be mapped to a table row.
///
/// Usually implemented through [`record!`](crate::record!).
pub trait Record: Default + Clone + Send + Sync + 'static {
    fn shape() -> RecordShape;

    /// Read the member at `path`.
    fn get_field(&self, path: &[usize]) -> Result<Value>;

    /// Decode `value` into the member at `path`.
    fn set_field(&mut self, path: &[usize], value: Value) -> Result<()>;
}

/// Split a member path into its head index and the remaining levels.
pub fn split_path<R: Record>(path: &[usize]) -> Result<(usize, &[usize])> {
    match path.split_first() {
        Some((head, rest)) => Ok((*head, rest)),
        None => Err(fatal!(
            "empty member path for {}",
            std::any::type_name::<R>()
        )),
    }
}

pub fn leaf_get<R: Record, T: FieldValue>(field: &T, rest: &[usize]) -> Result<Value> {
    if !rest.is_empty() {
        return Err(fatal!(
            "member path descends into a scalar field of {}",
            std::any::type_name::<R>()
        ));
    }
    Ok(field.to_value())
}

pub fn leaf_set<R: Record, T: FieldValue>(field: &mut T, rest: &[usize], value: Value) -> Result<()> {
    if !rest.is_empty() {
        return Err(fatal!(
            "member path descends into a scalar field of {}",
            std::any::type_name::<R>()
        ));
    }
    *field = T::from_value(value)?;
    Ok(())
}

pub fn member_out_of_range<R: Record>(path: &[usize]) -> MapperError {
    fatal!(
        "member path {path:?} out of range for {}",
        std::any::type_name::<R>()
    )
}

pub fn optional_column(columns: &[&'static str]) -> Option<&'static str> {
    columns.first().copied()
}

/// Implement [`Record`] for a struct.
///
/// ```ignore
/// record! {
///     User {
///         id: i64 => "id",
///         name: String => "name",
///         scratch: String,
///     }
///     embed { audit: Audit }
/// }
/// ```
///
/// Fields without a column are kept in memory only. Embedded members must
/// implement [`Record`] themselves; their fields are flattened into the
/// table's columns.
#[macro_export]
macro_rules! record {
    (
        $ty:ident {
            $( $field:ident : $fty:ty $( => $col:literal )? ),* $(,)?
        }
        $( embed { $( $emb:ident : $ety:ty ),* $(,)? } )?
    ) => {
        impl $crate::record::Record for $ty {
            fn shape() -> $crate::record::RecordShape {
                $crate::record::RecordShape::record(
                    stringify!($ty),
                    vec![
                        $(
                            $crate::record::Member::field(
                                stringify!($field),
                                $crate::record::optional_column(&[$($col),*]),
                                <$fty as $crate::value::FieldValue>::FIELD_TYPE,
                            ),
                        )*
                        $($(
                            $crate::record::Member::embedded(
                                stringify!($emb),
                                <$ety as $crate::record::Record>::shape(),
                            ),
                        )*)?
                    ],
                )
            }

            #[allow(unused_assignments, unused_mut)]
            fn get_field(&self, path: &[usize]) -> $crate::Result<$crate::value::Value> {
                let (head, rest) = $crate::record::split_path::<Self>(path)?;
                let mut idx = 0usize;
                $(
                    if head == idx {
                        return $crate::record::leaf_get::<Self, _>(&self.$field, rest);
                    }
                    idx += 1;
                )*
                $($(
                    if head == idx {
                        return $crate::record::Record::get_field(&self.$emb, rest);
                    }
                    idx += 1;
                )*)?
                Err($crate::record::member_out_of_range::<Self>(path))
            }

            #[allow(unused_assignments, unused_mut)]
            fn set_field(
                &mut self,
                path: &[usize],
                value: $crate::value::Value,
            ) -> $crate::Result<()> {
                let (head, rest) = $crate::record::split_path::<Self>(path)?;
                let mut idx = 0usize;
                $(
                    if head == idx {
                        return $crate::record::leaf_set::<Self, _>(&mut self.$field, rest, value);
                    }
                    idx += 1;
                )*
                $($(
                    if head == idx {
                        return $crate::record::Record::set_field(&mut self.$emb, rest, value);
                    }
                    idx += 1;
                )*)?
                Err($crate::record::member_out_of_range::<Self>(path))
            }
        }
    };
}
