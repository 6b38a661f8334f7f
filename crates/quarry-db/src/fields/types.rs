//! Field storage types.
//!
//! [`FieldType`] names the kind of column a field maps to. [`ValueType`] is
//! implemented by every Rust type a model may store in a plain column, tying
//! the Rust type to its [`FieldType`] and nullability so that
//! [`Definitions::field`](crate::model::Definitions::field) can infer both.

use crate::value::{FromValue, Value};

/// The kind of column a field maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// A 64-bit integer column.
    Integer,
    /// A floating-point column.
    Float,
    /// A boolean column.
    Boolean,
    /// A text column.
    Text,
    /// A binary column.
    Bytes,
    /// A date column.
    Date,
    /// A timestamp without timezone.
    DateTime,
    /// A timestamp in UTC.
    DateTimeTz,
    /// A time-of-day column.
    Time,
    /// A UUID column.
    Uuid,
    /// A JSON document column.
    Json,
    /// A field carrying a relation. Forward to-one relations store the
    /// target's primary key; other relation fields have no column.
    Relation,
}

impl FieldType {
    /// Returns `true` for field types that hold text.
    pub const fn is_textual(self) -> bool {
        matches!(self, Self::Text | Self::Uuid | Self::Json)
    }
}

/// A Rust type that can be stored in a model column.
pub trait ValueType: FromValue + Into<Value> + Clone + Send + Sync + 'static {
    /// The column kind for this type.
    const FIELD_TYPE: FieldType;
    /// Whether the column accepts NULL.
    const NULLABLE: bool = false;
}

macro_rules! value_type {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl ValueType for $ty {
                const FIELD_TYPE: FieldType = FieldType::$kind;
            }
        )*
    };
}

value_type! {
    i32 => Integer,
    i64 => Integer,
    f64 => Float,
    bool => Boolean,
    String => Text,
    Vec<u8> => Bytes,
    chrono::NaiveDate => Date,
    chrono::NaiveDateTime => DateTime,
    chrono::DateTime<chrono::Utc> => DateTimeTz,
    chrono::NaiveTime => Time,
    uuid::Uuid => Uuid,
    serde_json::Value => Json,
}

impl<T: ValueType> ValueType for Option<T> {
    const FIELD_TYPE: FieldType = T::FIELD_TYPE;
    const NULLABLE: bool = true;
}
