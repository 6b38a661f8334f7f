//! Backend-agnostic values and result rows.
//!
//! The [`Value`] enum is the currency of the engine: field values read from
//! models, parameters bound into compiled statements, and cells of result
//! [`Row`]s. [`FromValue`] converts a cell back into a Rust type, accepting
//! the looser representations a backend may hand back (`SQLite` stores booleans
//! as integers and dates as text, for instance).

use std::fmt;

use quarry_core::{QuarryError, QuarryResult};

/// A backend-agnostic representation of a database value.
///
/// # Examples
///
/// ```
/// use quarry_db::value::Value;
///
/// let v = Value::from(42_i64);
/// assert_eq!(v, Value::Int(42));
///
/// let v = Value::from("hello");
/// assert_eq!(v, Value::String("hello".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    /// SQL NULL.
    Null,
    /// A boolean value.
    Bool(bool),
    /// A 64-bit signed integer.
    Int(i64),
    /// A 64-bit floating-point number.
    Float(f64),
    /// A UTF-8 string.
    String(String),
    /// Raw binary data.
    Bytes(Vec<u8>),
    /// A date without time.
    Date(chrono::NaiveDate),
    /// A date and time without timezone.
    DateTime(chrono::NaiveDateTime),
    /// A date and time in UTC.
    DateTimeTz(chrono::DateTime<chrono::Utc>),
    /// A time without date.
    Time(chrono::NaiveTime),
    /// A UUID value.
    Uuid(uuid::Uuid),
    /// A JSON document.
    Json(serde_json::Value),
    /// A list of values (the right-hand side of `__in`).
    List(Vec<Value>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Date(d) => write!(f, "{d}"),
            Self::DateTime(dt) => write!(f, "{dt}"),
            Self::DateTimeTz(dt) => write!(f, "{dt}"),
            Self::Time(t) => write!(f, "{t}"),
            Self::Uuid(u) => write!(f, "{u}"),
            Self::Json(j) => write!(f, "{j}"),
            Self::List(vals) => {
                write!(f, "[")?;
                for (i, v) in vals.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl Value {
    /// Returns `true` if this value is `Null`.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns `true` for values an auto-generated primary key holds before
    /// the row is written: `Null`, `0`, or the empty string.
    pub fn is_unset_key(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Int(0) => true,
            Self::String(s) => s.is_empty(),
            _ => false,
        }
    }

    /// A stable textual identity used to deduplicate rows by primary key.
    pub(crate) fn identity(&self) -> String {
        match self {
            Self::String(s) => format!("s:{s}"),
            Self::Int(i) => format!("i:{i}"),
            other => format!("{other:?}"),
        }
    }

    /// The name of the variant, used in conversion errors.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "Null",
            Self::Bool(_) => "Bool",
            Self::Int(_) => "Int",
            Self::Float(_) => "Float",
            Self::String(_) => "String",
            Self::Bytes(_) => "Bytes",
            Self::Date(_) => "Date",
            Self::DateTime(_) => "DateTime",
            Self::DateTimeTz(_) => "DateTimeTz",
            Self::Time(_) => "Time",
            Self::Uuid(_) => "Uuid",
            Self::Json(_) => "Json",
            Self::List(_) => "List",
        }
    }

    /// Attempts to extract a boolean value.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Attempts to extract an integer value.
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Attempts to extract a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

// ── From implementations ───────────────────────────────────────────────

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v.into())
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i16 => Int,
    i32 => Int,
    i64 => Int,
    f32 => Float,
    f64 => Float,
    String => String,
    Vec<u8> => Bytes,
    chrono::NaiveDate => Date,
    chrono::NaiveDateTime => DateTime,
    chrono::DateTime<chrono::Utc> => DateTimeTz,
    chrono::NaiveTime => Time,
    uuid::Uuid => Uuid,
    serde_json::Value => Json,
    Vec<Value> => List,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

// ── FromValue ──────────────────────────────────────────────────────────

/// Trait for converting a [`Value`] to a concrete Rust type.
pub trait FromValue: Sized {
    /// Attempts to convert a value reference to this type.
    fn from_value(value: &Value) -> QuarryResult<Self>;
}

fn mismatch<T>(expected: &str, value: &Value) -> QuarryResult<T> {
    Err(QuarryError::type_mismatch(expected, value.kind()))
}

impl FromValue for Value {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        Ok(value.clone())
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::Int(i) => Ok(*i),
            Value::Bool(b) => Ok(Self::from(*b)),
            _ => mismatch("i64", value),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::Int(i) => {
                Self::try_from(*i).map_err(|_| QuarryError::type_mismatch("i32", format!("Int({i})")))
            }
            _ => mismatch("i32", value),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as Self),
            _ => mismatch("f64", value),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            _ => mismatch("bool", value),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::String(s) => Ok(s.clone()),
            _ => mismatch("String", value),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            Value::String(s) => Ok(s.clone().into_bytes()),
            _ => mismatch("Vec<u8>", value),
        }
    }
}

impl FromValue for uuid::Uuid {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::Uuid(u) => Ok(*u),
            Value::String(s) => {
                Self::parse_str(s).map_err(|_| QuarryError::type_mismatch("Uuid", "String"))
            }
            Value::Bytes(b) => {
                Self::from_slice(b).map_err(|_| QuarryError::type_mismatch("Uuid", "Bytes"))
            }
            _ => mismatch("Uuid", value),
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::Json(j) => Ok(j.clone()),
            Value::String(s) => Ok(serde_json::from_str(s)?),
            _ => mismatch("serde_json::Value", value),
        }
    }
}

impl FromValue for chrono::NaiveDate {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::Date(d) => Ok(*d),
            Value::String(s) => s
                .parse()
                .map_err(|_| QuarryError::type_mismatch("NaiveDate", "String")),
            _ => mismatch("NaiveDate", value),
        }
    }
}

impl FromValue for chrono::NaiveDateTime {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::DateTime(dt) => Ok(*dt),
            Value::String(s) => s
                .parse()
                .or_else(|_| Self::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                .map_err(|_| QuarryError::type_mismatch("NaiveDateTime", "String")),
            _ => mismatch("NaiveDateTime", value),
        }
    }
}

impl FromValue for chrono::DateTime<chrono::Utc> {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::DateTimeTz(dt) => Ok(*dt),
            Value::String(s) => s
                .parse()
                .map_err(|_| QuarryError::type_mismatch("DateTime<Utc>", "String")),
            _ => mismatch("DateTime<Utc>", value),
        }
    }
}

impl FromValue for chrono::NaiveTime {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::Time(t) => Ok(*t),
            Value::String(s) => s
                .parse()
                .map_err(|_| QuarryError::type_mismatch("NaiveTime", "String")),
            _ => mismatch("NaiveTime", value),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> QuarryResult<Self> {
        match value {
            Value::Null => Ok(None),
            _ => T::from_value(value).map(Some),
        }
    }
}

// ── Row ────────────────────────────────────────────────────────────────

/// A single result row: column names plus their values.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Creates a new row from column names and values.
    ///
    /// # Panics
    ///
    /// Panics if the number of columns does not match the number of values.
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        assert_eq!(
            columns.len(),
            values.len(),
            "Row column count must match value count"
        );
        Self { columns, values }
    }

    /// Returns the column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Consumes the row, returning its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns `true` if the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Gets a typed value by column name.
    pub fn get<T: FromValue>(&self, column: &str) -> QuarryResult<T> {
        let value = self.get_value(column).ok_or_else(|| QuarryError::UnknownField {
            model: "row".to_string(),
            field: column.to_string(),
            valid: self.columns.clone(),
        })?;
        T::from_value(value).map_err(|e| e.with_field(column))
    }

    /// Gets a typed value by column index.
    pub fn get_by_index<T: FromValue>(&self, idx: usize) -> QuarryResult<T> {
        let value = self.values.get(idx).ok_or_else(|| {
            QuarryError::DatabaseError(format!(
                "column index {idx} out of bounds (row has {} columns)",
                self.values.len()
            ))
        })?;
        T::from_value(value)
    }

    /// Returns a reference to the raw value at the given column name.
    pub fn get_value(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| &self.values[idx])
    }
}
