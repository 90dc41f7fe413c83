use std::collections::{BTreeMap, HashMap};

use rusqlite::types::{ToSqlOutput, Value as SqliteValue, ValueRef};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Number, Value as JsonValue};

use crate::error::DbError;

/// Values that can be bound as statement parameters or read back out of a row.
///
/// The first five variants map one-to-one onto SQLite's storage classes. `Array` and `Object`
/// are stored as JSON text, so structured data fits in a plain `TEXT` column:
/// ```rust
/// use sqlite_dispatch::Value;
///
/// let tags = Value::Array(vec![Value::from("red"), Value::from(3)]);
/// assert_eq!(tags.to_json_text().unwrap(), r#"["red",3]"#);
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// SQL NULL
    #[default]
    Null,
    /// Integer value (64-bit)
    Integer(i64),
    /// Floating point value (64-bit)
    Real(f64),
    /// Text/string value
    Text(String),
    /// Binary data
    Blob(Vec<u8>),
    /// Sequence, bound as a JSON array
    Array(Vec<Value>),
    /// String-keyed mapping, bound as a JSON object
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Check if this value is NULL
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        if let Value::Integer(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(value) => Some(*value),
            #[allow(clippy::cast_precision_loss)]
            Value::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let Value::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        if let Value::Blob(bytes) = self {
            Some(bytes)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        if let Value::Array(items) = self {
            Some(items)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        if let Value::Object(map) = self {
            Some(map)
        } else {
            None
        }
    }

    /// Short name of the variant, used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Build a value from anything serde can serialize.
    ///
    /// # Errors
    /// Returns `DbError::BindingError` if serialization fails (e.g. a map with non-string keys).
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, DbError> {
        Ok(Value::from(serde_json::to_value(value)?))
    }

    /// Encode as a `serde_json::Value`.
    ///
    /// # Errors
    /// Returns `DbError::BindingError` for blobs and non-finite reals, which JSON cannot represent.
    pub fn to_json(&self) -> Result<JsonValue, DbError> {
        Ok(match self {
            Value::Null => JsonValue::Null,
            Value::Integer(i) => JsonValue::Number(Number::from(*i)),
            Value::Real(f) => Number::from_f64(*f).map(JsonValue::Number).ok_or_else(|| {
                DbError::binding(format!("real value {f} has no JSON representation"))
            })?,
            Value::Text(s) => JsonValue::String(s.clone()),
            Value::Blob(_) => {
                return Err(DbError::binding(
                    "blob values cannot be nested inside a JSON array or object",
                ));
            }
            Value::Array(items) => {
                JsonValue::Array(items.iter().map(Value::to_json).collect::<Result<_, _>>()?)
            }
            Value::Object(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_json()?)))
                    .collect::<Result<_, DbError>>()?,
            ),
        })
    }

    /// Encode as JSON text, the storage form of `Array` and `Object`.
    ///
    /// # Errors
    /// Same as [`Value::to_json`].
    pub fn to_json_text(&self) -> Result<String, DbError> {
        Ok(self.to_json()?.to_string())
    }

    /// Convert into the engine's native parameter type.
    ///
    /// # Errors
    /// Returns `DbError::BindingError` if a structured value cannot be JSON encoded.
    pub fn to_sqlite(&self) -> Result<SqliteValue, DbError> {
        Ok(match self {
            Value::Null => SqliteValue::Null,
            Value::Integer(i) => SqliteValue::Integer(*i),
            Value::Real(f) => SqliteValue::Real(*f),
            Value::Text(s) => SqliteValue::Text(s.clone()),
            Value::Blob(b) => SqliteValue::Blob(b.clone()),
            Value::Array(_) | Value::Object(_) => SqliteValue::Text(self.to_json_text()?),
        })
    }

    /// Read a raw column value. Text in a column whose declared type mentions `JSON` is decoded
    /// into `Array`/`Object` when it parses as one; anything else is returned as stored.
    ///
    /// # Errors
    /// Returns `DbError::ExtractionError` if text is not valid UTF-8.
    pub fn from_column(raw: ValueRef<'_>, decl_type: Option<&str>) -> Result<Self, DbError> {
        Ok(match raw {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(bytes) => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| DbError::extraction(format!("invalid UTF-8 in text column: {e}")))?;
                if decl_type.is_some_and(is_json_decl_type)
                    && let Some(structured) = decode_structured(text)
                {
                    structured
                } else {
                    Value::Text(text.to_owned())
                }
            }
            ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
        })
    }
}

/// Declared column types such as `JSON`, `JSON ARRAY TEXT` or `json_obj` mark structured columns.
#[must_use]
pub fn is_json_decl_type(decl_type: &str) -> bool {
    decl_type.to_ascii_uppercase().contains("JSON")
}

fn decode_structured(text: &str) -> Option<Value> {
    match serde_json::from_str::<JsonValue>(text) {
        Ok(json @ (JsonValue::Array(_) | JsonValue::Object(_))) => Some(Value::from(json)),
        _ => None,
    }
}

impl From<JsonValue> for Value {
    fn from(json: JsonValue) -> Self {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Integer(i64::from(b)),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Real(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Value::Text(s),
            JsonValue::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            JsonValue::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl rusqlite::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        self.to_sqlite()
            .map(ToSqlOutput::Owned)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
    }
}

macro_rules! value_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::Integer(i64::from(value))
                }
            }
        )*
    };
}

value_from_int!(i8, i16, i32, i64, u8, u16, u32, bool);

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Real(f64::from(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Blob(value)
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Blob(value.to_vec())
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Array(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Object(value)
    }
}

impl From<HashMap<String, Value>> for Value {
    fn from(value: HashMap<String, Value>) -> Self {
        Value::Object(value.into_iter().collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Typed extraction out of a [`Value`].
///
/// Non-optional targets reject NULL; wrap the target in `Option` to accept it.
pub trait FromValue: Sized {
    /// # Errors
    /// Returns `DbError::ExtractionError` on NULL or a type mismatch.
    fn from_value(value: Value) -> Result<Self, DbError>;
}

fn mismatch<T>(expected: &str, value: &Value) -> Result<T, DbError> {
    if value.is_null() {
        Err(DbError::extraction(format!(
            "NULL cannot be extracted as non-optional {expected}"
        )))
    } else {
        Err(DbError::extraction(format!(
            "expected {expected}, found {}",
            value.type_name()
        )))
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, DbError> {
        Ok(value)
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, DbError> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self, DbError> {
        match value {
            Value::Integer(i) => Ok(i),
            other => mismatch("integer", &other),
        }
    }
}

macro_rules! from_value_narrow_int {
    ($($ty:ty),*) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: Value) -> Result<Self, DbError> {
                    let wide = i64::from_value(value)?;
                    <$ty>::try_from(wide).map_err(|_| {
                        DbError::extraction(format!(
                            "integer {wide} out of range for {}",
                            stringify!($ty)
                        ))
                    })
                }
            }
        )*
    };
}

// u8 is left out so `Vec<u8>` stays a blob rather than an array of integers.
from_value_narrow_int!(i8, i16, i32, u16, u32, u64, usize);

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self, DbError> {
        match value {
            Value::Integer(0) => Ok(false),
            Value::Integer(_) => Ok(true),
            other => mismatch("boolean (integer)", &other),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self, DbError> {
        match value.as_real() {
            Some(f) => Ok(f),
            None => mismatch("real", &value),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, DbError> {
        match value {
            Value::Text(s) => Ok(s),
            other => mismatch("text", &other),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> Result<Self, DbError> {
        match value {
            Value::Blob(b) => Ok(b),
            other => mismatch("blob", &other),
        }
    }
}

fn structured(value: Value, expected: &str) -> Result<Value, DbError> {
    match value {
        Value::Text(ref text) => match serde_json::from_str::<JsonValue>(text) {
            Ok(json) => Ok(Value::from(json)),
            Err(e) => Err(DbError::extraction(format!(
                "text is not valid JSON for {expected}: {e}"
            ))),
        },
        other => Ok(other),
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self, DbError> {
        match structured(value, "array")? {
            Value::Array(items) => items.into_iter().map(T::from_value).collect(),
            other => mismatch("array", &other),
        }
    }
}

impl<T: FromValue> FromValue for BTreeMap<String, T> {
    fn from_value(value: Value) -> Result<Self, DbError> {
        match structured(value, "object")? {
            Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| Ok((k, T::from_value(v)?)))
                .collect(),
            other => mismatch("object", &other),
        }
    }
}

impl<T: FromValue> FromValue for HashMap<String, T> {
    fn from_value(value: Value) -> Result<Self, DbError> {
        Ok(BTreeMap::<String, T>::from_value(value)?.into_iter().collect())
    }
}

impl FromValue for JsonValue {
    fn from_value(value: Value) -> Result<Self, DbError> {
        value
            .to_json()
            .map_err(|e| DbError::extraction(format!("value has no JSON form: {e}")))
    }
}

/// Wrapper that extracts (or binds) any serde type through its JSON form.
#[derive(Debug, Clone, PartialEq)]
pub struct Json<T>(pub T);

impl<T: DeserializeOwned> FromValue for Json<T> {
    fn from_value(value: Value) -> Result<Self, DbError> {
        let json = JsonValue::from_value(structured(value, "JSON")?)?;
        serde_json::from_value(json)
            .map(Json)
            .map_err(|e| DbError::extraction(format!("JSON decode failed: {e}")))
    }
}

impl<T: Serialize> Json<T> {
    /// Serialize the wrapped value into a bindable [`Value`].
    ///
    /// # Errors
    /// Returns `DbError::BindingError` if serialization fails.
    pub fn to_value(&self) -> Result<Value, DbError> {
        Value::from_serialize(&self.0)
    }
}
