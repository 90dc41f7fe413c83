use crate::error::DbError;
use crate::types::Value;

/// Build a `[Value; N]` parameter array from anything convertible into [`Value`].
///
/// ```rust
/// use sqlite_dispatch::{Value, params};
///
/// let p = params!["Ford", 20_000, None::<i64>];
/// assert_eq!(p, [Value::from("Ford"), Value::Integer(20_000), Value::Null]);
/// ```
#[macro_export]
macro_rules! params {
    () => {
        [$crate::Value::Null; 0]
    };
    ($($param:expr),+ $(,)?) => {
        [$($crate::Value::from($param)),+]
    };
}

/// Bind `params` to the statement's `?` placeholders, left to right.
///
/// # Errors
///
/// Returns `DbError::BindingError` if the number of values does not match the placeholder
/// count or a structured value cannot be JSON encoded, and `DbError::SqliteError` if the
/// engine rejects the bind.
pub(crate) fn bind_params(
    stmt: &mut rusqlite::Statement<'_>,
    params: &[Value],
) -> Result<(), DbError> {
    let expected = stmt.parameter_count();
    if expected != params.len() {
        return Err(DbError::BindingError(format!(
            "statement expects {expected} parameter(s), {} supplied",
            params.len()
        )));
    }
    for (idx, value) in params.iter().enumerate() {
        let native = value.to_sqlite().map_err(|err| match err {
            DbError::BindingError(msg) => {
                DbError::BindingError(format!("parameter {}: {msg}", idx + 1))
            }
            other => other,
        })?;
        stmt.raw_bind_parameter(idx + 1, native)?;
    }
    Ok(())
}
