use rowmap::value::{TIMESTAMP_FORMAT, Value};
use rowmap_error::{StoreError, StoreErrorCode};
use rusqlite::ffi;
use rusqlite::types::Value as SqliteValue;

/// Convert a bound argument into a SQLite value.
///
/// Booleans are stored as integers and timestamps as text in the fixed
/// timestamp format.
pub fn to_sqlite(value: &Value) -> Result<SqliteValue, StoreError> {
    Ok(match value {
        Value::Null => SqliteValue::Null,
        Value::Int(v) => SqliteValue::Integer(*v),
        Value::UInt(v) => SqliteValue::Integer(i64::try_from(*v).map_err(|_| {
            StoreError::new(format!("unsigned value {v} out of range for sqlite integer"))
        })?),
        Value::Float(v) => SqliteValue::Real(*v),
        Value::Bool(v) => SqliteValue::Integer(i64::from(*v)),
        Value::Text(v) => SqliteValue::Text(v.clone()),
        Value::Blob(v) => SqliteValue::Blob(v.clone()),
        Value::Timestamp(v) => SqliteValue::Text(v.format(TIMESTAMP_FORMAT).to_string()),
    })
}

pub fn from_sqlite(value: SqliteValue) -> Value {
    match value {
        SqliteValue::Null => Value::Null,
        SqliteValue::Integer(v) => Value::Int(v),
        SqliteValue::Real(v) => Value::Float(v),
        SqliteValue::Text(v) => Value::Text(v),
        SqliteValue::Blob(v) => Value::Blob(v),
    }
}

/// Map a rusqlite error onto a store error, keeping the structured codes
/// the mapper cares about.
pub fn store_error(err: rusqlite::Error) -> StoreError {
    let code = match &err {
        rusqlite::Error::QueryReturnedNoRows => StoreErrorCode::NoRows,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            StoreErrorCode::Duplicate
        }
        _ => StoreErrorCode::Other,
    };
    StoreError::new(err.to_string())
        .with_code(code)
        .with_source(err)
}
