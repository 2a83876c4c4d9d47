//! Decode result rows into records.

use rowmap_error::{MapperError, Result};

use crate::record::Record;
use crate::schema::Schema;
use crate::store::ResultSet;
use crate::value::Value;

/// Result column to record member mapping for one result set.
#[derive(Debug)]
pub struct RowMaterializer {
    /// One entry per result column. `None` for columns the record doesn't
    /// map.
    targets: Vec<Option<(String, Vec<usize>)>>,
}

impl RowMaterializer {
    pub fn new(schema: &Schema, columns: &[String]) -> Self {
        let targets = columns
            .iter()
            .map(|column| {
                schema
                    .fields()
                    .by_column(column)
                    .map(|desc| (column.clone(), desc.path.clone()))
            })
            .collect();
        RowMaterializer { targets }
    }

    pub fn materialize<R: Record>(&self, row: Vec<Value>) -> Result<R> {
        let mut record = R::default();
        for (target, value) in self.targets.iter().zip(row) {
            let Some((column, path)) = target else {
                continue;
            };
            record.set_field(path, value).map_err(|e| match e {
                MapperError::Fatal(msg) => MapperError::Fatal(format!("column '{column}': {msg}")),
                other => other,
            })?;
        }
        Ok(record)
    }

    pub fn materialize_all<R: Record>(&self, rows: Vec<Vec<Value>>) -> Result<Vec<R>> {
        rows.into_iter().map(|row| self.materialize(row)).collect()
    }
}

/// First row of `result` as a record, [`MapperError::NoRows`] if empty.
pub fn read_one<R: Record>(schema: &Schema, result: ResultSet) -> Result<R> {
    let materializer = RowMaterializer::new(schema, &result.columns);
    match result.rows.into_iter().next() {
        Some(row) => materializer.materialize(row),
        None => Err(MapperError::NoRows),
    }
}

pub fn read_all<R: Record>(schema: &Schema, result: ResultSet) -> Result<Vec<R>> {
    let materializer = RowMaterializer::new(schema, &result.columns);
    materializer.materialize_all(result.rows)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::store::TableDescription;
    use crate::value::parse_timestamp;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Event {
        id: u32,
        name: String,
        active: bool,
        score: f64,
        at: chrono::NaiveDateTime,
        note: Option<String>,
    }

    crate::record! {
        Event {
            id: u32 => "id",
            name: String => "name",
            active: bool => "active",
            score: f64 => "score",
            at: chrono::NaiveDateTime => "at",
            note: Option<String> => "note",
        }
    }

    fn schema() -> Schema {
        Schema::derive::<Event>("events", TableDescription::new(["id"])).unwrap()
    }

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn coerces_and_ignores_unknown_columns() {
        let result = ResultSet {
            columns: columns(&["id", "extra", "name", "active", "score", "at", "note"]),
            rows: vec![vec![
                Value::Int(3),
                Value::from("ignored"),
                Value::Int(42),
                Value::from("true"),
                Value::Int(5),
                Value::from("2024-03-01 10:20:30.250"),
                Value::Null,
            ]],
        };
        let event: Event = read_one(&schema(), result).unwrap();
        let expected = Event {
            id: 3,
            name: "42".to_string(),
            active: true,
            score: 5.0,
            at: NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_milli_opt(10, 20, 30, 250)
                .unwrap(),
            note: None,
        };
        assert_eq!(expected, event);
    }

    #[test]
    fn read_one_empty_is_no_rows() {
        let result = ResultSet {
            columns: columns(&["id"]),
            rows: Vec::new(),
        };
        let err = read_one::<Event>(&schema(), result).unwrap_err();
        assert!(err.is_no_rows());
    }

    #[test]
    fn read_all_empty_is_empty() {
        let result = ResultSet {
            columns: columns(&["id"]),
            rows: Vec::new(),
        };
        let events: Vec<Event> = read_all(&schema(), result).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn mismatch_names_column() {
        let result = ResultSet {
            columns: columns(&["id", "at"]),
            rows: vec![vec![Value::Int(1), Value::from("yesterday")]],
        };
        let err = read_all::<Event>(&schema(), result).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("column 'at'"), "{err}");
    }

    #[test]
    fn overflow_is_fatal() {
        let result = ResultSet {
            columns: columns(&["id"]),
            rows: vec![vec![Value::Int(-1)]],
        };
        assert!(read_one::<Event>(&schema(), result).unwrap_err().is_fatal());
        assert!(parse_timestamp("2024-03-01 10:20:30").is_some());
    }
}
