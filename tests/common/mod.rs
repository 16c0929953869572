#![allow(dead_code)]

use std::path::{Path, PathBuf};

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use weave::exec::backend::frame::FrameTable;
use weave::exec::backend::{Deadline, TableBackend};
use weave::ram::types::Value;
use weave::row;

pub const CEREAL_TABLE: &str = "cereal";

pub fn cereal_csv() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/testdata/cereal.csv")
}

pub fn cereal_rows() -> Vec<Value> {
    FrameTable::read_csv(cereal_csv(), b',')
        .unwrap()
        .rows(&Deadline::none())
        .unwrap()
}

pub fn row0() -> Value {
    row! {
        "name" => "100% Bran",
        "mfr" => "N",
        "type" => "C",
        "calories" => 70i64,
        "protein" => 4i64,
        "fat" => 1i64,
        "sodium" => 130i64,
        "fiber" => 10.0f64,
        "carbo" => 5.0f64,
        "sugars" => 6i64,
        "potass" => 280i64,
        "vitamins" => 25i64,
        "shelf" => 3i64,
        "weight" => 1.0f64,
        "cups" => 0.33f64,
        "rating" => 68.402973f64,
    }
}

/// Loads the cereal rows into a fresh SQLite file under `dir` and returns
/// its uri.
pub fn sqlite_fixture(dir: &Path) -> String {
    let path = dir.join("cereal.db");
    let conn = Connection::open(&path).unwrap();
    let rows = cereal_rows();
    let Value::Dict(first) = &rows[0] else {
        panic!("cereal rows are dicts");
    };
    let columns = first
        .iter()
        .map(|(name, v)| {
            let decl = match v {
                Value::Int(_) => "INTEGER",
                Value::Float(_) => "REAL",
                _ => "TEXT",
            };
            format!("\"{}\" {}", name, decl)
        })
        .collect::<Vec<_>>();
    conn.execute(
        &format!("CREATE TABLE {} ({})", CEREAL_TABLE, columns.join(", ")),
        [],
    )
    .unwrap();
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    let insert = format!("INSERT INTO {} VALUES ({})", CEREAL_TABLE, placeholders);
    for row in &rows {
        let Value::Dict(fields) = row else {
            panic!("cereal rows are dicts");
        };
        let params = fields.values().map(|v| match v {
            Value::Int(i) => SqlValue::Integer(*i),
            Value::Float(f) => SqlValue::Real(*f),
            Value::String(s) => SqlValue::Text(s.clone()),
            _ => SqlValue::Null,
        });
        conn.execute(&insert, params_from_iter(params)).unwrap();
    }
    format!("sqlite://{}", path.display())
}
