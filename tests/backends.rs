mod common;

use std::fs;
use std::path::Path;

use rusqlite::Connection;
use weave::exec::backend::sql::SqlConnection;
use weave::exec::{Engine, GraphBuilder, NodeRef};
use weave::ram::types::Value;
use weave::{row, Result};

use common::*;

fn table(b: &GraphBuilder<'_>, backend: &str, sql_uri: &str) -> NodeRef {
    let file = b.local_path(cereal_csv().to_str().unwrap()).unwrap();
    match backend {
        "sequence" => b.read_csv(&file).unwrap(),
        "frame" => b.read_csv_frame(&file).unwrap(),
        "sql" => {
            let conn = b.sql_connect(sql_uri).unwrap();
            b.sql_table(&conn, CEREAL_TABLE).unwrap()
        }
        other => panic!("unknown backend {}", other),
    }
}

fn rich(b: &GraphBuilder<'_>, t: &NodeRef) -> Result<NodeRef> {
    b.filter(t, |r| b.gt(&b.pick(r, "potass")?, &b.int(280)))
}

fn without(row: Value, key: &str) -> Value {
    match row {
        Value::Dict(mut fields) => {
            fields.shift_remove(key);
            Value::Dict(fields)
        }
        other => other,
    }
}

#[test]
pub fn backends_agree() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let uri = sqlite_fixture(dir.path());
    let engine = Engine::in_memory();
    let b = engine.builder();
    for backend in ["sequence", "frame", "sql"] {
        let t = table(&b, backend, &uri);
        let count = b.count(&t).unwrap();
        assert_eq!(engine.use_value(&count).unwrap(), Value::Int(77), "{}", backend);
        let first = b.index(&t, 0).unwrap();
        assert_eq!(engine.use_value(&first).unwrap(), row0(), "{}", backend);
        let past_end = b.index(&t, 77).unwrap();
        assert_eq!(engine.use_value(&past_end).unwrap(), Value::Null, "{}", backend);
        let rich_count = b.count(&rich(&b, &t).unwrap()).unwrap();
        assert_eq!(engine.use_value(&rich_count).unwrap(), Value::Int(2), "{}", backend);
        let names = b.pick(&t, "name").unwrap();
        let fourth = b.index(&names, 3).unwrap();
        assert_eq!(
            engine.use_value(&fourth).unwrap(),
            Value::from("All-Bran with Extra Fiber"),
            "{}",
            backend
        );
        let rich_names = b.map(&rich(&b, &t).unwrap(), |r| b.pick(r, "name")).unwrap();
        assert_eq!(
            engine.use_value(&rich_names).unwrap(),
            Value::List(vec![
                Value::from("All-Bran"),
                Value::from("All-Bran with Extra Fiber")
            ]),
            "{}",
            backend
        );
    }
}

#[test]
pub fn groupby_first_group() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let uri = sqlite_fixture(dir.path());
    let engine = Engine::in_memory();
    let b = engine.builder();
    for backend in ["sequence", "frame", "sql"] {
        let t = table(&b, backend, &uri);
        let groups = b.groupby(&t, |r| b.pick(r, "type")).unwrap();
        assert_eq!(
            engine.use_value(&b.count(&groups).unwrap()).unwrap(),
            Value::Int(2),
            "{}",
            backend
        );
        let group = b.index(&groups, 0).unwrap();
        let key = b.group_key(&group).unwrap();
        assert_eq!(engine.use_value(&key).unwrap(), Value::from("C"), "{}", backend);
        let size = b.count(&group).unwrap();
        assert_eq!(engine.use_value(&size).unwrap(), Value::Int(74), "{}", backend);
        let member = b.index(&group, 0).unwrap();
        let expected = match backend {
            // columnar grouping on a plain field drops that field
            "frame" => without(row0(), "type"),
            _ => row0(),
        };
        assert_eq!(engine.use_value(&member).unwrap(), expected, "{}", backend);
    }
}

#[test]
pub fn sql_chain_is_one_statement() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let uri = sqlite_fixture(dir.path());
    let engine = Engine::in_memory();
    let b = engine.builder();
    let t = table(&b, "sql", &uri);
    let count = b.count(&rich(&b, &t).unwrap()).unwrap();

    let conn = SqlConnection::open(&uri).unwrap();
    conn.clear_log();
    let mut ctx = engine.context();
    let res = engine.execute(&mut ctx, &[count]);
    assert_eq!(res[0].as_ref().unwrap().as_value(), Some(&Value::Int(2)));
    assert_eq!(ctx.stats.pushdowns, 1);
    let log = conn.query_log();
    assert_eq!(log.len(), 1, "{:?}", log);
    assert!(log[0].contains("COUNT(*)"));
    assert!(log[0].contains("WHERE"));
}

#[test]
pub fn frame_filters_stay_columnar() {
    let _ = env_logger::try_init();
    let engine = Engine::in_memory();
    let b = engine.builder();
    let t = table(&b, "frame", "");
    let light = b
        .filter(&t, |r| b.lt(&b.pick(r, "calories")?, &b.int(70)))
        .unwrap();
    let names = b.map(&light, |r| b.pick(r, "name")).unwrap();
    assert_eq!(
        engine.use_value(&names).unwrap(),
        Value::List(vec![
            Value::from("All-Bran with Extra Fiber"),
            Value::from("Puffed Rice"),
            Value::from("Puffed Wheat"),
        ])
    );
}

/// `k` holds an int and an integral float, `v` the same without a declared
/// type, `big` sits at the top of the int range.
fn mixed_fixture(dir: &Path) -> (String, String) {
    let db = dir.join("mixed.db");
    let conn = Connection::open(&db).unwrap();
    conn.execute_batch(
        "CREATE TABLE mixed (k INTEGER, v, big INTEGER);
         INSERT INTO mixed VALUES (1, 1, 9223372036854775807), (1.0, 1.0, 1), (2, 2, 2);",
    )
    .unwrap();
    let csv = dir.join("mixed.csv");
    fs::write(&csv, "k,v,big\n1,1,9223372036854775807\n1.0,1.0,1\n2,2,2\n").unwrap();
    (
        format!("sqlite://{}", db.display()),
        csv.to_str().unwrap().to_owned(),
    )
}

fn mixed_table(b: &GraphBuilder<'_>, backend: &str, sql_uri: &str, csv: &str) -> NodeRef {
    match backend {
        "sequence" => b.constant(Value::List(vec![
            row! {"k" => 1i64, "v" => 1i64, "big" => i64::MAX},
            row! {"k" => 1.0f64, "v" => 1.0f64, "big" => 1i64},
            row! {"k" => 2i64, "v" => 2i64, "big" => 2i64},
        ])),
        "frame" => b.read_csv_frame(&b.local_path(csv).unwrap()).unwrap(),
        "sql" => {
            let conn = b.sql_connect(sql_uri).unwrap();
            b.sql_table(&conn, "mixed").unwrap()
        }
        other => panic!("unknown backend {}", other),
    }
}

#[test]
pub fn non_boolean_predicates_keep_nothing() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let uri = sqlite_fixture(dir.path());
    let engine = Engine::in_memory();
    let b = engine.builder();
    for backend in ["sequence", "frame", "sql"] {
        let t = table(&b, backend, &uri);
        let by_int = b.filter(&t, |r| b.pick(r, "fat")).unwrap();
        assert_eq!(
            engine.use_value(&b.count(&by_int).unwrap()).unwrap(),
            Value::Int(0),
            "{}",
            backend
        );
        let mixed = b
            .filter(&t, |r| b.gt(&b.pick(r, "name")?, &b.int(5)))
            .unwrap();
        assert_eq!(
            engine.use_value(&b.count(&mixed).unwrap()).unwrap(),
            Value::Int(0),
            "{}",
            backend
        );
    }
}

#[test]
pub fn lambdas_close_over_outer_rows() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let uri = sqlite_fixture(dir.path());
    let engine = Engine::in_memory();
    let b = engine.builder();
    let limits = b.constant(Value::List(vec![Value::Int(280), Value::Int(320)]));
    for backend in ["sequence", "frame", "sql"] {
        let t = table(&b, backend, &uri);
        let counts = b
            .map(&limits, |limit| {
                let above = b.filter(&t, |r| b.gt(&b.pick(r, "potass")?, limit))?;
                b.count(&above)
            })
            .unwrap();
        assert_eq!(
            engine.use_value(&counts).unwrap(),
            Value::List(vec![Value::Int(2), Value::Int(1)]),
            "{}",
            backend
        );
    }
}

#[test]
pub fn int_and_float_keys_group_together() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let (uri, csv) = mixed_fixture(dir.path());
    let engine = Engine::in_memory();
    let b = engine.builder();
    for backend in ["sequence", "frame", "sql"] {
        let t = mixed_table(&b, backend, &uri, &csv);
        for key in ["k", "v"] {
            let groups = b.groupby(&t, |r| b.pick(r, key)).unwrap();
            assert_eq!(
                engine.use_value(&b.count(&groups).unwrap()).unwrap(),
                Value::Int(2),
                "{} by {}",
                backend,
                key
            );
            let first = b.index(&groups, 0).unwrap();
            assert_eq!(
                engine.use_value(&b.count(&first).unwrap()).unwrap(),
                Value::Int(2),
                "{} by {}",
                backend,
                key
            );
        }
    }
}

#[test]
pub fn int_overflow_is_null_everywhere() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    let (uri, csv) = mixed_fixture(dir.path());
    let engine = Engine::in_memory();
    let b = engine.builder();
    for backend in ["sequence", "frame", "sql"] {
        let t = mixed_table(&b, backend, &uri, &csv);
        let next = b
            .map(&t, |r| b.add(&b.pick(r, "big")?, &b.int(1)))
            .unwrap();
        assert_eq!(
            engine.use_value(&next).unwrap(),
            Value::List(vec![Value::Null, Value::Int(2), Value::Int(3)]),
            "{}",
            backend
        );
    }
}
