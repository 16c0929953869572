mod common;

use std::sync::Arc;

use weave::exec::funcs::FnOp;
use weave::exec::{Datum, Engine, ExecOptions, BUILTINS};
use weave::ram::store::Store;
use weave::ram::types::Value;
use weave::types::Type;

use common::*;

fn disk_engine(dir: &std::path::Path) -> Engine {
    Engine::with_store(Arc::new(Store::open(dir).unwrap()))
}

#[test]
pub fn saving_is_idempotent() {
    let _ = env_logger::try_init();
    let engine = Engine::in_memory();
    let b = engine.builder();
    let file = b.local_path(cereal_csv().to_str().unwrap()).unwrap();
    let rows = b.read_csv(&file).unwrap();
    let saved = b.save(&rows).unwrap();
    let first = match engine.use_node(&saved).unwrap() {
        Datum::Ref(r) => r,
        other => panic!("expected a ref, got {:?}", other),
    };
    let again = match engine.use_node(&saved).unwrap() {
        Datum::Ref(r) => r,
        other => panic!("expected a ref, got {:?}", other),
    };
    assert_eq!(first, again);
    let stored = engine.store().deref(&first).unwrap();
    assert_eq!(stored.as_list().unwrap().len(), 77);
    assert_eq!(stored.as_list().unwrap()[0], row0());
}

#[test]
pub fn named_artifacts_resolve_latest() {
    let _ = env_logger::try_init();
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = disk_engine(dir.path());
        let b = engine.builder();
        for n in [1i64, 2] {
            let saved = b.save_named(&b.int(n), "answer").unwrap();
            assert!(engine.use_node(&saved).is_ok());
        }
    }
    let engine = disk_engine(dir.path());
    let b = engine.builder();
    let loaded = b.get("answer:latest");
    assert_eq!(loaded.ty(), &Type::Int);
    assert_eq!(engine.use_value(&loaded).unwrap(), Value::Int(2));
    let versions = engine.store().versions("answer").unwrap();
    assert_eq!(versions.len(), 2);
    let pinned = b.get(&format!("answer:{}", versions[0]));
    assert_eq!(engine.use_value(&pinned).unwrap(), Value::Int(1));
    let missing = b.get("question:latest");
    assert_eq!(engine.use_value(&missing).unwrap_err().kind(), "NotFound");
}

#[test]
pub fn loaded_artifacts_feed_table_ops() {
    let _ = env_logger::try_init();
    let engine = Engine::in_memory();
    engine.store().save(&Value::List(cereal_rows()), Some("cereal")).unwrap();
    let b = engine.builder();
    let loaded = b.get("cereal:latest");
    let rich = b
        .filter(&loaded, |r| b.gt(&b.pick(r, "potass")?, &b.int(280)))
        .unwrap();
    assert_eq!(engine.use_value(&b.count(&rich).unwrap()).unwrap(), Value::Int(2));
}

#[test]
pub fn custom_list_op_round_trips_through_store() {
    let _ = env_logger::try_init();
    let mut registry = (**BUILTINS).clone();
    registry
        .register(
            "evens",
            FnOp::new([("n", Type::Int)], Type::list(Type::Int), |call| {
                let n = call.int("n")?;
                Ok(Datum::Value(Value::List(
                    (0..n).filter(|i| i % 2 == 0).map(Value::Int).collect(),
                )))
            }),
        )
        .unwrap();
    let engine = Engine::new(
        Arc::new(registry),
        Arc::new(Store::in_memory()),
        ExecOptions::default(),
    );
    let b = engine.builder();
    let evens = b.apply("evens", [("n", b.int(7))]).unwrap();
    assert_eq!(evens.ty(), &Type::list(Type::Int));
    let saved = b.save_named(&evens, "evens").unwrap();
    let artifact = match engine.use_node(&saved).unwrap() {
        Datum::Ref(r) => r,
        other => panic!("expected a ref, got {:?}", other),
    };
    let expected = Value::List(vec![Value::Int(0), Value::Int(2), Value::Int(4), Value::Int(6)]);
    assert_eq!(engine.store().deref(&artifact).unwrap(), expected);
    assert_eq!(engine.store().type_of(&artifact).unwrap(), Type::list(Type::Int));
    let total = b.count(&b.get("evens:latest")).unwrap();
    assert_eq!(engine.use_value(&total).unwrap(), Value::Int(4));
}
