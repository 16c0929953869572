mod common;

use serde_json::json;
use tokio::net::TcpListener;
use weave::client::RemoteClient;
use weave::exec::Engine;
use weave::ram::types::Value;
use weave::server::{serve, ServerOptions, ServerState, TargetResult};

use common::*;

#[tokio::test(flavor = "multi_thread")]
pub async fn remote_execution() {
    let _ = env_logger::try_init();
    let store = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let uri = sqlite_fixture(data.path());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = ServerState::new(ServerOptions {
        store_dir: Some(store.path().to_path_buf()),
        ..ServerOptions::default()
    })
    .unwrap();
    tokio::spawn(serve(listener, state));

    // graphs are only built here; the server evaluates them
    let engine = Engine::in_memory();
    let b = engine.builder();
    let conn = b.sql_connect(&uri).unwrap();
    let table = b.sql_table(&conn, CEREAL_TABLE).unwrap();
    let rich = b
        .filter(&table, |r| b.gt(&b.pick(r, "potass")?, &b.int(280)))
        .unwrap();
    let rich_count = b.count(&rich).unwrap();
    let first = b.index(&table, 0).unwrap();
    let saved = b.save_named(&b.map(&rich, |r| b.pick(r, "name")).unwrap(), "rich").unwrap();
    let missing = b.sql_table(&conn, "no_such_table").unwrap();

    let client = RemoteClient::connect(addr).await.unwrap();
    let results = client
        .execute(&[rich_count, first, saved, b.count(&missing).unwrap()])
        .await
        .unwrap();
    assert_eq!(results.len(), 4);
    assert_eq!(results.0[0], TargetResult::Ok(json!(2)));
    match &results.0[1] {
        TargetResult::Ok(row) => assert_eq!(Value::from_json(row), row0()),
        other => panic!("expected row 0, got {:?}", other),
    }
    assert_eq!(
        results.0[2],
        TargetResult::Ok(json!(["All-Bran", "All-Bran with Extra Fiber"]))
    );
    match &results.0[3] {
        TargetResult::Error(e) => assert_eq!(e.error_kind, "NotFound"),
        other => panic!("expected a missing table, got {:?}", other),
    }

    // the named artifact is on disk for the next request
    let loaded = b.get("rich:latest");
    let results = client.execute(&[b.count(&loaded).unwrap()]).await.unwrap();
    assert_eq!(results.unwrap().unwrap(), vec![json!(2)]);
}
