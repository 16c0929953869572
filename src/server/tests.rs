use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use super::*;
use crate::exec::dag::Node;
use crate::types::Type;

fn list(items: &[i64]) -> Value {
    Value::List(items.iter().map(|i| Value::Int(*i)).collect())
}

#[test]
pub fn results_follow_target_order() {
    let _ = env_logger::try_init();
    let engine = Engine::in_memory();
    let b = engine.builder();
    let arr = b.constant(list(&[4, 5, 6]));
    let count = b.count(&arr).unwrap();
    let second = b.index(&arr, 1).unwrap();
    let request = Request::for_targets(&[count, second]);
    let response = handle_request(&engine, &request, true, &*make_js_serializer());
    assert!(response.error.is_none());
    assert_eq!(response.results.unwrap().unwrap(), vec![json!(3), json!(5)]);
}

#[test]
pub fn failed_target_reports_its_own_error() {
    let _ = env_logger::try_init();
    let engine = Engine::in_memory();
    let b = engine.builder();
    let arr = b.constant(list(&[1, 2]));
    let count = b.count(&arr).unwrap();
    let broken = Node::output("no-such-op", vec![("arr".to_owned(), arr)], Type::Any);
    let request = Request::for_targets(&[count, broken]);
    let response = handle_request(&engine, &request, true, &*make_js_serializer());
    assert_eq!(response.results.len(), 2);
    assert_eq!(response.results.0[0], TargetResult::Ok(json!(2)));
    match &response.results.0[1] {
        TargetResult::Error(e) => {
            assert_eq!(e.target_id, request.graphs.target_nodes[1]);
            assert_eq!(e.error_kind, "OpResolutionError");
            assert!(e.message.contains("no-such-op"));
        }
        other => panic!("expected an error, got {:?}", other),
    }
    let err = response.results.unwrap().unwrap_err();
    assert_eq!(err.error_kind, "OpResolutionError");
}

#[test]
pub fn refs_are_dereferenced_on_request() {
    let _ = env_logger::try_init();
    let engine = Engine::in_memory();
    let b = engine.builder();
    let saved = b.save(&b.constant(list(&[7, 8]))).unwrap();
    let request = Request::for_targets(&[saved]);

    let deref = handle_request(&engine, &request, true, &*make_js_serializer());
    assert_eq!(deref.results.unwrap().unwrap(), vec![json!([7, 8])]);

    let raw = handle_request(&engine, &request, false, &*make_js_serializer());
    let payload = raw.results.unwrap().unwrap();
    let uri = payload[0].as_str().unwrap();
    assert_eq!(uri.len(), 64);
    assert_eq!(
        engine.use_value(&b.get(uri)).unwrap(),
        list(&[7, 8])
    );
}

#[test]
pub fn serializers_differ_on_tags() {
    let mut tags = crate::ram::types::Tags::new();
    tags.insert("source".to_owned(), Value::from("a.csv"));
    let value = Value::tagged(tags, Value::Int(1));
    let js = make_js_serializer()(&value).unwrap();
    assert_eq!(js, json!({"_tag": {"source": "a.csv"}, "_value": 1}));
    let native = make_native_serializer()(&value).unwrap();
    let back: Value = serde_json::from_value(native).unwrap();
    assert_eq!(back, value);
}

#[test]
pub fn malformed_request_is_a_request_error() {
    let _ = env_logger::try_init();
    let state = ServerState::with_engine(Engine::in_memory(), ServerOptions::default());
    let response = state.handle_line("{\"graphs\": 42}");
    assert!(response.results.is_empty());
    assert_eq!(response.error.unwrap().error_kind, "SerializationError");
}

#[test]
pub fn dangling_input_fails_every_target() {
    let _ = env_logger::try_init();
    let engine = Engine::in_memory();
    let request: Request = serde_json::from_value(json!({
        "graphs": {
            "nodes": [{
                "nodeType": "output",
                "type": "int",
                "fromOp": {"name": "count", "inputs": {"arr": 7}}
            }],
            "targetNodes": [0]
        }
    }))
    .unwrap();
    let response = handle_request(&engine, &request, true, &*make_js_serializer());
    assert_eq!(response.error.as_ref().unwrap().error_kind, "SerializationError");
    let err = response.results.unwrap().unwrap_err();
    assert_eq!(err.target_id, 0);
    assert_eq!(err.error_kind, "SerializationError");
}

#[test]
pub fn overly_deep_graph_is_a_request_error() {
    let _ = env_logger::try_init();
    let engine = Engine::in_memory();
    let mut nodes = vec![json!({"nodeType": "const", "type": "int", "val": 1})];
    for i in 1..=5_000usize {
        nodes.push(json!({
            "nodeType": "output",
            "type": "int",
            "fromOp": {"name": "+", "inputs": {"lhs": i - 1, "rhs": 0}}
        }));
    }
    let request: Request = serde_json::from_value(json!({
        "graphs": {"nodes": nodes, "targetNodes": [5_000]}
    }))
    .unwrap();
    let response = handle_request(&engine, &request, true, &*make_js_serializer());
    let error = response.error.unwrap();
    assert_eq!(error.error_kind, "SerializationError");
    assert!(error.message.contains("deeper"), "{}", error.message);
}

#[tokio::test(flavor = "multi_thread")]
pub async fn serves_newline_delimited_requests() {
    let _ = env_logger::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let engine = Engine::in_memory();
    let state = ServerState::with_engine(engine.clone(), ServerOptions::default());
    tokio::spawn(serve(listener, state));

    let b = engine.builder();
    let arr = b.constant(list(&[1, 2, 3, 4]));
    let request = Request::for_targets(&[b.count(&arr).unwrap(), b.limit(&arr, 2).unwrap()]);

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    for _ in 0..2 {
        let mut line = serde_json::to_string(&request).unwrap();
        line.push('\n');
        write.write_all(line.as_bytes()).await.unwrap();
        let reply = lines.next_line().await.unwrap().unwrap();
        let response: Response = serde_json::from_str(&reply).unwrap();
        assert_eq!(
            response.results.unwrap().unwrap(),
            vec![json!(4), json!([1, 2])]
        );
    }
}
