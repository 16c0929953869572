//! Request handling: a serialized graph plus target ids in, one outcome per
//! target out. `serve` exposes it over TCP as newline delimited JSON.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value as Json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{Result, WeaveError};
use crate::exec::backend::Deadline;
use crate::exec::dag::NodeRef;
use crate::exec::datum::Datum;
use crate::exec::engines::{Engine, ExecOptions};
use crate::exec::registry::BUILTINS;
use crate::exec::serialize::Graphs;
use crate::ram::store::Store;
use crate::ram::types::Value;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOptions {
    pub listen_addr: String,
    /// Artifact directory. Artifacts live in memory when unset.
    pub store_dir: Option<PathBuf>,
    /// Return stored content instead of refs for ref-valued targets.
    pub deref_results: bool,
    #[serde(default)]
    pub exec: ExecOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            listen_addr: "127.0.0.1:9994".to_owned(),
            store_dir: None,
            deref_results: true,
            exec: ExecOptions::default(),
        }
    }
}

impl ServerOptions {
    /// Defaults overridden by `WEAVE_LISTEN_ADDR`, `WEAVE_STORE_DIR` and
    /// `WEAVE_DEREF_RESULTS`.
    pub fn from_env() -> Self {
        let mut opts = ServerOptions {
            exec: ExecOptions::from_env(),
            ..ServerOptions::default()
        };
        if let Ok(addr) = env::var("WEAVE_LISTEN_ADDR") {
            opts.listen_addr = addr;
        }
        if let Ok(dir) = env::var("WEAVE_STORE_DIR") {
            opts.store_dir = Some(PathBuf::from(dir));
        }
        if let Ok(deref) = env::var("WEAVE_DEREF_RESULTS") {
            opts.deref_results = !matches!(deref.as_str(), "0" | "false" | "no");
        }
        opts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub graphs: Graphs,
}

impl Request {
    pub fn for_targets(targets: &[NodeRef]) -> Self {
        Request {
            graphs: Graphs::from_targets(targets),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub target_id: usize,
    pub error_kind: String,
    pub message: String,
}

impl ErrorDescriptor {
    fn new(target_id: usize, e: &WeaveError) -> Self {
        ErrorDescriptor {
            target_id,
            error_kind: e.kind().to_owned(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetResult {
    Ok(Json),
    Error(ErrorDescriptor),
}

/// Outcomes in target order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Results(pub Vec<TargetResult>);

impl Results {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetResult> {
        self.0.iter()
    }

    /// Every payload, or the first failure.
    pub fn unwrap(self) -> std::result::Result<Vec<Json>, ErrorDescriptor> {
        self.0
            .into_iter()
            .map(|r| match r {
                TargetResult::Ok(json) => Ok(json),
                TargetResult::Error(e) => Err(e),
            })
            .collect()
    }
}

/// A failure that prevented reading the request at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestError {
    pub error_kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub results: Results,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RequestError>,
}

pub type SerializeFn = dyn Fn(&Value) -> Result<Json> + Send + Sync;

/// Plain JSON; tagged values become `{"_tag": .., "_value": ..}`.
pub fn make_js_serializer() -> Arc<SerializeFn> {
    Arc::new(|v: &Value| Ok(v.to_json()))
}

/// The lossless serde form of `Value`.
pub fn make_native_serializer() -> Arc<SerializeFn> {
    Arc::new(|v: &Value| Ok(serde_json::to_value(v)?))
}

fn materialize(engine: &Engine, datum: Datum, deref: bool, deadline: &Deadline) -> Result<Value> {
    match datum {
        Datum::Ref(artifact) if deref => engine.store().deref(&artifact),
        datum => datum.into_value(deadline),
    }
}

pub fn handle_request(
    engine: &Engine,
    request: &Request,
    deref: bool,
    serialize: &SerializeFn,
) -> Response {
    let target_ids = &request.graphs.target_nodes;
    let targets = match request.graphs.to_nodes() {
        Ok(targets) => targets,
        Err(e) => {
            warn!("Cannot read request graph: {}", e);
            return Response {
                results: Results(
                    target_ids
                        .iter()
                        .map(|&id| TargetResult::Error(ErrorDescriptor::new(id, &e)))
                        .collect(),
                ),
                error: Some(RequestError {
                    error_kind: e.kind().to_owned(),
                    message: e.to_string(),
                }),
            };
        }
    };
    let mut ctx = engine.context();
    let deadline = ctx.deadline();
    let results = engine
        .execute(&mut ctx, &targets)
        .into_iter()
        .zip(target_ids)
        .map(|(res, &id)| {
            match res
                .and_then(|d| materialize(engine, d, deref, &deadline))
                .and_then(|v| serialize(&v))
            {
                Ok(json) => TargetResult::Ok(json),
                Err(e) => TargetResult::Error(ErrorDescriptor::new(id, &e)),
            }
        })
        .collect();
    debug!(
        "Handled {} targets: {} ops resolved, {} pushdowns",
        targets.len(),
        ctx.stats.resolved,
        ctx.stats.pushdowns
    );
    Response {
        results: Results(results),
        error: None,
    }
}

pub struct ServerState {
    pub engine: Engine,
    pub options: ServerOptions,
    serializer: Arc<SerializeFn>,
}

impl ServerState {
    pub fn new(options: ServerOptions) -> Result<Arc<Self>> {
        let store = match &options.store_dir {
            Some(dir) => Store::open(dir)?,
            None => Store::in_memory(),
        };
        let engine = Engine::new(BUILTINS.clone(), Arc::new(store), options.exec.clone());
        Ok(ServerState::with_engine(engine, options))
    }

    pub fn with_engine(engine: Engine, options: ServerOptions) -> Arc<Self> {
        Arc::new(ServerState {
            engine,
            options,
            serializer: make_js_serializer(),
        })
    }

    pub fn handle_line(&self, line: &str) -> Response {
        match serde_json::from_str::<Request>(line) {
            Ok(request) => handle_request(
                &self.engine,
                &request,
                self.options.deref_results,
                &*self.serializer,
            ),
            Err(e) => {
                let e = WeaveError::from(e);
                warn!("Malformed request: {}", e);
                Response {
                    results: Results::default(),
                    error: Some(RequestError {
                        error_kind: e.kind().to_owned(),
                        message: e.to_string(),
                    }),
                }
            }
        }
    }
}

/// Binds `options.listen_addr` and serves until the listener fails.
pub async fn start(options: ServerOptions) -> Result<()> {
    let listener = TcpListener::bind(&options.listen_addr).await?;
    info!("Listening on {}", listener.local_addr()?);
    serve(listener, ServerState::new(options)?).await
}

pub async fn serve(listener: TcpListener, state: Arc<ServerState>) -> Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        info!("Accepted connection from {}", peer);
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, state).await {
                warn!("Connection from {} closed: {}", peer, e);
            }
        });
    }
}

async fn handle_connection(socket: TcpStream, state: Arc<ServerState>) -> Result<()> {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let state = state.clone();
        // each request evaluates synchronously in its own context
        let response = tokio::task::spawn_blocking(move || state.handle_line(&line))
            .await
            .map_err(|e| WeaveError::Backend(e.to_string()))?;
        let mut bytes = serde_json::to_vec(&response)?;
        bytes.push(b'\n');
        write.write_all(&bytes).await?;
    }
    Ok(())
}
