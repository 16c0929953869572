//! Clients submitting graphs for execution. `LocalClient` evaluates in
//! process; `RemoteClient` talks to a server started with `server::serve`.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;

use crate::error::{Result, WeaveError};
use crate::exec::dag::NodeRef;
use crate::exec::engines::Engine;
use crate::server::{
    handle_request, make_native_serializer, Request, Response, Results, SerializeFn,
};


pub struct LocalClient {
    engine: Engine,
    deref: bool,
    serializer: Arc<SerializeFn>,
}

impl LocalClient {
    pub fn new(engine: Engine) -> Self {
        LocalClient {
            engine,
            deref: true,
            serializer: make_native_serializer(),
        }
    }

    pub fn with_deref(mut self, deref: bool) -> Self {
        self.deref = deref;
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<SerializeFn>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Goes through the same serialize and deserialize path as a remote
    /// request.
    pub fn execute(&self, targets: &[NodeRef]) -> Results {
        let request = Request::for_targets(targets);
        handle_request(&self.engine, &request, self.deref, &*self.serializer).results
    }
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// One connection; concurrent `execute` calls are serialized on it.
pub struct RemoteClient {
    conn: Mutex<Connection>,
}

impl RemoteClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read, writer) = stream.into_split();
        Ok(RemoteClient {
            conn: Mutex::new(Connection {
                reader: BufReader::new(read),
                writer,
            }),
        })
    }

    pub async fn execute(&self, targets: &[NodeRef]) -> Result<Results> {
        let mut line = serde_json::to_string(&Request::for_targets(targets))?;
        line.push('\n');
        let mut conn = self.conn.lock().await;
        conn.writer.write_all(line.as_bytes()).await?;
        let mut reply = String::new();
        if conn.reader.read_line(&mut reply).await? == 0 {
            return Err(WeaveError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            )));
        }
        let response: Response = serde_json::from_str(&reply)?;
        match response.error {
            Some(e) => Err(WeaveError::Serialization(format!(
                "{}: {}",
                e.error_kind, e.message
            ))),
            None => Ok(response.results),
        }
    }
}
