//! SQLite backend. Table ops accumulate as steps and are rendered into one
//! nested statement only when a terminal primitive needs rows.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection, ErrorCode};

use super::sequence::SequenceTable;
use super::*;
use crate::query::expr::BinOp;
use crate::query::sql::{
    compile, compile_predicate, compile_projection, quote_ident, select_list, Params, Shape, ROWID_COLUMN,
    VALUE_COLUMN,
};

/// Statements between progress handler callbacks.
const PROGRESS_OPS: i32 = 1000;

lazy_static! {
    static ref CONNECTIONS: Mutex<HashMap<String, SqlConnection>> = Mutex::new(HashMap::new());
}

/// A shared SQLite connection. Opening the same uri twice yields the same
/// connection.
#[derive(Clone)]
pub struct SqlConnection {
    uri: String,
    conn: Arc<Mutex<Connection>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl fmt::Debug for SqlConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SqlConnection({})", self.uri)
    }
}

impl SqlConnection {
    /// Accepts `sqlite:///path/to.db`, `:memory:` or a plain path.
    pub fn open(uri: &str) -> Result<Self> {
        let mut connections = CONNECTIONS.lock();
        if let Some(conn) = connections.get(uri) {
            return Ok(conn.clone());
        }
        let path = uri.strip_prefix("sqlite://").unwrap_or(uri);
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        info!("Opened sql connection {}", uri);
        let conn = SqlConnection {
            uri: uri.to_owned(),
            conn: Arc::new(Mutex::new(conn)),
            log: Arc::new(Mutex::new(vec![])),
        };
        connections.insert(uri.to_owned(), conn.clone());
        Ok(conn)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Statements issued for table data since the last `clear_log`.
    pub fn query_log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear()
    }

    pub fn table(&self, name: &str) -> Result<SqlTable> {
        let conn = self.conn.lock();
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(WeaveError::NotFound(format!("table {} in {}", name, self.uri)));
        }
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(name)))?;
        let columns = stmt
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let decl: String = row.get(2)?;
                Ok((name, declared_type(&decl)))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(SqlTable {
            conn: self.clone(),
            name: name.to_owned(),
            base: Shape::Dict(columns),
            steps: vec![],
        })
    }

    fn query<T>(
        &self,
        sql: &str,
        params: &Params,
        deadline: &Deadline,
        mut f: impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>> {
        deadline.check()?;
        debug!("{}: {}", self.uri, sql);
        self.log.lock().push(sql.to_owned());
        let conn = self.conn.lock();
        if let Some(at) = deadline.at() {
            conn.progress_handler(PROGRESS_OPS, Some(move || Instant::now() >= at));
        }
        let res = conn.prepare(sql).and_then(|mut stmt| {
            let rows = stmt.query_map(params_from_iter(params.values().iter()), |r| f(r))?;
            let collected = rows.collect::<rusqlite::Result<Vec<T>>>();
            collected
        });
        if deadline.at().is_some() {
            conn.progress_handler(0, None::<fn() -> bool>);
        }
        res.map_err(|e| {
            let interrupted = matches!(
                &e,
                rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::OperationInterrupted
            );
            if interrupted {
                deadline.timeout()
            } else {
                e.into()
            }
        })
    }
}

fn declared_type(decl: &str) -> Type {
    let decl = decl.to_ascii_uppercase();
    if decl.contains("BOOL") {
        Type::Boolean
    } else if decl.contains("INT") {
        Type::Int
    } else if decl.contains("REAL") || decl.contains("FLOA") || decl.contains("DOUB") {
        Type::Float
    } else if decl.contains("CHAR") || decl.contains("TEXT") || decl.contains("CLOB") {
        Type::String
    } else {
        Type::Any
    }
}

fn decode(value: ValueRef<'_>, ty: &Type) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) if *ty.untagged() == Type::Boolean => Value::Bool(i != 0),
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) | ValueRef::Blob(t) => {
            Value::String(String::from_utf8_lossy(t).into_owned())
        }
    }
}

fn decode_row(row: &rusqlite::Row<'_>, shape: &Shape) -> rusqlite::Result<Value> {
    Ok(match shape {
        Shape::Scalar(ty) => decode(row.get_ref(0)?, ty),
        Shape::Dict(columns) => {
            let mut fields = crate::ram::types::Map::with_capacity(columns.len());
            for (i, (name, ty)) in columns.iter().enumerate() {
                fields.insert(name.clone(), decode(row.get_ref(i)?, ty));
            }
            Value::Dict(fields)
        }
    })
}

/// A lazily built query over one SQLite table.
#[derive(Clone)]
pub struct SqlTable {
    conn: SqlConnection,
    name: String,
    base: Shape,
    steps: Vec<Step>,
}

impl SqlTable {
    pub fn connection(&self) -> &SqlConnection {
        &self.conn
    }

    /// Renders the accumulated steps as a subquery that also carries the
    /// source `__rowid`.
    fn source(&self, params: &mut Params) -> Option<(String, Shape)> {
        let mut shape = self.base.clone();
        let mut sql = format!(
            "SELECT rowid AS {}, {} FROM {}",
            ROWID_COLUMN,
            select_list(&shape),
            quote_ident(&self.name)
        );
        for (i, step) in self.steps.iter().enumerate() {
            sql = match step {
                Step::Filter(e) => format!(
                    "SELECT * FROM ({}) AS t{} WHERE {}",
                    sql,
                    i,
                    compile_predicate(e, &shape, params)?
                ),
                Step::Map(e) => {
                    let (projection, next) = compile_projection(e, &shape, params)?;
                    shape = next;
                    format!("SELECT {}, {} FROM ({}) AS t{}", ROWID_COLUMN, projection, sql, i)
                }
                Step::Pick(key) => {
                    let (column, ty) = match &shape {
                        Shape::Dict(columns) => match columns.iter().find(|(c, _)| c == key) {
                            Some((c, ty)) => (quote_ident(c), ty.clone()),
                            None => ("NULL".to_owned(), Type::None),
                        },
                        Shape::Scalar(_) => ("NULL".to_owned(), Type::None),
                    };
                    shape = Shape::Scalar(ty);
                    format!(
                        "SELECT {}, {} AS {} FROM ({}) AS t{}",
                        ROWID_COLUMN,
                        column,
                        quote_ident(VALUE_COLUMN),
                        sql,
                        i
                    )
                }
                Step::Limit(n) => format!(
                    "SELECT * FROM ({}) AS t{} ORDER BY {} LIMIT {}",
                    sql, i, ROWID_COLUMN, n
                ),
                Step::Index(_) | Step::Count | Step::GroupBy(_) => return None,
            };
        }
        Some((sql, shape))
    }

    fn shape(&self) -> Shape {
        let mut params = Params::new();
        self.source(&mut params)
            .map(|(_, shape)| shape)
            .unwrap_or_else(|| Shape::Scalar(Type::Any))
    }

    /// Appends `step` if it renders to SQL against the current shape.
    fn push(&self, step: Step) -> Option<SqlTable> {
        let mut next = self.clone();
        next.steps.push(step);
        let mut params = Params::new();
        next.source(&mut params)?;
        Some(next)
    }

    fn compiled(&self) -> Result<(String, Shape, Params)> {
        let mut params = Params::new();
        let (sql, shape) = self.source(&mut params).ok_or_else(|| {
            WeaveError::Backend(format!("cannot render query over {}", self.name))
        })?;
        Ok((sql, shape, params))
    }

    fn select_rows(&self, suffix: &str, deadline: &Deadline) -> Result<Vec<Value>> {
        let (source, shape, params) = self.compiled()?;
        let sql = format!(
            "SELECT {} FROM ({}) AS r ORDER BY {}{}",
            select_list(&shape),
            source,
            ROWID_COLUMN,
            suffix
        );
        self.conn
            .query(&sql, &params, deadline, |row| decode_row(row, &shape))
    }

    /// Rows pulled into memory for ops with no SQL rendering.
    fn materialize(&self, deadline: &Deadline) -> Result<SequenceTable> {
        debug!("Materializing {} for a row-wise op", self.name);
        Ok(SequenceTable::with_type(
            self.rows(deadline)?,
            self.object_type(),
        ))
    }
}

impl TableBackend for SqlTable {
    fn kind(&self) -> &'static str {
        "sql"
    }

    fn object_type(&self) -> Type {
        self.shape().row_type()
    }

    fn count(&self, deadline: &Deadline) -> Result<usize> {
        let (source, _, params) = self.compiled()?;
        let sql = format!("SELECT COUNT(*) FROM ({}) AS c", source);
        let counts = self
            .conn
            .query(&sql, &params, deadline, |row| row.get::<_, i64>(0))?;
        Ok(counts.first().copied().unwrap_or(0) as usize)
    }

    fn index(&self, i: usize, deadline: &Deadline) -> Result<Value> {
        let rows = self.select_rows(&format!(" LIMIT 1 OFFSET {}", i), deadline)?;
        Ok(rows.into_iter().next().unwrap_or(Value::Null))
    }

    fn pick(&self, key: &str, deadline: &Deadline) -> Result<Table> {
        match self.push(Step::Pick(key.to_owned())) {
            Some(t) => Ok(Arc::new(t)),
            None => self.materialize(deadline)?.pick(key, deadline),
        }
    }

    fn filter(&self, predicate: RowFn, deadline: &Deadline) -> Result<Table> {
        if let Some(t) = predicate.expr().and_then(|e| self.push(Step::Filter(e.clone()))) {
            return Ok(Arc::new(t));
        }
        self.materialize(deadline)?.filter(predicate, deadline)
    }

    fn map(&self, f: RowFn, deadline: &Deadline) -> Result<Table> {
        if let Some(t) = f.expr().and_then(|e| self.push(Step::Map(e.clone()))) {
            return Ok(Arc::new(t));
        }
        self.materialize(deadline)?.map(f, deadline)
    }

    fn groupby(&self, key: RowFn, deadline: &Deadline) -> Result<GroupResult> {
        let Some(key_expr) = key.expr().cloned() else {
            return self.materialize(deadline)?.groupby(key, deadline);
        };
        let (source, shape, mut params) = self.compiled()?;
        // members are selected with `key IS k`, which needs a typed key
        let null_member =
            RowExpr::binary(BinOp::Is, key_expr.clone(), RowExpr::Const(Value::Null));
        let key_sql = match compile(&key_expr, &shape, &mut params) {
            Some(sql) if self.push(Step::Filter(null_member)).is_some() => sql,
            _ => return self.materialize(deadline)?.groupby(key, deadline),
        };
        let key_type = key_expr.output_type(&shape.row_type());
        let sql = format!(
            "SELECT {} AS __key, MIN({}) AS __first FROM ({}) AS g GROUP BY __key ORDER BY __first",
            key_sql, ROWID_COLUMN, source
        );
        let keys = self.conn.query(&sql, &params, deadline, |row| {
            Ok(decode(row.get_ref(0)?, &key_type))
        })?;
        let mut groups = Vec::with_capacity(keys.len());
        for k in keys {
            let member_filter =
                RowExpr::binary(BinOp::Is, key_expr.clone(), RowExpr::Const(k.clone()));
            let members = self.push(Step::Filter(member_filter)).ok_or_else(|| {
                WeaveError::Backend(format!("cannot render group {} of {}", k, self.name))
            })?;
            groups.push(Group {
                key: k,
                members: Arc::new(members),
            });
        }
        Ok(GroupResult::new(
            Type::merge_all(groups.iter().map(|g| Type::of(&g.key))),
            shape.row_type(),
            groups,
        ))
    }

    fn limit(&self, n: usize, deadline: &Deadline) -> Result<Table> {
        match self.push(Step::Limit(n)) {
            Some(t) => Ok(Arc::new(t)),
            None => self.materialize(deadline)?.limit(n, deadline),
        }
    }

    fn rows(&self, deadline: &Deadline) -> Result<Vec<Value>> {
        self.select_rows("", deadline)
    }
}
