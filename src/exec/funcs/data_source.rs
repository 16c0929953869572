use std::path::{Component, Path, PathBuf};

use super::*;
use crate::exec::backend::frame::FrameTable;
use crate::exec::backend::sequence::SequenceTable;
use crate::exec::backend::sql::SqlConnection;
use crate::exec::backend::TableBackend;

const DELIMITER: &str = "delimiter";

fn file_input(call: &Call<'_>, name: &str) -> Result<PathBuf> {
    match call.input(name)? {
        Datum::Resource(Resource::File(p)) => Ok(p.clone()),
        other => Err(WeaveError::execution(
            call.op,
            format!("expected a local file, got {:?}", other),
        )),
    }
}

fn delimiter(call: &Call<'_>) -> Result<u8> {
    match call.config_str(DELIMITER) {
        None => Ok(b','),
        Some(d) if d.len() == 1 => Ok(d.as_bytes()[0]),
        Some(d) => Err(WeaveError::execution(
            call.op,
            format!("delimiter must be a single byte, got {:?}", d),
        )),
    }
}

fn single_char_delimiter(config: &Value) -> bool {
    match config {
        Value::Dict(d) => matches!(
            d.get(DELIMITER).and_then(Value::as_str),
            Some(s) if s.len() == 1
        ),
        _ => false,
    }
}

pub struct LocalPath;
impl Function for LocalPath {
    fn func_type(&self) -> FuncType {
        FuncType::DataSource
    }
    fn signature(&self) -> Signature {
        Signature::new([("path", Type::String)])
    }
    fn output_type(&self, _args: &TypeArgs<'_>) -> Type {
        Type::LocalFile
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        Ok(Datum::Resource(Resource::File(PathBuf::from(
            call.string("path")?,
        ))))
    }
}

pub struct LocalDir;
impl Function for LocalDir {
    fn func_type(&self) -> FuncType {
        FuncType::DataSource
    }
    fn signature(&self) -> Signature {
        Signature::new([("path", Type::String)])
    }
    fn output_type(&self, _args: &TypeArgs<'_>) -> Type {
        Type::LocalDir
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        Ok(Datum::Resource(Resource::Dir(PathBuf::from(
            call.string("path")?,
        ))))
    }
}

/// A named file inside a directory. Missing files give null rather than
/// an error.
pub struct DirFile;
impl Function for DirFile {
    fn func_type(&self) -> FuncType {
        FuncType::DataSource
    }
    fn signature(&self) -> Signature {
        Signature::new([("dir", Type::LocalDir), ("path", Type::String)])
    }
    fn output_type(&self, _args: &TypeArgs<'_>) -> Type {
        Type::optional(Type::LocalFile)
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        let dir = match call.input("dir")? {
            Datum::Resource(Resource::Dir(p)) => p.clone(),
            other => {
                return Err(WeaveError::execution(
                    call.op,
                    format!("expected a local dir, got {:?}", other),
                ))
            }
        };
        let name = Path::new(call.string("path")?);
        let escapes = name
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        let path = dir.join(name);
        if escapes || !path.is_file() {
            debug!("No file {:?} in {:?}", name, dir);
            return Ok(Datum::Value(Value::Null));
        }
        Ok(Datum::Resource(Resource::File(path)))
    }
}

/// CSV rows as an in-memory sequence.
pub struct ReadCsv;
impl Function for ReadCsv {
    fn func_type(&self) -> FuncType {
        FuncType::DataSource
    }
    fn signature(&self) -> Signature {
        Signature::new([("file", Type::LocalFile)])
    }
    fn output_type(&self, _args: &TypeArgs<'_>) -> Type {
        Type::list(Type::Any)
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        let frame = FrameTable::read_csv(file_input(call, "file")?, delimiter(call)?)?;
        let object_type = frame.object_type();
        let rows = frame.rows(&call.deadline)?;
        Ok(Datum::Table(Arc::new(SequenceTable::with_type(
            rows,
            object_type,
        ))))
    }
    fn refine_output_type(&self, call: &mut Call<'_>) -> Option<Result<Type>> {
        Some(read_schema(call))
    }
    fn default_config(&self) -> Option<Value> {
        Some(row! { DELIMITER => "," })
    }
    fn set_config(&self, old: Option<&Value>, _input: &NodeRef, new: Value) -> Option<Value> {
        if single_char_delimiter(&new) {
            Some(new)
        } else {
            debug!("Ignoring csv config {}", new);
            old.cloned()
        }
    }
}

/// CSV rows as an arrow frame.
pub struct ReadCsvFrame;
impl Function for ReadCsvFrame {
    fn func_type(&self) -> FuncType {
        FuncType::DataSource
    }
    fn signature(&self) -> Signature {
        Signature::new([("file", Type::LocalFile)])
    }
    fn output_type(&self, _args: &TypeArgs<'_>) -> Type {
        Type::list(Type::Any)
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        let frame = FrameTable::read_csv(file_input(call, "file")?, delimiter(call)?)?;
        Ok(Datum::Table(Arc::new(frame)))
    }
    fn refine_output_type(&self, call: &mut Call<'_>) -> Option<Result<Type>> {
        Some(read_schema(call))
    }
    fn default_config(&self) -> Option<Value> {
        Some(row! { DELIMITER => "," })
    }
    fn set_config(&self, old: Option<&Value>, input: &NodeRef, new: Value) -> Option<Value> {
        ReadCsv.set_config(old, input, new)
    }
}

fn read_schema(call: &Call<'_>) -> Result<Type> {
    let frame = FrameTable::read_csv(file_input(call, "file")?, delimiter(call)?)?;
    Ok(Type::list(frame.object_type()))
}

pub struct SqlConnect;
impl Function for SqlConnect {
    fn func_type(&self) -> FuncType {
        FuncType::DataSource
    }
    fn signature(&self) -> Signature {
        Signature::new([("uri", Type::String)])
    }
    fn output_type(&self, _args: &TypeArgs<'_>) -> Type {
        Type::SqlConnection
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        Ok(Datum::Resource(Resource::Sql(SqlConnection::open(
            call.string("uri")?,
        )?)))
    }
}

pub struct SqlTableOp;
impl SqlTableOp {
    fn open(call: &Call<'_>) -> Result<crate::exec::backend::sql::SqlTable> {
        let name = call.string("name")?;
        match call.input("conn")? {
            Datum::Resource(Resource::Sql(conn)) => conn.table(name),
            other => Err(WeaveError::execution(
                call.op,
                format!("expected a sql connection, got {:?}", other),
            )),
        }
    }
}

impl Function for SqlTableOp {
    fn func_type(&self) -> FuncType {
        FuncType::DataSource
    }
    fn signature(&self) -> Signature {
        Signature::new([("conn", Type::SqlConnection), ("name", Type::String)])
    }
    fn output_type(&self, _args: &TypeArgs<'_>) -> Type {
        Type::list(Type::Any)
    }
    fn resolve(&self, call: &mut Call<'_>) -> Result<Datum> {
        Ok(Datum::Table(Arc::new(SqlTableOp::open(call)?)))
    }
    fn refine_output_type(&self, call: &mut Call<'_>) -> Option<Result<Type>> {
        Some(SqlTableOp::open(call).map(|t| Type::list(t.object_type())))
    }
}
