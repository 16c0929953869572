//! Columnar backend over arrow record batches. Row expressions are
//! evaluated with arrow kernels when every part has one; anything else is
//! applied row by row.

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use arrow::array::{
    new_null_array, Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray,
    UInt32Array,
};
use arrow::compute::kernels::boolean::{and_kleene, not, or_kleene};
use arrow::compute::kernels::cmp::{eq, gt, gt_eq, lt, lt_eq, neq};
use arrow::compute::kernels::numeric::{add, mul, sub};
use arrow::compute::{cast, concat_batches, filter_record_batch, take_record_batch};
use arrow::csv::reader::Format;
use arrow::csv::ReaderBuilder;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use indexmap::IndexMap;

use super::sequence::SequenceTable;
use super::*;
use crate::query::expr::{compare_values, BinOp};
use crate::ram::types::Map;

const SERIES_COLUMN: &str = "__value";
const SCHEMA_INFERENCE_ROWS: usize = 1000;

#[derive(Debug, Clone)]
pub struct FrameTable {
    batch: RecordBatch,
    /// Rows are the bare values of the single column instead of dicts.
    series: bool,
}

impl FrameTable {
    pub fn new(batch: RecordBatch) -> Result<Self> {
        Ok(FrameTable {
            batch: normalize(batch)?,
            series: false,
        })
    }

    pub fn series(array: ArrayRef) -> Result<Self> {
        let schema = Schema::new(vec![Field::new(SERIES_COLUMN, array.data_type().clone(), true)]);
        Ok(FrameTable {
            batch: normalize(RecordBatch::try_new(Arc::new(schema), vec![array])?)?,
            series: true,
        })
    }

    /// Columnar copy of `rows`, `None` when they do not fit a flat schema.
    pub fn from_rows(rows: &[Value]) -> Option<Result<Self>> {
        if rows.is_empty() {
            return None;
        }
        if rows.iter().all(|r| matches!(r, Value::Dict(_))) {
            let mut columns: Map<String, Vec<&Value>> = Map::new();
            for (i, row) in rows.iter().enumerate() {
                if let Value::Dict(fields) = row {
                    for (k, v) in fields {
                        columns
                            .entry(k.clone())
                            .or_insert_with(|| vec![&Value::Null; i])
                            .push(v);
                    }
                }
                for values in columns.values_mut() {
                    values.resize(i + 1, &Value::Null);
                }
            }
            if columns.is_empty() {
                return None;
            }
            let mut fields = Vec::with_capacity(columns.len());
            let mut arrays = Vec::with_capacity(columns.len());
            for (name, values) in columns {
                let array = build_array(&values)?;
                fields.push(Field::new(name, array.data_type().clone(), true));
                arrays.push(array);
            }
            return Some(
                RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
                    .map_err(Into::into)
                    .and_then(FrameTable::new),
            );
        }
        let values = rows.iter().collect::<Vec<_>>();
        Some(FrameTable::series(build_array(&values)?))
    }

    pub fn read_csv<P: AsRef<Path>>(path: P, delimiter: u8) -> Result<Self> {
        let mut file = File::open(path.as_ref())?;
        let format = Format::default()
            .with_header(true)
            .with_delimiter(delimiter);
        let (schema, _) = format.infer_schema(&mut file, Some(SCHEMA_INFERENCE_ROWS))?;
        file.seek(SeekFrom::Start(0))?;
        let schema = Arc::new(schema);
        let reader = ReaderBuilder::new(schema.clone())
            .with_header(true)
            .with_delimiter(delimiter)
            .build(file)?;
        let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
        debug!(
            "Read {} batches from {:?}",
            batches.len(),
            path.as_ref()
        );
        FrameTable::new(concat_batches(&schema, &batches)?)
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    fn len(&self) -> usize {
        self.batch.num_rows()
    }

    fn row(&self, i: usize) -> Value {
        if self.series {
            return cell(self.batch.column(0), i);
        }
        let schema = self.batch.schema();
        Value::Dict(
            schema
                .fields()
                .iter()
                .zip(self.batch.columns())
                .map(|(f, c)| (f.name().clone(), cell(c, i)))
                .collect(),
        )
    }

    fn with_batch(&self, batch: RecordBatch) -> Table {
        Arc::new(FrameTable {
            batch,
            series: self.series,
        })
    }

    /// Evaluates `expr` with arrow kernels. `Ok(None)` when some part of it
    /// has no kernel.
    fn columnar(&self, expr: &RowExpr) -> Result<Option<ArrayRef>> {
        let n = self.len();
        Ok(match expr {
            RowExpr::Row if self.series => Some(self.batch.column(0).clone()),
            RowExpr::Pick(inner, key) if **inner == RowExpr::Row && !self.series => {
                self.batch.column_by_name(key).cloned()
            }
            RowExpr::Const(v) => constant_array(v, n),
            RowExpr::Not(inner) => match self.columnar(inner)? {
                Some(a) => a
                    .as_any()
                    .downcast_ref::<BooleanArray>()
                    .map(not)
                    .transpose()?
                    .map(|b| Arc::new(b) as ArrayRef),
                None => None,
            },
            RowExpr::Binary(op, lhs, rhs) => {
                let (Some(l), Some(r)) = (self.columnar(lhs)?, self.columnar(rhs)?) else {
                    return Ok(None);
                };
                binary_kernel(*op, l, r)?
            }
            _ => None,
        })
    }

    fn eval_rows(&self, f: &RowFn, deadline: &Deadline) -> Result<Vec<Value>> {
        let mut out = Vec::with_capacity(self.len());
        for i in 0..self.len() {
            deadline.check()?;
            out.push(f.call(&self.row(i), i)?);
        }
        Ok(out)
    }

    fn eval(&self, f: &RowFn, deadline: &Deadline) -> Result<Evaluated> {
        if let Some(expr) = f.expr() {
            if let Some(array) = self.columnar(expr)? {
                return Ok(Evaluated::Column(array));
            }
            trace!("Row-wise fallback for {}", expr);
        }
        Ok(Evaluated::Rows(self.eval_rows(f, deadline)?))
    }
}

enum Evaluated {
    Column(ArrayRef),
    Rows(Vec<Value>),
}

impl TableBackend for FrameTable {
    fn kind(&self) -> &'static str {
        "frame"
    }

    fn object_type(&self) -> Type {
        let schema = self.batch.schema();
        if self.series {
            return arrow_type(schema.field(0).data_type());
        }
        Type::dict(
            schema
                .fields()
                .iter()
                .map(|f| (f.name().clone(), arrow_type(f.data_type()))),
        )
    }

    fn count(&self, _deadline: &Deadline) -> Result<usize> {
        Ok(self.len())
    }

    fn index(&self, i: usize, _deadline: &Deadline) -> Result<Value> {
        Ok(if i < self.len() {
            self.row(i)
        } else {
            Value::Null
        })
    }

    fn pick(&self, key: &str, _deadline: &Deadline) -> Result<Table> {
        let column = match self.batch.column_by_name(key) {
            Some(c) if !self.series => c.clone(),
            _ => new_null_array(&DataType::Null, self.len()),
        };
        Ok(Arc::new(FrameTable::series(column)?))
    }

    fn filter(&self, predicate: RowFn, deadline: &Deadline) -> Result<Table> {
        let mask = match self.eval(&predicate, deadline)? {
            Evaluated::Column(a) => match a.as_any().downcast_ref::<BooleanArray>() {
                Some(mask) => mask.clone(),
                None => BooleanArray::from(vec![false; self.len()]),
            },
            Evaluated::Rows(values) => values.iter().map(|v| Some(v.truthy())).collect(),
        };
        Ok(self.with_batch(filter_record_batch(&self.batch, &mask)?))
    }

    fn map(&self, f: RowFn, deadline: &Deadline) -> Result<Table> {
        if let Some(RowExpr::Dict(fields)) = f.expr() {
            let mut columns = Vec::with_capacity(fields.len());
            for (name, field) in fields {
                match self.columnar(field)? {
                    Some(a) => columns.push((name.clone(), a)),
                    None => break,
                }
            }
            if columns.len() == fields.len() && !columns.is_empty() {
                let schema = Schema::new(
                    columns
                        .iter()
                        .map(|(n, a)| Field::new(n.as_str(), a.data_type().clone(), true))
                        .collect::<Vec<_>>(),
                );
                let arrays = columns.into_iter().map(|(_, a)| a).collect();
                return Ok(Arc::new(FrameTable::new(RecordBatch::try_new(
                    Arc::new(schema),
                    arrays,
                )?)?));
            }
        }
        match self.eval(&f, deadline)? {
            Evaluated::Column(a) => Ok(Arc::new(FrameTable::series(a)?)),
            Evaluated::Rows(values) => match FrameTable::from_rows(&values) {
                Some(frame) => Ok(Arc::new(frame?)),
                None => Ok(SequenceTable::table(values)),
            },
        }
    }

    /// Groups come out sorted by key, and grouping on a plain column drops
    /// that column from the members.
    fn groupby(&self, key: RowFn, deadline: &Deadline) -> Result<GroupResult> {
        let keys = match self.eval(&key, deadline)? {
            Evaluated::Column(a) => (0..a.len()).map(|i| cell(&a, i)).collect(),
            Evaluated::Rows(values) => values,
        };
        let mut groups: IndexMap<Vec<u8>, (Value, Vec<u32>)> = IndexMap::new();
        for (i, k) in keys.into_iter().enumerate() {
            groups
                .entry(k.group_key()?)
                .or_insert_with(|| (k, vec![]))
                .1
                .push(i as u32);
        }
        let mut groups = groups.into_values().collect::<Vec<_>>();
        groups.sort_by(|(a, _), (b, _)| {
            compare_values(a, b).unwrap_or(std::cmp::Ordering::Equal)
        });
        let dropped = match key.expr().and_then(RowExpr::column) {
            Some(col) if !self.series => self.batch.schema().index_of(col).ok(),
            _ => None,
        };
        let projection = dropped.map(|d| {
            (0..self.batch.num_columns())
                .filter(|c| *c != d)
                .collect::<Vec<_>>()
        });
        let mut members = Vec::with_capacity(groups.len());
        let mut key_types = Vec::with_capacity(groups.len());
        for (k, indices) in groups {
            deadline.check()?;
            let mut batch = take_record_batch(&self.batch, &UInt32Array::from(indices))?;
            if let Some(projection) = &projection {
                batch = batch.project(projection)?;
            }
            key_types.push(Type::of(&k));
            members.push(Group {
                key: k,
                members: self.with_batch(batch),
            });
        }
        let object_type = match &projection {
            Some(projection) => FrameTable {
                batch: self.batch.project(projection)?,
                series: false,
            }
            .object_type(),
            None => self.object_type(),
        };
        Ok(GroupResult::new(
            Type::merge_all(key_types),
            object_type,
            members,
        ))
    }

    fn limit(&self, n: usize, _deadline: &Deadline) -> Result<Table> {
        Ok(self.with_batch(self.batch.slice(0, n.min(self.len()))))
    }

    fn rows(&self, deadline: &Deadline) -> Result<Vec<Value>> {
        let mut rows = Vec::with_capacity(self.len());
        for i in 0..self.len() {
            if i % 1024 == 0 {
                deadline.check()?;
            }
            rows.push(self.row(i));
        }
        Ok(rows)
    }
}

/// Casts columns to the handful of arrow types rows are read from.
fn normalize(batch: RecordBatch) -> Result<RecordBatch> {
    let schema = batch.schema();
    if schema.fields().iter().all(|f| is_normal(f.data_type())) {
        return Ok(batch);
    }
    let mut fields = Vec::with_capacity(batch.num_columns());
    let mut columns = Vec::with_capacity(batch.num_columns());
    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        let target = match field.data_type() {
            t if is_normal(t) => t.clone(),
            t if t.is_integer() => DataType::Int64,
            t if t.is_floating() => DataType::Float64,
            _ => DataType::Utf8,
        };
        columns.push(cast(column, &target)?);
        fields.push(Field::new(field.name(), target, true));
    }
    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
}

fn is_normal(t: &DataType) -> bool {
    matches!(
        t,
        DataType::Null | DataType::Boolean | DataType::Int64 | DataType::Float64 | DataType::Utf8
    )
}

fn arrow_type(t: &DataType) -> Type {
    match t {
        DataType::Null => Type::None,
        DataType::Boolean => Type::Boolean,
        DataType::Int64 => Type::Int,
        DataType::Float64 => Type::Float,
        DataType::Utf8 => Type::String,
        _ => Type::Any,
    }
}

fn cell(array: &ArrayRef, i: usize) -> Value {
    if array.is_null(i) {
        return Value::Null;
    }
    let any = array.as_any();
    let value = match array.data_type() {
        DataType::Int64 => any.downcast_ref::<Int64Array>().map(|a| Value::Int(a.value(i))),
        DataType::Float64 => any
            .downcast_ref::<Float64Array>()
            .map(|a| Value::Float(a.value(i))),
        DataType::Boolean => any
            .downcast_ref::<BooleanArray>()
            .map(|a| Value::Bool(a.value(i))),
        DataType::Utf8 => any
            .downcast_ref::<StringArray>()
            .map(|a| Value::from(a.value(i))),
        _ => None,
    };
    value.unwrap_or(Value::Null)
}

fn constant_array(v: &Value, n: usize) -> Option<ArrayRef> {
    let array: ArrayRef = match v.untagged() {
        Value::Int(i) => Arc::new(Int64Array::from(vec![*i; n])),
        Value::Float(f) => Arc::new(Float64Array::from(vec![*f; n])),
        Value::Bool(b) => Arc::new(BooleanArray::from(vec![*b; n])),
        Value::String(s) => Arc::new(StringArray::from(vec![s.as_str(); n])),
        _ => return None,
    };
    Some(array)
}

/// A flat arrow array for scalar values, `None` for mixed or nested ones.
fn build_array(values: &[&Value]) -> Option<ArrayRef> {
    let mut int = false;
    let mut float = false;
    let mut boolean = false;
    let mut string = false;
    for v in values {
        match v {
            Value::Null => {}
            Value::Int(_) => int = true,
            Value::Float(_) => float = true,
            Value::Bool(_) => boolean = true,
            Value::String(_) => string = true,
            _ => return None,
        }
    }
    let array: ArrayRef = match (int || float, boolean, string) {
        (false, false, false) => new_null_array(&DataType::Null, values.len()),
        (true, false, false) if !float => Arc::new(Int64Array::from(
            values.iter().map(|v| v.as_i64()).collect::<Vec<_>>(),
        )),
        (true, false, false) => Arc::new(Float64Array::from(
            values.iter().map(|v| v.as_f64()).collect::<Vec<_>>(),
        )),
        (false, true, false) => Arc::new(BooleanArray::from(
            values.iter().map(|v| v.as_bool()).collect::<Vec<_>>(),
        )),
        (false, false, true) => Arc::new(StringArray::from(
            values.iter().map(|v| v.as_str()).collect::<Vec<_>>(),
        )),
        _ => return None,
    };
    Some(array)
}

fn is_numeric(t: &DataType) -> bool {
    matches!(t, DataType::Int64 | DataType::Float64)
}

fn binary_kernel(op: BinOp, l: ArrayRef, r: ArrayRef) -> Result<Option<ArrayRef>> {
    let (lt_, rt_) = (l.data_type().clone(), r.data_type().clone());
    if matches!(op, BinOp::And | BinOp::Or) {
        let (Some(a), Some(b)) = (
            l.as_any().downcast_ref::<BooleanArray>(),
            r.as_any().downcast_ref::<BooleanArray>(),
        ) else {
            return Ok(None);
        };
        let res = if op == BinOp::And {
            and_kleene(a, b)?
        } else {
            or_kleene(a, b)?
        };
        return Ok(Some(Arc::new(res)));
    }
    let (l, r) = if lt_ == rt_ && is_normal(&lt_) && lt_ != DataType::Null {
        (l, r)
    } else if is_numeric(&lt_) && is_numeric(&rt_) {
        (cast(&l, &DataType::Float64)?, cast(&r, &DataType::Float64)?)
    } else {
        return Ok(None);
    };
    let res: ArrayRef = match op {
        BinOp::Eq => Arc::new(eq(&l, &r)?),
        BinOp::NotEq => Arc::new(neq(&l, &r)?),
        BinOp::Gt => Arc::new(gt(&l, &r)?),
        BinOp::GtEq => Arc::new(gt_eq(&l, &r)?),
        BinOp::Lt => Arc::new(lt(&l, &r)?),
        BinOp::LtEq => Arc::new(lt_eq(&l, &r)?),
        BinOp::Add | BinOp::Sub | BinOp::Mul if is_numeric(l.data_type()) => {
            let checked = match op {
                BinOp::Add => add(&l, &r),
                BinOp::Sub => sub(&l, &r),
                _ => mul(&l, &r),
            };
            // an overflowing row becomes null once evaluated row by row
            match checked {
                Ok(res) => res,
                Err(_) => return Ok(None),
            }
        }
        // division by zero and string concatenation follow row semantics
        _ => return Ok(None),
    };
    Ok(Some(res))
}
