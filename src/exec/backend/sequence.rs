use std::sync::Arc;

use indexmap::IndexMap;

use super::*;

/// In-memory rows. Accepts arbitrary row functions.
#[derive(Debug, Clone)]
pub struct SequenceTable {
    rows: Arc<Vec<Value>>,
    object_type: Type,
}

impl SequenceTable {
    pub fn new(rows: Vec<Value>) -> Self {
        let object_type = Type::merge_all(rows.iter().map(Type::of));
        SequenceTable::with_type(rows, object_type)
    }

    pub fn with_type(rows: Vec<Value>, object_type: Type) -> Self {
        SequenceTable {
            rows: Arc::new(rows),
            object_type,
        }
    }

    pub fn table(rows: Vec<Value>) -> Table {
        Arc::new(SequenceTable::new(rows))
    }

    pub fn values(&self) -> &[Value] {
        &self.rows
    }
}

/// Groups rows by key in first-seen order.
pub fn group_rows(
    rows: impl IntoIterator<Item = (Value, Value)>,
    object_type: Type,
) -> Result<GroupResult> {
    let mut groups: IndexMap<Vec<u8>, (Value, Vec<Value>)> = IndexMap::new();
    for (key, row) in rows {
        groups
            .entry(key.group_key()?)
            .or_insert_with(|| (key, vec![]))
            .1
            .push(row);
    }
    let key_type = Type::merge_all(groups.values().map(|(k, _)| Type::of(k)));
    let groups = groups
        .into_values()
        .map(|(key, members)| Group {
            key,
            members: Arc::new(SequenceTable::with_type(members, object_type.clone())) as Table,
        })
        .collect();
    Ok(GroupResult::new(key_type, object_type, groups))
}

impl TableBackend for SequenceTable {
    fn kind(&self) -> &'static str {
        "sequence"
    }

    fn object_type(&self) -> Type {
        self.object_type.clone()
    }

    fn count(&self, _deadline: &Deadline) -> Result<usize> {
        Ok(self.rows.len())
    }

    fn index(&self, i: usize, _deadline: &Deadline) -> Result<Value> {
        Ok(self.rows.get(i).cloned().unwrap_or(Value::Null))
    }

    fn pick(&self, key: &str, deadline: &Deadline) -> Result<Table> {
        deadline.check()?;
        Ok(SequenceTable::table(
            self.rows.iter().map(|row| row.pick(key)).collect(),
        ))
    }

    fn filter(&self, predicate: RowFn, deadline: &Deadline) -> Result<Table> {
        let mut kept = Vec::new();
        for (i, row) in self.rows.iter().enumerate() {
            deadline.check()?;
            if predicate.call(row, i)?.truthy() {
                kept.push(row.clone());
            }
        }
        Ok(Arc::new(SequenceTable::with_type(kept, self.object_type.clone())))
    }

    fn map(&self, f: RowFn, deadline: &Deadline) -> Result<Table> {
        let mut mapped = Vec::with_capacity(self.rows.len());
        for (i, row) in self.rows.iter().enumerate() {
            deadline.check()?;
            mapped.push(f.call(row, i)?);
        }
        Ok(SequenceTable::table(mapped))
    }

    fn groupby(&self, key: RowFn, deadline: &Deadline) -> Result<GroupResult> {
        let mut keyed = Vec::with_capacity(self.rows.len());
        for (i, row) in self.rows.iter().enumerate() {
            deadline.check()?;
            keyed.push((key.call(row, i)?, row.clone()));
        }
        group_rows(keyed, self.object_type.clone())
    }

    fn limit(&self, n: usize, _deadline: &Deadline) -> Result<Table> {
        Ok(Arc::new(SequenceTable::with_type(
            self.rows.iter().take(n).cloned().collect(),
            self.object_type.clone(),
        )))
    }

    fn rows(&self, _deadline: &Deadline) -> Result<Vec<Value>> {
        Ok(self.rows.to_vec())
    }

    /// One pass over the rows for the whole chain of row-wise steps.
    fn execute_native(&self, plan: &Plan, deadline: &Deadline) -> Option<Result<Datum>> {
        Some(fused_pass(&self.rows, &plan.steps, deadline))
    }
}

fn fused_pass(rows: &[Value], steps: &[Step], deadline: &Deadline) -> Result<Datum> {
    let (row_steps, terminal) = match steps.split_last() {
        Some((last, rest)) if last.is_terminal() => (rest, Some(last)),
        _ => (steps, None),
    };
    let mut passed = vec![0usize; row_steps.len()];
    let mut out = Vec::new();
    let mut groups = Vec::new();
    let mut count = 0usize;
    'rows: for row in rows {
        deadline.check()?;
        let mut current = row.clone();
        for (j, step) in row_steps.iter().enumerate() {
            match step {
                Step::Filter(e) => {
                    if !e.eval(&current).truthy() {
                        continue 'rows;
                    }
                }
                Step::Map(e) => current = e.eval(&current),
                Step::Pick(k) => current = current.pick(k),
                Step::Limit(n) => {
                    // counters only grow, so nothing later gets through either
                    if passed[j] >= *n {
                        break 'rows;
                    }
                    passed[j] += 1;
                }
                Step::Index(_) | Step::Count | Step::GroupBy(_) => {}
            }
        }
        count += 1;
        match terminal {
            Some(Step::Index(i)) if count - 1 == *i => return Ok(Datum::Value(current)),
            Some(Step::Index(_)) | Some(Step::Count) => {}
            Some(Step::GroupBy(e)) => groups.push((e.eval(&current), current)),
            _ => out.push(current),
        }
    }
    Ok(match terminal {
        Some(Step::Index(_)) => Datum::Value(Value::Null),
        Some(Step::Count) => Datum::Value(Value::Int(count as i64)),
        Some(Step::GroupBy(_)) => {
            let object_type = Type::merge_all(groups.iter().map(|(_, r)| Type::of(r)));
            Datum::Groups(group_rows(groups, object_type)?)
        }
        _ => Datum::Table(SequenceTable::table(out)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::expr::BinOp;

    fn rows() -> Vec<Value> {
        vec![
            row! { "type" => "C", "potass" => 280i64 },
            row! { "type" => "H", "potass" => 330i64 },
            row! { "type" => "C", "potass" => 320i64 },
        ]
    }

    #[test]
    fn primitives() {
        let t = SequenceTable::table(rows());
        let d = Deadline::none();
        assert_eq!(t.count(&d).unwrap(), 3);
        assert_eq!(t.index(5, &d).unwrap(), Value::Null);
        let picked = t.pick("potass", &d).unwrap();
        assert_eq!(picked.rows(&d).unwrap(), vec![Value::Int(280), Value::Int(330), Value::Int(320)]);
        let groups = t
            .groupby(expr_fn(RowExpr::Row.pick("type")), &d)
            .unwrap();
        assert_eq!(groups.groups.len(), 2);
        assert_eq!(groups.groups[0].key, Value::from("C"));
        assert_eq!(groups.groups[0].members.count(&d).unwrap(), 2);
    }

    #[test]
    fn fused_plan_matches_fold() {
        let t = SequenceTable::table(rows());
        let d = Deadline::none();
        let plan = Plan::new(vec![
            Step::Filter(RowExpr::binary(
                BinOp::Gt,
                RowExpr::Row.pick("potass"),
                RowExpr::Const(Value::Int(290)),
            )),
            Step::Pick("type".to_owned()),
            Step::Count,
        ]);
        let fused = execute_plan(&t, &plan, &d).unwrap();
        let folded = fold_plan(t.clone(), &plan.steps, &d).unwrap();
        assert_eq!(fused.as_value(), Some(&Value::Int(2)));
        assert_eq!(folded.as_value(), Some(&Value::Int(2)));

        let plan = Plan::new(vec![Step::Limit(2), Step::Index(1)]);
        let fused = execute_plan(&t, &plan, &d).unwrap();
        assert_eq!(fused.as_value(), Some(&rows()[1]));
    }

    #[test]
    fn expired_deadline_stops_row_loops() {
        let t = SequenceTable::table(rows());
        let d = Deadline::after(Some(std::time::Duration::from_millis(0)));
        std::thread::sleep(std::time::Duration::from_millis(2));
        let err = t
            .filter(expr_fn(RowExpr::Const(Value::Bool(true))), &d)
            .err()
            .unwrap();
        assert_eq!(err.kind(), "TimeoutError");
    }
}
