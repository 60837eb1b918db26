// src/lower/projection.rs
//! Query output columns. A projection is either direct (one query
//! expression, one result column) or split: several independently
//! pushed-down atoms whose decoded values an interpreter-side merger folds
//! back into one value per row.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::errors::RtError;
use crate::query::QueryExpr;
use crate::rexpr::{MemberCalc, RtCallTarget};
use crate::runtime::{Frame, Value};
use crate::types::Type;

#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Direct {
        expr: QueryExpr,
        ty: Type,
    },
    Split {
        parts: Vec<Projection>,
        merger: RowMerger,
        ty: Type,
    },
}

/// Interpreter-side merge step of a split projection. Invoked once per
/// result row with the decoded part values, in part order.
#[derive(Debug, Clone, PartialEq)]
pub enum RowMerger {
    /// Parts are the list elements.
    List,
    /// Parts alternate key, value.
    Map,
    /// Parts are the tuple fields.
    Tuple,
    /// Single part: the member receiver. Steps run left to right; a null
    /// receiver under safe navigation short-circuits the whole chain.
    Member {
        steps: SmallVec<[MemberCalc; 2]>,
        safe: bool,
    },
    /// Parts are the receiver (when `has_base`) followed by the call-site
    /// arguments; the merger re-invokes the call semantics on the decoded
    /// values.
    Call {
        target: RtCallTarget,
        mapping: Arc<[usize]>,
        has_base: bool,
        safe: bool,
    },
}

impl Projection {
    pub fn direct(expr: QueryExpr) -> Projection {
        let ty = expr.ty();
        Projection::Direct { expr, ty }
    }

    pub fn ty(&self) -> &Type {
        match self {
            Projection::Direct { ty, .. } => ty,
            Projection::Split { ty, .. } => ty,
        }
    }

    /// The atomic query expressions this projection adds to the query's
    /// output list, flattened in decode order.
    pub fn atoms(&self) -> Vec<&QueryExpr> {
        let mut out = Vec::new();
        self.collect_atoms(&mut out);
        out
    }

    fn collect_atoms<'a>(&'a self, out: &mut Vec<&'a QueryExpr>) {
        match self {
            Projection::Direct { expr, .. } => out.push(expr),
            Projection::Split { parts, .. } => {
                for part in parts {
                    part.collect_atoms(out);
                }
            }
        }
    }

    /// Rebuild this projection's value from one result row. Consumes
    /// exactly `self.atoms().len()` values from the iterator, in order.
    pub fn decode(
        &self,
        frame: &mut Frame<'_>,
        row: &mut dyn Iterator<Item = Value>,
    ) -> Result<Value, RtError> {
        match self {
            Projection::Direct { .. } => row.next().ok_or(RtError::Decode {
                detail: "projection row exhausted".to_string(),
            }),
            Projection::Split { parts, merger, .. } => {
                let mut values = Vec::with_capacity(parts.len());
                for part in parts {
                    values.push(part.decode(frame, row)?);
                }
                merger.merge(frame, values)
            }
        }
    }
}

impl RowMerger {
    fn merge(&self, frame: &mut Frame<'_>, values: Vec<Value>) -> Result<Value, RtError> {
        match self {
            RowMerger::List => Ok(Value::list(values)),
            RowMerger::Map => {
                debug_assert!(values.len() % 2 == 0);
                let mut pairs = Vec::with_capacity(values.len() / 2);
                let mut it = values.into_iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    pairs.push((k, v));
                }
                Ok(Value::map(pairs))
            }
            RowMerger::Tuple => Ok(Value::tuple(values)),
            RowMerger::Member { steps, safe } => {
                let mut current = values.into_iter().next().ok_or(RtError::Decode {
                    detail: "member projection without receiver".to_string(),
                })?;
                for step in steps {
                    if *safe && current.is_null() {
                        return Ok(Value::Null);
                    }
                    current = step.calculate(frame, &current)?;
                }
                Ok(current)
            }
            RowMerger::Call {
                target,
                mapping,
                has_base,
                safe,
            } => {
                let mut it = values.into_iter();
                let base = if *has_base { it.next() } else { None };
                if *safe && matches!(base, Some(Value::Null)) {
                    return Ok(Value::Null);
                }
                let args: Vec<Value> = it.collect();
                let ordered: Vec<Value> = mapping.iter().map(|&i| args[i].clone()).collect();
                target.call(frame, base.as_ref(), ordered)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryScopeId;
    use crate::runtime::NoDb;

    fn rowid_atom(n: u32) -> Projection {
        Projection::direct(QueryExpr::Rowid {
            scope: QueryScopeId(n),
        })
    }

    #[test]
    fn atoms_flatten_nested_splits_in_order() {
        let p = Projection::Split {
            parts: vec![
                rowid_atom(0),
                Projection::Split {
                    parts: vec![rowid_atom(1), rowid_atom(2)],
                    merger: RowMerger::Tuple,
                    ty: Type::tuple(vec![]),
                },
            ],
            merger: RowMerger::List,
            ty: Type::list(Type::Integer),
        };
        let scopes: Vec<u32> = p
            .atoms()
            .iter()
            .map(|a| match a {
                QueryExpr::Rowid { scope } => scope.0,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(scopes, vec![0, 1, 2]);
    }

    #[test]
    fn decode_consumes_values_in_atom_order() {
        let p = Projection::Split {
            parts: vec![rowid_atom(0), rowid_atom(1)],
            merger: RowMerger::List,
            ty: Type::list(Type::Integer),
        };
        let mut frame = Frame::new(&NoDb, 0);
        let mut row = vec![Value::Integer(10), Value::Integer(20)].into_iter();
        let v = p.decode(&mut frame, &mut row).unwrap();
        assert_eq!(
            v,
            Value::list(vec![Value::Integer(10), Value::Integer(20)])
        );
        assert!(row.next().is_none());
    }

    #[test]
    fn safe_call_merger_short_circuits_on_null_receiver() {
        let merger = RowMerger::Call {
            target: RtCallTarget::Sys(crate::rexpr::SysFn::TextUpperCase),
            mapping: Arc::from([] as [usize; 0]),
            has_base: true,
            safe: true,
        };
        let mut frame = Frame::new(&NoDb, 0);
        let v = merger.merge(&mut frame, vec![Value::Null]).unwrap();
        assert_eq!(v, Value::Null);
    }
}
