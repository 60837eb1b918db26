// src/lower/fold.rs
//! Best-effort constant folding with a recursion breaker for cyclic global
//! constant definitions. "Not constant" is a normal outcome, never an
//! error; the caller decides whether a declared constant that fails to fold
//! is a problem.

use rustc_hash::FxHashSet;

use crate::lower::expr::{ExprKind, ExprNode};
use crate::lower::member::MemberStrategy;
use crate::lower::LowerCtx;
use crate::runtime::Value;
use crate::schema::GlobalConstId;

/// Shared folding state: the set of global constants currently being
/// folded. Re-entering one of them means the definition is cyclic; the
/// inner reference folds to "not constant" and folding terminates.
#[derive(Debug, Default)]
pub struct ConstEvalCtx {
    folding: FxHashSet<GlobalConstId>,
}

pub fn constant_value(node: &ExprNode, ctx: &LowerCtx, eval: &mut ConstEvalCtx) -> Option<Value> {
    match &node.kind {
        ExprKind::Constant { value, .. } => Some(value.clone()),
        ExprKind::Binary { op, left, right, .. } => {
            let l = constant_value(left, ctx, eval)?;
            // Logical short-circuit mirrors runtime evaluation: the right
            // operand's foldability is irrelevant when the left decides.
            match op.rt {
                crate::rexpr::RBinaryOp::And if l == Value::Boolean(false) => return Some(l),
                crate::rexpr::RBinaryOp::Or if l == Value::Boolean(true) => return Some(l),
                _ => {}
            }
            let r = constant_value(right, ctx, eval)?;
            op.fold(&l, &r)
        }
        ExprKind::Elvis { left, right, .. } => {
            let l = constant_value(left, ctx, eval)?;
            if l.is_null() {
                constant_value(right, ctx, eval)
            } else {
                Some(l)
            }
        }
        ExprKind::ListLiteral { elems, .. } => {
            let values = elems
                .iter()
                .map(|e| constant_value(e, ctx, eval))
                .collect::<Option<Vec<_>>>()?;
            Some(Value::list(values))
        }
        ExprKind::TupleLiteral { elems, .. } => {
            let values = elems
                .iter()
                .map(|e| constant_value(e, ctx, eval))
                .collect::<Option<Vec<_>>>()?;
            Some(Value::tuple(values))
        }
        ExprKind::MapLiteral { entries, .. } => {
            let mut pairs = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                pairs.push((constant_value(k, ctx, eval)?, constant_value(v, ctx, eval)?));
            }
            Some(Value::map(pairs))
        }
        ExprKind::Member { base, safe, strategy, .. } => {
            let bv = constant_value(base, ctx, eval)?;
            if *safe && bv.is_null() {
                return Some(Value::Null);
            }
            match (strategy, &bv) {
                (MemberStrategy::TupleField { index, .. }, Value::Tuple(values)) => {
                    values.get(*index).cloned()
                }
                _ => None,
            }
        }
        ExprKind::Narrowed { inner, .. } => constant_value(inner, ctx, eval),
        ExprKind::GlobalConst { id, .. } => {
            if !eval.folding.insert(*id) {
                tracing::trace!(id = id.0, "constant fold cycle");
                return None;
            }
            let def = ctx.global_const(*id);
            let value = def.and_then(|d| constant_value(&d.init, ctx, eval));
            eval.folding.remove(id);
            value
        }
        ExprKind::Local { .. }
        | ExprKind::QueryItem { .. }
        | ExprKind::Call(_)
        | ExprKind::Subscript { .. }
        | ExprKind::Create { .. } => None,
    }
}
