// src/lower/ops.rs
//! Binary and null-coalescing operator lowering. Each operator carries an
//! interpreter evaluator, an optional query evaluator, and a value-level
//! evaluator reused by constant folding.

use crate::lower::expr::{ExprKind, ExprNode};
use crate::query::QBinaryOp;
use crate::rexpr::RBinaryOp;
use crate::runtime::Value;
use crate::source::Span;
use crate::types::Type;

/// A resolved binary operator. Query availability depends on the operand
/// type, not just the operator symbol: equality over a list compiles for the
/// interpreter but has no relational form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryOp {
    pub rt: RBinaryOp,
    pub query: Option<QBinaryOp>,
}

impl BinaryOp {
    /// Resolve an operator against its (common) operand type.
    pub fn resolve(rt: RBinaryOp, operand: &Type) -> BinaryOp {
        let query = if operand.is_sql_compatible() {
            Some(query_op(rt))
        } else {
            None
        };
        BinaryOp { rt, query }
    }

    pub fn symbol(&self) -> &'static str {
        match self.rt {
            RBinaryOp::And => "and",
            RBinaryOp::Or => "or",
            RBinaryOp::Eq => "==",
            RBinaryOp::Ne => "!=",
            RBinaryOp::Lt => "<",
            RBinaryOp::Gt => ">",
            RBinaryOp::Le => "<=",
            RBinaryOp::Ge => ">=",
            RBinaryOp::Add => "+",
            RBinaryOp::Sub => "-",
            RBinaryOp::Mul => "*",
            RBinaryOp::Div => "/",
            RBinaryOp::Mod => "%",
            RBinaryOp::Concat => "+",
        }
    }

    /// Value-level evaluator for constant folding. Runtime failures
    /// (overflow, division by zero) make the expression non-constant
    /// rather than a fold-time error.
    pub fn fold(&self, left: &Value, right: &Value) -> Option<Value> {
        self.rt.apply(left, right).ok()
    }
}

fn query_op(rt: RBinaryOp) -> QBinaryOp {
    match rt {
        RBinaryOp::And => QBinaryOp::And,
        RBinaryOp::Or => QBinaryOp::Or,
        RBinaryOp::Eq => QBinaryOp::Eq,
        RBinaryOp::Ne => QBinaryOp::Ne,
        RBinaryOp::Lt => QBinaryOp::Lt,
        RBinaryOp::Gt => QBinaryOp::Gt,
        RBinaryOp::Le => QBinaryOp::Le,
        RBinaryOp::Ge => QBinaryOp::Ge,
        RBinaryOp::Add => QBinaryOp::Add,
        RBinaryOp::Sub => QBinaryOp::Sub,
        RBinaryOp::Mul => QBinaryOp::Mul,
        RBinaryOp::Div => QBinaryOp::Div,
        RBinaryOp::Mod => QBinaryOp::Mod,
        RBinaryOp::Concat => QBinaryOp::Concat,
    }
}

/// Build a binary node, resolving query availability from the left operand's
/// type (operand types agree after upstream resolution, null widening aside).
pub fn binary(span: Span, rt: RBinaryOp, ty: Type, left: ExprNode, right: ExprNode) -> ExprNode {
    let op = BinaryOp::resolve(rt, left.ty().remove_nullable());
    ExprNode::new(
        span,
        ExprKind::Binary {
            op,
            ty,
            left: Box::new(left),
            right: Box::new(right),
        },
    )
}

/// Build a null-coalescing node. The result type is the common type of the
/// left operand stripped of nullability and the right operand; upstream
/// resolution guarantees one exists.
pub fn elvis(span: Span, left: ExprNode, right: ExprNode) -> ExprNode {
    let left_ty = left.ty().remove_nullable().clone();
    let ty = Type::common(&left_ty, right.ty());
    debug_assert!(ty.is_some(), "elvis operands have no common type");
    let ty = ty.unwrap_or_else(|| right.ty().clone());
    ExprNode::new(
        span,
        ExprKind::Elvis {
            ty,
            left: Box::new(left),
            right: Box::new(right),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_availability_follows_operand_type() {
        let int_eq = BinaryOp::resolve(RBinaryOp::Eq, &Type::Integer);
        assert_eq!(int_eq.query, Some(QBinaryOp::Eq));

        let list_eq = BinaryOp::resolve(RBinaryOp::Eq, &Type::list(Type::Integer));
        assert_eq!(list_eq.query, None);
    }

    #[test]
    fn folding_swallows_runtime_failures() {
        let div = BinaryOp::resolve(RBinaryOp::Div, &Type::Integer);
        assert_eq!(
            div.fold(&Value::Integer(7), &Value::Integer(2)),
            Some(Value::Integer(3))
        );
        assert_eq!(div.fold(&Value::Integer(7), &Value::Integer(0)), None);
    }
}
