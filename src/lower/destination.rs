// src/lower/destination.rs
//! Assignment targets. Only a small subset of node kinds can be assigned
//! to: mutable locals, subscripts of mutable containers, and narrowed
//! wrappers around either.

use crate::errors::LowerError;
use crate::lower::expr::{ExprKind, ExprNode};
use crate::lower::LowerCtx;
use crate::rexpr::{RBinaryOp, RDest, RExpr};
use crate::types::Type;

/// A compiled assignment target. `effective` differs from `declared` when
/// the destination went through a narrowing wrapper.
#[derive(Debug, Clone, PartialEq)]
pub struct Destination {
    pub declared: Type,
    pub effective: Type,
    target: RDest,
}

impl Destination {
    /// Bare assignment: `dst = src`.
    pub fn assign(self, src: RExpr) -> RExpr {
        RExpr::Assign {
            dst: self.target,
            op: None,
            src: Box::new(src),
        }
    }

    /// Compound assignment: `dst op= src`. The place is resolved once.
    pub fn compound_assign(self, op: RBinaryOp, src: RExpr) -> RExpr {
        RExpr::Assign {
            dst: self.target,
            op: Some(op),
            src: Box::new(src),
        }
    }
}

/// Compile a node as an assignment destination.
pub fn destination(ctx: &LowerCtx, node: &ExprNode) -> Result<Destination, LowerError> {
    match &node.kind {
        ExprKind::Local {
            name,
            slot,
            ty,
            mutable,
            ..
        } => {
            if !*mutable {
                return Err(LowerError::ImmutableAssignment {
                    name: name.to_string(),
                    span: node.span.into(),
                });
            }
            Ok(Destination {
                declared: ty.clone(),
                effective: ty.clone(),
                target: RDest::Local(*slot),
            })
        }
        ExprKind::Subscript {
            base, key, kind, ty, ..
        } => {
            if !kind.assignable() {
                return Err(LowerError::SubscriptNotAssignable {
                    ty: base.ty().to_string(),
                    span: node.span.into(),
                });
            }
            let base_expr = Box::new(base.to_interp(ctx)?);
            let key_expr = Box::new(key.to_interp(ctx)?);
            let target = match kind {
                crate::lower::subscript::SubscriptKind::List { .. } => RDest::ListElem {
                    base: base_expr,
                    index: key_expr,
                },
                crate::lower::subscript::SubscriptKind::Map { .. } => RDest::MapElem {
                    base: base_expr,
                    key: key_expr,
                },
                _ => unreachable!("assignable() admits only list and map"),
            };
            Ok(Destination {
                declared: ty.clone(),
                effective: ty.clone(),
                target,
            })
        }
        // A narrowed wrapper delegates to its inner destination but keeps
        // the narrowed type as the effective one.
        ExprKind::Narrowed { inner, ty } => {
            let mut dest = destination(ctx, inner)?;
            dest.effective = ty.clone();
            Ok(dest)
        }
        _ => Err(LowerError::BadDestination {
            span: node.span.into(),
        }),
    }
}
