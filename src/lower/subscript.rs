// src/lower/subscript.rs
//! Subscript (`[]`) resolution: the closed set of indexable container
//! kinds, each with its interpreter lowering, optional query lowering, and
//! assignability.

use std::sync::Arc;

use crate::errors::LowerError;
use crate::lower::expr::{ExprKind, ExprNode};
use crate::lower::{fold, LowerCtx};
use crate::query::SqlFn;
use crate::rexpr::RtSubscriptKind;
use crate::source::Span;
use crate::types::{TupleType, Type};

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptKind {
    /// One character of a text value, by index.
    Text,
    /// One byte of a byte array, by index.
    Bytes,
    List {
        elem: Type,
    },
    Map {
        key: Type,
        value: Type,
    },
    /// Partially materialized containers; elements may be absent, so the
    /// result widens to nullable. Read-only, never pushed down.
    VirtualList {
        elem: Type,
    },
    VirtualMap {
        key: Type,
        value: Type,
    },
    /// Static field access; the index folded to a constant at compile time.
    /// Resolved entirely within this node, never a query artifact.
    Tuple {
        tuple: Arc<TupleType>,
        index: usize,
    },
}

impl SubscriptKind {
    pub fn result_ty(&self) -> Type {
        match self {
            SubscriptKind::Text => Type::Text,
            SubscriptKind::Bytes => Type::Integer,
            SubscriptKind::List { elem } => elem.clone(),
            SubscriptKind::Map { value, .. } => value.clone(),
            SubscriptKind::VirtualList { elem } => elem.clone().nullable(),
            SubscriptKind::VirtualMap { value, .. } => value.clone().nullable(),
            SubscriptKind::Tuple { tuple, index } => tuple.fields[*index].ty.clone(),
        }
    }

    /// Runtime lookup behavior. Tuple subscripts lower to a field access
    /// instead and have none.
    pub fn rt_kind(&self) -> Option<RtSubscriptKind> {
        match self {
            SubscriptKind::Text => Some(RtSubscriptKind::Text),
            SubscriptKind::Bytes => Some(RtSubscriptKind::Bytes),
            SubscriptKind::List { .. } => Some(RtSubscriptKind::List),
            SubscriptKind::Map { .. } => Some(RtSubscriptKind::Map),
            SubscriptKind::VirtualList { .. } => Some(RtSubscriptKind::VirtualList),
            SubscriptKind::VirtualMap { .. } => Some(RtSubscriptKind::VirtualMap),
            SubscriptKind::Tuple { .. } => None,
        }
    }

    /// Relational equivalent, when one exists.
    pub fn sql_fn(&self) -> Option<SqlFn> {
        match self {
            SubscriptKind::Text => Some(SqlFn::TextSubscript),
            SubscriptKind::Bytes => Some(SqlFn::ByteSubscript),
            SubscriptKind::List { .. } => Some(SqlFn::ListAt),
            SubscriptKind::Map { .. } => Some(SqlFn::MapAt),
            SubscriptKind::VirtualList { .. }
            | SubscriptKind::VirtualMap { .. }
            | SubscriptKind::Tuple { .. } => None,
        }
    }

    /// Whether this subscript can be an assignment target.
    pub fn assignable(&self) -> bool {
        matches!(self, SubscriptKind::List { .. } | SubscriptKind::Map { .. })
    }
}

/// Build a subscript node, resolving the container kind from the base type
/// and checking the key. Tuple indices must fold to a compile-time constant.
pub fn subscript(
    ctx: &LowerCtx,
    span: Span,
    base: ExprNode,
    key: ExprNode,
) -> Result<ExprNode, LowerError> {
    let base_ty = base.ty().clone();
    if base_ty.is_nullable() {
        return Err(LowerError::SubscriptOnNullable { span: span.into() });
    }

    let kind = match &base_ty {
        Type::Text => {
            check_key(&key, &Type::Integer, span)?;
            SubscriptKind::Text
        }
        Type::Bytes => {
            check_key(&key, &Type::Integer, span)?;
            SubscriptKind::Bytes
        }
        Type::List(elem) => {
            check_key(&key, &Type::Integer, span)?;
            SubscriptKind::List {
                elem: (**elem).clone(),
            }
        }
        Type::VirtualList(elem) => {
            check_key(&key, &Type::Integer, span)?;
            SubscriptKind::VirtualList {
                elem: (**elem).clone(),
            }
        }
        Type::Map(k, v) => {
            check_key(&key, k, span)?;
            SubscriptKind::Map {
                key: (**k).clone(),
                value: (**v).clone(),
            }
        }
        Type::VirtualMap(k, v) => {
            check_key(&key, k, span)?;
            SubscriptKind::VirtualMap {
                key: (**k).clone(),
                value: (**v).clone(),
            }
        }
        Type::Tuple(tuple) | Type::VirtualTuple(tuple) => {
            let index = tuple_index(ctx, &key, tuple, span)?;
            SubscriptKind::Tuple {
                tuple: tuple.clone(),
                index,
            }
        }
        other => {
            return Err(LowerError::SubscriptBadBase {
                ty: other.to_string(),
                span: span.into(),
            })
        }
    };

    let ty = kind.result_ty();
    Ok(ExprNode::new(
        span,
        ExprKind::Subscript {
            base: Box::new(base),
            key: Box::new(key),
            kind,
            ty,
        },
    ))
}

fn check_key(key: &ExprNode, expected: &Type, span: Span) -> Result<(), LowerError> {
    if key.ty() == expected {
        Ok(())
    } else {
        Err(LowerError::SubscriptKeyType {
            expected: expected.to_string(),
            found: key.ty().to_string(),
            span: span.into(),
        })
    }
}

fn tuple_index(
    ctx: &LowerCtx,
    key: &ExprNode,
    tuple: &Arc<TupleType>,
    span: Span,
) -> Result<usize, LowerError> {
    let mut eval = fold::ConstEvalCtx::default();
    let value = fold::constant_value(key, ctx, &mut eval)
        .ok_or(LowerError::TupleIndexNotConstant { span: span.into() })?;
    let index = match value {
        crate::runtime::Value::Integer(i) => i,
        _ => return Err(LowerError::TupleIndexNotConstant { span: span.into() }),
    };
    if index < 0 || index as usize >= tuple.fields.len() {
        return Err(LowerError::TupleIndexOutOfBounds {
            index,
            size: tuple.fields.len(),
            span: span.into(),
        });
    }
    Ok(index as usize)
}
