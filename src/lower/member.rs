// src/lower/member.rs
//! Member resolution: per-member-kind lowering strategies, safe navigation,
//! chain refinement, and the deferred-diagnostic narrowing wrapper.

use std::sync::Arc;

use smallvec::{smallvec, SmallVec};

use crate::errors::{LowerError, LowerWarning};
use crate::lower::expr::{ExprKind, ExprNode};
use crate::lower::LowerCtx;
use crate::rexpr::{MemberCalc, SysFn};
use crate::schema::{EntityDef, StructDef};
use crate::source::Span;
use crate::types::{TupleType, Type};

/// One resolved member access. Closed set; every lowering site matches
/// exhaustively.
#[derive(Debug, Clone, PartialEq)]
pub enum MemberStrategy {
    /// An entity attribute, possibly reached through a chain of
    /// entity-typed attributes (refined member chains collapse into one
    /// strategy with a longer path).
    EntityAttr {
        entity: Arc<EntityDef>,
        path: SmallVec<[usize; 2]>,
    },
    StructAttr {
        def: Arc<StructDef>,
        index: usize,
    },
    TupleField {
        tuple: Arc<TupleType>,
        index: usize,
    },
    /// Synthetic builtin property (`text.size` and friends).
    SysProperty {
        name: &'static str,
        rt: SysFn,
        ty: Type,
    },
}

impl MemberStrategy {
    /// Declared type of the accessed member, before safe-navigation widening.
    pub fn declared_ty(&self) -> Type {
        match self {
            MemberStrategy::EntityAttr { entity, path } => {
                let mut current = entity.clone();
                let (prefix, last) = path.split_at(path.len() - 1);
                for &step in prefix {
                    match current.attr(step).ty.remove_nullable() {
                        Type::Entity(next) => current = next.clone(),
                        _ => break,
                    }
                }
                current.attr(last[0]).ty.clone()
            }
            MemberStrategy::StructAttr { def, index } => def.attrs[*index].ty.clone(),
            MemberStrategy::TupleField { tuple, index } => tuple.fields[*index].ty.clone(),
            MemberStrategy::SysProperty { ty, .. } => ty.clone(),
        }
    }

    /// Whether this member can execute inside the relational query.
    pub fn query_available(&self) -> bool {
        matches!(self, MemberStrategy::EntityAttr { .. })
    }

    /// Name used to auto-label a projected output column.
    pub fn implicit_name(&self) -> Option<String> {
        match self {
            MemberStrategy::EntityAttr { entity, path } => {
                let mut current = entity.clone();
                let (prefix, last) = path.split_at(path.len() - 1);
                for &step in prefix {
                    match current.attr(step).ty.remove_nullable() {
                        Type::Entity(next) => current = next.clone(),
                        _ => break,
                    }
                }
                Some(current.attr(last[0]).name.clone())
            }
            MemberStrategy::StructAttr { def, index } => Some(def.attrs[*index].name.clone()),
            MemberStrategy::TupleField { tuple, index } => tuple.fields[*index].name.clone(),
            MemberStrategy::SysProperty { name, .. } => Some((*name).to_string()),
        }
    }

    /// True if an intermediate step of the chain is nullable, which forces
    /// safe navigation on the whole access.
    pub fn path_nullable(&self) -> bool {
        match self {
            MemberStrategy::EntityAttr { entity, path } => {
                let mut current = entity.clone();
                for &step in &path[..path.len() - 1] {
                    let attr_ty = &current.attr(step).ty;
                    if attr_ty.is_nullable() {
                        return true;
                    }
                    match attr_ty.remove_nullable() {
                        Type::Entity(next) => current = next.clone(),
                        _ => break,
                    }
                }
                false
            }
            _ => false,
        }
    }

    /// Interpreter member calculators, one per chain step.
    pub fn calc_steps(&self) -> SmallVec<[MemberCalc; 2]> {
        match self {
            MemberStrategy::EntityAttr { path, .. } => {
                path.iter().map(|&attr| MemberCalc::EntityAttr { attr }).collect()
            }
            MemberStrategy::StructAttr { index, .. } => {
                smallvec![MemberCalc::StructAttr { index: *index }]
            }
            MemberStrategy::TupleField { index, .. } => {
                smallvec![MemberCalc::TupleField { index: *index }]
            }
            MemberStrategy::SysProperty { rt, .. } => smallvec![MemberCalc::SysProperty(*rt)],
        }
    }

    /// Refine with a further member on this member's result. Entity chains
    /// collapse into a single strategy with an extended path; everything
    /// else declines and resolution falls back to type-based lookup.
    pub fn refine(&self, name: &str) -> Option<MemberStrategy> {
        match self {
            MemberStrategy::EntityAttr { entity, path } => {
                match self.declared_ty().remove_nullable() {
                    Type::Entity(next) => {
                        let index = next.attr_index(name)?;
                        let mut path = path.clone();
                        path.push(index);
                        Some(MemberStrategy::EntityAttr {
                            entity: entity.clone(),
                            path,
                        })
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

/// Type-based member lookup on a (non-nullable) receiver type.
pub fn resolve_member(ty: &Type, name: &str) -> Option<MemberStrategy> {
    match ty {
        Type::Entity(entity) => {
            let index = entity.attr_index(name)?;
            Some(MemberStrategy::EntityAttr {
                entity: entity.clone(),
                path: smallvec![index],
            })
        }
        Type::Struct(def) => {
            let index = def.attr_index(name)?;
            Some(MemberStrategy::StructAttr {
                def: def.clone(),
                index,
            })
        }
        Type::Tuple(tuple) => {
            let index = tuple
                .fields
                .iter()
                .position(|f| f.name.as_deref() == Some(name))?;
            Some(MemberStrategy::TupleField {
                tuple: tuple.clone(),
                index,
            })
        }
        Type::Text if name == "size" => Some(MemberStrategy::SysProperty {
            name: "size",
            rt: SysFn::TextSize,
            ty: Type::Integer,
        }),
        Type::Bytes if name == "size" => Some(MemberStrategy::SysProperty {
            name: "size",
            rt: SysFn::BytesSize,
            ty: Type::Integer,
        }),
        Type::List(_) | Type::VirtualList(_) if name == "size" => {
            Some(MemberStrategy::SysProperty {
                name: "size",
                rt: SysFn::ListSize,
                ty: Type::Integer,
            })
        }
        _ => None,
    }
}

/// Build a member-access node, applying the safe-navigation rules:
/// `?.` on a never-null receiver is a warning, a plain `.` on a nullable
/// receiver is an error, and a safe access widens the result to nullable.
/// Chains refine: a member on a member asks the inner strategy first.
pub fn member(
    ctx: &LowerCtx,
    span: Span,
    base: ExprNode,
    name: &str,
    safe: bool,
) -> Result<ExprNode, LowerError> {
    let base_ty = base.ty().clone();
    let nullable = base_ty.is_nullable();
    if nullable && !safe {
        return Err(LowerError::MemberOnNullable {
            name: name.to_string(),
            ty: base_ty.to_string(),
            span: span.into(),
        });
    }
    if !nullable && safe {
        ctx.warning(LowerWarning::RedundantSafeNav {
            ty: base_ty.to_string(),
            span: span.into(),
        });
    }

    // Chain refinement: collapse `(base.m1).m2` into one node when the
    // inner strategy accepts the extension.
    if let ExprKind::Member {
        base: inner_base,
        strategy,
        safe: inner_safe,
        ..
    } = &base.kind
    {
        if let Some(refined) = strategy.refine(name) {
            let safe = safe || *inner_safe || refined.path_nullable();
            let ty = widen(refined.declared_ty(), safe);
            let inner_base = (**inner_base).clone();
            return Ok(ExprNode::new(
                span,
                ExprKind::Member {
                    base: Box::new(inner_base),
                    safe,
                    strategy: refined,
                    ty,
                },
            ));
        }
    }

    let strategy =
        resolve_member(base_ty.remove_nullable(), name).ok_or_else(|| LowerError::UnknownMember {
            name: name.to_string(),
            ty: base_ty.to_string(),
            span: span.into(),
        })?;
    let ty = widen(strategy.declared_ty(), safe && nullable);
    Ok(ExprNode::new(
        span,
        ExprKind::Member {
            base: Box::new(base),
            safe,
            strategy,
            ty,
        },
    ))
}

fn widen(ty: Type, safe: bool) -> Type {
    if safe {
        ty.nullable()
    } else {
        ty
    }
}

/// A narrowed expression carrying a pending diagnostic that fires only when
/// the wrapper is actually materialized for use.
#[derive(Debug)]
pub struct WrappedExpr {
    node: ExprNode,
    pending: Option<LowerWarning>,
}

impl WrappedExpr {
    pub fn new(node: ExprNode, pending: Option<LowerWarning>) -> WrappedExpr {
        WrappedExpr { node, pending }
    }

    /// Wrap a nullable expression the flow analysis proved non-null here.
    pub fn narrow_not_null(node: ExprNode, redundant: bool) -> WrappedExpr {
        let span = node.span;
        let ty = node.ty().remove_nullable().clone();
        let pending = redundant.then(|| LowerWarning::NeverNull { span: span.into() });
        let node = ExprNode::new(span, ExprKind::Narrowed { inner: Box::new(node), ty });
        WrappedExpr { node, pending }
    }

    /// Wrap an expression the flow analysis proved always null here.
    pub fn narrow_always_null(node: ExprNode) -> WrappedExpr {
        let span = node.span;
        let pending = Some(LowerWarning::AlwaysNull { span: span.into() });
        let node = ExprNode::new(
            span,
            ExprKind::Narrowed {
                inner: Box::new(node),
                ty: Type::Null,
            },
        );
        WrappedExpr { node, pending }
    }

    pub fn ty(&self) -> &Type {
        self.node.ty()
    }

    /// Unwrap for use, emitting the pending diagnostic if any.
    pub fn materialize(self, ctx: &LowerCtx) -> ExprNode {
        if let Some(warning) = self.pending {
            ctx.warning(warning);
        }
        self.node
    }
}
