// src/lower/expr.rs
//! Expression nodes and the dual lowering core.
//!
//! A node is immutable after construction; its metadata and flow facts are
//! computed once on first access. Lowering is idempotent: every `to_*`
//! operation can be called any number of times and produces semantically
//! identical output each time.

use std::sync::{Arc, OnceLock};

use rustc_hash::FxHashSet;
use smallvec::{smallvec, SmallVec};

use crate::errors::LowerError;
use crate::lower::calls::{CallExpr, CallShape, Restriction};
use crate::lower::facts::FlowFacts;
use crate::lower::info::{ExprInfo, OwnFlags};
use crate::lower::member::MemberStrategy;
use crate::lower::ops::BinaryOp;
use crate::lower::projection::{Projection, RowMerger};
use crate::lower::subscript::SubscriptKind;
use crate::lower::LowerCtx;
use crate::query::{QueryExpr, QueryScopeId};
use crate::rexpr::{MemberCalc, RExpr};
use crate::runtime::{BlockId, Slot, Value};
use crate::schema::{EntityDef, GlobalConstId};
use crate::source::Span;
use crate::types::Type;

#[derive(Debug, Clone, PartialEq)]
pub struct ExprNode {
    pub span: Span,
    /// Enclosing lexical block, when known. Consulted by the optional
    /// scope-validity instrumentation.
    pub block: Option<BlockId>,
    pub kind: ExprKind,
    info: OnceLock<ExprInfo>,
    facts: OnceLock<FlowFacts>,
}

/// Closed set of expression node kinds. Each lowering site matches
/// exhaustively; a new kind is a compile-checked, total update.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Constant {
        value: Value,
        ty: Type,
    },
    Local {
        name: Arc<str>,
        slot: Slot,
        ty: Type,
        mutable: bool,
        /// The query scope that bound this local, if any.
        scope: Option<QueryScopeId>,
    },
    /// The correlated entity of an enclosing query.
    QueryItem {
        scope: QueryScopeId,
        entity: Arc<EntityDef>,
        ty: Type,
    },
    Binary {
        op: BinaryOp,
        left: Box<ExprNode>,
        right: Box<ExprNode>,
        ty: Type,
    },
    Elvis {
        left: Box<ExprNode>,
        right: Box<ExprNode>,
        ty: Type,
    },
    ListLiteral {
        elems: Vec<ExprNode>,
        ty: Type,
    },
    MapLiteral {
        entries: Vec<(ExprNode, ExprNode)>,
        ty: Type,
    },
    TupleLiteral {
        elems: Vec<ExprNode>,
        ty: Type,
    },
    Member {
        base: Box<ExprNode>,
        safe: bool,
        strategy: MemberStrategy,
        ty: Type,
    },
    Call(Box<CallExpr>),
    Subscript {
        base: Box<ExprNode>,
        key: Box<ExprNode>,
        kind: SubscriptKind,
        ty: Type,
    },
    Create {
        entity: Arc<EntityDef>,
        /// `(attribute index, value)`, covering every attribute.
        attrs: Vec<(usize, ExprNode)>,
        ty: Type,
    },
    GlobalConst {
        id: GlobalConstId,
        ty: Type,
    },
    /// Type-narrowing wrapper produced by flow analysis; transparent to
    /// evaluation.
    Narrowed {
        inner: Box<ExprNode>,
        ty: Type,
    },
}

impl ExprNode {
    pub fn new(span: Span, kind: ExprKind) -> ExprNode {
        ExprNode {
            span,
            block: None,
            kind,
            info: OnceLock::new(),
            facts: OnceLock::new(),
        }
    }

    pub fn with_block(mut self, block: BlockId) -> ExprNode {
        self.block = Some(block);
        self
    }

    pub fn constant(span: Span, value: Value, ty: Type) -> ExprNode {
        ExprNode::new(span, ExprKind::Constant { value, ty })
    }

    pub fn local(
        span: Span,
        name: impl Into<Arc<str>>,
        slot: Slot,
        ty: Type,
        mutable: bool,
    ) -> ExprNode {
        ExprNode::new(
            span,
            ExprKind::Local {
                name: name.into(),
                slot,
                ty,
                mutable,
                scope: None,
            },
        )
    }

    /// A local bound by a collection-backed query clause. It evaluates like
    /// any other local but carries its scope for capture tracking.
    pub fn local_in_scope(
        span: Span,
        name: impl Into<Arc<str>>,
        slot: Slot,
        ty: Type,
        scope: QueryScopeId,
    ) -> ExprNode {
        ExprNode::new(
            span,
            ExprKind::Local {
                name: name.into(),
                slot,
                ty,
                mutable: false,
                scope: Some(scope),
            },
        )
    }

    pub fn query_item(span: Span, scope: QueryScopeId, entity: Arc<EntityDef>) -> ExprNode {
        let ty = Type::Entity(entity.clone());
        ExprNode::new(span, ExprKind::QueryItem { scope, entity, ty })
    }

    pub fn list_literal(span: Span, elems: Vec<ExprNode>, elem_ty: Type) -> ExprNode {
        ExprNode::new(
            span,
            ExprKind::ListLiteral {
                elems,
                ty: Type::list(elem_ty),
            },
        )
    }

    pub fn global_const(span: Span, id: GlobalConstId, ty: Type) -> ExprNode {
        ExprNode::new(span, ExprKind::GlobalConst { id, ty })
    }

    pub fn create(span: Span, entity: Arc<EntityDef>, attrs: Vec<(usize, ExprNode)>) -> ExprNode {
        let ty = Type::Entity(entity.clone());
        ExprNode::new(span, ExprKind::Create { entity, attrs, ty })
    }

    pub fn ty(&self) -> &Type {
        match &self.kind {
            ExprKind::Constant { ty, .. }
            | ExprKind::Local { ty, .. }
            | ExprKind::QueryItem { ty, .. }
            | ExprKind::Binary { ty, .. }
            | ExprKind::Elvis { ty, .. }
            | ExprKind::ListLiteral { ty, .. }
            | ExprKind::MapLiteral { ty, .. }
            | ExprKind::TupleLiteral { ty, .. }
            | ExprKind::Member { ty, .. }
            | ExprKind::Subscript { ty, .. }
            | ExprKind::Create { ty, .. }
            | ExprKind::GlobalConst { ty, .. }
            | ExprKind::Narrowed { ty, .. } => ty,
            ExprKind::Call(call) => &call.ty,
        }
    }

    pub fn children(&self) -> SmallVec<[&ExprNode; 4]> {
        match &self.kind {
            ExprKind::Constant { .. }
            | ExprKind::Local { .. }
            | ExprKind::QueryItem { .. }
            | ExprKind::GlobalConst { .. } => smallvec![],
            ExprKind::Binary { left, right, .. } | ExprKind::Elvis { left, right, .. } => {
                smallvec![&**left, &**right]
            }
            ExprKind::ListLiteral { elems, .. } | ExprKind::TupleLiteral { elems, .. } => {
                elems.iter().collect()
            }
            ExprKind::MapLiteral { entries, .. } => {
                entries.iter().flat_map(|(k, v)| [k, v]).collect()
            }
            ExprKind::Member { base, .. } => smallvec![&**base],
            ExprKind::Call(call) => call.base.iter().chain(call.args.iter()).collect(),
            ExprKind::Subscript { base, key, .. } => smallvec![&**base, &**key],
            ExprKind::Create { attrs, .. } => attrs.iter().map(|(_, e)| e).collect(),
            ExprKind::Narrowed { inner, .. } => smallvec![&**inner],
        }
    }

    /// Memoized metadata. Pure and total; computed at most once per node.
    pub fn info(&self) -> &ExprInfo {
        self.info.get_or_init(|| self.compute_info())
    }

    fn compute_info(&self) -> ExprInfo {
        let children = self.children();
        let infos: SmallVec<[&ExprInfo; 4]> = children.iter().map(|c| c.info()).collect();
        let own = match &self.kind {
            ExprKind::Constant { .. } | ExprKind::GlobalConst { .. } | ExprKind::Narrowed { .. } => {
                OwnFlags::default()
            }
            ExprKind::Local { scope, .. } => OwnFlags {
                captures: scope.iter().copied().collect(),
                ..OwnFlags::default()
            },
            ExprKind::QueryItem { scope, .. } => OwnFlags {
                depends_on_entity: true,
                captures: smallvec![*scope],
                ..OwnFlags::default()
            },
            ExprKind::Binary { op, .. } => OwnFlags {
                pushdownable: op.query.is_some(),
                ..OwnFlags::default()
            },
            // The left operand is never compiled as a query expression, so
            // an entity-dependent left side blocks pushdown of the whole
            // operator.
            ExprKind::Elvis { left, .. } => OwnFlags {
                pushdownable: !left.info().depends_on_query_entity,
                ..OwnFlags::default()
            },
            ExprKind::ListLiteral { .. }
            | ExprKind::MapLiteral { .. }
            | ExprKind::TupleLiteral { .. } => OwnFlags {
                pushdownable: false,
                ..OwnFlags::default()
            },
            // Query lowering of a member needs a column path all the way
            // down to a correlated item; anything else splits at this node.
            ExprKind::Member { base, strategy, .. } => OwnFlags {
                pushdownable: strategy.query_available() && base.query_path().is_some(),
                ..OwnFlags::default()
            },
            ExprKind::Call(call) => OwnFlags {
                pushdownable: matches!(call.shape, CallShape::Full { .. })
                    && call.target.query_fn().is_some(),
                ..OwnFlags::default()
            },
            ExprKind::Subscript { kind, .. } => OwnFlags {
                pushdownable: kind.sql_fn().is_some(),
                ..OwnFlags::default()
            },
            ExprKind::Create { .. } => OwnFlags {
                write_effect: true,
                pushdownable: false,
                ..OwnFlags::default()
            },
        };
        ExprInfo::combine(self.ty().clone(), &infos, own)
    }

    /// Memoized flow facts. Upstream flow analysis may install a precomputed
    /// summary with [`ExprNode::set_facts`]; otherwise the child union is
    /// derived on first access.
    pub fn facts(&self) -> &FlowFacts {
        self.facts.get_or_init(|| self.compute_facts())
    }

    /// Install externally computed flow facts. A no-op once facts have been
    /// read or set.
    pub fn set_facts(&self, facts: FlowFacts) {
        let _ = self.facts.set(facts);
    }

    fn compute_facts(&self) -> FlowFacts {
        match &self.kind {
            // Only the left operand is unconditionally evaluated.
            ExprKind::Elvis { left, .. } => left.facts().clone(),
            _ => FlowFacts::all(self.children().iter().map(|c| c.facts())),
        }
    }

    /// Name for an auto-labelled query output column, when this expression
    /// has a natural one.
    pub fn implicit_name(&self) -> Option<String> {
        match &self.kind {
            ExprKind::Member { strategy, .. } => strategy.implicit_name(),
            ExprKind::Local { name, .. } => Some(name.to_string()),
            ExprKind::Narrowed { inner, .. } => inner.implicit_name(),
            _ => None,
        }
    }

    /// Lower to an interpreter expression. Always wraps with a source
    /// position tag; adds a block-liveness check when instrumentation is on.
    pub fn to_interp(&self, ctx: &LowerCtx) -> Result<RExpr, LowerError> {
        let core = self.lower_interp(ctx)?;
        let core = match self.block {
            Some(block) if ctx.options.scope_checks => RExpr::BlockCheck {
                inner: Box::new(core),
                block,
            },
            _ => core,
        };
        Ok(RExpr::StackTrace {
            inner: Box::new(core),
            pos: self.span.file_pos(),
        })
    }

    fn lower_interp(&self, ctx: &LowerCtx) -> Result<RExpr, LowerError> {
        match &self.kind {
            ExprKind::Constant { value, .. } => Ok(RExpr::Constant(value.clone())),
            ExprKind::Local { slot, .. } => Ok(RExpr::LocalGet(*slot)),
            ExprKind::QueryItem { .. } => Err(LowerError::QueryOnly {
                span: self.span.into(),
            }),
            ExprKind::Binary { op, left, right, .. } => Ok(RExpr::Binary {
                op: op.rt,
                left: Box::new(left.to_interp(ctx)?),
                right: Box::new(right.to_interp(ctx)?),
            }),
            ExprKind::Elvis { left, right, .. } => Ok(RExpr::Elvis {
                left: Box::new(left.to_interp(ctx)?),
                right: Box::new(right.to_interp(ctx)?),
            }),
            ExprKind::ListLiteral { elems, .. } => {
                Ok(RExpr::ListLiteral(lower_all(elems, ctx)?))
            }
            ExprKind::MapLiteral { entries, .. } => {
                let mut out = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    out.push((k.to_interp(ctx)?, v.to_interp(ctx)?));
                }
                Ok(RExpr::MapLiteral(out))
            }
            ExprKind::TupleLiteral { elems, .. } => {
                Ok(RExpr::TupleLiteral(lower_all(elems, ctx)?))
            }
            ExprKind::Member { base, safe, strategy, .. } => {
                let mut current = base.to_interp(ctx)?;
                for calc in strategy.calc_steps() {
                    current = RExpr::Member {
                        base: Box::new(current),
                        safe: *safe,
                        calc,
                    };
                }
                Ok(current)
            }
            ExprKind::Call(call) => match &call.shape {
                CallShape::Full { mapping } => {
                    let base = match &call.base {
                        Some(b) => Some(Box::new(b.to_interp(ctx)?)),
                        None => None,
                    };
                    Ok(RExpr::Call {
                        target: call.target.runtime(),
                        base,
                        safe: call.safe,
                        args: lower_all(&call.args, ctx)?,
                        mapping: mapping.clone(),
                    })
                }
                CallShape::Partial { name, mapping } => Ok(RExpr::PartialCall {
                    target: call.target.runtime(),
                    name: name.clone(),
                    args: lower_all(&call.args, ctx)?,
                    mapping: mapping.clone(),
                }),
            },
            ExprKind::Subscript { base, key, kind, .. } => match kind.rt_kind() {
                Some(rt) => Ok(RExpr::Subscript {
                    base: Box::new(base.to_interp(ctx)?),
                    key: Box::new(key.to_interp(ctx)?),
                    kind: rt,
                }),
                // Tuple subscript: the index already folded to a constant,
                // so this is a plain field access.
                None => {
                    let SubscriptKind::Tuple { index, .. } = kind else {
                        unreachable!("only tuple subscripts lack a runtime kind");
                    };
                    Ok(RExpr::Member {
                        base: Box::new(base.to_interp(ctx)?),
                        safe: false,
                        calc: MemberCalc::TupleField { index: *index },
                    })
                }
            },
            ExprKind::Create { entity, attrs, .. } => {
                let mut lowered = Vec::with_capacity(attrs.len());
                for (index, value) in attrs {
                    lowered.push((*index, value.to_interp(ctx)?));
                }
                Ok(RExpr::Create {
                    entity: entity.clone(),
                    attrs: lowered,
                })
            }
            ExprKind::GlobalConst { id, .. } => Ok(RExpr::GlobalConst(*id)),
            ExprKind::Narrowed { inner, .. } => inner.lower_interp(ctx),
        }
    }

    /// Lower to a query expression. A subtree that never touches the
    /// correlated entity is evaluated once by the interpreter and bridged
    /// in as a bound parameter; everything else needs a node-specific
    /// relational lowering.
    pub fn to_query(&self, ctx: &LowerCtx) -> Result<QueryExpr, LowerError> {
        if !self.info().depends_on_query_entity {
            tracing::trace!(span = ?self.span, "query bridge via interpreter");
            let expr = self.to_interp(ctx)?;
            return Ok(QueryExpr::Interpreted {
                expr: Box::new(expr),
                ty: self.ty().clone(),
            });
        }
        self.lower_query(ctx)
    }

    fn lower_query(&self, ctx: &LowerCtx) -> Result<QueryExpr, LowerError> {
        match &self.kind {
            ExprKind::QueryItem { scope, .. } => Ok(QueryExpr::Rowid { scope: *scope }),
            ExprKind::Member { base, strategy, ty, .. } => {
                let MemberStrategy::EntityAttr { path, .. } = strategy else {
                    return Err(LowerError::NotAllowedInQuery {
                        span: self.span.into(),
                    });
                };
                let (scope, entity, mut full_path) =
                    base.query_path().ok_or(LowerError::NotAllowedInQuery {
                        span: self.span.into(),
                    })?;
                full_path.extend(path.iter().copied());
                Ok(QueryExpr::Column {
                    scope,
                    entity,
                    path: full_path,
                    ty: ty.clone(),
                })
            }
            ExprKind::Binary { op, left, right, ty } => {
                let q = op.query.ok_or_else(|| LowerError::OperatorNotInQuery {
                    op: op.symbol().to_string(),
                    left: left.ty().to_string(),
                    right: right.ty().to_string(),
                    span: self.span.into(),
                })?;
                Ok(QueryExpr::Binary {
                    op: q,
                    left: Box::new(left.to_query(ctx)?),
                    right: Box::new(right.to_query(ctx)?),
                    ty: ty.clone(),
                })
            }
            ExprKind::Elvis { left, right, ty } => {
                // The left operand is always interpreter-lowered; an
                // entity-dependent left side has no place to run.
                if left.info().depends_on_query_entity {
                    return Err(LowerError::NotAllowedInQuery {
                        span: left.span.into(),
                    });
                }
                Ok(QueryExpr::Coalesce {
                    left: Box::new(left.to_interp(ctx)?),
                    right: Box::new(right.to_query(ctx)?),
                    ty: ty.clone(),
                })
            }
            ExprKind::Call(call) => {
                let func = call
                    .target
                    .query_fn()
                    .filter(|_| matches!(call.shape, CallShape::Full { .. }))
                    .ok_or_else(|| LowerError::FunctionNotInQuery {
                        name: call.target.name().to_string(),
                        span: self.span.into(),
                    })?;
                let CallShape::Full { mapping } = &call.shape else {
                    unreachable!("filtered above");
                };
                let mut args = Vec::with_capacity(call.args.len() + 1);
                if let Some(base) = &call.base {
                    args.push(base.to_query(ctx)?);
                }
                // Arguments in callee parameter order.
                for &i in mapping.iter() {
                    args.push(call.args[i].to_query(ctx)?);
                }
                Ok(QueryExpr::Call {
                    func,
                    args,
                    ty: call.ty.clone(),
                })
            }
            ExprKind::Subscript { base, key, kind, ty } => {
                let func = kind.sql_fn().ok_or(LowerError::NotAllowedInQuery {
                    span: self.span.into(),
                })?;
                Ok(QueryExpr::Call {
                    func,
                    args: vec![base.to_query(ctx)?, key.to_query(ctx)?],
                    ty: ty.clone(),
                })
            }
            ExprKind::Narrowed { inner, .. } => inner.to_query(ctx),
            ExprKind::Constant { .. }
            | ExprKind::Local { .. }
            | ExprKind::ListLiteral { .. }
            | ExprKind::MapLiteral { .. }
            | ExprKind::TupleLiteral { .. }
            | ExprKind::Create { .. }
            | ExprKind::GlobalConst { .. } => Err(LowerError::NotAllowedInQuery {
                span: self.span.into(),
            }),
        }
    }

    /// The entity column path this expression denotes, when it is a pure
    /// attribute chain over a correlated entity.
    fn query_path(&self) -> Option<(QueryScopeId, Arc<EntityDef>, SmallVec<[usize; 2]>)> {
        match &self.kind {
            ExprKind::QueryItem { scope, entity, .. } => {
                Some((*scope, entity.clone(), smallvec![]))
            }
            ExprKind::Narrowed { inner, .. } => inner.query_path(),
            ExprKind::Member {
                base,
                strategy: MemberStrategy::EntityAttr { path, .. },
                ..
            } => {
                let (scope, entity, mut full) = base.query_path()?;
                full.extend(path.iter().copied());
                Some((scope, entity, full))
            }
            _ => None,
        }
    }

    /// Lower to one query output column, choosing between the direct and
    /// split strategies.
    pub fn to_projection(&self, ctx: &LowerCtx) -> Result<Projection, LowerError> {
        let info = self.info();
        let direct = (info.pushdown_eligible && info.ty.is_sql_compatible())
            || !ctx.options.split_projections;
        if direct {
            tracing::debug!(span = ?self.span, "projection: direct");
            return Ok(Projection::direct(self.to_query(ctx)?));
        }
        tracing::debug!(span = ?self.span, "projection: split");
        self.lower_split(ctx)
    }

    fn lower_split(&self, ctx: &LowerCtx) -> Result<Projection, LowerError> {
        match &self.kind {
            ExprKind::ListLiteral { elems, ty } => Ok(Projection::Split {
                parts: project_all(elems, ctx)?,
                merger: RowMerger::List,
                ty: ty.clone(),
            }),
            ExprKind::MapLiteral { entries, ty } => {
                let mut parts = Vec::with_capacity(entries.len() * 2);
                for (k, v) in entries {
                    parts.push(k.to_projection(ctx)?);
                    parts.push(v.to_projection(ctx)?);
                }
                Ok(Projection::Split {
                    parts,
                    merger: RowMerger::Map,
                    ty: ty.clone(),
                })
            }
            ExprKind::TupleLiteral { elems, ty } => Ok(Projection::Split {
                parts: project_all(elems, ctx)?,
                merger: RowMerger::Tuple,
                ty: ty.clone(),
            }),
            // The member itself needs interpreter logic, but its receiver
            // may still push down.
            ExprKind::Member { base, safe, strategy, ty } => Ok(Projection::Split {
                parts: vec![base.to_projection(ctx)?],
                merger: RowMerger::Member {
                    steps: strategy.calc_steps(),
                    safe: *safe,
                },
                ty: ty.clone(),
            }),
            // Arguments may be individually pushdown-eligible even when the
            // call is not.
            ExprKind::Call(call) => {
                if let CallShape::Full { mapping } = &call.shape {
                    let mut parts = Vec::with_capacity(call.args.len() + 1);
                    if let Some(base) = &call.base {
                        parts.push(base.to_projection(ctx)?);
                    }
                    for arg in &call.args {
                        parts.push(arg.to_projection(ctx)?);
                    }
                    Ok(Projection::Split {
                        parts,
                        merger: RowMerger::Call {
                            target: call.target.runtime(),
                            mapping: mapping.clone(),
                            has_base: call.base.is_some(),
                            safe: call.safe,
                        },
                        ty: call.ty.clone(),
                    })
                } else {
                    Ok(Projection::direct(self.to_query(ctx)?))
                }
            }
            // No split override: fall back to direct.
            _ => Ok(Projection::direct(self.to_query(ctx)?)),
        }
    }

    /// Validate that this expression only references query scopes the
    /// enclosing context makes visible.
    pub fn check_captures(&self, visible: &FxHashSet<QueryScopeId>) -> Result<(), LowerError> {
        if self
            .info()
            .captured_scopes
            .iter()
            .all(|s| visible.contains(s))
        {
            Ok(())
        } else {
            Err(LowerError::IllegalScopeCapture {
                span: self.span.into(),
            })
        }
    }

    /// Enforce the global-constant initializer restrictions: no entity
    /// creation, no restricted calls, no partial application.
    pub fn check_constant_restrictions(&self) -> Result<(), LowerError> {
        match &self.kind {
            ExprKind::Create { .. } => Err(LowerError::RestrictedInConstant {
                construct: "entity creation".to_string(),
                span: self.span.into(),
            }),
            ExprKind::Call(call) => {
                if matches!(call.shape, CallShape::Partial { .. }) {
                    return Err(LowerError::RestrictedInConstant {
                        construct: "partial function application".to_string(),
                        span: self.span.into(),
                    });
                }
                match call.target.restriction() {
                    Restriction::Allowed => {}
                    Restriction::Named(construct) => {
                        return Err(LowerError::RestrictedInConstant {
                            construct,
                            span: self.span.into(),
                        })
                    }
                    Restriction::Generic => {
                        return Err(LowerError::RestrictedInConstant {
                            construct: "function call".to_string(),
                            span: self.span.into(),
                        })
                    }
                }
                for child in self.children() {
                    child.check_constant_restrictions()?;
                }
                Ok(())
            }
            _ => {
                for child in self.children() {
                    child.check_constant_restrictions()?;
                }
                Ok(())
            }
        }
    }
}

fn lower_all(nodes: &[ExprNode], ctx: &LowerCtx) -> Result<Vec<RExpr>, LowerError> {
    nodes.iter().map(|n| n.to_interp(ctx)).collect()
}

fn project_all(nodes: &[ExprNode], ctx: &LowerCtx) -> Result<Vec<Projection>, LowerError> {
    nodes.iter().map(|n| n.to_projection(ctx)).collect()
}
