// src/lower/calls.rs
//! Call target resolution: the closed set of callable kinds, the two call
//! shapes (full and partial), builtin descriptors, and the per-kind policy
//! for query calls and global-constant restrictions.

use std::sync::Arc;

use crate::lower::expr::{ExprKind, ExprNode};
use crate::lower::Late;
use crate::query::SqlFn;
use crate::rexpr::{FunctionBody, RtCallTarget, SysFn};
use crate::runtime::value::ParamSource;
use crate::schema::FunctionId;
use crate::source::Span;
use crate::types::Type;

/// Compile-time descriptor of a builtin. The runtime evaluator is `rt`; a
/// builtin participates in query calls only if it declares a relational
/// equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SysFnDescriptor {
    pub name: &'static str,
    pub rt: SysFn,
    pub db_fn: Option<SqlFn>,
    /// Pure builtins are allowed inside global constant initializers.
    pub pure: bool,
    /// Synthetic property accessor: the constant-restriction diagnostic
    /// drops the name for these, but the restriction still applies.
    pub synth: bool,
}

pub const SYS_FNS: &[SysFnDescriptor] = &[
    SysFnDescriptor {
        name: "abs",
        rt: SysFn::Abs,
        db_fn: Some(SqlFn::Abs),
        pure: true,
        synth: false,
    },
    SysFnDescriptor {
        name: "max",
        rt: SysFn::Max,
        db_fn: Some(SqlFn::Greatest),
        pure: true,
        synth: false,
    },
    SysFnDescriptor {
        name: "min",
        rt: SysFn::Min,
        db_fn: Some(SqlFn::Least),
        pure: true,
        synth: false,
    },
    SysFnDescriptor {
        name: "integer.to_text",
        rt: SysFn::IntegerToText,
        db_fn: None,
        pure: true,
        synth: false,
    },
    SysFnDescriptor {
        name: "text.upper_case",
        rt: SysFn::TextUpperCase,
        db_fn: Some(SqlFn::Upper),
        pure: true,
        synth: false,
    },
    SysFnDescriptor {
        name: "text.lower_case",
        rt: SysFn::TextLowerCase,
        db_fn: Some(SqlFn::Lower),
        pure: true,
        synth: false,
    },
    SysFnDescriptor {
        name: "text.size",
        rt: SysFn::TextSize,
        db_fn: Some(SqlFn::CharLength),
        pure: true,
        synth: true,
    },
    SysFnDescriptor {
        name: "byte_array.size",
        rt: SysFn::BytesSize,
        db_fn: Some(SqlFn::ByteLength),
        pure: true,
        synth: true,
    },
    SysFnDescriptor {
        name: "list.size",
        rt: SysFn::ListSize,
        db_fn: None,
        pure: true,
        synth: true,
    },
    SysFnDescriptor {
        name: "last_block_time",
        rt: SysFn::LastBlockTime,
        db_fn: None,
        pure: false,
        synth: false,
    },
];

impl SysFnDescriptor {
    pub fn find(name: &str) -> Option<&'static SysFnDescriptor> {
        SYS_FNS.iter().find(|d| d.name == name)
    }
}

/// A resolved callable. Closed set; each variant knows how to build the
/// interpreter call, whether a query call exists, and how it is restricted
/// inside global constant initializers.
#[derive(Debug, Clone, PartialEq)]
pub enum CallTarget {
    /// Plain user function, body known at resolution time.
    Function {
        id: FunctionId,
        name: Arc<str>,
        body: Arc<FunctionBody>,
    },
    /// Overridable function; the effective body may be declared after this
    /// call site, so the handle is filled by the linking pass.
    LateBound {
        name: Arc<str>,
        body: Late<Arc<FunctionBody>>,
    },
    /// Extendable function: all extension bodies chained in declaration
    /// order, filled by the linking pass.
    Extendable {
        name: Arc<str>,
        bodies: Late<Arc<[Arc<FunctionBody>]>>,
    },
    /// Entry-point call; evaluates to a deferred operation-call value.
    Operation { name: Arc<str> },
    /// The callee is the receiver expression (a first-class function value).
    Value,
    Sys(&'static SysFnDescriptor),
}

/// How a call target is restricted inside a global constant initializer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Restriction {
    Allowed,
    /// Restricted; the diagnostic names the callable.
    Named(String),
    /// Restricted with a generic message (no stable name to report).
    Generic,
}

impl CallTarget {
    pub fn name(&self) -> &str {
        match self {
            CallTarget::Function { name, .. } => name,
            CallTarget::LateBound { name, .. } => name,
            CallTarget::Extendable { name, .. } => name,
            CallTarget::Operation { name } => name,
            CallTarget::Value => "<function value>",
            CallTarget::Sys(d) => d.name,
        }
    }

    /// Runtime half of the target.
    pub fn runtime(&self) -> RtCallTarget {
        match self {
            CallTarget::Function { body, .. } => RtCallTarget::UserFunction(body.clone()),
            CallTarget::LateBound { name, body } => RtCallTarget::LateBound {
                name: name.clone(),
                body: body.clone(),
            },
            CallTarget::Extendable { name, bodies } => RtCallTarget::Extendable {
                name: name.clone(),
                bodies: bodies.clone(),
            },
            CallTarget::Operation { name } => RtCallTarget::Operation { name: name.clone() },
            CallTarget::Value => RtCallTarget::FunctionValue,
            CallTarget::Sys(d) => RtCallTarget::Sys(d.rt),
        }
    }

    /// Relational equivalent of a full call, when one exists. Only builtins
    /// declare one; user code never executes inside the query engine.
    pub fn query_fn(&self) -> Option<SqlFn> {
        match self {
            CallTarget::Sys(d) => d.db_fn,
            _ => None,
        }
    }

    pub fn restriction(&self) -> Restriction {
        match self {
            CallTarget::Function { name, .. }
            | CallTarget::LateBound { name, .. }
            | CallTarget::Extendable { name, .. }
            | CallTarget::Operation { name } => {
                Restriction::Named(format!("call of function '{name}'"))
            }
            CallTarget::Value => Restriction::Generic,
            CallTarget::Sys(d) => {
                if d.pure {
                    Restriction::Allowed
                } else if d.synth {
                    // Synthetic property accessors have no stable name to
                    // report; the restriction itself still applies.
                    Restriction::Generic
                } else {
                    Restriction::Named(format!("call of function '{}'", d.name))
                }
            }
        }
    }
}

/// Call shape: a full call invokes immediately; a partial call produces a
/// first-class function value with some parameters bound.
#[derive(Debug, Clone, PartialEq)]
pub enum CallShape {
    Full {
        /// `mapping[param] = call-site argument index`. Always a
        /// permutation of the argument positions (keyword and reordered
        /// arguments resolve to this form upstream).
        mapping: Arc<[usize]>,
    },
    Partial {
        name: Arc<str>,
        /// `mapping[param]` says whether the parameter was bound at partial
        /// application time or stays open ("wild").
        mapping: Arc<[ParamSource]>,
    },
}

/// A resolved call expression. Shared by all target variants.
#[derive(Debug, Clone, PartialEq)]
pub struct CallExpr {
    pub target: CallTarget,
    pub base: Option<ExprNode>,
    pub safe: bool,
    pub args: Vec<ExprNode>,
    pub shape: CallShape,
    pub ty: Type,
}

impl CallExpr {
    pub fn full(
        span: Span,
        target: CallTarget,
        base: Option<ExprNode>,
        safe: bool,
        args: Vec<ExprNode>,
        mapping: Arc<[usize]>,
        ty: Type,
    ) -> ExprNode {
        debug_assert!(
            is_permutation(&mapping, args.len()),
            "argument mapping must be a permutation"
        );
        ExprNode::new(
            span,
            ExprKind::Call(Box::new(CallExpr {
                target,
                base,
                safe,
                args,
                shape: CallShape::Full { mapping },
                ty,
            })),
        )
    }

    pub fn partial(
        span: Span,
        target: CallTarget,
        args: Vec<ExprNode>,
        mapping: Arc<[ParamSource]>,
        ty: Type,
    ) -> ExprNode {
        let name: Arc<str> = Arc::from(target.name());
        ExprNode::new(
            span,
            ExprKind::Call(Box::new(CallExpr {
                target,
                base: None,
                safe: false,
                args,
                shape: CallShape::Partial { name, mapping },
                ty,
            })),
        )
    }
}

fn is_permutation(mapping: &[usize], arg_count: usize) -> bool {
    if mapping.len() != arg_count {
        return false;
    }
    let mut seen = vec![false; arg_count];
    for &i in mapping {
        if i >= arg_count || seen[i] {
            return false;
        }
        seen[i] = true;
    }
    true
}
