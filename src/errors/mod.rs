// src/errors/mod.rs
//! Structured error reporting for expression lowering.
//!
//! Lowering errors use the E3xxx code range (E1xxx/E2xxx belong to the
//! frontend and resolver). Warnings are non-fatal and collected through the
//! message sink; runtime errors are raised by the interpreter IR.

pub mod report;

pub use report::{render_to_stderr, render_to_string, render_to_writer};

use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

use crate::source::FilePos;

#[derive(Error, Debug, Diagnostic, Clone, PartialEq)]
pub enum LowerError {
    #[error("expression cannot be used inside a query")]
    #[diagnostic(
        code(E3001),
        help("the expression reads query-entity state but has no relational equivalent")
    )]
    NotAllowedInQuery {
        #[label("no query lowering for this expression")]
        span: SourceSpan,
    },

    #[error("operator '{op}' not supported in queries for {left} and {right}")]
    #[diagnostic(code(E3002))]
    OperatorNotInQuery {
        op: String,
        left: String,
        right: String,
        #[label("must be a pure query expression here")]
        span: SourceSpan,
    },

    #[error("function '{name}' has no query equivalent")]
    #[diagnostic(code(E3003))]
    FunctionNotInQuery {
        name: String,
        #[label("cannot be called inside a query")]
        span: SourceSpan,
    },

    #[error("invalid assignment target")]
    #[diagnostic(code(E3004))]
    BadDestination {
        #[label("cannot assign here")]
        span: SourceSpan,
    },

    #[error("cannot assign to '[]' of type {ty}")]
    #[diagnostic(code(E3005))]
    SubscriptNotAssignable {
        ty: String,
        #[label("read-only subscript")]
        span: SourceSpan,
    },

    #[error("cannot assign to immutable variable '{name}'")]
    #[diagnostic(code(E3006))]
    ImmutableAssignment {
        name: String,
        #[label("declared as immutable")]
        span: SourceSpan,
    },

    #[error("{construct} not allowed in a global constant")]
    #[diagnostic(code(E3007))]
    RestrictedInConstant {
        construct: String,
        #[label("restricted construct")]
        span: SourceSpan,
    },

    #[error("cannot access member '{name}' of nullable type {ty}")]
    #[diagnostic(code(E3008), help("use '?.' to access members of a nullable value"))]
    MemberOnNullable {
        name: String,
        ty: String,
        #[label("receiver may be null")]
        span: SourceSpan,
    },

    #[error("unknown member '{name}' of type {ty}")]
    #[diagnostic(code(E3009))]
    UnknownMember {
        name: String,
        ty: String,
        #[label("not a member")]
        span: SourceSpan,
    },

    #[error("operator '[]' undefined for type {ty}")]
    #[diagnostic(code(E3010))]
    SubscriptBadBase {
        ty: String,
        #[label("cannot be subscripted")]
        span: SourceSpan,
    },

    #[error("invalid subscript key: expected {expected}, found {found}")]
    #[diagnostic(code(E3011))]
    SubscriptKeyType {
        expected: String,
        found: String,
        #[label("wrong key type")]
        span: SourceSpan,
    },

    #[error("cannot apply '[]' on nullable value")]
    #[diagnostic(code(E3012))]
    SubscriptOnNullable {
        #[label("base may be null")]
        span: SourceSpan,
    },

    #[error("tuple subscript must be a constant expression")]
    #[diagnostic(code(E3013))]
    TupleIndexNotConstant {
        #[label("not a compile-time constant")]
        span: SourceSpan,
    },

    #[error("tuple index {index} out of bounds (0..{size})")]
    #[diagnostic(code(E3014))]
    TupleIndexOutOfBounds {
        index: i64,
        size: usize,
        #[label("no such field")]
        span: SourceSpan,
    },

    #[error("not a function: value of type {ty}")]
    #[diagnostic(code(E3015))]
    NotAFunction {
        ty: String,
        #[label("cannot be called")]
        span: SourceSpan,
    },

    #[error("wrong type for operator '?.': {ty}")]
    #[diagnostic(code(E3016))]
    SafeMemberBadType {
        ty: String,
        #[label("receiver is not nullable")]
        span: SourceSpan,
    },

    #[error("expression captures the entity of an outer query")]
    #[diagnostic(code(E3017))]
    IllegalScopeCapture {
        #[label("crosses a query boundary")]
        span: SourceSpan,
    },

    #[error("expression can only be used inside a query")]
    #[diagnostic(code(E3018))]
    QueryOnly {
        #[label("reads query-entity state")]
        span: SourceSpan,
    },
}

/// Non-fatal lowering diagnostics.
#[derive(Error, Debug, Diagnostic, Clone, PartialEq)]
pub enum LowerWarning {
    #[error("redundant '?.': receiver of type {ty} is never null")]
    #[diagnostic(code(W3001))]
    RedundantSafeNav {
        ty: String,
        #[label("safe navigation has no effect")]
        span: SourceSpan,
    },

    #[error("expression is always null here")]
    #[diagnostic(code(W3002))]
    AlwaysNull {
        #[label("provably null")]
        span: SourceSpan,
    },

    #[error("expression is never null here")]
    #[diagnostic(code(W3003))]
    NeverNull {
        #[label("provably not null")]
        span: SourceSpan,
    },
}

/// Runtime failures raised while evaluating interpreter expressions. The
/// stack-trace wrapper attaches source positions as the error unwinds.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RtError {
    #[error("null value")]
    NullValue,
    #[error("division by zero")]
    DivisionByZero,
    #[error("index {index} out of bounds (size {size})")]
    IndexOutOfBounds { index: i64, size: usize },
    #[error("key not found in map")]
    MapKeyNotFound,
    #[error("expression block is no longer live")]
    DeadBlock,
    #[error("no database available: {op}")]
    NoDatabase { op: String },
    #[error("value decoding failed: {detail}")]
    Decode { detail: String },
    #[error("{source}")]
    Traced {
        #[source]
        source: Box<RtError>,
        pos: FilePos,
    },
}

impl RtError {
    /// Wrap with a source position, building the runtime call trace.
    pub fn traced(self, pos: FilePos) -> RtError {
        RtError::Traced {
            source: Box::new(self),
            pos,
        }
    }

    /// The innermost untraced error.
    pub fn root(&self) -> &RtError {
        match self {
            RtError::Traced { source, .. } => source.root(),
            other => other,
        }
    }

    /// Source positions of the trace, outermost first.
    pub fn trace(&self) -> Vec<FilePos> {
        let mut out = Vec::new();
        let mut cur = self;
        while let RtError::Traced { source, pos } = cur {
            out.push(*pos);
            cur = source;
        }
        out
    }
}
