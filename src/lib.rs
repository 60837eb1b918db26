// src/lib.rs
pub mod errors;
pub mod lower;
pub mod options;
pub mod query;
pub mod rexpr;
pub mod runtime;
pub mod schema;
pub mod source;
pub mod types;

pub use errors::{LowerError, LowerWarning, RtError};
pub use lower::{ExprInfo, ExprKind, ExprNode, FlowFacts, LowerCtx, Projection, RowMerger};
pub use options::CompilerOptions;
pub use query::{QueryExpr, QueryScopeId, SqlAliases, SqlBuilder};
pub use rexpr::RExpr;
pub use runtime::{EntityBackend, Frame, MemBackend, NoDb, Value};
pub use source::{FilePos, Span};
pub use types::Type;
