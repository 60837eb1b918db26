// src/query.rs
//
// Query expression IR: the subset of expressions that executes inside the
// generated relational query. Interpreter-computed fragments are carried as
// embedded `RExpr`s and become bound parameters at render time, so a query
// mixing entity columns with ordinary computation still costs one round trip.

use std::fmt::Write;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::errors::RtError;
use crate::rexpr::RExpr;
use crate::runtime::{Frame, Value};
use crate::schema::EntityDef;
use crate::types::Type;

/// Identifies one entity-query scope (one `from` binding) in a compiled
/// declaration. Assigned by the entity-query compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryScopeId(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub enum QueryExpr {
    /// An attribute of the correlated entity, possibly reached through a
    /// chain of entity-typed attributes (each step before the last is a
    /// join the query compiler materializes).
    Column {
        scope: QueryScopeId,
        entity: Arc<EntityDef>,
        path: SmallVec<[usize; 2]>,
        ty: Type,
    },
    /// The correlated entity itself, i.e. its row id.
    Rowid { scope: QueryScopeId },
    /// Bridge: evaluated once by the interpreter outside the query, then
    /// bound as a parameter.
    Interpreted { expr: Box<RExpr>, ty: Type },
    Binary {
        op: QBinaryOp,
        left: Box<QueryExpr>,
        right: Box<QueryExpr>,
        ty: Type,
    },
    /// Null-coalescing. The left side is always an interpreter expression
    /// by design; only the right side may be a genuine query expression.
    Coalesce {
        left: Box<RExpr>,
        right: Box<QueryExpr>,
        ty: Type,
    },
    Call {
        func: SqlFn,
        args: Vec<QueryExpr>,
        ty: Type,
    },
}

impl QueryExpr {
    pub fn ty(&self) -> Type {
        match self {
            QueryExpr::Column { ty, .. } => ty.clone(),
            QueryExpr::Rowid { .. } => Type::Rowid,
            QueryExpr::Interpreted { ty, .. } => ty.clone(),
            QueryExpr::Binary { ty, .. } => ty.clone(),
            QueryExpr::Coalesce { ty, .. } => ty.clone(),
            QueryExpr::Call { ty, .. } => ty.clone(),
        }
    }

    /// Render into `builder`, evaluating interpreter fragments via `frame`
    /// into bound parameters.
    pub fn to_sql(
        &self,
        frame: &mut Frame<'_>,
        aliases: &SqlAliases,
        builder: &mut SqlBuilder,
    ) -> Result<(), RtError> {
        match self {
            QueryExpr::Column {
                scope,
                entity,
                path,
                ..
            } => {
                let (prefix, last) = path.split_at(path.len() - 1);
                builder.append(&aliases.alias(*scope, prefix));
                builder.append(".");
                builder.append(&column_name(entity, prefix, last[0]));
                Ok(())
            }
            QueryExpr::Rowid { scope } => {
                builder.append(&aliases.alias(*scope, &[]));
                builder.append(".rowid");
                Ok(())
            }
            QueryExpr::Interpreted { expr, .. } => {
                let value = expr.evaluate(frame)?;
                builder.param(value);
                Ok(())
            }
            QueryExpr::Binary { op, left, right, .. } => {
                builder.append("(");
                left.to_sql(frame, aliases, builder)?;
                builder.append(" ");
                builder.append(op.sql());
                builder.append(" ");
                right.to_sql(frame, aliases, builder)?;
                builder.append(")");
                Ok(())
            }
            QueryExpr::Coalesce { left, right, .. } => {
                // Reduce at render time: a non-null left side makes the
                // whole expression a constant parameter.
                let lv = left.evaluate(frame)?;
                if !lv.is_null() {
                    builder.param(lv);
                    return Ok(());
                }
                right.to_sql(frame, aliases, builder)
            }
            QueryExpr::Call { func, args, .. } => func.to_sql(args, frame, aliases, builder),
        }
    }
}

/// Attribute (column) name of the final step of a join path.
fn column_name(entity: &Arc<EntityDef>, prefix: &[usize], last: usize) -> String {
    let mut current = entity.clone();
    for &step in prefix {
        match current.attr(step).ty.remove_nullable() {
            Type::Entity(next) => current = next.clone(),
            other => {
                // Upstream resolution guarantees join steps are entity-typed.
                debug_assert!(false, "join step through non-entity type {other}");
                break;
            }
        }
    }
    current.attr(last).name.clone()
}

/// Binary operators with a relational equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QBinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
}

impl QBinaryOp {
    pub fn sql(&self) -> &'static str {
        match self {
            QBinaryOp::And => "AND",
            QBinaryOp::Or => "OR",
            QBinaryOp::Eq => "=",
            QBinaryOp::Ne => "<>",
            QBinaryOp::Lt => "<",
            QBinaryOp::Gt => ">",
            QBinaryOp::Le => "<=",
            QBinaryOp::Ge => ">=",
            QBinaryOp::Add => "+",
            QBinaryOp::Sub => "-",
            QBinaryOp::Mul => "*",
            QBinaryOp::Div => "/",
            QBinaryOp::Mod => "%",
            QBinaryOp::Concat => "||",
        }
    }
}

/// System functions with a relational rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlFn {
    Upper,
    Lower,
    CharLength,
    ByteLength,
    Abs,
    Greatest,
    Least,
    /// `text[i]` — one-character substring, converting to 1-based.
    TextSubscript,
    /// `byte_array[i]`.
    ByteSubscript,
    /// `list[i]` — array element, converting to 1-based.
    ListAt,
    /// `map[k]` — keyed document access.
    MapAt,
}

impl SqlFn {
    fn to_sql(
        &self,
        args: &[QueryExpr],
        frame: &mut Frame<'_>,
        aliases: &SqlAliases,
        builder: &mut SqlBuilder,
    ) -> Result<(), RtError> {
        match self {
            SqlFn::Upper => simple_call("UPPER", args, frame, aliases, builder),
            SqlFn::Lower => simple_call("LOWER", args, frame, aliases, builder),
            SqlFn::CharLength => simple_call("LENGTH", args, frame, aliases, builder),
            SqlFn::ByteLength => simple_call("OCTET_LENGTH", args, frame, aliases, builder),
            SqlFn::Abs => simple_call("ABS", args, frame, aliases, builder),
            SqlFn::Greatest => simple_call("GREATEST", args, frame, aliases, builder),
            SqlFn::Least => simple_call("LEAST", args, frame, aliases, builder),
            SqlFn::TextSubscript => {
                builder.append("SUBSTR(");
                args[0].to_sql(frame, aliases, builder)?;
                builder.append(", (");
                args[1].to_sql(frame, aliases, builder)?;
                builder.append(") + 1, 1)");
                Ok(())
            }
            SqlFn::ByteSubscript => {
                builder.append("GET_BYTE(");
                args[0].to_sql(frame, aliases, builder)?;
                builder.append(", ");
                args[1].to_sql(frame, aliases, builder)?;
                builder.append(")");
                Ok(())
            }
            SqlFn::ListAt => {
                builder.append("(");
                args[0].to_sql(frame, aliases, builder)?;
                builder.append(")[(");
                args[1].to_sql(frame, aliases, builder)?;
                builder.append(") + 1]");
                Ok(())
            }
            SqlFn::MapAt => {
                builder.append("(");
                args[0].to_sql(frame, aliases, builder)?;
                builder.append(" -> ");
                args[1].to_sql(frame, aliases, builder)?;
                builder.append(")");
                Ok(())
            }
        }
    }
}

fn simple_call(
    name: &str,
    args: &[QueryExpr],
    frame: &mut Frame<'_>,
    aliases: &SqlAliases,
    builder: &mut SqlBuilder,
) -> Result<(), RtError> {
    builder.append(name);
    builder.append("(");
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            builder.append(", ");
        }
        arg.to_sql(frame, aliases, builder)?;
    }
    builder.append(")");
    Ok(())
}

/// Table aliases assigned by the entity-query compiler. Join-path prefixes
/// get their own alias; unregistered paths fall back to a derived name so
/// rendering stays deterministic.
#[derive(Debug, Default)]
pub struct SqlAliases {
    assigned: FxHashMap<(QueryScopeId, Vec<usize>), String>,
}

impl SqlAliases {
    pub fn new() -> SqlAliases {
        SqlAliases::default()
    }

    pub fn assign(&mut self, scope: QueryScopeId, path: Vec<usize>, alias: impl Into<String>) {
        self.assigned.insert((scope, path), alias.into());
    }

    pub fn alias(&self, scope: QueryScopeId, path: &[usize]) -> String {
        if let Some(alias) = self.assigned.get(&(scope, path.to_vec())) {
            return alias.clone();
        }
        let mut alias = format!("a{}", scope.0);
        for step in path {
            let _ = write!(alias, "_{step}");
        }
        alias
    }
}

/// Accumulates SQL text plus bound parameters in placeholder order.
#[derive(Debug, Default)]
pub struct SqlBuilder {
    sql: String,
    params: Vec<Value>,
}

impl SqlBuilder {
    pub fn new() -> SqlBuilder {
        SqlBuilder::default()
    }

    pub fn append(&mut self, text: &str) {
        self.sql.push_str(text);
    }

    pub fn param(&mut self, value: Value) {
        self.params.push(value);
        self.sql.push('?');
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn finish(self) -> (String, Vec<Value>) {
        (self.sql, self.params)
    }
}
