// src/lower/tests.rs
//! End-to-end lowering tests: metadata propagation, the dual lowering
//! paths, projections, destinations, folding, and the diagnostics around
//! safe navigation and constant restrictions.
//!
//! Query expressions are executed against a small model of the relational
//! engine (`eval_qexpr`) backed by `MemBackend` rows, so direct and split
//! projections can be compared against the same data.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::smallvec;

use crate::errors::{LowerError, LowerWarning, RtError};
use crate::lower::calls::{CallExpr, CallTarget, SysFnDescriptor};
use crate::lower::destination::destination;
use crate::lower::expr::ExprNode;
use crate::lower::fold::{constant_value, ConstEvalCtx};
use crate::lower::member::{member, MemberStrategy, WrappedExpr};
use crate::lower::projection::{Projection, RowMerger};
use crate::lower::subscript::subscript;
use crate::lower::{ops, GlobalConstDef, Late, LowerCtx};
use crate::options::CompilerOptions;
use crate::query::{QBinaryOp, QueryExpr, QueryScopeId, SqlAliases, SqlBuilder, SqlFn};
use crate::rexpr::{FunctionBody, RBinaryOp, RExpr};
use crate::runtime::{BlockId, EntityBackend, Frame, MemBackend, NoDb, Slot, Value};
use crate::schema::{AttrDef, EntityDef, EntityId, FunctionId, GlobalConstId};
use crate::source::Span;
use crate::types::{TupleField, Type};

fn sp() -> Span {
    Span::new(0, 1, 1, 1)
}

fn ctx() -> LowerCtx {
    LowerCtx::new(CompilerOptions::default())
}

fn company() -> Arc<EntityDef> {
    EntityDef::new(
        EntityId(1),
        "company",
        vec![AttrDef {
            name: "name".to_string(),
            ty: Type::Text,
            mutable: false,
        }],
    )
}

/// account(amount: integer, name: text, ref: company?)
fn account(company: &Arc<EntityDef>) -> Arc<EntityDef> {
    EntityDef::new(
        EntityId(0),
        "account",
        vec![
            AttrDef {
                name: "amount".to_string(),
                ty: Type::Integer,
                mutable: true,
            },
            AttrDef {
                name: "name".to_string(),
                ty: Type::Text,
                mutable: false,
            },
            AttrDef {
                name: "ref".to_string(),
                ty: Type::Entity(company.clone()).nullable(),
                mutable: true,
            },
        ],
    )
}

fn item(entity: &Arc<EntityDef>) -> ExprNode {
    ExprNode::query_item(sp(), QueryScopeId(0), entity.clone())
}

fn int(n: i64) -> ExprNode {
    ExprNode::constant(sp(), Value::Integer(n), Type::Integer)
}

fn attr(cx: &LowerCtx, base: ExprNode, name: &str) -> ExprNode {
    member(cx, sp(), base, name, false).unwrap()
}

type Rows = FxHashMap<QueryScopeId, Value>;

/// Minimal model of the relational engine, with SQL null propagation.
fn eval_qexpr(q: &QueryExpr, frame: &mut Frame<'_>, rows: &Rows) -> Result<Value, RtError> {
    match q {
        QueryExpr::Column { scope, path, .. } => {
            let mut current = rows[scope].clone();
            for &step in path {
                if current.is_null() {
                    return Ok(Value::Null);
                }
                let (entity, rowid) = current.as_entity()?;
                current = frame.backend().attr_value(entity, rowid, step)?;
            }
            Ok(current)
        }
        QueryExpr::Rowid { scope } => Ok(rows[scope].clone()),
        QueryExpr::Interpreted { expr, .. } => expr.evaluate(frame),
        QueryExpr::Binary { op, left, right, .. } => {
            let l = eval_qexpr(left, frame, rows)?;
            let r = eval_qexpr(right, frame, rows)?;
            if l.is_null() || r.is_null() {
                return Ok(Value::Null);
            }
            q_op(*op).apply(&l, &r)
        }
        QueryExpr::Coalesce { left, right, .. } => {
            let l = left.evaluate(frame)?;
            if l.is_null() {
                eval_qexpr(right, frame, rows)
            } else {
                Ok(l)
            }
        }
        QueryExpr::Call { func, args, .. } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_qexpr(arg, frame, rows)?);
            }
            if values.iter().any(Value::is_null) {
                return Ok(Value::Null);
            }
            match func {
                SqlFn::Abs => Ok(Value::Integer(values[0].as_integer()?.abs())),
                SqlFn::Upper => Ok(Value::text(values[0].as_text()?.to_uppercase())),
                SqlFn::Lower => Ok(Value::text(values[0].as_text()?.to_lowercase())),
                SqlFn::CharLength => {
                    Ok(Value::Integer(values[0].as_text()?.chars().count() as i64))
                }
                other => panic!("sql function {other:?} not modeled in tests"),
            }
        }
    }
}

fn q_op(op: QBinaryOp) -> RBinaryOp {
    match op {
        QBinaryOp::And => RBinaryOp::And,
        QBinaryOp::Or => RBinaryOp::Or,
        QBinaryOp::Eq => RBinaryOp::Eq,
        QBinaryOp::Ne => RBinaryOp::Ne,
        QBinaryOp::Lt => RBinaryOp::Lt,
        QBinaryOp::Gt => RBinaryOp::Gt,
        QBinaryOp::Le => RBinaryOp::Le,
        QBinaryOp::Ge => RBinaryOp::Ge,
        QBinaryOp::Add => RBinaryOp::Add,
        QBinaryOp::Sub => RBinaryOp::Sub,
        QBinaryOp::Mul => RBinaryOp::Mul,
        QBinaryOp::Div => RBinaryOp::Div,
        QBinaryOp::Mod => RBinaryOp::Mod,
        QBinaryOp::Concat => RBinaryOp::Concat,
    }
}

/// Evaluate one projection against one result row: run its atoms through
/// the engine model, then decode.
fn run_projection(p: &Projection, frame: &mut Frame<'_>, rows: &Rows) -> Result<Value, RtError> {
    let mut decoded = Vec::new();
    for atom in p.atoms() {
        decoded.push(eval_qexpr(atom, frame, rows)?);
    }
    p.decode(frame, &mut decoded.into_iter())
}

#[test]
fn metadata_propagates_up_the_tree() {
    let cx = ctx();
    let company = company();
    let account = account(&company);
    let amount = attr(&cx, item(&account), "amount");
    let cmp = ops::binary(sp(), RBinaryOp::Gt, Type::Boolean, amount, int(100));

    let info = cmp.info();
    assert!(info.depends_on_query_entity);
    assert!(!info.has_write_effect);
    assert!(info.pushdown_eligible);
    assert!(info.captured_scopes.contains(&QueryScopeId(0)));
}

#[test]
fn entity_free_subtree_bridges_as_bound_parameter() {
    let cx = ctx();
    let sum = ops::binary(sp(), RBinaryOp::Add, Type::Integer, int(1), int(2));
    let q = sum.to_query(&cx).unwrap();
    assert!(matches!(q, QueryExpr::Interpreted { .. }));

    let mut frame = Frame::new(&NoDb, 0);
    let mut builder = SqlBuilder::new();
    q.to_sql(&mut frame, &SqlAliases::new(), &mut builder).unwrap();
    assert_eq!(builder.sql(), "?");
    assert_eq!(builder.params(), &[Value::Integer(3)]);
}

#[test]
fn column_comparison_projects_direct() {
    let cx = ctx();
    let company = company();
    let account = account(&company);
    let cmp = ops::binary(
        sp(),
        RBinaryOp::Gt,
        Type::Boolean,
        attr(&cx, item(&account), "amount"),
        int(100),
    );

    let p = cmp.to_projection(&cx).unwrap();
    let Projection::Direct { expr, .. } = &p else {
        panic!("expected direct projection");
    };
    assert_eq!(p.atoms().len(), 1);

    let mut frame = Frame::new(&NoDb, 0);
    let mut builder = SqlBuilder::new();
    expr.to_sql(&mut frame, &SqlAliases::new(), &mut builder).unwrap();
    assert_eq!(builder.sql(), "(a0.amount > ?)");
    assert_eq!(builder.params(), &[Value::Integer(100)]);

    // Run against a real row.
    let backend = MemBackend::new();
    let rowid = backend.insert_row(
        EntityId(0),
        vec![Value::Integer(150), Value::text("a"), Value::Null],
    );
    let mut frame = Frame::new(&backend, 0);
    let mut rows = Rows::default();
    rows.insert(QueryScopeId(0), Value::Entity(EntityId(0), rowid));
    assert_eq!(
        run_projection(&p, &mut frame, &rows).unwrap(),
        Value::Boolean(true)
    );
}

#[test]
fn list_literal_projects_split_with_one_atom_per_element() {
    let cx = ctx();
    let company = company();
    let account = account(&company);
    let list = ExprNode::list_literal(
        sp(),
        vec![attr(&cx, item(&account), "amount"), int(5)],
        Type::Integer,
    );

    let p = list.to_projection(&cx).unwrap();
    let Projection::Split { merger, .. } = &p else {
        panic!("expected split projection");
    };
    assert_eq!(*merger, RowMerger::List);

    let atoms = p.atoms();
    assert_eq!(atoms.len(), 2);
    assert!(matches!(atoms[0], QueryExpr::Column { .. }));
    assert!(matches!(atoms[1], QueryExpr::Interpreted { .. }));

    let backend = MemBackend::new();
    let rowid = backend.insert_row(
        EntityId(0),
        vec![Value::Integer(42), Value::text("a"), Value::Null],
    );
    let mut frame = Frame::new(&backend, 0);
    let mut rows = Rows::default();
    rows.insert(QueryScopeId(0), Value::Entity(EntityId(0), rowid));
    assert_eq!(
        run_projection(&p, &mut frame, &rows).unwrap(),
        Value::list(vec![Value::Integer(42), Value::Integer(5)])
    );
}

#[test]
fn member_over_subscripted_collection_splits_instead_of_erroring() {
    let cx = ctx();
    let company = company();
    let holder = EntityDef::new(
        EntityId(2),
        "holder",
        vec![AttrDef {
            name: "items".to_string(),
            ty: Type::list(Type::Entity(company.clone())),
            mutable: false,
        }],
    );

    // holder.items[0].name: the receiver is not an attribute chain, so the
    // trailing member cannot become a column and must split.
    let items = attr(&cx, item(&holder), "items");
    let first = subscript(&cx, sp(), items, int(0)).unwrap();
    let name = attr(&cx, first, "name");

    let info = name.info();
    assert!(info.depends_on_query_entity);
    assert!(!info.pushdown_eligible);

    let p = name.to_projection(&cx).unwrap();
    assert!(matches!(
        &p,
        Projection::Split {
            merger: RowMerger::Member { safe: false, .. },
            ..
        }
    ));
}

#[test]
fn nullable_reference_chain_in_query() {
    let cx = ctx();
    let company = company();
    let account = account(&company);

    // account.ref?.name collapses into one column with a join path.
    let chain = member(&cx, sp(), attr(&cx, item(&account), "ref"), "name", true).unwrap();
    assert_eq!(*chain.ty(), Type::Text.nullable());

    let q = chain.to_query(&cx).unwrap();
    let QueryExpr::Column { path, .. } = &q else {
        panic!("expected a column, got {q:?}");
    };
    assert_eq!(path.as_slice(), &[2, 0]);

    // Rendering derives a join alias from the path prefix.
    let mut frame = Frame::new(&NoDb, 0);
    let mut builder = SqlBuilder::new();
    q.to_sql(&mut frame, &SqlAliases::new(), &mut builder).unwrap();
    assert_eq!(builder.sql(), "a0_2.name");

    let backend = MemBackend::new();
    let company_row = backend.insert_row(EntityId(1), vec![Value::text("acme")]);
    let with_ref = backend.insert_row(
        EntityId(0),
        vec![
            Value::Integer(1),
            Value::text("a"),
            Value::Entity(EntityId(1), company_row),
        ],
    );
    let without_ref = backend.insert_row(
        EntityId(0),
        vec![Value::Integer(2), Value::text("b"), Value::Null],
    );

    let mut frame = Frame::new(&backend, 0);
    let mut rows = Rows::default();
    rows.insert(QueryScopeId(0), Value::Entity(EntityId(0), with_ref));
    assert_eq!(
        eval_qexpr(&q, &mut frame, &rows).unwrap(),
        Value::text("acme")
    );
    rows.insert(QueryScopeId(0), Value::Entity(EntityId(0), without_ref));
    assert_eq!(eval_qexpr(&q, &mut frame, &rows).unwrap(), Value::Null);
}

#[test]
fn nullable_reference_chain_in_interpreter() {
    let cx = ctx();
    let company = company();
    let account = account(&company);

    // Same chain over a plain local: lowers to the interpreter and
    // short-circuits identically.
    let local = ExprNode::local(sp(), "acc", Slot(0), Type::Entity(account.clone()), false);
    let chain = member(&cx, sp(), attr(&cx, local, "ref"), "name", true).unwrap();
    assert!(!chain.info().depends_on_query_entity);
    let expr = chain.to_interp(&cx).unwrap();

    let backend = MemBackend::new();
    let company_row = backend.insert_row(EntityId(1), vec![Value::text("acme")]);
    let with_ref = backend.insert_row(
        EntityId(0),
        vec![
            Value::Integer(1),
            Value::text("a"),
            Value::Entity(EntityId(1), company_row),
        ],
    );
    let without_ref = backend.insert_row(
        EntityId(0),
        vec![Value::Integer(2), Value::text("b"), Value::Null],
    );

    let mut frame = Frame::new(&backend, 1);
    frame.set_local(Slot(0), Value::Entity(EntityId(0), with_ref));
    assert_eq!(expr.evaluate(&mut frame).unwrap(), Value::text("acme"));
    frame.set_local(Slot(0), Value::Entity(EntityId(0), without_ref));
    assert_eq!(expr.evaluate(&mut frame).unwrap(), Value::Null);
}

#[test]
fn lowering_is_idempotent() {
    let cx = ctx();
    let company = company();
    let account = account(&company);
    let cmp = ops::binary(
        sp(),
        RBinaryOp::Gt,
        Type::Boolean,
        attr(&cx, item(&account), "amount"),
        int(100),
    );

    assert_eq!(cmp.to_query(&cx).unwrap(), cmp.to_query(&cx).unwrap());
    assert_eq!(
        cmp.to_projection(&cx).unwrap(),
        cmp.to_projection(&cx).unwrap()
    );

    let sum = ops::binary(sp(), RBinaryOp::Add, Type::Integer, int(1), int(2));
    assert_eq!(sum.to_interp(&cx).unwrap(), sum.to_interp(&cx).unwrap());
}

#[test]
fn split_and_direct_projections_agree() {
    let cx = ctx();
    let company = company();
    let account = account(&company);
    let abs = SysFnDescriptor::find("abs").unwrap();

    let direct = CallExpr::full(
        sp(),
        CallTarget::Sys(abs),
        None,
        false,
        vec![attr(&cx, item(&account), "amount")],
        Arc::from([0usize]),
        Type::Integer,
    )
    .to_projection(&cx)
    .unwrap();
    assert!(matches!(direct, Projection::Direct { .. }));

    // The split strategy is legal for the same call; both must decode to
    // the same value for the same row.
    let split = Projection::Split {
        parts: vec![Projection::direct(
            attr(&cx, item(&account), "amount").to_query(&cx).unwrap(),
        )],
        merger: RowMerger::Call {
            target: CallTarget::Sys(abs).runtime(),
            mapping: Arc::from([0usize]),
            has_base: false,
            safe: false,
        },
        ty: Type::Integer,
    };

    let backend = MemBackend::new();
    let rowid = backend.insert_row(
        EntityId(0),
        vec![Value::Integer(-9), Value::text("a"), Value::Null],
    );
    let mut frame = Frame::new(&backend, 0);
    let mut rows = Rows::default();
    rows.insert(QueryScopeId(0), Value::Entity(EntityId(0), rowid));

    let a = run_projection(&direct, &mut frame, &rows).unwrap();
    let b = run_projection(&split, &mut frame, &rows).unwrap();
    assert_eq!(a, b);
    assert_eq!(a, Value::Integer(9));
}

#[test]
fn call_without_query_equivalent_splits_its_receiver() {
    let cx = ctx();
    let company = company();
    let account = account(&company);
    let to_text = SysFnDescriptor::find("integer.to_text").unwrap();

    let call = CallExpr::full(
        sp(),
        CallTarget::Sys(to_text),
        Some(attr(&cx, item(&account), "amount")),
        false,
        vec![],
        Arc::from([] as [usize; 0]),
        Type::Text,
    );
    assert!(!call.info().pushdown_eligible);

    let p = call.to_projection(&cx).unwrap();
    let Projection::Split { merger, .. } = &p else {
        panic!("expected split projection");
    };
    assert!(matches!(merger, RowMerger::Call { has_base: true, .. }));
    assert_eq!(p.atoms().len(), 1);

    let backend = MemBackend::new();
    let rowid = backend.insert_row(
        EntityId(0),
        vec![Value::Integer(7), Value::text("a"), Value::Null],
    );
    let mut frame = Frame::new(&backend, 0);
    let mut rows = Rows::default();
    rows.insert(QueryScopeId(0), Value::Entity(EntityId(0), rowid));
    assert_eq!(
        run_projection(&p, &mut frame, &rows).unwrap(),
        Value::text("7")
    );
}

#[test]
fn disabling_split_projections_forces_direct() {
    let cx = LowerCtx::new(CompilerOptions {
        split_projections: false,
        ..CompilerOptions::default()
    });
    let company = company();
    let account = account(&company);
    let list = ExprNode::list_literal(
        sp(),
        vec![attr(&cx, item(&account), "amount")],
        Type::Integer,
    );
    // Direct is mandatory, and a list has no relational form.
    let err = list.to_projection(&cx).unwrap_err();
    assert!(matches!(err, LowerError::NotAllowedInQuery { .. }));
}

#[test]
fn list_destination_compiles_tuple_destination_does_not() {
    let cx = ctx();
    let list_local = ExprNode::local(
        sp(),
        "xs",
        Slot(0),
        Type::list(Type::Integer),
        true,
    );
    let elem = subscript(&cx, sp(), list_local, int(0)).unwrap();
    let dest = destination(&cx, &elem).unwrap();
    assert_eq!(dest.effective, Type::Integer);

    let assign = dest.assign(RExpr::Constant(Value::Integer(99)));
    let mut frame = Frame::new(&NoDb, 1);
    frame.set_local(Slot(0), Value::list(vec![Value::Integer(1)]));
    assign.evaluate(&mut frame).unwrap();
    let list = frame.get_local(Slot(0)).unwrap();
    assert_eq!(list.as_list().unwrap().borrow()[0], Value::Integer(99));

    let tuple_ty = Type::tuple(vec![
        TupleField {
            name: None,
            ty: Type::Integer,
        },
        TupleField {
            name: None,
            ty: Type::Text,
        },
    ]);
    let tuple_local = ExprNode::local(sp(), "t", Slot(1), tuple_ty, true);
    let field = subscript(&cx, sp(), tuple_local, int(0)).unwrap();
    let err = destination(&cx, &field).unwrap_err();
    let LowerError::SubscriptNotAssignable { ty, .. } = err else {
        panic!("expected a destination error, got {err:?}");
    };
    assert_eq!(ty, "(integer,text)");
}

#[test]
fn tuple_subscript_requires_constant_in_bounds_index() {
    let cx = ctx();
    let tuple_ty = Type::tuple(vec![TupleField {
        name: None,
        ty: Type::Integer,
    }]);

    let dynamic = ExprNode::local(sp(), "i", Slot(0), Type::Integer, false);
    let t = ExprNode::local(sp(), "t", Slot(1), tuple_ty.clone(), false);
    let err = subscript(&cx, sp(), t, dynamic).unwrap_err();
    assert!(matches!(err, LowerError::TupleIndexNotConstant { .. }));

    let t = ExprNode::local(sp(), "t", Slot(1), tuple_ty, false);
    let err = subscript(&cx, sp(), t, int(3)).unwrap_err();
    assert!(matches!(
        err,
        LowerError::TupleIndexOutOfBounds { index: 3, size: 1, .. }
    ));
}

#[test]
fn self_referential_constant_folds_to_not_constant() {
    let cx = ctx();
    let a = GlobalConstId(0);
    // const A = A + 1
    let init = ops::binary(
        sp(),
        RBinaryOp::Add,
        Type::Integer,
        ExprNode::global_const(sp(), a, Type::Integer),
        int(1),
    );
    cx.define_global_const(
        a,
        GlobalConstDef {
            name: "A".to_string(),
            ty: Type::Integer,
            init: Arc::new(init),
        },
    );

    let node = ExprNode::global_const(sp(), a, Type::Integer);
    let mut eval = ConstEvalCtx::default();
    assert_eq!(constant_value(&node, &cx, &mut eval), None);
}

#[test]
fn mutually_recursive_constants_terminate() {
    let cx = ctx();
    let a = GlobalConstId(0);
    let b = GlobalConstId(1);
    cx.define_global_const(
        a,
        GlobalConstDef {
            name: "A".to_string(),
            ty: Type::Integer,
            init: Arc::new(ExprNode::global_const(sp(), b, Type::Integer)),
        },
    );
    cx.define_global_const(
        b,
        GlobalConstDef {
            name: "B".to_string(),
            ty: Type::Integer,
            init: Arc::new(ExprNode::global_const(sp(), a, Type::Integer)),
        },
    );

    let node = ExprNode::global_const(sp(), a, Type::Integer);
    let mut eval = ConstEvalCtx::default();
    assert_eq!(constant_value(&node, &cx, &mut eval), None);
}

#[test]
fn constant_folding_resolves_acyclic_references() {
    let cx = ctx();
    let b = GlobalConstId(0);
    let a = GlobalConstId(1);
    cx.define_global_const(
        b,
        GlobalConstDef {
            name: "B".to_string(),
            ty: Type::Integer,
            init: Arc::new(int(2)),
        },
    );
    cx.define_global_const(
        a,
        GlobalConstDef {
            name: "A".to_string(),
            ty: Type::Integer,
            init: Arc::new(ops::binary(
                sp(),
                RBinaryOp::Add,
                Type::Integer,
                ExprNode::global_const(sp(), b, Type::Integer),
                int(3),
            )),
        },
    );

    let node = ExprNode::global_const(sp(), a, Type::Integer);
    let mut eval = ConstEvalCtx::default();
    assert_eq!(
        constant_value(&node, &cx, &mut eval),
        Some(Value::Integer(5))
    );

    // The lowered initializers evaluate the same way, in id order.
    let inits = cx.lower_constant_initializers().unwrap();
    let mut frame = Frame::new(&NoDb, 0);
    let mut constants = Vec::new();
    for init in &inits {
        frame.set_constants(constants.clone());
        constants.push(init.evaluate(&mut frame).unwrap());
    }
    assert_eq!(constants, vec![Value::Integer(2), Value::Integer(5)]);
}

#[test]
fn nonpure_builtin_restricted_in_constant_initializer() {
    let block_time = SysFnDescriptor::find("last_block_time").unwrap();
    let call = CallExpr::full(
        sp(),
        CallTarget::Sys(block_time),
        None,
        false,
        vec![],
        Arc::from([] as [usize; 0]),
        Type::Integer,
    );
    let err = call.check_constant_restrictions().unwrap_err();
    let LowerError::RestrictedInConstant { construct, .. } = err else {
        panic!("expected a restriction error, got {err:?}");
    };
    assert!(construct.contains("last_block_time"));
}

#[test]
fn create_restricted_in_constant_initializer() {
    let company = company();
    let node = ExprNode::create(
        sp(),
        company,
        vec![(0, ExprNode::constant(sp(), Value::text("x"), Type::Text))],
    );
    let err = node.check_constant_restrictions().unwrap_err();
    assert!(matches!(err, LowerError::RestrictedInConstant { .. }));
}

#[test]
fn pure_builtin_allowed_in_constant_initializer() {
    let abs = SysFnDescriptor::find("abs").unwrap();
    let call = CallExpr::full(
        sp(),
        CallTarget::Sys(abs),
        None,
        false,
        vec![int(-4)],
        Arc::from([0usize]),
        Type::Integer,
    );
    assert!(call.check_constant_restrictions().is_ok());
}

#[test]
fn safe_navigation_diagnostics() {
    let cx = ctx();
    let company = company();
    let account = account(&company);

    // `?.` on a never-null receiver: warning.
    let local = ExprNode::local(sp(), "acc", Slot(0), Type::Entity(account.clone()), false);
    member(&cx, sp(), local, "amount", true).unwrap();
    let messages = cx.take_messages();
    assert!(messages
        .warnings
        .iter()
        .any(|w| matches!(w, LowerWarning::RedundantSafeNav { .. })));

    // Plain `.` on a nullable receiver: error.
    let cx = ctx();
    let nullable = ExprNode::local(
        sp(),
        "acc",
        Slot(0),
        Type::Entity(account).nullable(),
        false,
    );
    let err = member(&cx, sp(), nullable, "amount", false).unwrap_err();
    assert!(matches!(err, LowerError::MemberOnNullable { .. }));
}

#[test]
fn unknown_member_names_type_and_member() {
    let cx = ctx();
    let company = company();
    let account = account(&company);
    let err = member(&cx, sp(), item(&account), "balance", false).unwrap_err();
    let LowerError::UnknownMember { name, ty, .. } = err else {
        panic!("expected unknown member, got {err:?}");
    };
    assert_eq!(name, "balance");
    assert_eq!(ty, "account");
}

#[test]
fn narrowing_wrapper_defers_its_diagnostic() {
    let cx = ctx();
    let nullable = ExprNode::local(sp(), "x", Slot(0), Type::Integer.nullable(), false);
    let wrapped = WrappedExpr::narrow_not_null(nullable, true);
    assert_eq!(*wrapped.ty(), Type::Integer);
    assert!(cx.take_messages().warnings.is_empty());

    let node = wrapped.materialize(&cx);
    assert_eq!(*node.ty(), Type::Integer);
    let messages = cx.take_messages();
    assert!(messages
        .warnings
        .iter()
        .any(|w| matches!(w, LowerWarning::NeverNull { .. })));
}

#[test]
fn elvis_left_operand_is_never_query_lowered() {
    let cx = ctx();
    let company = company();
    let account = account(&company);

    // (x ?: account.amount): the left side becomes an interpreter fragment
    // inside a store-native coalesce.
    let local = ExprNode::local(sp(), "x", Slot(0), Type::Integer.nullable(), false);
    let e = ops::elvis(sp(), local, attr(&cx, item(&account), "amount"));
    let q = e.to_query(&cx).unwrap();
    assert!(matches!(q, QueryExpr::Coalesce { .. }));

    let backend = MemBackend::new();
    let rowid = backend.insert_row(
        EntityId(0),
        vec![Value::Integer(50), Value::text("a"), Value::Null],
    );
    let mut rows = Rows::default();
    rows.insert(QueryScopeId(0), Value::Entity(EntityId(0), rowid));

    let mut frame = Frame::new(&backend, 1);
    frame.set_local(Slot(0), Value::Null);
    assert_eq!(eval_qexpr(&q, &mut frame, &rows).unwrap(), Value::Integer(50));
    frame.set_local(Slot(0), Value::Integer(7));
    assert_eq!(eval_qexpr(&q, &mut frame, &rows).unwrap(), Value::Integer(7));

    // An entity-dependent left side has nowhere to run.
    let cx = ctx();
    let chain = member(&cx, sp(), attr(&cx, item(&account), "ref"), "name", true).unwrap();
    let e = ops::elvis(sp(), chain, ExprNode::constant(sp(), Value::text("none"), Type::Text));
    assert!(!e.info().pushdown_eligible);
    let err = e.to_query(&cx).unwrap_err();
    assert!(matches!(err, LowerError::NotAllowedInQuery { .. }));
}

#[test]
fn operator_without_query_form_names_both_operand_types() {
    let cx = ctx();
    let company = company();
    let account = account(&company);

    let left = ExprNode::list_literal(
        sp(),
        vec![attr(&cx, item(&account), "amount")],
        Type::Integer,
    );
    let right = ExprNode::list_literal(sp(), vec![int(5)], Type::Integer);
    let eq = ops::binary(sp(), RBinaryOp::Eq, Type::Boolean, left, right);

    let err = eq.to_query(&cx).unwrap_err();
    let LowerError::OperatorNotInQuery { op, left, right, .. } = err else {
        panic!("expected operator error, got {err:?}");
    };
    assert_eq!(op, "==");
    assert_eq!(left, "list<integer>");
    assert_eq!(right, "list<integer>");
}

#[test]
fn scope_capture_validation() {
    let cx = ctx();
    let company = company();
    let account = account(&company);
    let amount = attr(&cx, item(&account), "amount");

    let mut visible = rustc_hash::FxHashSet::default();
    visible.insert(QueryScopeId(1));
    let err = amount.check_captures(&visible).unwrap_err();
    assert!(matches!(err, LowerError::IllegalScopeCapture { .. }));

    visible.insert(QueryScopeId(0));
    assert!(amount.check_captures(&visible).is_ok());
}

#[test]
fn collection_bound_local_counts_as_a_scope_capture() {
    let x = ExprNode::local_in_scope(sp(), "x", Slot(0), Type::Integer, QueryScopeId(2));
    let sum = ops::binary(sp(), RBinaryOp::Add, Type::Integer, x, int(1));

    // A collection item is a plain local at runtime; only its scope marks
    // the subtree as correlated.
    let info = sum.info();
    assert!(!info.depends_on_query_entity);
    assert!(info.captured_scopes.contains(&QueryScopeId(2)));
    assert_eq!(info.captured_scopes.len(), 1);

    let mut visible = rustc_hash::FxHashSet::default();
    visible.insert(QueryScopeId(0));
    let err = sum.check_captures(&visible).unwrap_err();
    assert!(matches!(err, LowerError::IllegalScopeCapture { .. }));

    visible.insert(QueryScopeId(2));
    assert!(sum.check_captures(&visible).is_ok());
}

#[test]
fn late_bound_call_resolves_through_linking() {
    let cx = ctx();
    let handle: Late<Arc<FunctionBody>> = Late::new();
    let call = CallExpr::full(
        sp(),
        CallTarget::LateBound {
            name: Arc::from("on_event"),
            body: handle.clone(),
        },
        None,
        false,
        vec![int(10)],
        Arc::from([0usize]),
        Type::Integer,
    );
    let expr = call.to_interp(&cx).unwrap();

    // Before linking the target is unresolved.
    let mut frame = Frame::new(&NoDb, 0);
    assert!(expr.evaluate(&mut frame).is_err());

    handle
        .set(Arc::new(FunctionBody {
            name: Arc::from("on_event"),
            param_count: 1,
            local_count: 1,
            body: RExpr::Binary {
                op: RBinaryOp::Add,
                left: Box::new(RExpr::LocalGet(Slot(0))),
                right: Box::new(RExpr::Constant(Value::Integer(1))),
            },
        }))
        .ok()
        .unwrap();
    assert_eq!(expr.evaluate(&mut frame).unwrap(), Value::Integer(11));
}

#[test]
fn extendable_call_first_result_wins() {
    let cx = ctx();
    let bodies: Late<Arc<[Arc<FunctionBody>]>> = Late::new();
    let body = |v: Value| {
        Arc::new(FunctionBody {
            name: Arc::from("ext"),
            param_count: 0,
            local_count: 0,
            body: RExpr::Constant(v),
        })
    };
    bodies
        .set(Arc::from(vec![
            body(Value::Null),
            body(Value::Integer(7)),
            body(Value::Integer(8)),
        ]))
        .ok()
        .unwrap();

    let call = CallExpr::full(
        sp(),
        CallTarget::Extendable {
            name: Arc::from("ext"),
            bodies,
        },
        None,
        false,
        vec![],
        Arc::from([] as [usize; 0]),
        Type::Integer.nullable(),
    );
    let expr = call.to_interp(&cx).unwrap();
    let mut frame = Frame::new(&NoDb, 0);
    assert_eq!(expr.evaluate(&mut frame).unwrap(), Value::Integer(7));
}

#[test]
fn scope_check_instrumentation_guards_dead_blocks() {
    let cx = LowerCtx::new(CompilerOptions {
        scope_checks: true,
        ..CompilerOptions::default()
    });
    let local =
        ExprNode::local(sp(), "x", Slot(0), Type::Integer, false).with_block(BlockId(1));
    let expr = local.to_interp(&cx).unwrap();

    let mut frame = Frame::new(&NoDb, 1);
    frame.set_local(Slot(0), Value::Integer(3));
    let err = expr.evaluate(&mut frame).unwrap_err();
    assert!(matches!(err.root(), RtError::DeadBlock));

    frame.enter_block(BlockId(1));
    assert_eq!(expr.evaluate(&mut frame).unwrap(), Value::Integer(3));
}

#[test]
fn implicit_names_label_projected_columns() {
    let cx = ctx();
    let company = company();
    let account = account(&company);
    let amount = attr(&cx, item(&account), "amount");
    assert_eq!(amount.implicit_name().as_deref(), Some("amount"));

    let chain = member(&cx, sp(), attr(&cx, item(&account), "ref"), "name", true).unwrap();
    assert_eq!(chain.implicit_name().as_deref(), Some("name"));

    assert_eq!(int(1).implicit_name(), None);
}

#[test]
fn entity_attr_strategy_refines_chains() {
    let company = company();
    let account = account(&company);
    let strategy = MemberStrategy::EntityAttr {
        entity: account,
        path: smallvec![2],
    };
    let refined = strategy.refine("name").unwrap();
    let MemberStrategy::EntityAttr { path, .. } = &refined else {
        panic!("refinement changed strategy kind");
    };
    assert_eq!(path.as_slice(), &[2, 0]);
    assert_eq!(refined.declared_ty(), Type::Text);
    assert!(strategy.refine("missing").is_none());
}

#[test]
fn create_lowers_to_backend_insert() {
    let cx = ctx();
    let company = company();
    let node = ExprNode::create(
        sp(),
        company.clone(),
        vec![(0, ExprNode::constant(sp(), Value::text("acme"), Type::Text))],
    );
    assert!(node.info().has_write_effect);

    let expr = node.to_interp(&cx).unwrap();
    let backend = MemBackend::new();
    let mut frame = Frame::new(&backend, 0);
    let v = expr.evaluate(&mut frame).unwrap();
    let (entity, rowid) = v.as_entity().unwrap();
    assert_eq!(entity, EntityId(1));
    assert_eq!(backend.row_count(EntityId(1)), 1);
    assert_eq!(
        backend.attr_value(entity, rowid, 0).unwrap(),
        Value::text("acme")
    );
}

#[test]
fn partial_call_produces_function_value() {
    let cx = ctx();
    let body = Arc::new(FunctionBody {
        name: Arc::from("add"),
        param_count: 2,
        local_count: 2,
        body: RExpr::Binary {
            op: RBinaryOp::Add,
            left: Box::new(RExpr::LocalGet(Slot(0))),
            right: Box::new(RExpr::LocalGet(Slot(1))),
        },
    });
    let target = CallTarget::Function {
        id: FunctionId(0),
        name: Arc::from("add"),
        body,
    };

    // add(10, *): bind the first parameter, leave the second open.
    use crate::runtime::value::ParamSource;
    let partial = CallExpr::partial(
        sp(),
        target,
        vec![int(10)],
        Arc::from([ParamSource::Bound(0), ParamSource::Wild(0)]),
        Type::Integer,
    );
    let expr = partial.to_interp(&cx).unwrap();
    let mut frame = Frame::new(&NoDb, 0);
    let fv = expr.evaluate(&mut frame).unwrap();

    // Calling the value supplies the remaining argument.
    let call = RExpr::Call {
        target: crate::rexpr::RtCallTarget::FunctionValue,
        base: Some(Box::new(RExpr::Constant(fv))),
        safe: false,
        args: vec![RExpr::Constant(Value::Integer(5))],
        mapping: Arc::from([0usize]),
    };
    assert_eq!(call.evaluate(&mut frame).unwrap(), Value::Integer(15));

    // Partial application is always restricted inside constants.
    let partial_err = {
        let body = Arc::new(FunctionBody {
            name: Arc::from("add"),
            param_count: 1,
            local_count: 1,
            body: RExpr::LocalGet(Slot(0)),
        });
        CallExpr::partial(
            sp(),
            CallTarget::Function {
                id: FunctionId(1),
                name: Arc::from("add"),
                body,
            },
            vec![],
            Arc::from([ParamSource::Wild(0)]),
            Type::Integer,
        )
        .check_constant_restrictions()
        .unwrap_err()
    };
    assert!(matches!(partial_err, LowerError::RestrictedInConstant { .. }));
}

#[test]
fn safe_property_on_query_receiver_splits_and_short_circuits() {
    let cx = ctx();
    let company = company();
    let account = account(&company);

    // account.ref?.name pushes down as a column; the synthetic `size`
    // property runs interpreter-side over the decoded value, and a null
    // receiver short-circuits the merge.
    let chain = member(&cx, sp(), attr(&cx, item(&account), "ref"), "name", true).unwrap();
    let size = member(&cx, sp(), chain, "size", true).unwrap();
    let p = size.to_projection(&cx).unwrap();
    let Projection::Split { merger, .. } = &p else {
        panic!("expected split projection");
    };
    assert!(matches!(merger, RowMerger::Member { safe: true, .. }));

    let backend = MemBackend::new();
    let rowid = backend.insert_row(
        EntityId(0),
        vec![Value::Integer(1), Value::text("a"), Value::Null],
    );
    let mut frame = Frame::new(&backend, 0);
    let mut rows = Rows::default();
    rows.insert(QueryScopeId(0), Value::Entity(EntityId(0), rowid));
    assert_eq!(run_projection(&p, &mut frame, &rows).unwrap(), Value::Null);
}
