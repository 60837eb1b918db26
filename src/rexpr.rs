// src/rexpr.rs
//
// Interpreter expression IR. Lowering produces this tree for everything that
// executes in the host interpreter; it is also the evaluation engine behind
// split-projection mergers and the literal bridge into queries.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::errors::RtError;
use crate::lower::Late;
use crate::runtime::value::{FunctionValue, OpCallValue, ParamSource, Value};
use crate::runtime::{BlockId, EntityBackend, Frame, Slot};
use crate::schema::{EntityDef, GlobalConstId};
use crate::source::FilePos;

#[derive(Debug, Clone, PartialEq)]
pub enum RExpr {
    Constant(Value),
    LocalGet(Slot),
    /// Source-position tag; runtime errors unwinding through it pick up the
    /// position so failures can report a call stack.
    StackTrace { inner: Box<RExpr>, pos: FilePos },
    /// Asserts the enclosing lexical block is still live when evaluated.
    BlockCheck { inner: Box<RExpr>, block: BlockId },
    Binary {
        op: RBinaryOp,
        left: Box<RExpr>,
        right: Box<RExpr>,
    },
    Elvis {
        left: Box<RExpr>,
        right: Box<RExpr>,
    },
    ListLiteral(Vec<RExpr>),
    MapLiteral(Vec<(RExpr, RExpr)>),
    TupleLiteral(Vec<RExpr>),
    Member {
        base: Box<RExpr>,
        safe: bool,
        calc: MemberCalc,
    },
    Call {
        target: RtCallTarget,
        base: Option<Box<RExpr>>,
        safe: bool,
        args: Vec<RExpr>,
        /// `mapping[param] = call-site argument index`.
        mapping: Arc<[usize]>,
    },
    PartialCall {
        target: RtCallTarget,
        name: Arc<str>,
        args: Vec<RExpr>,
        mapping: Arc<[ParamSource]>,
    },
    Subscript {
        base: Box<RExpr>,
        key: Box<RExpr>,
        kind: RtSubscriptKind,
    },
    Create {
        entity: Arc<EntityDef>,
        /// `(attribute index, value expression)`, covering every attribute.
        attrs: Vec<(usize, RExpr)>,
    },
    GlobalConst(GlobalConstId),
    /// Assignment through a destination; `op` makes it compound. The place
    /// (base + key) is resolved once, so side effects are not repeated.
    Assign {
        dst: RDest,
        op: Option<RBinaryOp>,
        src: Box<RExpr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RDest {
    Local(Slot),
    ListElem { base: Box<RExpr>, index: Box<RExpr> },
    MapElem { base: Box<RExpr>, key: Box<RExpr> },
}

/// Reusable member computation over the receiver's runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum MemberCalc {
    EntityAttr { attr: usize },
    StructAttr { index: usize },
    TupleField { index: usize },
    SysProperty(SysFn),
}

impl MemberCalc {
    pub fn calculate(&self, frame: &mut Frame<'_>, base: &Value) -> Result<Value, RtError> {
        match self {
            MemberCalc::EntityAttr { attr } => {
                let (entity, rowid) = base.as_entity()?;
                frame.backend().attr_value(entity, rowid, *attr)
            }
            MemberCalc::StructAttr { index } => match base {
                Value::Struct(values) => Ok(values.borrow()[*index].clone()),
                other => Err(RtError::Decode {
                    detail: format!("expected struct, found {}", other.kind_name()),
                }),
            },
            MemberCalc::TupleField { index } => match base {
                Value::Tuple(values) => Ok(values[*index].clone()),
                other => Err(RtError::Decode {
                    detail: format!("expected tuple, found {}", other.kind_name()),
                }),
            },
            MemberCalc::SysProperty(f) => f.call(Some(base), &[]),
        }
    }
}

/// Runtime half of a resolved call target. The compile-time policy (query
/// support, constant restrictions) lives in `lower::calls`.
#[derive(Debug, Clone, PartialEq)]
pub enum RtCallTarget {
    UserFunction(Arc<FunctionBody>),
    /// Overridable function; the effective body is only known once the whole
    /// program is linked, hence the late handle.
    LateBound { name: Arc<str>, body: Late<Arc<FunctionBody>> },
    /// All extension bodies, in declaration order, filled by linking.
    Extendable { name: Arc<str>, bodies: Late<Arc<[Arc<FunctionBody>]>> },
    Operation { name: Arc<str> },
    /// The callee is the base value (a first-class function value).
    FunctionValue,
    Sys(SysFn),
}

impl RtCallTarget {
    pub fn call(
        &self,
        frame: &mut Frame<'_>,
        base: Option<&Value>,
        args: Vec<Value>,
    ) -> Result<Value, RtError> {
        match self {
            RtCallTarget::UserFunction(body) => body.invoke(frame, args),
            RtCallTarget::LateBound { name, body } => {
                let body = body.try_get().ok_or_else(|| unresolved(name))?;
                body.invoke(frame, args)
            }
            RtCallTarget::Extendable { name, bodies } => {
                let bodies = bodies.try_get().ok_or_else(|| unresolved(name))?;
                // Extensions run in declaration order; the first body that
                // yields a non-null, non-unit value short-circuits.
                let mut result = Value::Unit;
                for body in bodies.iter() {
                    let v = body.invoke(frame, args.clone())?;
                    if !matches!(v, Value::Null | Value::Unit) {
                        return Ok(v);
                    }
                    result = v;
                }
                Ok(result)
            }
            RtCallTarget::Operation { name } => Ok(Value::OpCall(
                OpCallValue {
                    name: name.clone(),
                    args,
                }
                .into(),
            )),
            RtCallTarget::FunctionValue => {
                let fv = base.ok_or(RtError::NullValue)?.as_function()?.clone();
                let full: Vec<Value> = fv
                    .mapping
                    .iter()
                    .map(|src| match src {
                        ParamSource::Bound(i) => fv.bound[*i].clone(),
                        ParamSource::Wild(i) => args[*i].clone(),
                    })
                    .collect();
                fv.target.call(frame, None, full)
            }
            RtCallTarget::Sys(f) => f.call(base, &args),
        }
    }
}

fn unresolved(name: &str) -> RtError {
    RtError::Decode {
        detail: format!("call target '{name}' not linked"),
    }
}

/// An expression-bodied routine. Statement-bodied routines are compiled by
/// the statement compiler; through this interface they look the same.
#[derive(Debug, PartialEq)]
pub struct FunctionBody {
    pub name: Arc<str>,
    pub param_count: usize,
    pub local_count: usize,
    pub body: RExpr,
}

impl FunctionBody {
    pub fn invoke(&self, frame: &mut Frame<'_>, args: Vec<Value>) -> Result<Value, RtError> {
        debug_assert_eq!(args.len(), self.param_count);
        let mut sub = frame.sub_frame(self.local_count.max(self.param_count));
        for (i, arg) in args.into_iter().enumerate() {
            sub.set_local(Slot(i as u32), arg);
        }
        self.body.evaluate(&mut sub)
    }
}

/// Builtin (system) functions and synthetic properties. Closed set; the
/// query-side equivalents are declared by `lower::calls::SysFnDescriptor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysFn {
    Abs,
    Max,
    Min,
    IntegerToText,
    TextUpperCase,
    TextLowerCase,
    TextSize,
    BytesSize,
    ListSize,
    /// Timestamp of the enclosing transaction block; needs an execution
    /// context this subsystem does not own, hence non-pure.
    LastBlockTime,
}

impl SysFn {
    pub fn call(&self, base: Option<&Value>, args: &[Value]) -> Result<Value, RtError> {
        match self {
            SysFn::Abs => Ok(Value::Integer(args[0].as_integer()?.abs())),
            SysFn::Max => Ok(Value::Integer(args[0].as_integer()?.max(args[1].as_integer()?))),
            SysFn::Min => Ok(Value::Integer(args[0].as_integer()?.min(args[1].as_integer()?))),
            SysFn::IntegerToText => {
                let n = base.ok_or(RtError::NullValue)?.as_integer()?;
                Ok(Value::text(n.to_string()))
            }
            SysFn::TextUpperCase => {
                let s = base.ok_or(RtError::NullValue)?.as_text()?.to_uppercase();
                Ok(Value::text(s))
            }
            SysFn::TextLowerCase => {
                let s = base.ok_or(RtError::NullValue)?.as_text()?.to_lowercase();
                Ok(Value::text(s))
            }
            SysFn::TextSize => {
                let s = base.ok_or(RtError::NullValue)?.as_text()?;
                Ok(Value::Integer(s.chars().count() as i64))
            }
            SysFn::BytesSize => {
                let b = base.ok_or(RtError::NullValue)?.as_bytes()?;
                Ok(Value::Integer(b.len() as i64))
            }
            SysFn::ListSize => {
                let l = base.ok_or(RtError::NullValue)?.as_list()?;
                let n = l.borrow().len();
                Ok(Value::Integer(n as i64))
            }
            SysFn::LastBlockTime => Err(RtError::NoDatabase {
                op: "block time".to_string(),
            }),
        }
    }
}

/// Binary operators at runtime. Logical and/or short-circuit (handled in
/// `RExpr::evaluate`, not here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RBinaryOp {
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

impl RBinaryOp {
    pub fn apply(&self, left: &Value, right: &Value) -> Result<Value, RtError> {
        match self {
            RBinaryOp::And => Ok(Value::Boolean(left.as_boolean()? && right.as_boolean()?)),
            RBinaryOp::Or => Ok(Value::Boolean(left.as_boolean()? || right.as_boolean()?)),
            RBinaryOp::Eq => Ok(Value::Boolean(left == right)),
            RBinaryOp::Ne => Ok(Value::Boolean(left != right)),
            RBinaryOp::Lt => cmp(left, right, |o| o.is_lt()),
            RBinaryOp::Gt => cmp(left, right, |o| o.is_gt()),
            RBinaryOp::Le => cmp(left, right, |o| o.is_le()),
            RBinaryOp::Ge => cmp(left, right, |o| o.is_ge()),
            RBinaryOp::Add => arith(left, right, i64::checked_add),
            RBinaryOp::Sub => arith(left, right, i64::checked_sub),
            RBinaryOp::Mul => arith(left, right, i64::checked_mul),
            RBinaryOp::Div => {
                let (a, b) = (left.as_integer()?, right.as_integer()?);
                if b == 0 {
                    return Err(RtError::DivisionByZero);
                }
                Ok(Value::Integer(a / b))
            }
            RBinaryOp::Mod => {
                let (a, b) = (left.as_integer()?, right.as_integer()?);
                if b == 0 {
                    return Err(RtError::DivisionByZero);
                }
                Ok(Value::Integer(a % b))
            }
            RBinaryOp::Concat => {
                let mut s = left.as_text()?.to_string();
                s.push_str(right.as_text()?);
                Ok(Value::text(s))
            }
        }
    }
}

fn cmp(left: &Value, right: &Value, f: impl Fn(std::cmp::Ordering) -> bool) -> Result<Value, RtError> {
    use std::cmp::Ordering;
    let ord = match (left, right) {
        (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
        (Value::Text(a), Value::Text(b)) => a.cmp(b),
        (Value::Rowid(a), Value::Rowid(b)) => a.cmp(b),
        (Value::Decimal(a), Value::Decimal(b)) => {
            a.partial_cmp(b).unwrap_or(Ordering::Equal)
        }
        _ => {
            return Err(RtError::Decode {
                detail: format!(
                    "cannot compare {} and {}",
                    left.kind_name(),
                    right.kind_name()
                ),
            })
        }
    };
    Ok(Value::Boolean(f(ord)))
}

fn arith(left: &Value, right: &Value, f: impl Fn(i64, i64) -> Option<i64>) -> Result<Value, RtError> {
    let (a, b) = (left.as_integer()?, right.as_integer()?);
    f(a, b).map(Value::Integer).ok_or(RtError::Decode {
        detail: "integer overflow".to_string(),
    })
}

/// Runtime subscript behavior per container kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtSubscriptKind {
    Text,
    Bytes,
    List,
    VirtualList,
    Map,
    VirtualMap,
}

impl RtSubscriptKind {
    pub fn lookup(&self, base: &Value, key: &Value) -> Result<Value, RtError> {
        match self {
            RtSubscriptKind::Text => {
                let s = base.as_text()?;
                let i = key.as_integer()?;
                let ch = checked_index(s.chars().count(), i)
                    .and_then(|i| s.chars().nth(i))
                    .ok_or(RtError::IndexOutOfBounds {
                        index: i,
                        size: s.chars().count(),
                    })?;
                Ok(Value::text(ch.to_string()))
            }
            RtSubscriptKind::Bytes => {
                let b = base.as_bytes()?;
                let i = key.as_integer()?;
                let byte = checked_index(b.len(), i)
                    .map(|i| b[i])
                    .ok_or(RtError::IndexOutOfBounds {
                        index: i,
                        size: b.len(),
                    })?;
                Ok(Value::Integer(byte as i64))
            }
            RtSubscriptKind::List | RtSubscriptKind::VirtualList => {
                let l = base.as_list()?.borrow();
                let i = key.as_integer()?;
                checked_index(l.len(), i)
                    .map(|i| l[i].clone())
                    .ok_or(RtError::IndexOutOfBounds {
                        index: i,
                        size: l.len(),
                    })
            }
            RtSubscriptKind::Map | RtSubscriptKind::VirtualMap => {
                let m = base.as_map()?.borrow();
                m.iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.clone())
                    .ok_or(RtError::MapKeyNotFound)
            }
        }
    }
}

fn checked_index(len: usize, index: i64) -> Option<usize> {
    if index >= 0 && (index as usize) < len {
        Some(index as usize)
    } else {
        None
    }
}

impl RExpr {
    pub fn constant(value: Value) -> RExpr {
        RExpr::Constant(value)
    }

    pub fn evaluate(&self, frame: &mut Frame<'_>) -> Result<Value, RtError> {
        match self {
            RExpr::Constant(v) => Ok(v.clone()),
            RExpr::LocalGet(slot) => frame.get_local(*slot),
            RExpr::StackTrace { inner, pos } => {
                inner.evaluate(frame).map_err(|e| e.traced(*pos))
            }
            RExpr::BlockCheck { inner, block } => {
                if !frame.block_live(*block) {
                    return Err(RtError::DeadBlock);
                }
                inner.evaluate(frame)
            }
            RExpr::Binary { op, left, right } => {
                let lv = left.evaluate(frame)?;
                // Short-circuit logical operators before touching the rhs.
                match op {
                    RBinaryOp::And if !lv.as_boolean()? => return Ok(Value::Boolean(false)),
                    RBinaryOp::Or if lv.as_boolean()? => return Ok(Value::Boolean(true)),
                    _ => {}
                }
                let rv = right.evaluate(frame)?;
                op.apply(&lv, &rv)
            }
            RExpr::Elvis { left, right } => {
                let lv = left.evaluate(frame)?;
                if lv.is_null() {
                    right.evaluate(frame)
                } else {
                    Ok(lv)
                }
            }
            RExpr::ListLiteral(elems) => {
                let values = eval_all(elems, frame)?;
                Ok(Value::list(values))
            }
            RExpr::MapLiteral(entries) => {
                let mut pairs = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    pairs.push((k.evaluate(frame)?, v.evaluate(frame)?));
                }
                Ok(Value::map(pairs))
            }
            RExpr::TupleLiteral(elems) => {
                let values = eval_all(elems, frame)?;
                Ok(Value::tuple(values))
            }
            RExpr::Member { base, safe, calc } => {
                let bv = base.evaluate(frame)?;
                if *safe && bv.is_null() {
                    return Ok(Value::Null);
                }
                calc.calculate(frame, &bv)
            }
            RExpr::Call {
                target,
                base,
                safe,
                args,
                mapping,
            } => {
                let bv = match base {
                    Some(b) => Some(b.evaluate(frame)?),
                    None => None,
                };
                if *safe && matches!(bv, Some(Value::Null)) {
                    return Ok(Value::Null);
                }
                let arg_values = eval_all(args, frame)?;
                let ordered: Vec<Value> =
                    mapping.iter().map(|&i| arg_values[i].clone()).collect();
                target.call(frame, bv.as_ref(), ordered)
            }
            RExpr::PartialCall {
                target,
                name,
                args,
                mapping,
            } => {
                let bound = eval_all(args, frame)?;
                Ok(Value::Function(
                    FunctionValue {
                        name: name.clone(),
                        target: target.clone(),
                        bound,
                        mapping: mapping.to_vec(),
                    }
                    .into(),
                ))
            }
            RExpr::Subscript { base, key, kind } => {
                let bv = base.evaluate(frame)?;
                let kv = key.evaluate(frame)?;
                kind.lookup(&bv, &kv)
            }
            RExpr::Create { entity, attrs } => {
                let mut values: Vec<Option<Value>> = vec![None; entity.attrs.len()];
                for (index, expr) in attrs {
                    values[*index] = Some(expr.evaluate(frame)?);
                }
                let values: Vec<Value> = values
                    .into_iter()
                    .map(|v| v.unwrap_or(Value::Null))
                    .collect();
                let rowid = frame.backend().create(entity.id, values)?;
                Ok(Value::Entity(entity.id, rowid))
            }
            RExpr::GlobalConst(id) => frame.constant(*id),
            RExpr::Assign { dst, op, src } => {
                self.eval_assign(frame, dst, *op, src)?;
                Ok(Value::Unit)
            }
        }
    }

    fn eval_assign(
        &self,
        frame: &mut Frame<'_>,
        dst: &RDest,
        op: Option<RBinaryOp>,
        src: &RExpr,
    ) -> Result<(), RtError> {
        match dst {
            RDest::Local(slot) => {
                let value = match op {
                    None => src.evaluate(frame)?,
                    Some(op) => {
                        let old = frame.get_local(*slot)?;
                        let rhs = src.evaluate(frame)?;
                        op.apply(&old, &rhs)?
                    }
                };
                frame.set_local(*slot, value);
                Ok(())
            }
            RDest::ListElem { base, index } => {
                let list = base.evaluate(frame)?;
                let list = list.as_list()?.clone();
                let i = index.evaluate(frame)?.as_integer()?;
                let len = list.borrow().len();
                let slot = checked_index(len, i)
                    .ok_or(RtError::IndexOutOfBounds { index: i, size: len })?;
                let value = match op {
                    None => src.evaluate(frame)?,
                    Some(op) => {
                        let old = list.borrow()[slot].clone();
                        let rhs = src.evaluate(frame)?;
                        op.apply(&old, &rhs)?
                    }
                };
                list.borrow_mut()[slot] = value;
                Ok(())
            }
            RDest::MapElem { base, key } => {
                let map = base.evaluate(frame)?;
                let map = map.as_map()?.clone();
                let k = key.evaluate(frame)?;
                let value = match op {
                    None => src.evaluate(frame)?,
                    Some(op) => {
                        let old = map
                            .borrow()
                            .iter()
                            .find(|(mk, _)| *mk == k)
                            .map(|(_, v)| v.clone())
                            .ok_or(RtError::MapKeyNotFound)?;
                        let rhs = src.evaluate(frame)?;
                        op.apply(&old, &rhs)?
                    }
                };
                let mut borrow = map.borrow_mut();
                match borrow.iter_mut().find(|(mk, _)| *mk == k) {
                    Some((_, v)) => *v = value,
                    None => borrow.push((k, value)),
                }
                Ok(())
            }
        }
    }
}

fn eval_all(exprs: &[RExpr], frame: &mut Frame<'_>) -> Result<Vec<Value>, RtError> {
    let mut out: SmallVec<[Value; 4]> = SmallVec::with_capacity(exprs.len());
    for e in exprs {
        out.push(e.evaluate(frame)?);
    }
    Ok(out.into_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::NoDb;

    fn eval(expr: &RExpr) -> Result<Value, RtError> {
        let mut frame = Frame::new(&NoDb, 4);
        expr.evaluate(&mut frame)
    }

    #[test]
    fn elvis_short_circuits_on_non_null() {
        let e = RExpr::Elvis {
            left: Box::new(RExpr::Constant(Value::Integer(7))),
            right: Box::new(RExpr::Constant(Value::Integer(0))),
        };
        assert_eq!(eval(&e).unwrap(), Value::Integer(7));
    }

    #[test]
    fn logical_and_does_not_evaluate_rhs_when_false() {
        // rhs would fail with a decode error if evaluated
        let e = RExpr::Binary {
            op: RBinaryOp::And,
            left: Box::new(RExpr::Constant(Value::Boolean(false))),
            right: Box::new(RExpr::Constant(Value::Integer(1))),
        };
        assert_eq!(eval(&e).unwrap(), Value::Boolean(false));
    }

    #[test]
    fn stack_trace_wraps_errors_with_position() {
        let e = RExpr::StackTrace {
            inner: Box::new(RExpr::Binary {
                op: RBinaryOp::Div,
                left: Box::new(RExpr::Constant(Value::Integer(1))),
                right: Box::new(RExpr::Constant(Value::Integer(0))),
            }),
            pos: FilePos { line: 3, column: 9 },
        };
        let err = eval(&e).unwrap_err();
        assert_eq!(err.root(), &RtError::DivisionByZero);
        assert_eq!(err.trace(), vec![FilePos { line: 3, column: 9 }]);
    }

    #[test]
    fn compound_assign_resolves_place_once() {
        let mut frame = Frame::new(&NoDb, 4);
        frame.set_local(Slot(0), Value::list(vec![Value::Integer(10)]));
        let e = RExpr::Assign {
            dst: RDest::ListElem {
                base: Box::new(RExpr::LocalGet(Slot(0))),
                index: Box::new(RExpr::Constant(Value::Integer(0))),
            },
            op: Some(RBinaryOp::Add),
            src: Box::new(RExpr::Constant(Value::Integer(5))),
        };
        e.evaluate(&mut frame).unwrap();
        let list = frame.get_local(Slot(0)).unwrap();
        assert_eq!(list.as_list().unwrap().borrow()[0], Value::Integer(15));
    }
}
