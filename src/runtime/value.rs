// src/runtime/value.rs
//
// Runtime values for the interpreter and for decoded query rows.
// Containers use shared interior mutability (list/map mutation through
// subscript destinations observes aliasing, same as the language semantics).

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use crate::errors::RtError;
use crate::schema::EntityId;
use crate::types::Type;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Unit,
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    Text(Arc<str>),
    Bytes(Arc<[u8]>),
    Rowid(i64),
    /// A persisted entity instance, identified by its row id.
    Entity(EntityId, i64),
    List(Rc<RefCell<Vec<Value>>>),
    /// Insertion-ordered key/value pairs.
    Map(Rc<RefCell<Vec<(Value, Value)>>>),
    Tuple(Rc<Vec<Value>>),
    Struct(Rc<RefCell<Vec<Value>>>),
    /// A first-class function value produced by a partial call.
    Function(Rc<FunctionValue>),
    /// A deferred entry-point invocation (argument record for the caller).
    OpCall(Rc<OpCallValue>),
}

/// A bound partial call: the target plus the arguments captured so far.
/// Wild (unbound) parameter positions are filled at invocation time.
#[derive(Debug)]
pub struct FunctionValue {
    pub name: Arc<str>,
    pub target: crate::rexpr::RtCallTarget,
    pub bound: Vec<Value>,
    /// For each callee parameter: `Bound(i)` takes `bound[i]`, `Wild(i)`
    /// takes invocation argument `i`.
    pub mapping: Vec<ParamSource>,
}

impl PartialEq for FunctionValue {
    fn eq(&self, other: &Self) -> bool {
        // Function values compare by identity of the partial application,
        // not by target code.
        self.name == other.name && self.bound == other.bound && self.mapping == other.mapping
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSource {
    Bound(usize),
    Wild(usize),
}

#[derive(Debug, PartialEq)]
pub struct OpCallValue {
    pub name: Arc<str>,
    pub args: Vec<Value>,
}

impl Value {
    pub fn text(s: impl AsRef<str>) -> Value {
        Value::Text(Arc::from(s.as_ref()))
    }

    pub fn bytes(b: impl AsRef<[u8]>) -> Value {
        Value::Bytes(Arc::from(b.as_ref()))
    }

    pub fn list(values: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(values)))
    }

    pub fn map(pairs: Vec<(Value, Value)>) -> Value {
        Value::Map(Rc::new(RefCell::new(pairs)))
    }

    pub fn tuple(values: Vec<Value>) -> Value {
        Value::Tuple(Rc::new(values))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_boolean(&self) -> Result<bool, RtError> {
        match self {
            Value::Boolean(b) => Ok(*b),
            other => Err(decode("boolean", other)),
        }
    }

    pub fn as_integer(&self) -> Result<i64, RtError> {
        match self {
            Value::Integer(n) => Ok(*n),
            other => Err(decode("integer", other)),
        }
    }

    pub fn as_text(&self) -> Result<&str, RtError> {
        match self {
            Value::Text(s) => Ok(s),
            other => Err(decode("text", other)),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8], RtError> {
        match self {
            Value::Bytes(b) => Ok(b),
            other => Err(decode("byte_array", other)),
        }
    }

    pub fn as_list(&self) -> Result<&Rc<RefCell<Vec<Value>>>, RtError> {
        match self {
            Value::List(l) => Ok(l),
            other => Err(decode("list", other)),
        }
    }

    pub fn as_map(&self) -> Result<&Rc<RefCell<Vec<(Value, Value)>>>, RtError> {
        match self {
            Value::Map(m) => Ok(m),
            other => Err(decode("map", other)),
        }
    }

    pub fn as_entity(&self) -> Result<(EntityId, i64), RtError> {
        match self {
            Value::Entity(id, rowid) => Ok((*id, *rowid)),
            other => Err(decode("entity", other)),
        }
    }

    pub fn as_function(&self) -> Result<&Rc<FunctionValue>, RtError> {
        match self {
            Value::Function(f) => Ok(f),
            other => Err(decode("function", other)),
        }
    }

    /// The dynamic type name, for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Unit => "unit",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Decimal(_) => "decimal",
            Value::Text(_) => "text",
            Value::Bytes(_) => "byte_array",
            Value::Rowid(_) => "rowid",
            Value::Entity(_, _) => "entity",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Tuple(_) => "tuple",
            Value::Struct(_) => "struct",
            Value::Function(_) => "function",
            Value::OpCall(_) => "operation",
        }
    }

    /// Default value for a type, used by the type-checked constant table
    /// before initializers run.
    pub fn zero_of(ty: &Type) -> Value {
        match ty {
            Type::Boolean => Value::Boolean(false),
            Type::Integer => Value::Integer(0),
            Type::Decimal => Value::Decimal(0.0),
            Type::Text => Value::text(""),
            _ => Value::Null,
        }
    }
}

fn decode(expected: &str, found: &Value) -> RtError {
    RtError::Decode {
        detail: format!("expected {expected}, found {}", found.kind_name()),
    }
}
