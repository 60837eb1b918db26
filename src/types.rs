// src/types.rs
//
// Result types for resolved expressions. The set is closed: every lowering
// site matches exhaustively, so growing the language is a compile-checked
// update (no open subclassing).

use std::fmt;
use std::sync::Arc;

use crate::schema::{EntityDef, StructDef};

/// A resolved Stoat type. Fixed at node construction by upstream resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Unit,
    Boolean,
    Integer,
    Decimal,
    Text,
    Bytes,
    Rowid,
    /// The type of the `null` literal, before any widening.
    Null,
    Entity(Arc<EntityDef>),
    Struct(Arc<StructDef>),
    Nullable(Box<Type>),
    List(Box<Type>),
    Map(Box<Type>, Box<Type>),
    Tuple(Arc<TupleType>),
    /// Partially materialized counterparts; produced by the virtual-value
    /// subsystem, read-only here.
    VirtualList(Box<Type>),
    VirtualMap(Box<Type>, Box<Type>),
    VirtualTuple(Arc<TupleType>),
    Function(Arc<FunctionType>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleType {
    pub fields: Vec<TupleField>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleField {
    pub name: Option<String>,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionType {
    pub params: Vec<Type>,
    pub result: Type,
}

impl Type {
    pub fn list(elem: Type) -> Type {
        Type::List(Box::new(elem))
    }

    pub fn map(key: Type, value: Type) -> Type {
        Type::Map(Box::new(key), Box::new(value))
    }

    pub fn tuple(fields: Vec<TupleField>) -> Type {
        Type::Tuple(Arc::new(TupleType { fields }))
    }

    /// Widen to nullable. `T?` of `T?` stays `T?`; `null` stays `null`.
    pub fn nullable(self) -> Type {
        match self {
            Type::Nullable(_) | Type::Null | Type::Unit => self,
            other => Type::Nullable(Box::new(other)),
        }
    }

    pub fn is_nullable(&self) -> bool {
        matches!(self, Type::Nullable(_) | Type::Null)
    }

    /// Strip one level of nullability, if any.
    pub fn remove_nullable(&self) -> &Type {
        match self {
            Type::Nullable(inner) => inner,
            other => other,
        }
    }

    /// Whether a value of this type has a native scalar representation in
    /// the relational store. Containers, tuples and function values do not;
    /// they are only reachable through split projections.
    pub fn is_sql_compatible(&self) -> bool {
        match self {
            Type::Boolean
            | Type::Integer
            | Type::Decimal
            | Type::Text
            | Type::Bytes
            | Type::Rowid
            | Type::Null
            | Type::Entity(_) => true,
            Type::Nullable(inner) => inner.is_sql_compatible(),
            Type::Unit
            | Type::Struct(_)
            | Type::List(_)
            | Type::Map(_, _)
            | Type::Tuple(_)
            | Type::VirtualList(_)
            | Type::VirtualMap(_, _)
            | Type::VirtualTuple(_)
            | Type::Function(_) => false,
        }
    }

    /// Least common type of two operands, if one exists. Used by the elvis
    /// operator and conditional results.
    pub fn common(a: &Type, b: &Type) -> Option<Type> {
        if a == b {
            return Some(a.clone());
        }
        match (a, b) {
            (Type::Null, other) | (other, Type::Null) => Some(other.clone().nullable()),
            (Type::Nullable(x), other) | (other, Type::Nullable(x)) if x.as_ref() == other => {
                Some(Type::Nullable(x.clone()))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Unit => write!(f, "unit"),
            Type::Boolean => write!(f, "boolean"),
            Type::Integer => write!(f, "integer"),
            Type::Decimal => write!(f, "decimal"),
            Type::Text => write!(f, "text"),
            Type::Bytes => write!(f, "byte_array"),
            Type::Rowid => write!(f, "rowid"),
            Type::Null => write!(f, "null"),
            Type::Entity(e) => write!(f, "{}", e.name),
            Type::Struct(s) => write!(f, "struct<{}>", s.name),
            Type::Nullable(inner) => write!(f, "{inner}?"),
            Type::List(elem) => write!(f, "list<{elem}>"),
            Type::Map(k, v) => write!(f, "map<{k},{v}>"),
            Type::Tuple(t) => {
                write!(f, "(")?;
                for (i, field) in t.fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    match &field.name {
                        Some(name) => write!(f, "{name}:{}", field.ty)?,
                        None => write!(f, "{}", field.ty)?,
                    }
                }
                write!(f, ")")
            }
            Type::VirtualList(elem) => write!(f, "virtual<list<{elem}>>"),
            Type::VirtualMap(k, v) => write!(f, "virtual<map<{k},{v}>>"),
            Type::VirtualTuple(t) => write!(f, "virtual<{}>", Type::Tuple(t.clone())),
            Type::Function(ft) => {
                write!(f, "(")?;
                for (i, p) in ft.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{p}")?;
                }
                write!(f, ")->{}", ft.result)
            }
        }
    }
}
