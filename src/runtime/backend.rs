// src/runtime/backend.rs
//
// Narrow storage interface. The real relational store lives outside this
// crate; lowering and the interpreter only ever touch entities through this
// trait. `MemBackend` is the in-memory implementation used by tests and by
// the collection-query path.

use std::cell::RefCell;

use rustc_hash::FxHashMap;

use crate::errors::RtError;
use crate::runtime::value::Value;
use crate::schema::EntityId;

pub trait EntityBackend {
    /// Read one attribute of a persisted entity instance.
    fn attr_value(&self, entity: EntityId, rowid: i64, attr: usize) -> Result<Value, RtError>;

    /// Insert a new instance; `values` is in attribute (column) order.
    fn create(&self, entity: EntityId, values: Vec<Value>) -> Result<i64, RtError>;

    /// Overwrite one attribute of an existing instance.
    fn update_attr(
        &self,
        entity: EntityId,
        rowid: i64,
        attr: usize,
        value: Value,
    ) -> Result<(), RtError>;
}

/// Backend for contexts with no store attached (e.g. constant folding).
/// Every operation fails with a runtime error.
pub struct NoDb;

impl EntityBackend for NoDb {
    fn attr_value(&self, entity: EntityId, _rowid: i64, _attr: usize) -> Result<Value, RtError> {
        Err(no_db("attribute read", entity))
    }

    fn create(&self, entity: EntityId, _values: Vec<Value>) -> Result<i64, RtError> {
        Err(no_db("create", entity))
    }

    fn update_attr(
        &self,
        entity: EntityId,
        _rowid: i64,
        _attr: usize,
        _value: Value,
    ) -> Result<(), RtError> {
        Err(no_db("attribute update", entity))
    }
}

fn no_db(op: &str, entity: EntityId) -> RtError {
    RtError::NoDatabase {
        op: format!("{op} on entity #{}", entity.0),
    }
}

/// In-memory table-per-entity backend.
#[derive(Default)]
pub struct MemBackend {
    tables: RefCell<FxHashMap<EntityId, Vec<Vec<Value>>>>,
}

impl MemBackend {
    pub fn new() -> MemBackend {
        MemBackend::default()
    }

    /// Insert a row directly, returning its rowid. Rowids are 1-based.
    pub fn insert_row(&self, entity: EntityId, values: Vec<Value>) -> i64 {
        let mut tables = self.tables.borrow_mut();
        let table = tables.entry(entity).or_default();
        table.push(values);
        table.len() as i64
    }

    pub fn row_count(&self, entity: EntityId) -> usize {
        self.tables
            .borrow()
            .get(&entity)
            .map(|t| t.len())
            .unwrap_or(0)
    }
}

impl EntityBackend for MemBackend {
    fn attr_value(&self, entity: EntityId, rowid: i64, attr: usize) -> Result<Value, RtError> {
        let tables = self.tables.borrow();
        let row = tables
            .get(&entity)
            .and_then(|t| t.get(rowid as usize - 1))
            .ok_or(RtError::IndexOutOfBounds {
                index: rowid,
                size: self.row_count(entity),
            })?;
        row.get(attr).cloned().ok_or(RtError::Decode {
            detail: format!("entity #{} has no attribute {attr}", entity.0),
        })
    }

    fn create(&self, entity: EntityId, values: Vec<Value>) -> Result<i64, RtError> {
        Ok(self.insert_row(entity, values))
    }

    fn update_attr(
        &self,
        entity: EntityId,
        rowid: i64,
        attr: usize,
        value: Value,
    ) -> Result<(), RtError> {
        let mut tables = self.tables.borrow_mut();
        let row = tables
            .get_mut(&entity)
            .and_then(|t| t.get_mut(rowid as usize - 1))
            .ok_or(RtError::IndexOutOfBounds {
                index: rowid,
                size: 0,
            })?;
        if attr >= row.len() {
            return Err(RtError::Decode {
                detail: format!("entity #{} has no attribute {attr}", entity.0),
            });
        }
        row[attr] = value;
        Ok(())
    }
}
