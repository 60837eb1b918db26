// src/schema.rs
//
// Entity and struct metadata consumed from upstream declaration resolution.
// The schema engine itself (tables, migrations) is an external collaborator;
// lowering only needs names, attribute types and mutability.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::types::Type;

/// Identifies one declared entity within a compiled program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u32);

/// Identifies one declared global constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalConstId(pub u32);

/// Identifies one user function definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub u32);

#[derive(Debug)]
pub struct AttrDef {
    pub name: String,
    pub ty: Type,
    pub mutable: bool,
}

/// A persisted entity declaration. Attribute order is column order.
#[derive(Debug)]
pub struct EntityDef {
    pub id: EntityId,
    pub name: String,
    pub attrs: Vec<AttrDef>,
    by_name: FxHashMap<String, usize>,
}

impl EntityDef {
    pub fn new(id: EntityId, name: impl Into<String>, attrs: Vec<AttrDef>) -> Arc<EntityDef> {
        let by_name = attrs
            .iter()
            .enumerate()
            .map(|(i, a)| (a.name.clone(), i))
            .collect();
        Arc::new(EntityDef {
            id,
            name: name.into(),
            attrs,
            by_name,
        })
    }

    pub fn attr_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn attr(&self, index: usize) -> &AttrDef {
        &self.attrs[index]
    }
}

impl PartialEq for EntityDef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EntityDef {}

/// A struct declaration (in-memory record type, no persistence).
#[derive(Debug)]
pub struct StructDef {
    pub name: String,
    pub attrs: Vec<AttrDef>,
    by_name: FxHashMap<String, usize>,
}

impl StructDef {
    pub fn new(name: impl Into<String>, attrs: Vec<AttrDef>) -> Arc<StructDef> {
        let by_name = attrs
            .iter()
            .enumerate()
            .map(|(i, a)| (a.name.clone(), i))
            .collect();
        Arc::new(StructDef {
            name: name.into(),
            attrs,
            by_name,
        })
    }

    pub fn attr_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }
}

impl PartialEq for StructDef {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for StructDef {}
