// src/runtime/mod.rs
//! Interpreter execution state.
//!
//! A `Frame` holds the local slots of one routine activation plus the set of
//! currently live lexical blocks (consulted by scope-check expressions when
//! the compiler option is on). Entity state is only reachable through the
//! `EntityBackend` trait.

pub mod backend;
pub mod value;

pub use backend::{EntityBackend, MemBackend, NoDb};
pub use value::Value;

use rustc_hash::FxHashSet;

use crate::errors::RtError;
use crate::schema::GlobalConstId;

/// A local variable slot, assigned by upstream resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot(pub u32);

/// A lexical block within a routine, used by scope-validity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

pub struct Frame<'a> {
    backend: &'a dyn EntityBackend,
    locals: Vec<Option<Value>>,
    live_blocks: FxHashSet<BlockId>,
    constants: Vec<Value>,
}

impl<'a> Frame<'a> {
    pub fn new(backend: &'a dyn EntityBackend, local_count: usize) -> Frame<'a> {
        Frame {
            backend,
            locals: vec![None; local_count],
            live_blocks: FxHashSet::default(),
            constants: Vec::new(),
        }
    }

    pub fn backend(&self) -> &dyn EntityBackend {
        self.backend
    }

    /// A frame for a callee activation: same backend and constant table,
    /// fresh locals.
    pub fn sub_frame(&self, local_count: usize) -> Frame<'a> {
        Frame {
            backend: self.backend,
            locals: vec![None; local_count],
            live_blocks: FxHashSet::default(),
            constants: self.constants.clone(),
        }
    }

    pub fn get_local(&self, slot: Slot) -> Result<Value, RtError> {
        self.locals
            .get(slot.0 as usize)
            .and_then(|v| v.clone())
            .ok_or(RtError::Decode {
                detail: format!("local slot {} not initialized", slot.0),
            })
    }

    pub fn set_local(&mut self, slot: Slot, value: Value) {
        let idx = slot.0 as usize;
        if idx >= self.locals.len() {
            self.locals.resize(idx + 1, None);
        }
        self.locals[idx] = Some(value);
    }

    pub fn enter_block(&mut self, block: BlockId) {
        self.live_blocks.insert(block);
    }

    pub fn exit_block(&mut self, block: BlockId) {
        self.live_blocks.remove(&block);
    }

    pub fn block_live(&self, block: BlockId) -> bool {
        self.live_blocks.contains(&block)
    }

    /// Install the evaluated global-constant table, in id order.
    pub fn set_constants(&mut self, constants: Vec<Value>) {
        self.constants = constants;
    }

    pub fn constant(&self, id: GlobalConstId) -> Result<Value, RtError> {
        self.constants
            .get(id.0 as usize)
            .cloned()
            .ok_or(RtError::Decode {
                detail: format!("global constant #{} not evaluated", id.0),
            })
    }
}
