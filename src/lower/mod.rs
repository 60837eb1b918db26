// src/lower/mod.rs
//! Expression lowering: typed expression nodes, per-node metadata, and the
//! dual lowering paths into interpreter and query IR.

pub mod calls;
pub mod destination;
pub mod expr;
pub mod facts;
pub mod fold;
pub mod info;
pub mod member;
pub mod ops;
pub mod projection;
pub mod subscript;

#[cfg(test)]
mod tests;

use std::cell::RefCell;
use std::sync::{Arc, OnceLock};

use rustc_hash::FxHashMap;

use crate::errors::{LowerError, LowerWarning};
use crate::options::CompilerOptions;
use crate::rexpr::RExpr;
use crate::schema::GlobalConstId;
use crate::types::Type;

pub use expr::{ExprKind, ExprNode};
pub use facts::FlowFacts;
pub use info::ExprInfo;
pub use projection::{Projection, RowMerger};

/// A write-once cell set by a later compilation pass. Reads before the
/// linking pass completes return `None`; lowered code treats that as a
/// deferred-resolution failure, not a panic.
#[derive(Debug, Clone)]
pub struct Late<T>(Arc<OnceLock<T>>);

impl<T> Late<T> {
    pub fn new() -> Late<T> {
        Late(Arc::new(OnceLock::new()))
    }

    /// Set the value. Returns `Err` with the rejected value if already set.
    pub fn set(&self, value: T) -> Result<(), T> {
        self.0.set(value)
    }

    pub fn try_get(&self) -> Option<&T> {
        self.0.get()
    }
}

impl<T> Default for Late<T> {
    fn default() -> Late<T> {
        Late::new()
    }
}

impl<T: PartialEq> PartialEq for Late<T> {
    fn eq(&self, other: &Late<T>) -> bool {
        self.0.get() == other.0.get()
    }
}

/// Diagnostics accumulated during lowering. Errors poison the compilation;
/// warnings are reported but do not.
#[derive(Debug, Default)]
pub struct Messages {
    pub errors: Vec<LowerError>,
    pub warnings: Vec<LowerWarning>,
}

impl Messages {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// A registered global constant: its declared type and initializer.
/// The initializer is lowered like any other expression; constant folding
/// walks into it through [`LowerCtx::global_const`].
#[derive(Debug)]
pub struct GlobalConstDef {
    pub name: String,
    pub ty: Type,
    pub init: Arc<ExprNode>,
}

/// Shared context for one lowering run.
pub struct LowerCtx {
    pub options: CompilerOptions,
    messages: RefCell<Messages>,
    constants: RefCell<FxHashMap<GlobalConstId, Arc<GlobalConstDef>>>,
}

impl LowerCtx {
    pub fn new(options: CompilerOptions) -> LowerCtx {
        LowerCtx {
            options,
            messages: RefCell::new(Messages::default()),
            constants: RefCell::new(FxHashMap::default()),
        }
    }

    pub fn error(&self, error: LowerError) {
        tracing::debug!(?error, "lowering error");
        self.messages.borrow_mut().errors.push(error);
    }

    pub fn warning(&self, warning: LowerWarning) {
        self.messages.borrow_mut().warnings.push(warning);
    }

    pub fn has_errors(&self) -> bool {
        self.messages.borrow().has_errors()
    }

    /// Drain accumulated diagnostics.
    pub fn take_messages(&self) -> Messages {
        self.messages.replace(Messages::default())
    }

    pub fn define_global_const(&self, id: GlobalConstId, def: GlobalConstDef) {
        self.constants.borrow_mut().insert(id, Arc::new(def));
    }

    pub fn global_const(&self, id: GlobalConstId) -> Option<Arc<GlobalConstDef>> {
        self.constants.borrow().get(&id).cloned()
    }

    /// Lower every registered constant initializer to its interpreter form,
    /// in id order, for installation into a [`crate::runtime::Frame`].
    pub fn lower_constant_initializers(&self) -> Result<Vec<RExpr>, LowerError> {
        let defs: Vec<_> = {
            let map = self.constants.borrow();
            let mut entries: Vec<_> = map.iter().map(|(id, d)| (*id, d.clone())).collect();
            entries.sort_by_key(|(id, _)| *id);
            entries
        };
        defs.into_iter()
            .map(|(_, def)| def.init.to_interp(self))
            .collect()
    }
}
