// src/lower/facts.rs
//! Flow facts: the nullability summary produced by upstream flow analysis
//! and propagated through lowering. Opaque to most of this crate; lowering
//! only combines summaries, it never derives new facts.

use rustc_hash::FxHashSet;

use crate::runtime::Slot;

/// Locals proven non-null after an expression evaluates. Combining follows
/// evaluation order: facts from sub-expressions that unconditionally run
/// all hold afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlowFacts {
    not_null: FxHashSet<Slot>,
}

impl FlowFacts {
    pub fn empty() -> FlowFacts {
        FlowFacts::default()
    }

    pub fn proving(slots: impl IntoIterator<Item = Slot>) -> FlowFacts {
        FlowFacts {
            not_null: slots.into_iter().collect(),
        }
    }

    pub fn proves_not_null(&self, slot: Slot) -> bool {
        self.not_null.contains(&slot)
    }

    /// Facts after evaluating `self` then `other` unconditionally.
    pub fn and(&self, other: &FlowFacts) -> FlowFacts {
        let mut not_null = self.not_null.clone();
        not_null.extend(other.not_null.iter().copied());
        FlowFacts { not_null }
    }

    /// Conjunction over an unconditionally-evaluated child list. Call
    /// arguments and the receiver of a member call combine this way.
    pub fn all<'a>(facts: impl IntoIterator<Item = &'a FlowFacts>) -> FlowFacts {
        facts
            .into_iter()
            .fold(FlowFacts::empty(), |acc, f| acc.and(f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conjunction_unions_proofs() {
        let a = FlowFacts::proving([Slot(0)]);
        let b = FlowFacts::proving([Slot(1)]);
        let both = a.and(&b);
        assert!(both.proves_not_null(Slot(0)));
        assert!(both.proves_not_null(Slot(1)));
        assert!(!both.proves_not_null(Slot(2)));
    }

    #[test]
    fn all_over_empty_list_proves_nothing() {
        let facts = FlowFacts::all([]);
        assert_eq!(facts, FlowFacts::empty());
    }
}
