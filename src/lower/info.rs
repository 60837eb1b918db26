// src/lower/info.rs
//! Per-node expression metadata: the memoized descriptor every lowering
//! component consults. Computed once per node through [`ExprInfo::combine`];
//! node kinds never hand-roll the propagation rules.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::query::QueryScopeId;
use crate::types::Type;

/// A node's own contribution to its metadata, before child propagation.
/// Defaults describe the common case: no side effects, no entity
/// dependency, pushdownable when everything underneath is.
#[derive(Debug, Clone)]
pub struct OwnFlags {
    /// This node itself performs a persistent-store mutation.
    pub write_effect: bool,
    /// This node kind has a query lowering of its own.
    pub pushdownable: bool,
    /// This node itself reads correlated-entity state.
    pub depends_on_entity: bool,
    /// Query scopes this node references directly.
    pub captures: SmallVec<[QueryScopeId; 1]>,
}

impl Default for OwnFlags {
    fn default() -> OwnFlags {
        OwnFlags {
            write_effect: false,
            pushdownable: true,
            depends_on_entity: false,
            captures: SmallVec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExprInfo {
    pub ty: Type,
    /// True if this node or any descendant mutates the persistent store.
    pub has_write_effect: bool,
    /// True if this node or any descendant reads correlated-entity state.
    pub depends_on_query_entity: bool,
    /// True if the whole subtree can execute inside the relational query.
    /// A subtree that never touches the correlated entity is trivially
    /// eligible: it runs once in the interpreter and binds as a parameter.
    pub pushdown_eligible: bool,
    /// Query scopes referenced anywhere in the subtree.
    pub captured_scopes: FxHashSet<QueryScopeId>,
}

impl ExprInfo {
    /// Build a node's info from its own flags and its children's info.
    pub fn combine(ty: Type, children: &[&ExprInfo], own: OwnFlags) -> ExprInfo {
        let depends_on_query_entity =
            own.depends_on_entity || children.iter().any(|c| c.depends_on_query_entity);
        let pushdown_eligible = !depends_on_query_entity
            || (own.pushdownable && children.iter().all(|c| c.pushdown_eligible));
        let has_write_effect =
            own.write_effect || children.iter().any(|c| c.has_write_effect);
        let mut captured_scopes: FxHashSet<QueryScopeId> =
            own.captures.iter().copied().collect();
        for child in children {
            captured_scopes.extend(child.captured_scopes.iter().copied());
        }
        ExprInfo {
            ty,
            has_write_effect,
            depends_on_query_entity,
            pushdown_eligible,
            captured_scopes,
        }
    }

    /// Info for a leaf with default flags.
    pub fn leaf(ty: Type) -> ExprInfo {
        ExprInfo::combine(ty, &[], OwnFlags::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn entity_column() -> ExprInfo {
        ExprInfo::combine(
            Type::Integer,
            &[],
            OwnFlags {
                depends_on_entity: true,
                captures: smallvec![QueryScopeId(0)],
                ..OwnFlags::default()
            },
        )
    }

    #[test]
    fn flags_are_monotonic_up_the_tree() {
        let col = entity_column();
        let write = ExprInfo::combine(
            Type::Unit,
            &[],
            OwnFlags {
                write_effect: true,
                ..OwnFlags::default()
            },
        );
        let parent = ExprInfo::combine(Type::Boolean, &[&col, &write], OwnFlags::default());
        assert!(parent.depends_on_query_entity);
        assert!(parent.has_write_effect);
        assert!(parent.captured_scopes.contains(&QueryScopeId(0)));
    }

    #[test]
    fn entity_free_subtree_is_trivially_eligible() {
        // Own capability false, but no entity dependency anywhere.
        let leaf = ExprInfo::leaf(Type::Integer);
        let parent = ExprInfo::combine(
            Type::Integer,
            &[&leaf],
            OwnFlags {
                pushdownable: false,
                ..OwnFlags::default()
            },
        );
        assert!(!parent.depends_on_query_entity);
        assert!(parent.pushdown_eligible);
    }

    #[test]
    fn strict_eligibility_requires_own_capability_and_all_children() {
        let col = entity_column();
        assert!(col.pushdown_eligible);

        let eligible = ExprInfo::combine(Type::Integer, &[&col], OwnFlags::default());
        assert!(eligible.pushdown_eligible);

        let blocked = ExprInfo::combine(
            Type::Integer,
            &[&col],
            OwnFlags {
                pushdownable: false,
                ..OwnFlags::default()
            },
        );
        assert!(blocked.depends_on_query_entity);
        assert!(!blocked.pushdown_eligible);

        // Ineligibility propagates through capable parents.
        let parent = ExprInfo::combine(Type::Integer, &[&blocked], OwnFlags::default());
        assert!(!parent.pushdown_eligible);
    }
}
