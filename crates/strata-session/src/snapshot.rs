//! In-process deep copy of entity graphs.
//!
//! A context snapshot must not share handles with the live session, yet two
//! references to one object inside the snapshot must still point at one
//! object after restore. [`GraphCopier`] memoizes every handle it copies and
//! relinks the copies through that memo, so cycles and shared references
//! survive.

use std::cell::RefCell;
use std::collections::HashMap;
use strata_core::{CollectionIdentity, CollectionRef, EntityIdentity, EntityRef};

#[derive(Default)]
struct CopyState {
    entities: HashMap<EntityIdentity, EntityRef>,
    collections: HashMap<CollectionIdentity, CollectionRef>,
    pending_entities: Vec<EntityRef>,
    pending_collections: Vec<CollectionRef>,
}

/// Copies entity and collection handles, preserving sharing.
///
/// Copies are produced shallowly by [`entity`](Self::entity) /
/// [`collection`](Self::collection); their outgoing references are rewritten
/// when [`finish`](Self::finish) runs.
#[derive(Default)]
pub struct GraphCopier {
    state: RefCell<CopyState>,
}

impl GraphCopier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of `source`; the same copy for every call with the same source.
    pub fn entity(&self, source: &EntityRef) -> EntityRef {
        let mut state = self.state.borrow_mut();
        if let Some(copy) = state.entities.get(&source.identity()) {
            return copy.clone();
        }
        let copy = source.detached_copy();
        state.entities.insert(source.identity(), copy.clone());
        state.pending_entities.push(copy.clone());
        copy
    }

    pub fn collection(&self, source: &CollectionRef) -> CollectionRef {
        let mut state = self.state.borrow_mut();
        if let Some(copy) = state.collections.get(&source.identity()) {
            return copy.clone();
        }
        let copy = source.detached_copy();
        state.collections.insert(source.identity(), copy.clone());
        state.pending_collections.push(copy.clone());
        copy
    }

    /// Rewrite references inside every copy made so far (and every copy this
    /// produces in turn) to point at copies.
    pub fn finish(&self) {
        loop {
            let next_entity = self.state.borrow_mut().pending_entities.pop();
            if let Some(copy) = next_entity {
                let mut map_entity = |e: &EntityRef| Some(self.entity(e));
                let mut map_collection = |c: &CollectionRef| Some(self.collection(c));
                copy.write().relink(&mut map_entity, &mut map_collection);
                continue;
            }
            let next_collection = self.state.borrow_mut().pending_collections.pop();
            if let Some(copy) = next_collection {
                let mut map_entity = |e: &EntityRef| Some(self.entity(e));
                copy.write().relink_elements(&mut map_entity);
                continue;
            }
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{Association, Element, Entity};

    #[test]
    fn shared_references_stay_shared() {
        let customer = EntityRef::new(Entity::new("Customer").with_id(1_i64));
        let a = EntityRef::new(
            Entity::new("Order")
                .with_id(10_i64)
                .with_reference("customer", Association::to(&customer)),
        );
        let b = EntityRef::new(
            Entity::new("Order")
                .with_id(11_i64)
                .with_reference("customer", Association::to(&customer)),
        );

        let copier = GraphCopier::new();
        let a2 = copier.entity(&a);
        let b2 = copier.entity(&b);
        copier.finish();

        let ca = a2.read().association("customer").unwrap().target().unwrap().clone();
        let cb = b2.read().association("customer").unwrap().target().unwrap().clone();
        assert!(ca.ptr_eq(&cb));
        assert!(!ca.ptr_eq(&customer));
        assert!(!a2.ptr_eq(&a));
    }

    #[test]
    fn cycles_terminate() {
        let parent = EntityRef::new(Entity::new("Node").with_id(1_i64));
        let children = CollectionRef::new("Node.children", Vec::new());
        let child = EntityRef::new(
            Entity::new("Node")
                .with_id(2_i64)
                .with_reference("parent", Association::to(&parent)),
        );
        children.write().push(Element::Entity(child.clone())).unwrap();
        parent.write().set_property(
            "children",
            strata_core::Property::Collection(children.clone()),
        );

        let copier = GraphCopier::new();
        let parent2 = copier.entity(&parent);
        copier.finish();

        let coll2 = parent2.read().collection("children").unwrap().clone();
        assert!(!coll2.ptr_eq(&children));
        let child2 = coll2.read().elements().unwrap()[0].as_entity().unwrap().clone();
        assert!(!child2.ptr_eq(&child));
        let back = child2.read().association("parent").unwrap().target().unwrap().clone();
        assert!(back.ptr_eq(&parent2));
    }
}
