//! Request-scoped cache.
//!
//! Every row a manager loads or stages is memoized here so repeated lookups
//! within one unit of work hand back the same object. Rows are held as
//! [`Shared`] handles in a trie keyed by successive rendered key segments;
//! a partial key resolves to a subtree whose leaves are all returned.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use rowcache_core::{Entity, Key};

/// Handle to a memoized row. Mutations through it are visible to every
/// later read from the same scope.
pub type Shared<E> = Rc<RefCell<E>>;

enum Node<E> {
    Leaf(Shared<E>),
    Branch(BTreeMap<String, Node<E>>),
}

impl<E> Node<E> {
    fn collect_into(&self, out: &mut Vec<Shared<E>>) {
        match self {
            Node::Leaf(shared) => out.push(Rc::clone(shared)),
            Node::Branch(children) => {
                for child in children.values() {
                    child.collect_into(out);
                }
            }
        }
    }
}

/// Trie of memoized rows for one entity type.
pub struct ScopedStore<E> {
    root: BTreeMap<String, Node<E>>,
    len: usize,
}

impl<E> Default for ScopedStore<E> {
    fn default() -> Self {
        Self {
            root: BTreeMap::new(),
            len: 0,
        }
    }
}

impl<E: Entity> ScopedStore<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Branch map holding the leaf for `segments`, creating branches on the
    /// way. A leaf found where a branch is needed is replaced.
    fn parent_of(&mut self, segments: &[String]) -> &mut BTreeMap<String, Node<E>> {
        let mut level = &mut self.root;
        for segment in &segments[..segments.len() - 1] {
            let node = level
                .entry(segment.clone())
                .or_insert_with(|| Node::Branch(BTreeMap::new()));
            if let Node::Leaf(_) = node {
                *node = Node::Branch(BTreeMap::new());
            }
            level = match node {
                Node::Branch(children) => children,
                Node::Leaf(_) => unreachable!("leaf replaced by branch above"),
            };
        }
        level
    }

    /// Memoize `entity`. If its identity is already present the existing
    /// handle is overwritten in place and returned.
    pub fn save(&mut self, entity: E) -> Shared<E> {
        let segments = entity.key().segments();
        if segments.is_empty() {
            return Rc::new(RefCell::new(entity));
        }
        let last = segments[segments.len() - 1].clone();
        let level = self.parent_of(&segments);
        match level.get(&last) {
            Some(Node::Leaf(existing)) => {
                let existing = Rc::clone(existing);
                *existing.borrow_mut() = entity;
                existing
            }
            _ => {
                let shared = Rc::new(RefCell::new(entity));
                level.insert(last, Node::Leaf(Rc::clone(&shared)));
                self.len += 1;
                shared
            }
        }
    }

    /// Memoize an existing handle. When another handle already holds this
    /// identity, that one keeps its place and takes the new contents.
    pub fn save_shared(&mut self, shared: &Shared<E>) -> Shared<E> {
        let segments = shared.borrow().key().segments();
        if segments.is_empty() {
            return Rc::clone(shared);
        }
        let last = segments[segments.len() - 1].clone();
        let level = self.parent_of(&segments);
        match level.get(&last) {
            Some(Node::Leaf(existing)) if Rc::ptr_eq(existing, shared) => Rc::clone(existing),
            Some(Node::Leaf(existing)) => {
                let existing = Rc::clone(existing);
                let value = shared.borrow().clone();
                *existing.borrow_mut() = value;
                existing
            }
            _ => {
                level.insert(last, Node::Leaf(Rc::clone(shared)));
                self.len += 1;
                Rc::clone(shared)
            }
        }
    }

    /// Rows under `key`: the leaf for a full key, the whole subtree for a
    /// partial one, nothing if absent. A key with segments left over once a
    /// leaf is reached matches nothing.
    pub fn get(&self, key: &Key) -> Vec<Shared<E>> {
        let mut out = Vec::new();
        let mut level = &self.root;
        let segments = key.segments();
        for (depth, segment) in segments.iter().enumerate() {
            match level.get(segment) {
                None => return out,
                Some(Node::Leaf(shared)) => {
                    if depth + 1 == segments.len() {
                        out.push(Rc::clone(shared));
                    }
                    return out;
                }
                Some(Node::Branch(children)) => level = children,
            }
        }
        for node in level.values() {
            node.collect_into(&mut out);
        }
        out
    }

    /// The first row under `key`.
    pub fn get_one(&self, key: &Key) -> Option<Shared<E>> {
        self.get(key).into_iter().next()
    }

    pub fn get_many(&self, keys: &[Key]) -> Vec<Shared<E>> {
        keys.iter().flat_map(|k| self.get(k)).collect()
    }
}

/// Per-manager collection of [`ScopedStore`]s, one per entity type.
#[derive(Default)]
pub struct RequestScope {
    stores: HashMap<TypeId, Box<dyn Any>>,
}

impl RequestScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store<E: Entity>(&self) -> Option<&ScopedStore<E>> {
        self.stores
            .get(&TypeId::of::<E>())
            .and_then(|b| b.downcast_ref::<ScopedStore<E>>())
    }

    pub fn store_mut<E: Entity>(&mut self) -> &mut ScopedStore<E> {
        let slot = self
            .stores
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(ScopedStore::<E>::new()));
        match slot.downcast_mut::<ScopedStore<E>>() {
            Some(store) => store,
            None => unreachable!("scope slots are keyed by their own TypeId"),
        }
    }

    pub fn save<E: Entity>(&mut self, entity: E) -> Shared<E> {
        self.store_mut::<E>().save(entity)
    }

    pub fn get_many<E: Entity>(&self, keys: &[Key]) -> Vec<Shared<E>> {
        self.store::<E>()
            .map(|s| s.get_many(keys))
            .unwrap_or_default()
    }

    /// Number of memoized rows of `E`.
    pub fn count<E: Entity>(&self) -> usize {
        self.store::<E>().map_or(0, ScopedStore::len)
    }

    pub fn clear(&mut self) {
        self.stores.clear();
    }
}


#[cfg(test)]
mod prop_tests {
    use super::tests_support::*;
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Every saved row is reachable by its full key and by its first
        /// segment, and saving is idempotent on identity.
        #[test]
        fn prop_trie_lookup(rows in prop::collection::vec((0i64..5, 0i64..5), 1..20)) {
            let mut store = ScopedStore::new();
            for (a, b) in &rows {
                store.save(Cell { a: *a, b: *b });
            }
            let distinct: std::collections::HashSet<_> = rows.iter().cloned().collect();
            prop_assert_eq!(store.len(), distinct.len());
            for (a, b) in &distinct {
                let full = store.get(&rowcache_core::key![*a, *b]);
                prop_assert_eq!(full.len(), 1);
                let partial = store.get(&Key::from(*a));
                let expected = distinct.iter().filter(|(x, _)| x == a).count();
                prop_assert_eq!(partial.len(), expected);
            }
        }
    }
}

#[cfg(test)]
mod tests_support {
    use rowcache_core::{key, ColumnKind, Entity, EntitySchema, Key};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Cell {
        pub a: i64,
        pub b: i64,
    }

    impl Entity for Cell {
        const TABLE: &'static str = "cell";

        fn schema() -> EntitySchema {
            EntitySchema::new()
                .key("a", ColumnKind::Integer)
                .key("b", ColumnKind::Integer)
        }

        fn key(&self) -> Key {
            key![self.a, self.b]
        }
    }
}
