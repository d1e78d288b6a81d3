//! Object registry (C3): the arena that owns every [`Object`] and indexes
//! it by `(ObjectKind, name)` identity, per §4.3.

use hashbrown::HashMap;

use crate::error::{CoreError, Result};
use crate::object::{Object, ObjectId, ObjectKind};

/// Owns every object and provides the only path from `(kind, name)` or
/// [`ObjectId`] to a live [`Object`]. Mirrors the pack's arena-plus-index
/// pattern for peer maps: a stable handle decouples identity from storage
/// location, so the link manager can hold an `ObjectId` across a borrow
/// that would otherwise alias.
#[derive(Default)]
pub struct Registry {
    objects: HashMap<ObjectId, Object>,
    by_name: HashMap<(ObjectKind, String), ObjectId>,
    next_id: ObjectId,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next [`ObjectId`]; the caller constructs the `Object`
    /// with it and passes it to [`Registry::insert`].
    pub fn reserve_id(&mut self) -> ObjectId {
        self.next_id += 1;
        self.next_id
    }

    /// Insert a freshly constructed object. Fails with
    /// [`CoreError::Duplicate`] if an object of the same kind and name is
    /// already registered (invariant: identity is unique per §3).
    pub fn insert(&mut self, object: Object) -> Result<ObjectId> {
        let key = (object.kind(), object.name().to_string());
        if self.by_name.contains_key(&key) {
            return Err(CoreError::Duplicate(object.name().to_string()));
        }
        let id = object.id();
        self.by_name.insert(key, id);
        self.objects.insert(id, object);
        Ok(id)
    }

    #[must_use]
    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(&id)
    }

    #[must_use]
    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.objects.get_mut(&id)
    }

    #[must_use]
    pub fn find(&self, kind: ObjectKind, name: &str) -> Option<ObjectId> {
        self.by_name.get(&(kind, name.to_string())).copied()
    }

    /// Remove an object entirely. Callers must have already detached it
    /// from the link graph (see [`crate::link::close`]); this is the raw
    /// arena operation, not the cascading close.
    pub fn remove(&mut self, id: ObjectId) -> Option<Object> {
        let object = self.objects.remove(&id)?;
        self.by_name.remove(&(object.kind(), object.name().to_string()));
        Some(object)
    }

    /// Borrow two distinct objects mutably at once, e.g. to move a writer
    /// link's endpoints. Panics if `a == b`; callers never need that case.
    pub fn get_pair_mut(&mut self, a: ObjectId, b: ObjectId) -> (Option<&mut Object>, Option<&mut Object>) {
        assert_ne!(a, b, "get_pair_mut requires distinct ids");
        if a < b {
            let (left, right) = self.objects.split_at_id(a, b);
            (left, right)
        } else {
            let (right, left) = self.objects.split_at_id(b, a);
            (left, right)
        }
    }

    /// All objects in `compare` order (name order), for listing commands.
    #[must_use]
    pub fn sorted(&self) -> Vec<&Object> {
        let mut v: Vec<&Object> = self.objects.values().collect();
        v.sort_by(|a, b| crate::object::compare(a, b));
        v
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectId, &Object)> {
        self.objects.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ObjectId, &mut Object)> {
        self.objects.iter_mut()
    }
}

/// `hashbrown::HashMap` has no built-in "split at one key" helper, so this
/// extension trait implements it via two lookups and `get_disjoint_mut`-
/// style unsafe aliasing avoidance, scoped to this module only.
trait SplitAtId {
    fn split_at_id(
        &mut self,
        a: ObjectId,
        b: ObjectId,
    ) -> (Option<&mut Object>, Option<&mut Object>);
}

impl SplitAtId for HashMap<ObjectId, Object> {
    fn split_at_id(
        &mut self,
        a: ObjectId,
        b: ObjectId,
    ) -> (Option<&mut Object>, Option<&mut Object>) {
        assert!(a < b);
        // SAFETY: `a` and `b` are distinct keys, so the two raw pointers
        // obtained below never alias. `HashMap` does not expose a safe
        // "get two mutable entries" API, hence the raw-pointer detour,
        // scoped tightly to this single function.
        let ptr_a = self.get_mut(&a).map(|r| r as *mut Object);
        let ptr_b = self.get_mut(&b).map(|r| r as *mut Object);
        unsafe {
            (
                ptr_a.map(|p| &mut *p),
                ptr_b.map(|p| &mut *p),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_console(registry: &mut Registry, name: &str) -> ObjectId {
        let id = registry.reserve_id();
        registry
            .insert(Object::new_console(id, name, "/dev/null", 9600, None))
            .unwrap()
    }

    #[test]
    fn insert_and_find_roundtrip() {
        let mut reg = Registry::new();
        let id = make_console(&mut reg, "c1");
        assert_eq!(reg.find(ObjectKind::Console, "c1"), Some(id));
        assert!(reg.get(id).is_some());
    }

    #[test]
    fn duplicate_name_same_kind_rejected() {
        let mut reg = Registry::new();
        make_console(&mut reg, "c1");
        let id2 = reg.reserve_id();
        let err = reg
            .insert(Object::new_console(id2, "c1", "/dev/null", 9600, None))
            .unwrap_err();
        assert!(matches!(err, CoreError::Duplicate(_)));
    }

    #[test]
    fn same_name_different_kind_is_allowed() {
        let mut reg = Registry::new();
        make_console(&mut reg, "c1");
        let id2 = reg.reserve_id();
        reg.insert(Object::new_logfile(id2, "c1")).unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn remove_drops_name_index_entry() {
        let mut reg = Registry::new();
        let id = make_console(&mut reg, "c1");
        reg.remove(id);
        assert_eq!(reg.find(ObjectKind::Console, "c1"), None);
        assert!(reg.is_empty());
    }

    #[test]
    fn get_pair_mut_returns_both_distinct() {
        let mut reg = Registry::new();
        let a = make_console(&mut reg, "a");
        let b = make_console(&mut reg, "b");
        let (oa, ob) = reg.get_pair_mut(a, b);
        assert_eq!(oa.unwrap().name(), "a");
        assert_eq!(ob.unwrap().name(), "b");
    }

    #[test]
    fn sorted_is_name_order() {
        let mut reg = Registry::new();
        make_console(&mut reg, "zeta");
        make_console(&mut reg, "alpha");
        let names: Vec<&str> = reg.sorted().iter().map(|o| o.name()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
