use std::collections::HashMap;

/// Opaque object id. Every configurable entity gets one, assigned by the
/// parent while loading the configuration.
pub type ObjectId = u32;

/// Named entity with a parent-assigned id.
pub trait Entity {
    fn id(&self) -> ObjectId;
    fn name(&self) -> &str;
}

/// Insertion-ordered registry with by-id and by-name lookup.
///
/// Configurations hold tens to low hundreds of entries, so a linear scan is
/// fine; the order also matters for config distribution and rule matching.
#[derive(Debug, Default)]
pub struct IdMap<T> {
    items: Vec<T>,
}

impl<T: Entity> IdMap<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn find(&self, id: ObjectId) -> Option<&T> {
        self.items.iter().find(|i| i.id() == id)
    }

    pub fn find_mut(&mut self, id: ObjectId) -> Option<&mut T> {
        self.items.iter_mut().find(|i| i.id() == id)
    }

    pub fn by_name(&self, name: &str) -> Option<&T> {
        self.items.iter().find(|i| i.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Handle-keyed store for entities that come and go at high rate
/// (sessions). Insertion hands out the id; removal is O(1).
#[derive(Debug)]
pub struct HandleMap<T> {
    next: ObjectId,
    items: HashMap<ObjectId, T>,
}

impl<T> HandleMap<T> {
    pub fn new() -> Self {
        Self {
            next: 1,
            items: HashMap::new(),
        }
    }

    pub fn insert(&mut self, item: T) -> ObjectId {
        let id = self.next;
        self.next = self.next.wrapping_add(1).max(1);
        self.items.insert(id, item);
        id
    }

    pub fn get(&self, id: ObjectId) -> Option<&T> {
        self.items.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut T> {
        self.items.get_mut(&id)
    }

    pub fn remove(&mut self, id: ObjectId) -> Option<T> {
        self.items.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectId, &T)> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T> Default for HandleMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Item {
        id: ObjectId,
        name: String,
    }

    impl Entity for Item {
        fn id(&self) -> ObjectId {
            self.id
        }
        fn name(&self) -> &str {
            &self.name
        }
    }

    fn item(id: ObjectId, name: &str) -> Item {
        Item {
            id,
            name: name.to_string(),
        }
    }

    #[test]
    fn idmap_preserves_insertion_order() {
        let mut map = IdMap::new();
        map.push(item(3, "c"));
        map.push(item(1, "a"));
        map.push(item(2, "b"));

        let names: Vec<_> = map.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["c", "a", "b"]);
        assert_eq!(map.find(1).unwrap().name, "a");
        assert_eq!(map.by_name("b").unwrap().id, 2);
        assert!(map.find(9).is_none());
    }

    #[test]
    fn handles_are_unique_and_removal_is_exact() {
        let mut map = HandleMap::new();
        let a = map.insert("a");
        let b = map.insert("b");
        assert_ne!(a, b);
        assert_eq!(map.remove(a), Some("a"));
        assert_eq!(map.remove(a), None);
        assert_eq!(map.get(b), Some(&"b"));
        assert_eq!(map.len(), 1);
    }
}
