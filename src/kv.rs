use std::cmp::Ordering;
use std::collections::BTreeMap;

use glob::{MatchOptions, Pattern};

/// Key wrapper ordering case-insensitively while keeping the original
/// spelling for display.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct KvKey(String);

impl KvKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for KvKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let a = self.0.chars().map(|c| c.to_ascii_lowercase());
        let b = other.0.chars().map(|c| c.to_ascii_lowercase());
        a.cmp(b)
    }
}

impl PartialOrd for KvKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Kv {
    pub key: String,
    pub value: Option<String>,
    /// Repeated headers with the same name.
    pub children: Vec<Kv>,
    /// Value contains a `$` macro that gets expanded at apply time.
    pub macro_expand: bool,
    /// Key contains shell wildcards and is matched by scanning.
    pub globbing: bool,
}

impl Kv {
    pub fn new(key: impl Into<String>, value: Option<String>) -> Self {
        let key = key.into();
        let globbing = key.contains(['*', '?', '[']);
        let macro_expand = value.as_deref().is_some_and(|v| v.contains('$'));
        Self {
            key,
            value,
            children: Vec::new(),
            macro_expand,
            globbing,
        }
    }

    /// Replace the value atomically: the old value and all repeated-header
    /// children are dropped together.
    pub fn set(&mut self, value: impl Into<String>) {
        self.children.clear();
        let value = value.into();
        self.macro_expand = value.contains('$');
        self.value = Some(value);
    }

    pub fn set_key(&mut self, key: impl Into<String>) {
        let key = key.into();
        self.globbing = key.contains(['*', '?', '[']);
        self.key = key;
    }

    /// Append to the value, e.g. for header continuation lines.
    pub fn extend(&mut self, tail: &str) {
        match &mut self.value {
            Some(v) => v.push_str(tail),
            None => self.value = Some(tail.to_string()),
        }
    }
}

/// Ordered, case-insensitive key-value store for header rewrite rules.
/// Exact keys resolve through the tree; keys holding shell wildcards are
/// matched by a linear scan.
#[derive(Debug, Default)]
pub struct KvTree {
    nodes: BTreeMap<KvKey, Kv>,
}

impl KvTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node. A second node under an existing key becomes a child
    /// of the first (repeated header); the return value names the node that
    /// now owns the key.
    pub fn add(&mut self, kv: Kv) -> &mut Kv {
        let key = KvKey::new(kv.key.clone());
        match self.nodes.entry(key) {
            std::collections::btree_map::Entry::Occupied(e) => {
                let parent = e.into_mut();
                parent.children.push(kv);
                parent
            }
            std::collections::btree_map::Entry::Vacant(e) => e.insert(kv),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Kv> {
        self.nodes.get(&KvKey::new(key))
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Kv> {
        self.nodes.get_mut(&KvKey::new(key))
    }

    /// Look up the node matching `probe`: by tree lookup for plain keys,
    /// by case-folded wildcard match for globbing keys.
    pub fn find(&self, probe: &Kv) -> Option<&Kv> {
        if probe.globbing {
            let pattern = Pattern::new(&probe.key).ok()?;
            let options = MatchOptions {
                case_sensitive: false,
                require_literal_separator: false,
                require_literal_leading_dot: false,
            };
            self.nodes
                .values()
                .find(|kv| pattern.matches_with(&kv.key, options))
        } else {
            self.get(&probe.key)
        }
    }

    /// Remove a node together with its repeated-header children.
    pub fn delete(&mut self, key: &str) -> Option<Kv> {
        self.nodes.remove(&KvKey::new(key))
    }

    pub fn purge(&mut self) {
        self.nodes.clear();
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Key-ordered iteration.
    pub fn iter(&self) -> impl Iterator<Item = &Kv> {
        self.nodes.values()
    }

    /// The node owning `child`'s key, if the key is present. Children keep
    /// no owning back-reference to their parent; this lookup stands in for
    /// one.
    pub fn parent_of(&self, child: &Kv) -> Option<&Kv> {
        self.get(&child.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut tree = KvTree::new();
        tree.add(Kv::new("Content-Type", Some("text/html".into())));
        assert_eq!(
            tree.get("content-type").unwrap().value.as_deref(),
            Some("text/html")
        );
        assert!(tree.get("content-length").is_none());
    }

    #[test]
    fn repeated_keys_become_children() {
        let mut tree = KvTree::new();
        tree.add(Kv::new("Set-Cookie", Some("a=1".into())));
        tree.add(Kv::new("Set-Cookie", Some("b=2".into())));

        let kv = tree.get("set-cookie").unwrap();
        assert_eq!(kv.value.as_deref(), Some("a=1"));
        assert_eq!(kv.children.len(), 1);
        assert_eq!(kv.children[0].value.as_deref(), Some("b=2"));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn set_replaces_value_and_drops_children() {
        let mut tree = KvTree::new();
        tree.add(Kv::new("X-Header", Some("one".into())));
        tree.add(Kv::new("X-Header", Some("two".into())));

        let kv = tree.get_mut("x-header").unwrap();
        kv.set("$REMOTE_ADDR");
        assert_eq!(kv.value.as_deref(), Some("$REMOTE_ADDR"));
        assert!(kv.children.is_empty());
        assert!(kv.macro_expand);
    }

    #[test]
    fn glob_keys_match_by_scan() {
        let mut tree = KvTree::new();
        tree.add(Kv::new("X-Forwarded-For", None));
        tree.add(Kv::new("Host", None));

        let probe = Kv::new("x-forwarded-*", None);
        assert!(probe.globbing);
        assert_eq!(tree.find(&probe).unwrap().key, "X-Forwarded-For");

        let miss = Kv::new("cookie*", None);
        assert!(tree.find(&miss).is_none());
    }

    #[test]
    fn exact_find_ignores_glob_entries() {
        let mut tree = KvTree::new();
        tree.add(Kv::new("Accept", Some("*/*".into())));
        let probe = Kv::new("Accept", None);
        assert!(!probe.globbing);
        assert_eq!(tree.find(&probe).unwrap().value.as_deref(), Some("*/*"));
    }

    #[test]
    fn delete_removes_node_and_children() {
        let mut tree = KvTree::new();
        tree.add(Kv::new("Via", Some("a".into())));
        tree.add(Kv::new("Via", Some("b".into())));
        let removed = tree.delete("via").unwrap();
        assert_eq!(removed.children.len(), 1);
        assert!(tree.is_empty());
    }

    #[test]
    fn iteration_is_key_ordered() {
        let mut tree = KvTree::new();
        tree.add(Kv::new("b-header", None));
        tree.add(Kv::new("A-Header", None));
        tree.add(Kv::new("C-header", None));
        let keys: Vec<_> = tree.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, ["A-Header", "b-header", "C-header"]);
    }

    #[test]
    fn extend_appends() {
        let mut kv = Kv::new("User-Agent", Some("curl".into()));
        kv.extend("/8.0");
        assert_eq!(kv.value.as_deref(), Some("curl/8.0"));
    }
}
