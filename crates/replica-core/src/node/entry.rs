//! Child slots of a node

use super::Replicant;
use replica_value::{Key, Value};
use std::collections::BTreeMap;

/// Content of one child slot: a plain value or a nested node
#[derive(Debug, Clone)]
pub enum Entry {
    /// Plain value
    Value(Value),
    /// Nested node owned by the slot's node
    Node(Replicant),
}

impl Entry {
    /// Whether the slot is empty
    #[inline]
    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Value(Value::Nil))
    }

    /// Plain value, if this is one
    #[inline]
    #[must_use]
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Node(_) => None,
        }
    }

    /// Nested node, if this is one
    #[inline]
    #[must_use]
    pub fn as_node(&self) -> Option<&Replicant> {
        match self {
            Self::Node(node) => Some(node),
            Self::Value(_) => None,
        }
    }

    /// Snapshot as a plain value; nested nodes are flattened
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Value(value) => value.clone(),
            Self::Node(node) => node.to_value(),
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Value(value) => value.kind(),
            Self::Node(_) => "node",
        }
    }
}

impl Default for Entry {
    fn default() -> Self {
        Self::Value(Value::Nil)
    }
}

/// Values compare by content, nodes by identity
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Value(a), Self::Value(b)) => a == b,
            (Self::Node(a), Self::Node(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<Replicant> for Entry {
    fn from(node: Replicant) -> Self {
        Self::Node(node)
    }
}

impl From<&Replicant> for Entry {
    fn from(node: &Replicant) -> Self {
        Self::Node(node.clone())
    }
}

macro_rules! entry_from_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Entry {
                fn from(value: $ty) -> Self {
                    Self::Value(Value::from(value))
                }
            }
        )*
    };
}

entry_from_value!(Value, bool, f64, i32, u32, &str, String);

/// Storage of a node's children
///
/// Sequences are dense: a `Nil` written inside the sequence leaves a hole,
/// trailing holes are trimmed. Keyed slots never store `Nil`.
#[derive(Debug, Clone)]
pub(crate) enum Slots {
    Sequence(Vec<Entry>),
    Keyed(BTreeMap<String, Entry>),
}

impl Slots {
    pub(crate) fn new(sequence: bool) -> Self {
        if sequence {
            Self::Sequence(Vec::new())
        } else {
            Self::Keyed(BTreeMap::new())
        }
    }

    pub(crate) fn get(&self, key: &Key) -> Option<&Entry> {
        match (self, key) {
            (Self::Sequence(items), Key::Index(i)) => items.get(*i),
            (Self::Keyed(map), Key::Name(name)) => map.get(name),
            _ => None,
        }
    }

    /// Store `entry` at `key`, returning the displaced entry
    ///
    /// The key kind and sequence bound must already be validated against
    /// the slot flavor.
    pub(crate) fn put(&mut self, key: &Key, entry: Entry) -> Option<Entry> {
        match (self, key) {
            (Self::Sequence(items), Key::Index(i)) => {
                let i = *i;
                let displaced = if entry.is_nil() {
                    items.get_mut(i).map(|slot| std::mem::replace(slot, entry))
                } else {
                    if i >= items.len() {
                        let len = i.checked_add(1)?;
                        items.resize_with(len, Entry::default);
                    }
                    Some(std::mem::replace(&mut items[i], entry))
                };
                while items.last().is_some_and(Entry::is_nil) {
                    items.pop();
                }
                displaced.filter(|old| !old.is_nil())
            }
            (Self::Keyed(map), Key::Name(name)) => {
                if entry.is_nil() {
                    map.remove(name)
                } else {
                    map.insert(name.clone(), entry)
                }
            }
            _ => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Sequence(items) => items.len(),
            Self::Keyed(map) => map.len(),
        }
    }

    /// Keys in slot order
    pub(crate) fn keys(&self) -> Vec<Key> {
        match self {
            Self::Sequence(items) => (0..items.len()).map(Key::Index).collect(),
            Self::Keyed(map) => map.keys().cloned().map(Key::Name).collect(),
        }
    }

    pub(crate) fn iter(&self) -> Box<dyn Iterator<Item = (Key, &Entry)> + '_> {
        match self {
            Self::Sequence(items) => Box::new(items.iter().enumerate().map(|(i, e)| (Key::Index(i), e))),
            Self::Keyed(map) => Box::new(map.iter().map(|(k, e)| (Key::Name(k.clone()), e))),
        }
    }

    /// Nested nodes, with their keys
    pub(crate) fn nodes(&self) -> Vec<(Key, Replicant)> {
        self.iter()
            .filter_map(|(key, entry)| entry.as_node().map(|node| (key, node.clone())))
            .collect()
    }

    /// Take every entry out, leaving the slots empty
    pub(crate) fn drain(&mut self) -> Vec<Entry> {
        match self {
            Self::Sequence(items) => std::mem::take(items),
            Self::Keyed(map) => std::mem::take(map).into_values().collect(),
        }
    }
}
