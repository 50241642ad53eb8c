//! Interned engine class names.

use std::fmt;
use std::sync::{Mutex, OnceLock};

use rustc_hash::FxHashMap;

use crate::TypeHash;

static INTERNER: OnceLock<Mutex<FxHashMap<TypeHash, &'static str>>> = OnceLock::new();

/// Interned engine class name.
///
/// Class tags are the keys of every registry lookup and every cast check.
/// Interning makes them `Copy` and compares them by hash; the name string is
/// leaked once per distinct class for the life of the process, matching the
/// lifetime of the engine's class database.
#[derive(Clone, Copy)]
pub struct ClassTag {
    name: &'static str,
    hash: TypeHash,
}

impl ClassTag {
    /// Intern `name` and return its tag.
    pub fn new(name: &str) -> Self {
        let hash = TypeHash::from_name(name);
        let interner = INTERNER.get_or_init(|| Mutex::new(FxHashMap::default()));
        let mut table = interner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let name = *table
            .entry(hash)
            .or_insert_with(|| Box::leak(name.to_owned().into_boxed_str()));
        ClassTag { name, hash }
    }

    /// The class name.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The class hash.
    #[inline]
    pub fn hash(&self) -> TypeHash {
        self.hash
    }
}

impl PartialEq for ClassTag {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for ClassTag {}

impl std::hash::Hash for ClassTag {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Debug for ClassTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassTag({})", self.name)
    }
}

impl fmt::Display for ClassTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl From<&str> for ClassTag {
    fn from(name: &str) -> Self {
        ClassTag::new(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_same_storage() {
        let a = ClassTag::new("Sprite2D");
        let b = ClassTag::new(&String::from("Sprite2D"));
        assert_eq!(a, b);
        assert!(std::ptr::eq(a.name(), b.name()));
    }

    #[test]
    fn distinct_names_differ() {
        assert_ne!(ClassTag::new("Node"), ClassTag::new("Node3D"));
    }

    #[test]
    fn display() {
        assert_eq!(ClassTag::new("Timer").to_string(), "Timer");
        assert_eq!(format!("{:?}", ClassTag::new("Timer")), "ClassTag(Timer)");
    }
}
