//! Name to factory maps populated at startup.

use std::collections::BTreeMap;

use crate::{error::Error, utils::Result};

/// Factories keyed by name, for dialects and authentication handlers.
#[derive(Clone)]
pub struct Registry<F> {
    kind: &'static str,
    entries: BTreeMap<String, F>,
}

impl<F> Registry<F> {
    /// `kind` names what the registry holds, for error messages.
    pub fn new(kind: &'static str) -> Registry<F> {
        Registry {
            kind,
            entries: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, key: &str, factory: F) -> &mut Self {
        self.entries.insert(key.to_owned(), factory);
        self
    }

    pub fn get(&self, key: &str) -> Result<&F> {
        self.entries
            .get(key)
            .ok_or_else(|| Error::Msg(format!("unknown {}: {}", self.kind, key)))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl<F> std::fmt::Debug for Registry<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("keys", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_key_is_a_plain_error() {
        let mut reg: Registry<fn() -> u32> = Registry::new("widget");
        reg.register("one", || 1).register("two", || 2);

        assert_eq!((reg.get("two").unwrap())(), 2);
        assert!(reg.contains("one"));
        assert_eq!(reg.keys().collect::<Vec<_>>(), vec!["one", "two"]);

        let err = reg.get("three").err().unwrap();
        assert_eq!(err.to_string(), "unknown widget: three");
    }
}
