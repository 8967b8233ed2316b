//! Cheap, clonable identifiers for jobs, resources, flags and shaders.

use std::borrow::Borrow;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// An interned-style string identifier. Cloning only bumps a reference count, so names can be
/// freely copied into commands, declarations and map keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Name(Arc<str>);

impl Name {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Name {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Name {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl From<&String> for Name {
    fn from(value: &String) -> Self {
        Self::new(value)
    }
}

impl From<&Name> for Name {
    fn from(value: &Name) -> Self {
        value.clone()
    }
}

impl Borrow<str> for Name {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Name {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl PartialEq<&str> for Name {
    fn eq(&self, other: &&str) -> bool {
        &*self.0 == *other
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn lookup_by_str() {
        let mut map = BTreeMap::new();
        map.insert(Name::from("gbuffer"), 1);
        assert_eq!(map.get("gbuffer"), Some(&1));
        assert_eq!(Name::from(String::from("gbuffer")), "gbuffer");
    }
}
