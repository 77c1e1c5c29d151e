//! Plugin identity.
//!
//! A plugin is identified by the scope it was installed under plus its
//! manifest id. The same id may be installed independently under several
//! scopes.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A grouping identifier (for example a library) under which plugins are
/// installed and ordering/field settings may override the global default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// The host-wide default.
    Global,
    /// A specific scope.
    Id(u64),
}

impl Scope {
    pub fn is_global(&self) -> bool {
        matches!(self, Scope::Global)
    }

    /// Whether a plugin installed under `self` is visible to `viewer`.
    ///
    /// Global plugins are visible everywhere; scoped plugins only to their
    /// own scope.
    pub fn is_visible_to(&self, viewer: &Scope) -> bool {
        match self {
            Scope::Global => true,
            own => own == viewer,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Id(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("global") {
            return Ok(Scope::Global);
        }
        s.parse::<u64>()
            .map(Scope::Id)
            .map_err(|_| format!("invalid scope '{}': expected \"global\" or a number", s))
    }
}

impl Serialize for Scope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Scope::Global => serializer.serialize_str("global"),
            Scope::Id(id) => serializer.serialize_u64(*id),
        }
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Id(u64),
            Name(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Id(id) => Ok(Scope::Id(id)),
            Raw::Name(name) => name.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Registry key of an installed plugin: `(scope, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginKey {
    pub scope: Scope,
    pub id: String,
}

impl PluginKey {
    pub fn new(scope: Scope, id: impl Into<String>) -> Self {
        Self {
            scope,
            id: id.into(),
        }
    }

    pub fn global(id: impl Into<String>) -> Self {
        Self::new(Scope::Global, id)
    }
}

impl fmt::Display for PluginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_parse() {
        assert_eq!("global".parse::<Scope>().unwrap(), Scope::Global);
        assert_eq!("GLOBAL".parse::<Scope>().unwrap(), Scope::Global);
        assert_eq!("7".parse::<Scope>().unwrap(), Scope::Id(7));
        assert!("library".parse::<Scope>().is_err());
    }

    #[test]
    fn test_scope_deserialize_int_or_string() {
        #[derive(Deserialize)]
        struct Row {
            scope: Scope,
        }

        let row: Row = toml::from_str("scope = 7").unwrap();
        assert_eq!(row.scope, Scope::Id(7));
        let row: Row = toml::from_str("scope = \"global\"").unwrap();
        assert_eq!(row.scope, Scope::Global);
    }

    #[test]
    fn test_visibility() {
        assert!(Scope::Global.is_visible_to(&Scope::Id(3)));
        assert!(Scope::Id(3).is_visible_to(&Scope::Id(3)));
        assert!(!Scope::Id(3).is_visible_to(&Scope::Id(4)));
        assert!(!Scope::Id(3).is_visible_to(&Scope::Global));
    }

    #[test]
    fn test_key_display() {
        assert_eq!(PluginKey::new(Scope::Id(7), "goodreads").to_string(), "7/goodreads");
        assert_eq!(PluginKey::global("openlibrary").to_string(), "global/openlibrary");
    }
}
