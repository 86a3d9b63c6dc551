//! Lock scopes and applicant identity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A named class of fleet-wide operation. Lower ordinal means higher
/// priority; the ordering is explicit through [`Scope::priority`] rather
/// than operator overloading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scope {
    Catalog,
    Upgrade,
    Orchestration,
}

impl Scope {
    pub const ALL: [Scope; 3] = [Scope::Catalog, Scope::Upgrade, Scope::Orchestration];

    /// Priority ordinal; 1 is the highest.
    pub fn priority(self) -> u8 {
        match self {
            Scope::Catalog => 1,
            Scope::Upgrade => 2,
            Scope::Orchestration => 3,
        }
    }

    /// Whether this scope takes precedence over `other`.
    pub fn outranks(self, other: Scope) -> bool {
        self.priority() < other.priority()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scope::Catalog => "CATALOG",
            Scope::Upgrade => "UPGRADE",
            Scope::Orchestration => "ORCHESTRATION",
        };
        f.write_str(name)
    }
}

/// The identity that owns a lock reservation: the ordered collection of
/// participant node ids party to the handshake. The same applicant value
/// must be presented byte-for-byte across prevent, lock and unlock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Applicant(Vec<String>);

impl Applicant {
    /// Use the ids exactly as given.
    pub fn new(ids: Vec<String>) -> Self {
        Self(ids)
    }

    /// Canonical form: sorted and deduplicated, so every participant derives
    /// the identical applicant from the same membership.
    pub fn from_participants<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        ids.sort();
        ids.dedup();
        Self(ids)
    }

    pub fn ids(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Applicant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_priority_order() {
        assert!(Scope::Catalog.outranks(Scope::Upgrade));
        assert!(Scope::Catalog.outranks(Scope::Orchestration));
        assert!(Scope::Upgrade.outranks(Scope::Orchestration));
        assert!(!Scope::Orchestration.outranks(Scope::Catalog));
        assert!(!Scope::Catalog.outranks(Scope::Catalog));
    }

    #[test]
    fn test_applicant_canonical_form() {
        let a = Applicant::from_participants(["node-b", "node-a", "node-b"]);
        let b = Applicant::from_participants(["node-a", "node-b"]);
        assert_eq!(a, b);
        assert_eq!(a.ids(), ["node-a", "node-b"]);
    }

    #[test]
    fn test_scope_wire_name() {
        assert_eq!(
            serde_json::to_string(&Scope::Orchestration).unwrap(),
            "\"ORCHESTRATION\""
        );
    }
}
