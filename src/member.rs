//! Cluster Members
//!
//! A member is one backend database participating in the cluster.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use serde::{Deserialize, Serialize};

/// Where a member lives relative to this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locality {
    /// Same host/process as the middleware
    Local,
    /// Reachable over the network
    Remote,
}

impl std::fmt::Display for Locality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Locality::Local => write!(f, "LOCAL"),
            Locality::Remote => write!(f, "REMOTE"),
        }
    }
}

/// One backend database.
///
/// Identity is the `id` alone: two members with the same id are the same
/// member regardless of weight or url.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// Unique identifier, stable across restarts
    pub id: String,
    /// Connection URL for the backend
    pub url: String,
    /// Routing priority (higher wins primary)
    pub weight: u32,
    /// Local or remote
    pub locality: Locality,
}

impl Member {
    /// Create a remote member with weight 1
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            weight: 1,
            locality: Locality::Remote,
        }
    }

    /// Set the routing weight
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Set the locality
    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = locality;
        self
    }

    pub fn is_local(&self) -> bool {
        self.locality == Locality::Local
    }

    /// Ordering used to pick the primary: highest weight first, then id
    pub fn priority_cmp(&self, other: &Member) -> Ordering {
        other
            .weight
            .cmp(&self.weight)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Member {}

impl Hash for Member {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_identity() {
        let a = Member::new("db1", "mysql://a").with_weight(3);
        let b = Member::new("db1", "mysql://b").with_weight(1);
        assert_eq!(a, b);
    }

    #[test]
    fn test_priority_order() {
        let mut members = vec![
            Member::new("db3", "").with_weight(1),
            Member::new("db1", "").with_weight(1),
            Member::new("db2", "").with_weight(5),
        ];
        members.sort_by(|a, b| a.priority_cmp(b));
        let ids: Vec<_> = members.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["db2", "db1", "db3"]);
    }
}
