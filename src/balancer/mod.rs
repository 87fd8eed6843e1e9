//! Balancer Module
//!
//! Owns the set of active members and decides which member serves
//! read/dispatch-eligible work. Every variant serializes mutation and
//! `next()` behind a single internal lock; callers take a [`Balancer::snapshot`]
//! before dispatching so the lock is never held across a remote call.

mod simple;
mod round_robin;
mod load;
mod random;

pub use simple::SimpleBalancer;
pub use round_robin::RoundRobinBalancer;
pub use load::LoadBalancer;
pub use random::RandomBalancer;

use std::sync::Arc;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::member::Member;

/// Routing policy over the active member set
pub trait Balancer: Send + Sync {
    /// Highest-priority active member, `None` for an empty cluster
    fn primary(&self) -> Option<Member>;

    /// All active members except the primary
    fn backups(&self) -> Vec<Member>;

    /// Routing decision for read/dispatch-eligible work
    fn next(&self) -> Option<Member>;

    /// Add a member; returns false if it was already present
    fn add(&self, member: Member) -> bool;

    /// Remove a member; returns false if it was not present
    fn remove(&self, member: &Member) -> bool;

    /// Remove every member
    fn clear(&self);

    /// Owned copy of the active set, primary first
    fn snapshot(&self) -> Vec<Member>;

    /// Whether the member is active
    fn contains(&self, member: &Member) -> bool;

    /// Called before a member is dispatched to
    fn begin(&self, _member: &Member) {}

    /// Called after a dispatch to the member completes
    fn end(&self, _member: &Member) {}

    fn is_empty(&self) -> bool {
        self.primary().is_none()
    }
}

/// Balancer variants, selectable by id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalancerKind {
    /// Fixed primary: `next()` always returns the primary
    Simple,
    /// Weighted circular sequence
    RoundRobin,
    /// Fewest in-flight operations, weight adjusted
    Load,
    /// Weighted random choice
    Random,
}

impl BalancerKind {
    pub fn id(&self) -> &'static str {
        match self {
            BalancerKind::Simple => "simple",
            BalancerKind::RoundRobin => "round-robin",
            BalancerKind::Load => "load",
            BalancerKind::Random => "random",
        }
    }

    /// Build an empty balancer of this kind
    pub fn create(&self) -> Arc<dyn Balancer> {
        match self {
            BalancerKind::Simple => Arc::new(SimpleBalancer::new()),
            BalancerKind::RoundRobin => Arc::new(RoundRobinBalancer::new()),
            BalancerKind::Load => Arc::new(LoadBalancer::new()),
            BalancerKind::Random => Arc::new(RandomBalancer::new()),
        }
    }
}

impl std::str::FromStr for BalancerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "simple" => Ok(BalancerKind::Simple),
            "round-robin" => Ok(BalancerKind::RoundRobin),
            "load" => Ok(BalancerKind::Load),
            "random" => Ok(BalancerKind::Random),
            other => Err(Error::UnknownFactory {
                kind: "balancer",
                id: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for BalancerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Active members kept in priority order
#[derive(Debug, Default, Clone)]
pub(crate) struct MemberSet {
    members: Vec<Member>,
}

impl MemberSet {
    pub(crate) fn insert(&mut self, member: Member) -> bool {
        if self.members.contains(&member) {
            return false;
        }
        let pos = self
            .members
            .binary_search_by(|m| m.priority_cmp(&member))
            .unwrap_or_else(|p| p);
        self.members.insert(pos, member);
        true
    }

    pub(crate) fn remove(&mut self, member: &Member) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m != member);
        self.members.len() != before
    }

    pub(crate) fn clear(&mut self) {
        self.members.clear();
    }

    pub(crate) fn first(&self) -> Option<&Member> {
        self.members.first()
    }

    pub(crate) fn rest(&self) -> &[Member] {
        self.members.get(1..).unwrap_or(&[])
    }

    pub(crate) fn contains(&self, member: &Member) -> bool {
        self.members.contains(member)
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn iter(&self) -> std::slice::Iter<'_, Member> {
        self.members.iter()
    }

    pub(crate) fn to_vec(&self) -> Vec<Member> {
        self.members.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members() -> Vec<Member> {
        vec![
            Member::new("db1", "").with_weight(1),
            Member::new("db2", "").with_weight(2),
            Member::new("db3", "").with_weight(1),
        ]
    }

    #[test]
    fn test_factory_ids() {
        for kind in [
            BalancerKind::Simple,
            BalancerKind::RoundRobin,
            BalancerKind::Load,
            BalancerKind::Random,
        ] {
            assert_eq!(kind.id().parse::<BalancerKind>().unwrap(), kind);
        }
        assert!("fastest".parse::<BalancerKind>().is_err());
    }

    #[test]
    fn test_common_contract() {
        for kind in [
            BalancerKind::Simple,
            BalancerKind::RoundRobin,
            BalancerKind::Load,
            BalancerKind::Random,
        ] {
            let balancer = kind.create();
            assert!(balancer.is_empty());
            assert!(balancer.next().is_none());

            for member in members() {
                assert!(balancer.add(member.clone()));
                assert!(!balancer.add(member));
            }

            assert_eq!(balancer.primary().unwrap().id, "db2");
            let backups: Vec<_> = balancer.backups().into_iter().map(|m| m.id).collect();
            assert_eq!(backups, vec!["db1", "db3"]);
            assert!(balancer.next().is_some());

            let db2 = Member::new("db2", "");
            assert!(balancer.remove(&db2));
            assert!(!balancer.remove(&db2));
            assert_eq!(balancer.primary().unwrap().id, "db1");

            balancer.clear();
            assert!(balancer.primary().is_none());
            assert!(balancer.backups().is_empty());
        }
    }

    #[test]
    fn test_removing_last_member() {
        let balancer = BalancerKind::RoundRobin.create();
        let only = Member::new("db1", "");
        balancer.add(only.clone());
        balancer.remove(&only);

        assert!(balancer.primary().is_none());
        assert!(balancer.backups().is_empty());
        assert!(balancer.next().is_none());
        assert!(balancer.snapshot().is_empty());
    }
}
