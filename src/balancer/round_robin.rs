//! Weighted Round-Robin Balancer
//!
//! Keeps a circular sequence in which each member appears `weight` times.
//! `next()` pops the head and requeues it at the tail, so any window of
//! `sum(weights)` consecutive calls visits each member in proportion to its
//! weight.

use std::collections::VecDeque;
use parking_lot::Mutex;

use super::{Balancer, MemberSet};
use crate::member::Member;

#[derive(Default)]
struct State {
    members: MemberSet,
    sequence: VecDeque<Member>,
}

/// Round-robin balancer
#[derive(Default)]
pub struct RoundRobinBalancer {
    state: Mutex<State>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn sequence(&self) -> Vec<String> {
        self.state.lock().sequence.iter().map(|m| m.id.clone()).collect()
    }
}

impl Balancer for RoundRobinBalancer {
    fn primary(&self) -> Option<Member> {
        self.state.lock().members.first().cloned()
    }

    fn backups(&self) -> Vec<Member> {
        self.state.lock().members.rest().to_vec()
    }

    fn next(&self) -> Option<Member> {
        let mut state = self.state.lock();

        // Zero or one member: nothing to rotate
        if state.members.len() <= 1 {
            return state.members.first().cloned();
        }

        match state.sequence.pop_front() {
            Some(member) => {
                state.sequence.push_back(member.clone());
                Some(member)
            }
            // Every member has weight 0
            None => state.members.first().cloned(),
        }
    }

    fn add(&self, member: Member) -> bool {
        let mut state = self.state.lock();
        if !state.members.insert(member.clone()) {
            return false;
        }
        for _ in 0..member.weight {
            state.sequence.push_back(member.clone());
        }
        true
    }

    fn remove(&self, member: &Member) -> bool {
        let mut state = self.state.lock();
        if !state.members.remove(member) {
            return false;
        }
        state.sequence.retain(|m| m != member);
        true
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.members.clear();
        state.sequence.clear();
    }

    fn snapshot(&self) -> Vec<Member> {
        self.state.lock().members.to_vec()
    }

    fn contains(&self, member: &Member) -> bool {
        self.state.lock().members.contains(member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_weighted_proportions() {
        let balancer = RoundRobinBalancer::new();
        balancer.add(Member::new("db1", "").with_weight(1));
        balancer.add(Member::new("db2", "").with_weight(3));
        balancer.add(Member::new("db3", "").with_weight(2));

        let total = 6;
        // Any window of sum(weights) calls, starting anywhere
        for offset in 0..total {
            for _ in 0..offset {
                balancer.next();
            }
            let mut counts: HashMap<String, u32> = HashMap::new();
            for _ in 0..total {
                *counts.entry(balancer.next().unwrap().id).or_default() += 1;
            }
            assert_eq!(counts["db1"], 1);
            assert_eq!(counts["db2"], 3);
            assert_eq!(counts["db3"], 2);
        }
    }

    #[test]
    fn test_single_member_does_not_rotate() {
        let balancer = RoundRobinBalancer::new();
        balancer.add(Member::new("db1", "").with_weight(2));
        let before = balancer.sequence();

        for _ in 0..5 {
            assert_eq!(balancer.next().unwrap().id, "db1");
        }
        assert_eq!(balancer.sequence(), before);
    }

    #[test]
    fn test_remove_purges_sequence() {
        let balancer = RoundRobinBalancer::new();
        let db1 = Member::new("db1", "").with_weight(2);
        balancer.add(db1.clone());
        balancer.add(Member::new("db2", "").with_weight(1));
        balancer.remove(&db1);

        assert_eq!(balancer.sequence(), vec!["db2".to_string()]);
        assert_eq!(balancer.next().unwrap().id, "db2");
    }

    #[test]
    fn test_zero_weights_fall_back_to_primary() {
        let balancer = RoundRobinBalancer::new();
        balancer.add(Member::new("db1", "").with_weight(0));
        balancer.add(Member::new("db2", "").with_weight(0));
        assert_eq!(balancer.next().unwrap().id, "db1");
    }
}
