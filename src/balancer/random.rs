//! Weighted random balancer

use parking_lot::Mutex;
use rand::Rng;

use super::{Balancer, MemberSet};
use crate::member::Member;

/// Picks a member at random with probability proportional to its weight
#[derive(Default)]
pub struct RandomBalancer {
    members: Mutex<MemberSet>,
}

impl RandomBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for RandomBalancer {
    fn primary(&self) -> Option<Member> {
        self.members.lock().first().cloned()
    }

    fn backups(&self) -> Vec<Member> {
        self.members.lock().rest().to_vec()
    }

    fn next(&self) -> Option<Member> {
        let members = self.members.lock();

        if members.len() <= 1 {
            return members.first().cloned();
        }

        let total: u64 = members.iter().map(|m| m.weight as u64).sum();
        if total == 0 {
            return members.first().cloned();
        }

        let mut pick = rand::thread_rng().gen_range(0..total);
        for member in members.iter() {
            let weight = member.weight as u64;
            if pick < weight {
                return Some(member.clone());
            }
            pick -= weight;
        }

        members.first().cloned()
    }

    fn add(&self, member: Member) -> bool {
        self.members.lock().insert(member)
    }

    fn remove(&self, member: &Member) -> bool {
        self.members.lock().remove(member)
    }

    fn clear(&self) {
        self.members.lock().clear();
    }

    fn snapshot(&self) -> Vec<Member> {
        self.members.lock().to_vec()
    }

    fn contains(&self, member: &Member) -> bool {
        self.members.lock().contains(member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_weight_never_chosen() {
        let balancer = RandomBalancer::new();
        balancer.add(Member::new("db1", "").with_weight(5));
        balancer.add(Member::new("db2", "").with_weight(0));

        for _ in 0..200 {
            assert_eq!(balancer.next().unwrap().id, "db1");
        }
    }
}
