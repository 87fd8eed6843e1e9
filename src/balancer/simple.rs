//! Fixed-primary balancer

use parking_lot::Mutex;

use super::{Balancer, MemberSet};
use crate::member::Member;

/// Always routes to the primary
#[derive(Default)]
pub struct SimpleBalancer {
    members: Mutex<MemberSet>,
}

impl SimpleBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for SimpleBalancer {
    fn primary(&self) -> Option<Member> {
        self.members.lock().first().cloned()
    }

    fn backups(&self) -> Vec<Member> {
        self.members.lock().rest().to_vec()
    }

    fn next(&self) -> Option<Member> {
        self.primary()
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
    fn test_next_is_primary() {
        let balancer = SimpleBalancer::new();
        balancer.add(Member::new("db1", "").with_weight(1));
        balancer.add(Member::new("db2", "").with_weight(4));

        for _ in 0..10 {
            assert_eq!(balancer.next().unwrap().id, "db2");
        }
    }
}
