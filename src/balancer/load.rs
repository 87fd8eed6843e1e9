//! Load Balancer
//!
//! Routes to the member with the lowest weight-adjusted number of in-flight
//! operations. Counters are bumped by the invoker around each dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;

use super::{Balancer, MemberSet};
use crate::member::Member;

#[derive(Default)]
struct State {
    members: MemberSet,
    in_flight: HashMap<String, Arc<AtomicUsize>>,
}

/// Fewest-in-flight balancer
#[derive(Default)]
pub struct LoadBalancer {
    state: Mutex<State>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current in-flight count for a member
    pub fn load(&self, member: &Member) -> usize {
        self.state.lock()
            .in_flight
            .get(&member.id)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn counter(&self, member: &Member) -> Option<Arc<AtomicUsize>> {
        self.state.lock().in_flight.get(&member.id).cloned()
    }
}

impl Balancer for LoadBalancer {
    fn primary(&self) -> Option<Member> {
        self.state.lock().members.first().cloned()
    }

    fn backups(&self) -> Vec<Member> {
        self.state.lock().members.rest().to_vec()
    }

    fn next(&self) -> Option<Member> {
        let state = self.state.lock();

        if state.members.len() <= 1 {
            return state.members.first().cloned();
        }

        let mut best: Option<(&Member, f64)> = None;
        for member in state.members.iter().filter(|m| m.weight > 0) {
            let load = state
                .in_flight
                .get(&member.id)
                .map(|c| c.load(Ordering::Acquire))
                .unwrap_or(0);
            let score = (load + 1) as f64 / member.weight as f64;
            match best {
                Some((_, best_score)) if best_score <= score => {}
                _ => best = Some((member, score)),
            }
        }

        best.map(|(m, _)| m.clone())
            .or_else(|| state.members.first().cloned())
    }

    fn add(&self, member: Member) -> bool {
        let mut state = self.state.lock();
        if !state.members.insert(member.clone()) {
            return false;
        }
        state
            .in_flight
            .entry(member.id)
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)));
        true
    }

    fn remove(&self, member: &Member) -> bool {
        let mut state = self.state.lock();
        if !state.members.remove(member) {
            return false;
        }
        state.in_flight.remove(&member.id);
        true
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.members.clear();
        state.in_flight.clear();
    }

    fn snapshot(&self) -> Vec<Member> {
        self.state.lock().members.to_vec()
    }

    fn contains(&self, member: &Member) -> bool {
        self.state.lock().members.contains(member)
    }

    fn begin(&self, member: &Member) {
        if let Some(counter) = self.counter(member) {
            counter.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn end(&self, member: &Member) {
        if let Some(counter) = self.counter(member) {
            // Member may have been re-added mid-flight with a fresh counter
            let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }
}
