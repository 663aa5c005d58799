//! Zone leadership.
//!
//! Replicas of one cluster are grouped into zones; leader-scoped work (the
//! mirror engine, notably) runs on exactly one member per zone. The
//! cluster transport itself is an external collaborator; this coordinator
//! implements the leadership contract in-process: joining members queue up
//! per zone, the longest-standing live member leads, and leadership moves
//! to the next member the moment the leader leaves.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Receives leadership transitions of one member.
pub trait LeaderListener: Send + Sync {
    fn on_elected(&self);
    fn on_revoked(&self);
}

struct Member {
    id: String,
    listener: Arc<dyn LeaderListener>,
    leader: bool,
}

/// Coordinates zone leadership between the members of this process.
pub struct ClusterCoordinator {
    zones: Mutex<HashMap<String, Vec<Member>>>,
}

/// A member's seat in its zone; dropping it leaves the zone and hands
/// leadership over if held.
pub struct Membership {
    coordinator: Arc<ClusterCoordinator>,
    zone: String,
    id: String,
}

impl ClusterCoordinator {
    pub fn new() -> Arc<ClusterCoordinator> {
        Arc::new(ClusterCoordinator {
            zones: Mutex::new(HashMap::new()),
        })
    }

    /// Joins `zone`; the listener learns when this member gains or loses
    /// the zone's leadership.
    pub fn join(
        self: &Arc<Self>,
        zone: &str,
        id: &str,
        listener: Arc<dyn LeaderListener>,
    ) -> Membership {
        let elected = {
            let mut zones = self.zones.lock().expect("zones lock");
            let members = zones.entry(zone.to_string()).or_insert_with(Vec::new);
            let leads = members.iter().all(|m| !m.leader);
            members.push(Member {
                id: id.to_string(),
                listener: listener.clone(),
                leader: leads,
            });
            leads
        };
        if elected {
            log::info!("{} elected leader of zone {}", id, zone);
            listener.on_elected();
        }
        Membership {
            coordinator: self.clone(),
            zone: zone.to_string(),
            id: id.to_string(),
        }
    }

    /// Current leader of a zone, if any member is present.
    pub fn leader_of(&self, zone: &str) -> Option<String> {
        let zones = self.zones.lock().expect("zones lock");
        zones
            .get(zone)?
            .iter()
            .find(|m| m.leader)
            .map(|m| m.id.clone())
    }

    fn leave(&self, zone: &str, id: &str) {
        // Callbacks run outside the lock; a listener may call back in.
        let (revoked, elected) = {
            let mut zones = self.zones.lock().expect("zones lock");
            let members = match zones.get_mut(zone) {
                Some(members) => members,
                None => return,
            };
            let position = match members.iter().position(|m| m.id == id) {
                Some(position) => position,
                None => return,
            };
            let removed = members.remove(position);
            let revoked = if removed.leader {
                Some(removed.listener)
            } else {
                None
            };
            let elected = if removed.leader {
                members.first_mut().map(|next| {
                    next.leader = true;
                    (next.id.clone(), next.listener.clone())
                })
            } else {
                None
            };
            if members.is_empty() {
                zones.remove(zone);
            }
            (revoked, elected)
        };
        if let Some(listener) = revoked {
            listener.on_revoked();
        }
        if let Some((next_id, listener)) = elected {
            log::info!("{} elected leader of zone {}", next_id, zone);
            listener.on_elected();
        }
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.coordinator.leave(&self.zone, &self.id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Flag {
        leading: AtomicBool,
        elections: AtomicUsize,
    }

    impl LeaderListener for Flag {
        fn on_elected(&self) {
            self.leading.store(true, Ordering::SeqCst);
            self.elections.fetch_add(1, Ordering::SeqCst);
        }
        fn on_revoked(&self) {
            self.leading.store(false, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_one_leader_per_zone() {
        let coordinator = ClusterCoordinator::new();
        let flags: Vec<Arc<Flag>> = (0..3).map(|_| Arc::new(Flag::default())).collect();
        let _members: Vec<Membership> = flags
            .iter()
            .enumerate()
            .map(|(i, f)| coordinator.join("z1", &format!("n{}", i), f.clone()))
            .collect();

        let leaders = flags
            .iter()
            .filter(|f| f.leading.load(Ordering::SeqCst))
            .count();
        assert_eq!(leaders, 1);
        assert_eq!(coordinator.leader_of("z1"), Some("n0".to_string()));
    }

    #[test]
    fn test_zones_are_independent() {
        let coordinator = ClusterCoordinator::new();
        let a = Arc::new(Flag::default());
        let b = Arc::new(Flag::default());
        let _ma = coordinator.join("east", "e0", a.clone());
        let _mb = coordinator.join("west", "w0", b.clone());
        assert!(a.leading.load(Ordering::SeqCst));
        assert!(b.leading.load(Ordering::SeqCst));
    }

    #[test]
    fn test_failover_on_leader_departure() {
        let coordinator = ClusterCoordinator::new();
        let first = Arc::new(Flag::default());
        let second = Arc::new(Flag::default());
        let leader = coordinator.join("z1", "n0", first.clone());
        let _follower = coordinator.join("z1", "n1", second.clone());
        assert!(first.leading.load(Ordering::SeqCst));
        assert!(!second.leading.load(Ordering::SeqCst));

        // Killing the leader promotes the next member of the same zone.
        drop(leader);
        assert!(!first.leading.load(Ordering::SeqCst));
        assert!(second.leading.load(Ordering::SeqCst));
        assert_eq!(coordinator.leader_of("z1"), Some("n1".to_string()));
    }

    #[test]
    fn test_follower_departure_changes_nothing() {
        let coordinator = ClusterCoordinator::new();
        let first = Arc::new(Flag::default());
        let second = Arc::new(Flag::default());
        let _leader = coordinator.join("z1", "n0", first.clone());
        let follower = coordinator.join("z1", "n1", second.clone());
        drop(follower);
        assert!(first.leading.load(Ordering::SeqCst));
        assert_eq!(first.elections.load(Ordering::SeqCst), 1);
    }
}
