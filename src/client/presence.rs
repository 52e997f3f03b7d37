//! Who is in the meeting, as seen from one peer
//!
//! The relay never announces departures, so a user counts as gone once
//! nothing from them has arrived for the presence TTL.

use dashmap::DashMap;
use std::time::{Duration, Instant};

pub struct PresenceTracker {
    last_seen: DashMap<String, Instant>,
    ttl: Duration,
}

impl PresenceTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            last_seen: DashMap::new(),
            ttl,
        }
    }

    /// Record activity from `user`; true if they were not present before
    pub fn observe(&self, user: &str, now: Instant) -> bool {
        if let Some(mut seen) = self.last_seen.get_mut(user) {
            *seen = now;
            return false;
        }
        self.last_seen.insert(user.to_string(), now).is_none()
    }

    /// Remove and return users silent for longer than the TTL
    pub fn expire(&self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .last_seen
            .iter()
            .filter(|entry| now.saturating_duration_since(*entry.value()) > self.ttl)
            .map(|entry| entry.key().clone())
            .collect();

        expired
            .into_iter()
            .filter(|user| {
                self.last_seen
                    .remove_if(user, |_, seen| now.saturating_duration_since(*seen) > self.ttl)
                    .is_some()
            })
            .collect()
    }

    pub fn is_present(&self, user: &str) -> bool {
        self.last_seen.contains_key(user)
    }

    /// Present users, sorted
    pub fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.last_seen.iter().map(|e| e.key().clone()).collect();
        users.sort();
        users
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_reports_new_users_once() {
        let presence = PresenceTracker::new(Duration::from_secs(5));
        let now = Instant::now();

        assert!(presence.observe("ana", now));
        assert!(!presence.observe("ana", now + Duration::from_secs(1)));
        assert!(presence.observe("ben", now));
        assert_eq!(presence.users(), vec!["ana", "ben"]);
    }

    #[test]
    fn test_expire_silent_users() {
        let presence = PresenceTracker::new(Duration::from_secs(5));
        let start = Instant::now();
        presence.observe("ana", start);
        presence.observe("ben", start);
        presence.observe("ben", start + Duration::from_secs(4));

        let left = presence.expire(start + Duration::from_secs(6));
        assert_eq!(left, vec!["ana".to_string()]);
        assert!(!presence.is_present("ana"));
        assert!(presence.is_present("ben"));

        // Seen again after leaving counts as new
        assert!(presence.observe("ana", start + Duration::from_secs(7)));
    }
}
