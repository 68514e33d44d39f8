use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::Store;

// ---------------------------------------------------------------------------
// Room record
// ---------------------------------------------------------------------------

/// A shared room as persisted in the store.
///
/// `participant_ids` is ordered; the first entry is the host.  The record is
/// mutated only through the compare-and-swap path below, never in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub name: String,
    pub host_id: String,
    /// Argon2 PHC string. Stored, never exposed through the API.
    pub credential_hash: String,
    pub participant_ids: Vec<String>,
    pub capacity: usize,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Room {
    /// Remaining lifetime, or `None` once the room has expired.
    fn remaining_ttl(&self) -> Option<Duration> {
        (self.expires_at - Utc::now()).to_std().ok().filter(|d| *d > Duration::ZERO)
    }

    /// Public snapshot for API responses (no credential hash).
    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            host_id: self.host_id.clone(),
            participant_ids: self.participant_ids.clone(),
            capacity: self.capacity,
            created_at: self.created_at.to_rfc3339(),
            expires_at: self.expires_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomInfo {
    pub id: String,
    pub name: String,
    pub host_id: String,
    pub participant_ids: Vec<String>,
    pub capacity: usize,
    pub created_at: String,
    pub expires_at: String,
}

fn room_key(room_id: &str) -> String {
    format!("room:{room_id}")
}

/// Remove control characters and surrounding whitespace.
fn sanitize_name(name: &str) -> String {
    name.chars().filter(|c| !c.is_control()).collect::<String>().trim().to_string()
}

// ---------------------------------------------------------------------------
// Session store
// ---------------------------------------------------------------------------

/// Room lifecycle over the storage abstraction.
///
/// Joins and leaves are read-modify-write under optimistic concurrency: the
/// record is re-read and the mutation retried on every version conflict, up
/// to a configured bound.  Two racing joiners therefore never overwrite each
/// other's roster update — the loser's swap misses and its retry observes
/// the winner's write.
pub struct SessionStore {
    store: Arc<dyn Store>,
    room_ttl: Duration,
    capacity: usize,
    name_min_len: usize,
    name_max_len: usize,
    credential_min_len: usize,
    retry_limit: u32,
}

impl SessionStore {
    pub fn new(store: Arc<dyn Store>, config: &Config) -> Self {
        Self {
            store,
            room_ttl: config.room_ttl,
            capacity: config.room_capacity,
            name_min_len: config.name_min_len,
            name_max_len: config.name_max_len,
            credential_min_len: config.credential_min_len,
            retry_limit: config.roster_retry_limit,
        }
    }

    /// Create a room. The generated host participant id is seeded as the
    /// first (and only) roster entry.
    pub async fn create(&self, name: &str, credential: &str) -> Result<Room> {
        let name = sanitize_name(name);
        if name.len() < self.name_min_len || name.len() > self.name_max_len {
            return Err(Error::validation(format!(
                "room name must be between {} and {} characters",
                self.name_min_len, self.name_max_len
            )));
        }
        auth::validate_credential(credential, self.credential_min_len)?;

        let now = Utc::now();
        let host_id = uuid::Uuid::new_v4().to_string();
        let room = Room {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            host_id: host_id.clone(),
            credential_hash: auth::hash_credential(credential)?,
            participant_ids: vec![host_id],
            capacity: self.capacity,
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.room_ttl)
                    .map_err(|e| Error::internal(format!("room ttl out of range: {e}")))?,
        };

        let created = self
            .store
            .insert(&room_key(&room.id), &serde_json::to_string(&room)?, self.room_ttl)
            .await?;
        if !created {
            // A v4 UUID collision: not worth a retry loop.
            return Err(Error::internal("room id collision"));
        }

        debug!(room_id = %room.id, capacity = room.capacity, "room created");
        Ok(room)
    }

    pub async fn get(&self, room_id: &str) -> Result<Room> {
        let (raw, _) = self
            .store
            .fetch(&room_key(room_id))
            .await?
            .ok_or(Error::NotFound)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Check a presented credential against the stored hash.
    /// The hash itself never leaves this layer.
    pub async fn verify_credential(&self, room_id: &str, presented: &str) -> Result<bool> {
        let room = self.get(room_id).await?;
        auth::verify_credential(presented, &room.credential_hash)
    }

    /// Add a participant to the roster.
    ///
    /// Idempotent for an id already present.  Fails `Full` at capacity and
    /// `Contention` once the optimistic retries are exhausted.
    pub async fn add_participant(&self, room_id: &str, participant_id: &str) -> Result<()> {
        self.update_roster(room_id, |room| {
            if room.participant_ids.iter().any(|p| p == participant_id) {
                return RosterUpdate::Unchanged;
            }
            if room.participant_ids.len() >= room.capacity {
                return RosterUpdate::Refused(Error::Full);
            }
            room.participant_ids.push(participant_id.to_string());
            RosterUpdate::Changed
        })
        .await
    }

    /// Remove a participant from the roster.
    ///
    /// Removing an absent id — or leaving a room that already expired — is a
    /// no-op, because leave notifications race with room expiry.
    pub async fn remove_participant(&self, room_id: &str, participant_id: &str) -> Result<()> {
        let result = self
            .update_roster(room_id, |room| {
                let before = room.participant_ids.len();
                room.participant_ids.retain(|p| p != participant_id);
                if room.participant_ids.len() == before {
                    RosterUpdate::Unchanged
                } else {
                    RosterUpdate::Changed
                }
            })
            .await;
        match result {
            Err(Error::NotFound) => Ok(()),
            other => other,
        }
    }

    /// Bounded compare-and-retry combinator around one roster mutation.
    async fn update_roster<F>(&self, room_id: &str, mut mutate: F) -> Result<()>
    where
        F: FnMut(&mut Room) -> RosterUpdate,
    {
        let key = room_key(room_id);

        for attempt in 0..self.retry_limit {
            if attempt > 0 {
                tokio::time::sleep(backoff(attempt)).await;
            }

            let (raw, version) = self.store.fetch(&key).await?.ok_or(Error::NotFound)?;
            let mut room: Room = serde_json::from_str(&raw)?;

            match mutate(&mut room) {
                RosterUpdate::Unchanged => return Ok(()),
                RosterUpdate::Refused(err) => return Err(err),
                RosterUpdate::Changed => {}
            }

            let ttl = room.remaining_ttl().ok_or(Error::NotFound)?;
            let swapped = self
                .store
                .compare_and_swap(&key, version, &serde_json::to_string(&room)?, ttl)
                .await?;
            if swapped {
                return Ok(());
            }
            debug!(room_id = %room_id, attempt, "roster swap missed, retrying");
        }

        Err(Error::Contention)
    }
}

enum RosterUpdate {
    Changed,
    Unchanged,
    Refused(Error),
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(5u64 << attempt.min(6))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    fn sessions() -> SessionStore {
        SessionStore::new(Arc::new(MemoryStore::new()), &test_config())
    }

    fn sessions_with(store: Arc<dyn Store>, capacity: usize) -> SessionStore {
        let mut config = test_config();
        config.room_capacity = capacity;
        SessionStore::new(store, &config)
    }

    #[tokio::test]
    async fn create_seeds_host_as_first_participant() {
        let sessions = sessions();
        let room = sessions.create("Movie Night", "popcorn").await.unwrap();

        assert_eq!(room.participant_ids, vec![room.host_id.clone()]);
        let fetched = sessions.get(&room.id).await.unwrap();
        assert_eq!(fetched.participant_ids, room.participant_ids);
    }

    #[tokio::test]
    async fn create_rejects_bad_name_and_credential() {
        let sessions = sessions();

        assert!(matches!(
            sessions.create("ab", "popcorn").await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            sessions.create(&"x".repeat(51), "popcorn").await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            sessions.create("Movie Night", "pop").await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn name_is_sanitized() {
        let sessions = sessions();
        let room = sessions.create("  Movie\u{7}\u{0} Night  ", "popcorn").await.unwrap();
        assert_eq!(room.name, "Movie Night");
    }

    #[tokio::test]
    async fn credential_verification() {
        let sessions = sessions();
        let room = sessions.create("Movie Night", "popcorn").await.unwrap();

        assert!(sessions.verify_credential(&room.id, "popcorn").await.unwrap());
        assert!(!sessions.verify_credential(&room.id, "nachos").await.unwrap());
        assert!(matches!(
            sessions.verify_credential("missing", "popcorn").await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn join_then_leave_restores_roster() {
        let sessions = sessions();
        let room = sessions.create("Movie Night", "popcorn").await.unwrap();
        let before = sessions.get(&room.id).await.unwrap().participant_ids;

        sessions.add_participant(&room.id, "viewer-1").await.unwrap();
        sessions.remove_participant(&room.id, "viewer-1").await.unwrap();

        let after = sessions.get(&room.id).await.unwrap().participant_ids;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn add_is_idempotent() {
        let sessions = sessions();
        let room = sessions.create("Movie Night", "popcorn").await.unwrap();

        sessions.add_participant(&room.id, "viewer-1").await.unwrap();
        sessions.add_participant(&room.id, "viewer-1").await.unwrap();

        let roster = sessions.get(&room.id).await.unwrap().participant_ids;
        assert_eq!(roster.iter().filter(|p| *p == "viewer-1").count(), 1);
    }

    #[tokio::test]
    async fn remove_of_absent_id_is_a_noop() {
        let sessions = sessions();
        let room = sessions.create("Movie Night", "popcorn").await.unwrap();

        sessions.remove_participant(&room.id, "ghost").await.unwrap();
        sessions.remove_participant("missing-room", "ghost").await.unwrap();

        let roster = sessions.get(&room.id).await.unwrap().participant_ids;
        assert_eq!(roster.len(), 1);
    }

    #[tokio::test]
    async fn join_refused_at_capacity() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sessions = sessions_with(store, 2);
        let room = sessions.create("Tiny", "popcorn").await.unwrap();

        sessions.add_participant(&room.id, "viewer-1").await.unwrap();
        assert!(matches!(
            sessions.add_participant(&room.id, "viewer-2").await,
            Err(Error::Full)
        ));
    }

    #[tokio::test]
    async fn concurrent_joins_of_different_ids_both_land() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sessions = Arc::new(sessions_with(store, 10));
        let room = sessions.create("Movie Night", "popcorn").await.unwrap();

        let a = {
            let sessions = sessions.clone();
            let id = room.id.clone();
            tokio::spawn(async move { sessions.add_participant(&id, "viewer-a").await })
        };
        let b = {
            let sessions = sessions.clone();
            let id = room.id.clone();
            tokio::spawn(async move { sessions.add_participant(&id, "viewer-b").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let roster = sessions.get(&room.id).await.unwrap().participant_ids;
        assert!(roster.contains(&"viewer-a".to_string()));
        assert!(roster.contains(&"viewer-b".to_string()));
        assert_eq!(roster.len(), 3);
    }

    #[tokio::test]
    async fn race_at_last_seat_admits_exactly_one() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let sessions = Arc::new(sessions_with(store, 2));
        let room = sessions.create("Tiny", "popcorn").await.unwrap();

        let a = {
            let sessions = sessions.clone();
            let id = room.id.clone();
            tokio::spawn(async move { sessions.add_participant(&id, "viewer-a").await })
        };
        let b = {
            let sessions = sessions.clone();
            let id = room.id.clone();
            tokio::spawn(async move { sessions.add_participant(&id, "viewer-b").await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        let admitted = results.iter().filter(|r| r.is_ok()).count();
        let refused = results
            .iter()
            .filter(|r| matches!(r, Err(Error::Full)))
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(refused, 1);

        let roster = sessions.get(&room.id).await.unwrap().participant_ids;
        assert_eq!(roster.len(), 2);
    }

    // A store whose conditional writes always miss, to exercise the bound.
    struct AlwaysContended(MemoryStore);

    #[async_trait]
    impl Store for AlwaysContended {
        async fn fetch(&self, key: &str) -> crate::error::Result<Option<(String, u64)>> {
            self.0.fetch(key).await
        }
        async fn insert(&self, key: &str, value: &str, ttl: Duration) -> crate::error::Result<bool> {
            self.0.insert(key, value, ttl).await
        }
        async fn compare_and_swap(
            &self,
            _key: &str,
            _expected: u64,
            _value: &str,
            _ttl: Duration,
        ) -> crate::error::Result<bool> {
            Ok(false)
        }
        async fn remove(&self, key: &str) -> crate::error::Result<()> {
            self.0.remove(key).await
        }
        async fn append_log(
            &self,
            key: &str,
            entry: &str,
            cap: usize,
            ttl: Duration,
        ) -> crate::error::Result<()> {
            self.0.append_log(key, entry, cap, ttl).await
        }
        async fn log_entries(&self, key: &str) -> crate::error::Result<Vec<String>> {
            self.0.log_entries(key).await
        }
        async fn incr_window(&self, key: &str, window: Duration) -> crate::error::Result<u64> {
            self.0.incr_window(key, window).await
        }
        async fn ping(&self) -> crate::error::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn exhausted_retries_surface_contention() {
        let store: Arc<dyn Store> = Arc::new(AlwaysContended(MemoryStore::new()));
        let sessions = sessions_with(store, 10);
        let room = sessions.create("Movie Night", "popcorn").await.unwrap();

        assert!(matches!(
            sessions.add_participant(&room.id, "viewer-1").await,
            Err(Error::Contention)
        ));
    }
}
