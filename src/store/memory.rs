//! In-process keyed-store double. Single-mutex, lazily-expiring,
//! byte-faithful to the redis implementation's semantics so the whole
//! substrate can be exercised without a live store.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::domain::{DispatchError, Result};

use super::{KeyedStore, WindowProbe};

enum Value {
    Str(Vec<u8>),
    Hash(HashMap<String, String>),
    List(VecDeque<Vec<u8>>),
    ZSet(HashMap<String, f64>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    fail: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail, simulating a store outage
    pub fn set_fail_mode(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Messages published so far, for assertions
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    /// Drop a key immediately, as if its TTL elapsed
    pub fn force_expire(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    fn check_fail(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(DispatchError::Store("simulated store outage".to_string()))
        } else {
            Ok(())
        }
    }

    fn wrong_type(key: &str) -> DispatchError {
        DispatchError::Store(format!("WRONGTYPE operation on key {key}"))
    }
}

/// Run `f` over the live entry map with expired keys already purged
fn with_entries<T>(
    entries: &Mutex<HashMap<String, Entry>>,
    f: impl FnOnce(&mut HashMap<String, Entry>, Instant) -> T,
) -> T {
    let mut map = entries.lock().unwrap();
    let now = Instant::now();
    map.retain(|_, e| e.live(now));
    f(&mut map, now)
}

#[async_trait]
impl KeyedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_fail()?;
        with_entries(&self.entries, |map, _| match map.get(key) {
            Some(Entry {
                value: Value::Str(v),
                ..
            }) => Ok(Some(v.clone())),
            Some(_) => Err(Self::wrong_type(key)),
            None => Ok(None),
        })
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.check_fail()?;
        with_entries(&self.entries, |map, now| {
            map.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_vec()),
                    expires_at: Some(now + ttl),
                },
            );
        });
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        self.check_fail()?;
        Ok(with_entries(&self.entries, |map, now| {
            if map.contains_key(key) {
                false
            } else {
                map.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Str(value.to_vec()),
                        expires_at: Some(now + ttl),
                    },
                );
                true
            }
        }))
    }

    async fn del(&self, key: &str) -> Result<u64> {
        self.check_fail()?;
        Ok(with_entries(&self.entries, |map, _| {
            map.remove(key).map(|_| 1).unwrap_or(0)
        }))
    }

    async fn del_many(&self, keys: &[String]) -> Result<u64> {
        self.check_fail()?;
        Ok(with_entries(&self.entries, |map, _| {
            keys.iter().filter(|k| map.remove(*k).is_some()).count() as u64
        }))
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.check_fail()?;
        with_entries(&self.entries, |map, _| {
            let entry = map.entry(key.to_string()).or_insert(Entry {
                value: Value::Str(b"0".to_vec()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Str(v) => {
                    let n: i64 = std::str::from_utf8(v)
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| {
                            DispatchError::Store(format!("key {key} is not an integer"))
                        })?;
                    let next = n + 1;
                    *v = next.to_string().into_bytes();
                    Ok(next)
                }
                _ => Err(Self::wrong_type(key)),
            }
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.check_fail()?;
        Ok(with_entries(&self.entries, |map, now| {
            match map.get_mut(key) {
                Some(entry) => {
                    entry.expires_at = Some(now + ttl);
                    true
                }
                None => false,
            }
        }))
    }

    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>> {
        self.check_fail()?;
        Ok(with_entries(&self.entries, |map, now| {
            map.get(key)
                .and_then(|e| e.expires_at)
                .map(|at| at.saturating_duration_since(now))
        }))
    }

    async fn hash_incr_many(
        &self,
        key: &str,
        fields: &[(String, i64)],
        ttl: Duration,
    ) -> Result<()> {
        self.check_fail()?;
        with_entries(&self.entries, |map, now| {
            let entry = map.entry(key.to_string()).or_insert(Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Hash(hash) => {
                    for (field, by) in fields {
                        let current: i64 = hash
                            .get(field)
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                        hash.insert(field.clone(), (current + by).to_string());
                    }
                    entry.expires_at = Some(now + ttl);
                    Ok(())
                }
                _ => Err(Self::wrong_type(key)),
            }
        })
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.check_fail()?;
        with_entries(&self.entries, |map, _| match map.get(key) {
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.clone()),
            Some(_) => Err(Self::wrong_type(key)),
            None => Ok(HashMap::new()),
        })
    }

    async fn list_push(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<u64> {
        self.check_fail()?;
        with_entries(&self.entries, |map, now| {
            let entry = map.entry(key.to_string()).or_insert(Entry {
                value: Value::List(VecDeque::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::List(list) => {
                    list.push_back(value.to_vec());
                    if let Some(ttl) = ttl {
                        entry.expires_at = Some(now + ttl);
                    }
                    Ok(list.len() as u64)
                }
                _ => Err(Self::wrong_type(key)),
            }
        })
    }

    async fn list_rem(&self, key: &str, value: &[u8]) -> Result<u64> {
        self.check_fail()?;
        with_entries(&self.entries, |map, _| match map.get_mut(key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => {
                let before = list.len();
                list.retain(|v| v != value);
                Ok((before - list.len()) as u64)
            }
            Some(_) => Err(Self::wrong_type(key)),
            None => Ok(0),
        })
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        self.check_fail()?;
        with_entries(&self.entries, |map, _| match map.get(key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(list.len() as u64),
            Some(_) => Err(Self::wrong_type(key)),
            None => Ok(0),
        })
    }

    async fn zset_add(
        &self,
        key: &str,
        member: &str,
        score: f64,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.check_fail()?;
        with_entries(&self.entries, |map, now| {
            let entry = map.entry(key.to_string()).or_insert(Entry {
                value: Value::ZSet(HashMap::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::ZSet(zset) => {
                    zset.insert(member.to_string(), score);
                    if let Some(ttl) = ttl {
                        entry.expires_at = Some(now + ttl);
                    }
                    Ok(())
                }
                _ => Err(Self::wrong_type(key)),
            }
        })
    }

    async fn zset_rem(&self, key: &str, member: &str) -> Result<u64> {
        self.check_fail()?;
        with_entries(&self.entries, |map, _| match map.get_mut(key) {
            Some(Entry {
                value: Value::ZSet(zset),
                ..
            }) => Ok(zset.remove(member).map(|_| 1).unwrap_or(0)),
            Some(_) => Err(Self::wrong_type(key)),
            None => Ok(0),
        })
    }

    async fn zset_remove_below(&self, key: &str, max_score: f64) -> Result<u64> {
        self.check_fail()?;
        with_entries(&self.entries, |map, _| match map.get_mut(key) {
            Some(Entry {
                value: Value::ZSet(zset),
                ..
            }) => {
                let before = zset.len();
                zset.retain(|_, score| *score > max_score);
                Ok((before - zset.len()) as u64)
            }
            Some(_) => Err(Self::wrong_type(key)),
            None => Ok(0),
        })
    }

    async fn zset_card(&self, key: &str) -> Result<u64> {
        self.check_fail()?;
        with_entries(&self.entries, |map, _| match map.get(key) {
            Some(Entry {
                value: Value::ZSet(zset),
                ..
            }) => Ok(zset.len() as u64),
            Some(_) => Err(Self::wrong_type(key)),
            None => Ok(0),
        })
    }

    async fn zset_range(
        &self,
        key: &str,
        min_score: f64,
        max_score: f64,
    ) -> Result<Vec<(String, f64)>> {
        self.check_fail()?;
        with_entries(&self.entries, |map, _| match map.get(key) {
            Some(Entry {
                value: Value::ZSet(zset),
                ..
            }) => {
                let mut members: Vec<(String, f64)> = zset
                    .iter()
                    .filter(|(_, s)| **s >= min_score && **s <= max_score)
                    .map(|(m, s)| (m.clone(), *s))
                    .collect();
                members.sort_by(|a, b| {
                    a.1.partial_cmp(&b.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.0.cmp(&b.0))
                });
                Ok(members)
            }
            Some(_) => Err(Self::wrong_type(key)),
            None => Ok(Vec::new()),
        })
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        self.check_fail()?;
        self.published
            .lock()
            .unwrap()
            .push((channel.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn window_probe(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        max_requests: u64,
        member: &str,
    ) -> Result<WindowProbe> {
        self.check_fail()?;
        with_entries(&self.entries, |map, now| {
            let entry = map.entry(key.to_string()).or_insert(Entry {
                value: Value::ZSet(HashMap::new()),
                expires_at: None,
            });
            let zset = match &mut entry.value {
                Value::ZSet(zset) => zset,
                _ => return Err(Self::wrong_type(key)),
            };

            let floor = now_ms.saturating_sub(window_ms) as f64;
            zset.retain(|_, score| *score >= floor);

            let current = zset.len() as u64;
            let allowed = current < max_requests;
            if allowed {
                zset.insert(member.to_string(), now_ms as f64);
            }

            let oldest = zset
                .values()
                .fold(f64::INFINITY, |acc, s| acc.min(*s));
            let reset_at_ms = if oldest.is_finite() {
                oldest as u64 + window_ms
            } else {
                now_ms + window_ms
            };

            entry.expires_at = Some(now + Duration::from_millis(window_ms));

            Ok(WindowProbe {
                allowed,
                current: if allowed { current + 1 } else { current },
                reset_at_ms,
            })
        })
    }

    async fn del_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        self.check_fail()?;
        Ok(with_entries(&self.entries, |map, _| {
            let matches = matches!(
                map.get(key),
                Some(Entry { value: Value::Str(v), .. }) if v == expected
            );
            if matches {
                map.remove(key);
            }
            matches
        }))
    }

    async fn pop_to_processing(
        &self,
        source: &str,
        destination: &str,
    ) -> Result<Option<Vec<u8>>> {
        self.check_fail()?;
        with_entries(&self.entries, |map, _| {
            let popped = match map.get_mut(source) {
                Some(Entry {
                    value: Value::List(list),
                    ..
                }) => list.pop_front(),
                Some(_) => return Err(Self::wrong_type(source)),
                None => None,
            };

            if let Some(value) = &popped {
                let entry = map.entry(destination.to_string()).or_insert(Entry {
                    value: Value::List(VecDeque::new()),
                    expires_at: None,
                });
                match &mut entry.value {
                    Value::List(list) => list.push_back(value.clone()),
                    _ => return Err(Self::wrong_type(destination)),
                }
            }
            Ok(popped)
        })
    }

    async fn move_due(
        &self,
        zset_key: &str,
        dest_list: &str,
        now_score: f64,
        limit: usize,
    ) -> Result<Vec<String>> {
        self.check_fail()?;
        with_entries(&self.entries, |map, _| {
            let mut due: Vec<(String, f64)> = match map.get(zset_key) {
                Some(Entry {
                    value: Value::ZSet(zset),
                    ..
                }) => zset
                    .iter()
                    .filter(|(_, s)| **s <= now_score)
                    .map(|(m, s)| (m.clone(), *s))
                    .collect(),
                Some(_) => return Err(Self::wrong_type(zset_key)),
                None => Vec::new(),
            };
            due.sort_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.0.cmp(&b.0))
            });
            due.truncate(limit);

            if due.is_empty() {
                return Ok(Vec::new());
            }

            if let Some(Entry {
                value: Value::ZSet(zset),
                ..
            }) = map.get_mut(zset_key)
            {
                for (member, _) in &due {
                    zset.remove(member);
                }
            }

            let entry = map.entry(dest_list.to_string()).or_insert(Entry {
                value: Value::List(VecDeque::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::List(list) => {
                    for (member, _) in &due {
                        list.push_back(member.clone().into_bytes());
                    }
                }
                _ => return Err(Self::wrong_type(dest_list)),
            }

            Ok(due.into_iter().map(|(m, _)| m).collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_del_roundtrip() {
        let store = MemoryStore::new();
        store
            .set("k", b"v", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.del("k").await.unwrap(), 1);
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_nx_respects_existing() {
        let store = MemoryStore::new();
        assert!(store
            .set_nx("lock", b"a", Duration::from_secs(10))
            .await
            .unwrap());
        assert!(!store
            .set_nx("lock", b"b", Duration::from_secs(10))
            .await
            .unwrap());
        assert_eq!(store.get("lock").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn test_window_probe_denies_at_limit() {
        let store = MemoryStore::new();
        let now = 1_000_000;
        for i in 0..3 {
            let probe = store
                .window_probe("w", now + i, 1_000, 3, &format!("m{i}"))
                .await
                .unwrap();
            assert!(probe.allowed);
        }
        let probe = store
            .window_probe("w", now + 10, 1_000, 3, "m4")
            .await
            .unwrap();
        assert!(!probe.allowed);
        assert_eq!(probe.current, 3);

        // Entries age out of the window
        let probe = store
            .window_probe("w", now + 2_000, 1_000, 3, "m5")
            .await
            .unwrap();
        assert!(probe.allowed);
        assert_eq!(probe.current, 1);
    }

    #[tokio::test]
    async fn test_del_if_equals_only_matches_holder() {
        let store = MemoryStore::new();
        store
            .set("lock", b"holder-1", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!store.del_if_equals("lock", b"holder-2").await.unwrap());
        assert!(store.del_if_equals("lock", b"holder-1").await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pop_to_processing_moves_head() {
        let store = MemoryStore::new();
        store.list_push("pending", b"a", None).await.unwrap();
        store.list_push("pending", b"b", None).await.unwrap();

        let popped = store
            .pop_to_processing("pending", "processing")
            .await
            .unwrap();
        assert_eq!(popped, Some(b"a".to_vec()));
        assert_eq!(store.list_len("pending").await.unwrap(), 1);
        assert_eq!(store.list_len("processing").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_move_due_respects_score_and_limit() {
        let store = MemoryStore::new();
        store.zset_add("retry", "w1", 100.0, None).await.unwrap();
        store.zset_add("retry", "w2", 200.0, None).await.unwrap();
        store.zset_add("retry", "w3", 900.0, None).await.unwrap();

        let moved = store.move_due("retry", "pending", 500.0, 10).await.unwrap();
        assert_eq!(moved, vec!["w1".to_string(), "w2".to_string()]);
        assert_eq!(store.zset_card("retry").await.unwrap(), 1);
        assert_eq!(store.list_len("pending").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_fail_mode_fails_everything() {
        let store = MemoryStore::new();
        store.set_fail_mode(true);
        assert!(store.get("k").await.is_err());
        assert!(store.incr("k").await.is_err());
        store.set_fail_mode(false);
        assert!(store.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_hash_incr_many_accumulates() {
        let store = MemoryStore::new();
        let fields = vec![("a".to_string(), 5), ("b".to_string(), 7)];
        store
            .hash_incr_many("h", &fields, Duration::from_secs(60))
            .await
            .unwrap();
        store
            .hash_incr_many("h", &fields, Duration::from_secs(60))
            .await
            .unwrap();
        let all = store.hash_get_all("h").await.unwrap();
        assert_eq!(all.get("a").map(String::as_str), Some("10"));
        assert_eq!(all.get("b").map(String::as_str), Some("14"));
    }
}
