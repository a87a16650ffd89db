//! Tag- and prefix-indexed bulk invalidation. Wildcard key scans are
//! forbidden in production, so the invalidator maintains its own
//! indexes and deletes exactly what they list.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::Result;
use crate::metrics::CacheMetrics;
use crate::store::KeyedStore;

const TAG_INDEX: &str = "ci:tag:";
const PREFIX_INDEX: &str = "ci:idx:";
const STATS_KEY: &str = "ci:stats";
const INDEX_TTL: Duration = Duration::from_secs(24 * 3600);

/// Entity write kinds the rules engine reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityOp {
    Create,
    Update,
    Delete,
}

/// One invalidation rule: when `entity` sees one of `ops`, expand every
/// key pattern and invalidate the matching indexes. Patterns may carry
/// `{id}` and `{orgId}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InvalidationRule {
    pub entity: String,
    pub ops: Vec<EntityOp>,
    pub key_patterns: Vec<String>,
}

impl InvalidationRule {
    pub fn applies_to(&self, entity: &str, op: EntityOp) -> bool {
        self.entity == entity && self.ops.contains(&op)
    }
}

/// Expand placeholders; a pattern that still carries one falls back to
/// the literal prefix up to the first `{`.
fn expand_pattern(pattern: &str, id: &str, org_id: Option<&str>) -> String {
    let mut expanded = pattern.replace("{id}", id);
    if let Some(org_id) = org_id {
        expanded = expanded.replace("{orgId}", org_id);
    }
    match expanded.find('{') {
        Some(brace) => expanded[..brace].to_string(),
        None => expanded,
    }
}

pub struct CacheInvalidator<S: KeyedStore> {
    store: Arc<S>,
    rules: Vec<InvalidationRule>,
}

/// Aggregate invalidation counters, kept 24 h
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationStats {
    pub total_invalidations: u64,
    pub per_entity: HashMap<String, u64>,
    pub per_tag: HashMap<String, u64>,
}

impl<S: KeyedStore> CacheInvalidator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            rules: Vec::new(),
        }
    }

    pub fn with_rules(mut self, rules: Vec<InvalidationRule>) -> Self {
        self.rules = rules;
        self
    }

    /// Record `key` under every tag's index
    pub async fn tag_cache_entry(&self, key: &str, tags: &[String]) -> Result<()> {
        for tag in tags {
            self.union_into_index(&format!("{TAG_INDEX}{tag}"), key)
                .await?;
        }
        Ok(())
    }

    /// Record `key` under a prefix index
    pub async fn register_key_in_index(&self, prefix: &str, key: &str) -> Result<()> {
        self.union_into_index(&format!("{PREFIX_INDEX}{prefix}"), key)
            .await
    }

    /// Delete every key the tag index lists, then the index itself
    pub async fn invalidate_by_tag(&self, tag: &str) -> Result<u64> {
        let index_key = format!("{TAG_INDEX}{tag}");
        let keys = self.read_index(&index_key).await?;
        let deleted = self.store.del_many(&keys).await?;
        self.store.del(&index_key).await?;

        CacheMetrics::record_invalidation(deleted as usize);
        self.bump_stats(&[("total".to_string(), deleted as i64), (format!("tag:{tag}"), deleted as i64)])
            .await;
        Ok(deleted)
    }

    /// Delete every key the prefix index lists, the index, and (in case
    /// the pattern was a concrete key) the literal prefix itself.
    pub async fn invalidate_by_prefix(&self, prefix: &str) -> Result<u64> {
        let index_key = format!("{PREFIX_INDEX}{prefix}");
        let keys = self.read_index(&index_key).await?;
        let mut deleted = self.store.del_many(&keys).await?;
        self.store.del(&index_key).await?;
        deleted += self.store.del(prefix).await?;

        CacheMetrics::record_invalidation(deleted as usize);
        self.bump_stats(&[("total".to_string(), deleted as i64)]).await;
        Ok(deleted)
    }

    /// Apply the configured rules for one entity write
    pub async fn on_entity_write(
        &self,
        entity: &str,
        op: EntityOp,
        id: &str,
        org_id: Option<&str>,
    ) -> Result<u64> {
        let mut deleted = 0;
        let rules: Vec<InvalidationRule> = self
            .rules
            .iter()
            .filter(|r| r.applies_to(entity, op))
            .cloned()
            .collect();

        for rule in rules {
            for pattern in &rule.key_patterns {
                let prefix = expand_pattern(pattern, id, org_id);
                if prefix.is_empty() {
                    continue;
                }
                deleted += self.invalidate_by_prefix(&prefix).await?;
            }
        }

        if deleted > 0 {
            self.bump_stats(&[(format!("entity:{entity}"), deleted as i64)])
                .await;
        }
        Ok(deleted)
    }

    /// Current counters; missing stats degrade to zeroes
    pub async fn stats(&self) -> InvalidationStats {
        let hash = match self.store.hash_get_all(STATS_KEY).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!(error = %e, "Failed to read invalidation stats");
                return InvalidationStats::default();
            }
        };

        let mut stats = InvalidationStats::default();
        for (field, value) in hash {
            let count: u64 = value.parse().unwrap_or(0);
            if field == "total" {
                stats.total_invalidations = count;
            } else if let Some(entity) = field.strip_prefix("entity:") {
                stats.per_entity.insert(entity.to_string(), count);
            } else if let Some(tag) = field.strip_prefix("tag:") {
                stats.per_tag.insert(tag.to_string(), count);
            }
        }
        stats
    }

    async fn read_index(&self, index_key: &str) -> Result<Vec<String>> {
        match self.store.get(index_key).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    async fn union_into_index(&self, index_key: &str, key: &str) -> Result<()> {
        let mut keys = self.read_index(index_key).await?;
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
        let bytes = serde_json::to_vec(&keys)?;
        self.store.set(index_key, &bytes, INDEX_TTL).await
    }

    /// Stats updates are best-effort
    async fn bump_stats(&self, fields: &[(String, i64)]) {
        let owned: Vec<(String, i64)> = fields.to_vec();
        if let Err(e) = self
            .store
            .hash_incr_many(STATS_KEY, &owned, INDEX_TTL)
            .await
        {
            warn!(error = %e, "Failed to update invalidation stats");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn invalidator() -> (Arc<MemoryStore>, CacheInvalidator<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), CacheInvalidator::new(store))
    }

    async fn seed(store: &MemoryStore, key: &str) {
        store
            .set(key, b"cached", Duration::from_secs(600))
            .await
            .unwrap();
    }

    #[test]
    fn test_pattern_expansion() {
        assert_eq!(
            expand_pattern("org:{orgId}:user:{id}", "u1", Some("o1")),
            "org:o1:user:u1"
        );
        // Unresolved placeholder falls back to the literal prefix
        assert_eq!(
            expand_pattern("org:{orgId}:user:{id}", "u1", None),
            "org:"
        );
        assert_eq!(expand_pattern("plain:key", "x", None), "plain:key");
    }

    #[tokio::test]
    async fn test_invalidate_by_tag_deletes_indexed_keys() {
        let (store, invalidator) = invalidator();
        seed(&store, "doc:1").await;
        seed(&store, "doc:2").await;
        seed(&store, "unrelated").await;

        invalidator
            .tag_cache_entry("doc:1", &["docs".to_string()])
            .await
            .unwrap();
        invalidator
            .tag_cache_entry("doc:2", &["docs".to_string()])
            .await
            .unwrap();

        let deleted = invalidator.invalidate_by_tag("docs").await.unwrap();
        assert_eq!(deleted, 2);
        assert!(store.get("doc:1").await.unwrap().is_none());
        assert!(store.get("doc:2").await.unwrap().is_none());
        assert!(store.get("unrelated").await.unwrap().is_some());

        // Index itself is gone; a second pass deletes nothing
        assert_eq!(invalidator.invalidate_by_tag("docs").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tagging_is_idempotent() {
        let (store, invalidator) = invalidator();
        seed(&store, "doc:1").await;
        for _ in 0..3 {
            invalidator
                .tag_cache_entry("doc:1", &["docs".to_string()])
                .await
                .unwrap();
        }
        assert_eq!(invalidator.invalidate_by_tag("docs").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_by_prefix_also_hits_literal_key() {
        let (store, invalidator) = invalidator();
        seed(&store, "settings:o1").await;
        seed(&store, "settings:o1:feature").await;

        invalidator
            .register_key_in_index("settings:o1", "settings:o1:feature")
            .await
            .unwrap();

        let deleted = invalidator.invalidate_by_prefix("settings:o1").await.unwrap();
        assert_eq!(deleted, 2);
        assert!(store.get("settings:o1").await.unwrap().is_none());
        assert!(store.get("settings:o1:feature").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rules_engine_expands_and_invalidates() {
        let (store, invalidator) = invalidator();
        let invalidator = invalidator.with_rules(vec![InvalidationRule {
            entity: "user".to_string(),
            ops: vec![EntityOp::Update, EntityOp::Delete],
            key_patterns: vec!["org:{orgId}:user:{id}".to_string()],
        }]);

        seed(&store, "org:o1:user:u1").await;

        // Create is not in the rule's ops
        let deleted = invalidator
            .on_entity_write("user", EntityOp::Create, "u1", Some("o1"))
            .await
            .unwrap();
        assert_eq!(deleted, 0);

        let deleted = invalidator
            .on_entity_write("user", EntityOp::Update, "u1", Some("o1"))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get("org:o1:user:u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats_accumulate() {
        let (store, invalidator) = invalidator();
        seed(&store, "doc:1").await;
        invalidator
            .tag_cache_entry("doc:1", &["docs".to_string()])
            .await
            .unwrap();
        invalidator.invalidate_by_tag("docs").await.unwrap();

        let stats = invalidator.stats().await;
        assert_eq!(stats.total_invalidations, 1);
        assert_eq!(stats.per_tag.get("docs"), Some(&1));
    }
}
