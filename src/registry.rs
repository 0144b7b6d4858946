//! Source-kind registry.
//!
//! Maps a kind name to everything the pipeline needs: the connector fetch
//! path, base domain filter, batch sizes, and the flattening template.
//! Resolved once at startup; unknown kind names produce an explicit
//! unsupported result downstream, never a crash.

use serde_json::{json, Value};

use crate::config::ChunkingConfig;
use crate::flatten;
use crate::models::{FlatChunk, SourceRecord};

type FlattenFn = fn(&SourceRecord, &ChunkingConfig) -> Vec<FlatChunk>;

/// Everything the pipeline knows about one record kind.
pub struct KindSpec {
    pub name: &'static str,
    /// Path segment on the practice system's sync API.
    pub fetch_path: &'static str,
    /// Whether the kind participates in incremental sync via the
    /// source-owned synced flag. Full-sync kinds ignore the flag.
    pub incremental: bool,
    pub embed_batch: usize,
    pub upsert_batch: usize,
    flatten: FlattenFn,
    base_domain: &'static [(&'static str, &'static str, &'static str)],
}

impl KindSpec {
    pub fn flatten(&self, record: &SourceRecord, chunking: &ChunkingConfig) -> Vec<FlatChunk> {
        (self.flatten)(record, chunking)
    }

    /// Domain terms for a fetch: the kind's base filter, plus the
    /// unsynced-only cut when running incrementally.
    pub fn domain(&self, incremental: bool) -> Vec<Value> {
        let mut terms: Vec<Value> = self
            .base_domain
            .iter()
            .map(|(field, op, value)| json!([field, op, value]))
            .collect();
        if incremental && self.incremental {
            terms.push(json!(["synced", "=", false]));
        }
        terms
    }
}

pub struct KindRegistry {
    kinds: Vec<KindSpec>,
}

impl KindRegistry {
    /// Registry pre-loaded with the built-in kinds.
    pub fn builtin() -> Self {
        Self {
            kinds: vec![
                KindSpec {
                    name: "appointment",
                    fetch_path: "appointments",
                    incremental: true,
                    embed_batch: 32,
                    upsert_batch: 100,
                    flatten: flatten::appointment::flatten,
                    base_domain: &[("state", "!=", "rejected")],
                },
                KindSpec {
                    name: "prescription",
                    fetch_path: "prescriptions",
                    incremental: true,
                    embed_batch: 32,
                    upsert_batch: 100,
                    flatten: flatten::prescription::flatten,
                    base_domain: &[("state", "!=", "cancelled")],
                },
                KindSpec {
                    name: "patient",
                    fetch_path: "patients",
                    incremental: true,
                    embed_batch: 32,
                    upsert_batch: 100,
                    flatten: flatten::patient::flatten,
                    base_domain: &[],
                },
                // Fixed-vocabulary code list: always full sync, bulk batches
                KindSpec {
                    name: "condition",
                    fetch_path: "conditions",
                    incremental: false,
                    embed_batch: 128,
                    upsert_batch: 500,
                    flatten: flatten::condition::flatten,
                    base_domain: &[],
                },
            ],
        }
    }

    pub fn find(&self, name: &str) -> Option<&KindSpec> {
        self.kinds.iter().find(|k| k.name == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.kinds.iter().map(|k| k.name).collect()
    }

    /// Kinds indexed by default when the caller does not name any.
    pub fn default_names(&self) -> Vec<&'static str> {
        vec!["appointment", "prescription"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds_resolve() {
        let registry = KindRegistry::builtin();
        for name in ["appointment", "prescription", "patient", "condition"] {
            assert!(registry.find(name).is_some(), "missing kind {}", name);
        }
        assert!(registry.find("invoice").is_none());
    }

    #[test]
    fn test_incremental_domain_adds_synced_term() {
        let registry = KindRegistry::builtin();
        let spec = registry.find("prescription").unwrap();

        let full = spec.domain(false);
        assert_eq!(full, vec![json!(["state", "!=", "cancelled"])]);

        let incremental = spec.domain(true);
        assert!(incremental.contains(&json!(["synced", "=", false])));
    }

    #[test]
    fn test_full_sync_kind_ignores_incremental() {
        let registry = KindRegistry::builtin();
        let spec = registry.find("condition").unwrap();
        assert!(spec.domain(true).is_empty());
        assert_eq!(spec.embed_batch, 128);
        assert_eq!(spec.upsert_batch, 500);
    }
}
