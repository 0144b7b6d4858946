//! Indexing pipeline orchestration.
//!
//! Drives connector → flatten → embed → upsert → watermark per source
//! kind, in batches. A failure indexing one kind is caught and reported
//! in that kind's outcome without aborting the others; an unrecognized
//! kind name is skipped with a warning. Indexing is at-least-once: the
//! upsert key makes replays converge, so a mark-synced failure after a
//! successful write is logged and never rolled back.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::ChunkingConfig;
use crate::connector::RecordSource;
use crate::embedding::EmbeddingClient;
use crate::models::{ChunkRecord, IndexOutcome, SyncWatermark};
use crate::registry::{KindRegistry, KindSpec};
use crate::store::{KindStats, VectorStore};
use crate::watermark;

#[derive(Debug, Serialize)]
pub struct IndexStatus {
    pub index_stats: Vec<KindStats>,
    pub watermarks: Vec<SyncWatermark>,
}

pub struct EtlPipeline {
    pool: SqlitePool,
    store: VectorStore,
    connector: Arc<dyn RecordSource>,
    embedder: Arc<EmbeddingClient>,
    registry: Arc<KindRegistry>,
    chunking: ChunkingConfig,
}

impl EtlPipeline {
    pub fn new(
        pool: SqlitePool,
        connector: Arc<dyn RecordSource>,
        embedder: Arc<EmbeddingClient>,
        registry: Arc<KindRegistry>,
        chunking: ChunkingConfig,
    ) -> Self {
        let store = VectorStore::new(pool.clone());
        Self {
            pool,
            store,
            connector,
            embedder,
            registry,
            chunking,
        }
    }

    /// Index the requested kinds and return a per-kind outcome map. Kind
    /// failures land in the map, never abort the run.
    pub async fn run_full_indexing(
        &self,
        kinds: &[String],
        limit: Option<usize>,
        incremental: bool,
    ) -> BTreeMap<String, IndexOutcome> {
        let mut results = BTreeMap::new();

        for kind in kinds {
            let Some(spec) = self.registry.find(kind) else {
                warn!(kind = kind.as_str(), "skipping unsupported source kind");
                results.insert(
                    kind.clone(),
                    IndexOutcome::failed(format!("unsupported source kind: {}", kind)),
                );
                continue;
            };

            match self.index_kind(spec, limit, incremental).await {
                Ok(outcome) => {
                    info!(
                        kind = spec.name,
                        records = outcome.records_indexed,
                        chunks = outcome.chunks_created,
                        "kind indexed"
                    );
                    results.insert(kind.clone(), outcome);
                }
                Err(err) => {
                    error!(kind = spec.name, error = %err, "indexing failed for kind");
                    results.insert(kind.clone(), IndexOutcome::failed(err.to_string()));
                }
            }
        }

        results
    }

    async fn index_kind(
        &self,
        spec: &KindSpec,
        limit: Option<usize>,
        incremental: bool,
    ) -> Result<IndexOutcome> {
        let records = self
            .connector
            .fetch_records(spec, limit, incremental)
            .await?;

        if records.is_empty() {
            info!(kind = spec.name, "nothing to index");
            return Ok(IndexOutcome::default());
        }

        // Flatten every record; remember each record's chunk count so
        // stale higher-index chunks from earlier runs can be pruned.
        let mut flat: Vec<(i64, crate::models::FlatChunk)> = Vec::new();
        let mut per_record_chunks: Vec<(i64, i64)> = Vec::with_capacity(records.len());
        for record in &records {
            let chunks = spec.flatten(record, &self.chunking);
            per_record_chunks.push((record.id, chunks.len() as i64));
            for chunk in chunks {
                flat.push((record.id, chunk));
            }
        }

        // Embed all chunk texts in batches
        let texts: Vec<String> = flat.iter().map(|(_, c)| c.text.clone()).collect();
        let mut embeddings: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        for batch in texts.chunks(spec.embed_batch) {
            embeddings.extend(self.embedder.embed_texts(batch).await?);
        }

        let rows: Vec<ChunkRecord> = flat
            .into_iter()
            .zip(embeddings)
            .map(|((source_id, chunk), embedding)| ChunkRecord {
                source_kind: spec.name.to_string(),
                source_id,
                chunk_index: chunk.chunk_index,
                content: chunk.text,
                metadata: chunk.metadata,
                embedding,
            })
            .collect();

        let mut chunks_created = 0u64;
        for batch in rows.chunks(spec.upsert_batch) {
            chunks_created += self.store.upsert_chunks(batch).await?;
        }

        for (source_id, keep) in &per_record_chunks {
            let pruned = self
                .store
                .prune_stale_chunks(spec.name, *source_id, *keep)
                .await?;
            if pruned > 0 {
                info!(kind = spec.name, source_id, pruned, "pruned stale chunks");
            }
        }

        // Watermark: the max write date seen across the whole batch,
        // computed only after every sub-batch has landed.
        let last_write_date = records
            .iter()
            .map(|r| r.write_date())
            .max()
            .unwrap_or_else(Utc::now);
        watermark::upsert_watermark(
            &self.pool,
            spec.name,
            last_write_date,
            records.len() as i64,
            chunks_created as i64,
        )
        .await?;

        // Acknowledge processed records. The write already happened, so a
        // failure here only means the next incremental run re-fetches
        // them; the upsert key absorbs the replay.
        if spec.incremental {
            let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
            if let Err(err) = self.connector.mark_synced(spec, &ids).await {
                warn!(kind = spec.name, error = %err, "mark-synced failed; records will be re-fetched");
            }
        }

        Ok(IndexOutcome {
            records_indexed: records.len() as u64,
            chunks_created,
            error: None,
        })
    }

    pub async fn index_status(&self) -> Result<IndexStatus> {
        Ok(IndexStatus {
            index_stats: self.store.index_stats().await?,
            watermarks: watermark::load_watermarks(&self.pool).await?,
        })
    }

    pub fn store(&self) -> &VectorStore {
        &self.store
    }
}
