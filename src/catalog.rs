//! Catalog (C3): discovery and caching of series keys and scalar keys, plus
//! the bootstrap step that mirrors missing series/scalars onto the remote
//! store. See spec.md §3 and §4.4.

use crate::store::StoreClient;
use crate::time::Timestamp;
use eyre::Result;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesKey {
    pub full_name: String,
    pub short_name: String,
    pub first_ts: Timestamp,
    pub last_ts: Timestamp,
    pub total_samples: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScalarKey {
    pub full_name: String,
    pub short_name: String,
    pub value: Vec<u8>,
}

/// Per-store catalog: every series/scalar key visible under the configured
/// labels, indexed by full name. Invariant (spec.md §3): every key visible
/// to the planner appears exactly once here.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub series: BTreeMap<String, SeriesKey>,
    pub scalars: BTreeMap<String, ScalarKey>,
}

impl Catalog {
    /// Rebuild a catalog from scratch by querying `store` for every key under
    /// `key_label_ts.*` (series) and `key_label.*` (scalars).
    pub async fn build(
        store: &dyn StoreClient,
        desc: &str,
        key_label_ts: &str,
        key_label: &str,
    ) -> Result<Self> {
        let ts_pattern = format!("{key_label_ts}.*");
        let scalar_pattern = format!("{key_label}.*");

        let ts_names = store.keys_matching(&ts_pattern).await?;
        let scalar_names = store.keys_matching(&scalar_pattern).await?;

        let mut series = BTreeMap::new();
        let mut total_samples = 0u64;
        for name in &ts_names {
            let meta = store.series_info(name).await?;
            let short_name = strip_prefix(name, key_label_ts);
            tracing::debug!(
                desc,
                full_name = name,
                short_name,
                first_ts = meta.first_ts,
                last_ts = meta.last_ts,
                total_samples = meta.total_samples,
                "discovered series key"
            );
            total_samples += meta.total_samples;
            series.insert(
                name.clone(),
                SeriesKey {
                    full_name: name.clone(),
                    short_name,
                    first_ts: meta.first_ts,
                    last_ts: meta.last_ts,
                    total_samples: meta.total_samples,
                },
            );
        }
        if !series.is_empty() {
            tracing::info!(desc, total_samples, "catalog contains samples");
        }

        let mut scalars = BTreeMap::new();
        for name in &scalar_names {
            let value = store.scalar_get(name).await?.unwrap_or_default();
            let short_name = strip_prefix(name, key_label);
            scalars.insert(
                name.clone(),
                ScalarKey {
                    full_name: name.clone(),
                    short_name,
                    value,
                },
            );
        }

        tracing::info!(
            desc,
            series = series.len(),
            scalars = scalars.len(),
            "catalog built"
        );

        Ok(Self { series, scalars })
    }

    /// The global sync window: earliest `first_ts` and latest `last_ts`
    /// across every series in this catalog. `None` if the catalog has no
    /// series at all.
    pub fn global_window(&self) -> Option<(Timestamp, Timestamp)> {
        if self.series.is_empty() {
            return None;
        }
        let first = self.series.values().map(|s| s.first_ts).min().unwrap();
        let last = self.series.values().map(|s| s.last_ts).max().unwrap();
        Some((first, last))
    }

    fn series_names(&self) -> BTreeSet<String> {
        self.series.keys().cloned().collect()
    }

    fn scalar_names(&self) -> BTreeSet<String> {
        self.scalars.keys().cloned().collect()
    }
}

/// Bootstrap step (spec.md §4.4, steps 3–5): create missing series/rules on
/// `remote` and copy over missing scalar values.
pub async fn bootstrap_remote(
    local: &Catalog,
    remote_store: &dyn StoreClient,
    remote_catalog: &Catalog,
    key_label_ts: &str,
    compaction: &CompactionConfig,
) -> Result<()> {
    let missing_series: BTreeSet<String> = local
        .series_names()
        .difference(&remote_catalog.series_names())
        .cloned()
        .collect();

    tracing::info!(count = missing_series.len(), "need to add TS keys");
    for full_name in &missing_series {
        let mut labels = BTreeMap::new();
        labels.insert("class".to_string(), key_label_ts.to_string());
        remote_store.series_create(full_name, &labels).await?;

        if compaction.enabled {
            // `str::replace` substitutes every occurrence of `key_label_ts`,
            // matching `original_source/python/sync.py`'s plain
            // `bytes.replace()` (not just the first match).
            let compaction_name = full_name.replace(key_label_ts, &compaction_label(key_label_ts, &compaction.key_suffix));
            let mut clabels = BTreeMap::new();
            clabels.insert(
                "class".to_string(),
                compaction_label(key_label_ts, &compaction.key_suffix),
            );
            remote_store
                .series_create(&compaction_name, &clabels)
                .await?;
            remote_store
                .series_create_rule(
                    full_name,
                    &compaction_name,
                    &compaction.aggregator,
                    compaction.bucket_duration_ms,
                )
                .await?;
        }
    }

    let missing_scalars: BTreeSet<String> = local
        .scalar_names()
        .difference(&remote_catalog.scalar_names())
        .cloned()
        .collect();

    tracing::info!(count = missing_scalars.len(), "need to add scalar keys");
    for full_name in &missing_scalars {
        if let Some(key) = local.scalars.get(full_name) {
            remote_store.scalar_set(full_name, &key.value).await?;
        }
    }

    Ok(())
}

fn compaction_label(key_label_ts: &str, suffix: &str) -> String {
    format!("{key_label_ts}{suffix}")
}

fn strip_prefix(full_name: &str, label: &str) -> String {
    let prefix = format!("{label}.");
    full_name
        .strip_prefix(prefix.as_str())
        .unwrap_or(full_name)
        .to_string()
}

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    pub enabled: bool,
    pub key_suffix: String,
    pub bucket_duration_ms: u64,
    pub aggregator: String,
}
