//! Store client abstraction (C2): the uniform operation set the rest of the
//! engine uses against both the local and the remote (cloud) time-series
//! store. See spec.md §4.1.

use crate::time::Timestamp;
use async_trait::async_trait;
use eyre::{eyre, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Per-series metadata as reported by the store (first/last sample
/// timestamp, total sample count).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesMeta {
    pub first_ts: Timestamp,
    pub last_ts: Timestamp,
    pub total_samples: u64,
}

/// Outcome of a single sample write, as reported by the store for each
/// element of a `seriesMultiAdd` batch.
#[derive(Debug, Clone)]
pub enum SampleReply {
    Ok(Timestamp),
    Error(String),
}

/// One `(fullName, samples)` pair as returned by `seriesRangeByLabel`, in
/// store-determined order.
#[derive(Debug, Clone)]
pub struct SeriesRange {
    pub full_name: String,
    pub samples: Vec<(Timestamp, f64)>,
}

/// Uniform operations against a time-series store (spec.md §4.1).
///
/// Implemented once against Redis/RedisTimeSeries (`RedisStore`) and once as
/// an in-memory double for tests (`MockStore`, test-only).
#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn keys_matching(&self, pattern: &str) -> Result<BTreeSet<String>>;

    async fn series_info(&self, full_name: &str) -> Result<SeriesMeta>;

    async fn scalar_get(&self, full_name: &str) -> Result<Option<Vec<u8>>>;

    async fn scalar_set(&self, full_name: &str, value: &[u8]) -> Result<()>;

    /// Remove a scalar key outright. Used by the progress record's
    /// terminal cleanup (spec.md §4.6, §8 "terminal cleanliness") to make
    /// durable progress keys genuinely absent rather than present-with-an-
    /// empty-value.
    async fn scalar_delete(&self, full_name: &str) -> Result<()>;

    async fn series_create(&self, full_name: &str, labels: &BTreeMap<String, String>)
        -> Result<()>;

    async fn series_create_rule(
        &self,
        src: &str,
        dst: &str,
        aggregator: &str,
        bucket_ms: u64,
    ) -> Result<()>;

    async fn series_range_by_label(
        &self,
        start: Timestamp,
        end: Timestamp,
        label_selector: &str,
    ) -> Result<Vec<SeriesRange>>;

    async fn series_multi_add(
        &self,
        samples: &[(String, Timestamp, f64)],
    ) -> Result<Vec<SampleReply>>;
}

/// `StoreClient` backed by Redis + the RedisTimeSeries module.
///
/// The `redis` crate has no first-party RedisTimeSeries binding, so `TS.*`
/// commands are issued as raw commands via [`redis::cmd`].
pub struct RedisStore {
    desc: &'static str,
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn connect(desc: &'static str, host: &str, port: u16) -> Result<Self> {
        let url = format!("redis://{host}:{port}/");
        let client = redis::Client::open(url.as_str())
            .map_err(|e| eyre!("{desc}: invalid redis address {host}:{port}: {e}"))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| eyre!("{desc}: error connecting to redis at {host}:{port}: {e}"))?;
        Ok(Self { desc, conn })
    }
}

#[async_trait]
impl StoreClient for RedisStore {
    async fn keys_matching(&self, pattern: &str) -> Result<BTreeSet<String>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut conn)
            .await
            .map_err(|e| eyre!("{}: KEYS {pattern} failed: {e}", self.desc))?;
        tracing::info!(desc = self.desc, pattern, found = keys.len(), "keys listed");
        Ok(keys.into_iter().collect())
    }

    async fn series_info(&self, full_name: &str) -> Result<SeriesMeta> {
        let mut conn = self.conn.clone();
        let info: Vec<redis::Value> = redis::cmd("TS.INFO")
            .arg(full_name)
            .query_async(&mut conn)
            .await
            .map_err(|e| eyre!("{}: TS.INFO {full_name} failed: {e}", self.desc))?;
        parse_ts_info(&info)
            .ok_or_else(|| eyre!("{}: malformed TS.INFO reply for {full_name}", self.desc))
    }

    async fn scalar_get(&self, full_name: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(full_name)
            .query_async(&mut conn)
            .await
            .map_err(|e| eyre!("{}: GET {full_name} failed: {e}", self.desc))?;
        Ok(value)
    }

    async fn scalar_set(&self, full_name: &str, value: &[u8]) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(full_name)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| eyre!("{}: SET {full_name} failed: {e}", self.desc))?;
        Ok(())
    }

    async fn scalar_delete(&self, full_name: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(full_name)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| eyre!("{}: DEL {full_name} failed: {e}", self.desc))?;
        Ok(())
    }

    async fn series_create(
        &self,
        full_name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("TS.CREATE");
        cmd.arg(full_name);
        if !labels.is_empty() {
            cmd.arg("LABELS");
            for (k, v) in labels {
                cmd.arg(k).arg(v);
            }
        }
        let res: redis::RedisResult<()> = cmd.query_async(&mut conn).await;
        // Idempotent by design: "key already exists" is logged, not fatal.
        if let Err(e) = res {
            tracing::warn!(desc = self.desc, full_name, error = %e, "TS.CREATE failed (ignored)");
        }
        Ok(())
    }

    async fn series_create_rule(
        &self,
        src: &str,
        dst: &str,
        aggregator: &str,
        bucket_ms: u64,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let res: redis::RedisResult<()> = redis::cmd("TS.CREATERULE")
            .arg(src)
            .arg(dst)
            .arg("AGGREGATION")
            .arg(aggregator)
            .arg(bucket_ms)
            .query_async(&mut conn)
            .await;
        if let Err(e) = res {
            tracing::warn!(desc = self.desc, src, dst, error = %e, "TS.CREATERULE failed (ignored)");
        }
        Ok(())
    }

    async fn series_range_by_label(
        &self,
        start: Timestamp,
        end: Timestamp,
        label_selector: &str,
    ) -> Result<Vec<SeriesRange>> {
        let mut conn = self.conn.clone();
        let reply: Vec<redis::Value> = redis::cmd("TS.MRANGE")
            .arg(start)
            .arg(end)
            .arg("FILTER")
            .arg(label_selector)
            .query_async(&mut conn)
            .await
            .map_err(|e| eyre!("{}: TS.MRANGE {start}..{end} failed: {e}", self.desc))?;
        parse_mrange_reply(&reply)
            .ok_or_else(|| eyre!("{}: malformed TS.MRANGE reply", self.desc))
    }

    async fn series_multi_add(
        &self,
        samples: &[(String, Timestamp, f64)],
    ) -> Result<Vec<SampleReply>> {
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("TS.MADD");
        for (name, ts, value) in samples {
            cmd.arg(name).arg(ts).arg(value);
        }
        let replies: Vec<redis::Value> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| eyre!("{}: TS.MADD failed: {e}", self.desc))?;
        Ok(replies.into_iter().map(parse_madd_reply).collect())
    }
}

fn parse_madd_reply(v: redis::Value) -> SampleReply {
    match v {
        redis::Value::Int(ts) => SampleReply::Ok(ts as Timestamp),
        redis::Value::Okay => SampleReply::Ok(0),
        redis::Value::Status(s) => SampleReply::Error(s),
        other => SampleReply::Error(format!("{other:?}")),
    }
}

fn parse_ts_info(info: &[redis::Value]) -> Option<SeriesMeta> {
    // TS.INFO replies as a flat alternating key/value array, e.g.
    // ["firstTimestamp", 1656331798944, "lastTimestamp", 1656338283885,
    //  "totalSamples", 10, ...].
    let mut first_ts = None;
    let mut last_ts = None;
    let mut total_samples = None;

    let mut i = 0;
    while i + 1 < info.len() {
        if let redis::Value::Data(field) = &info[i] {
            let field = String::from_utf8_lossy(field);
            let value = value_as_i64(&info[i + 1]);
            match field.as_ref() {
                "firstTimestamp" => first_ts = value,
                "lastTimestamp" => last_ts = value,
                "totalSamples" => total_samples = value,
                _ => {}
            }
        }
        i += 2;
    }

    Some(SeriesMeta {
        first_ts: first_ts? as Timestamp,
        last_ts: last_ts? as Timestamp,
        total_samples: total_samples?.max(0) as u64,
    })
}

fn value_as_i64(v: &redis::Value) -> Option<i64> {
    match v {
        redis::Value::Int(i) => Some(*i),
        redis::Value::Data(d) => std::str::from_utf8(d).ok()?.parse().ok(),
        _ => None,
    }
}

fn parse_mrange_reply(reply: &[redis::Value]) -> Option<Vec<SeriesRange>> {
    // Each top-level entry is [keyName, [labels...], [[ts, value], ...]].
    let mut out = Vec::with_capacity(reply.len());
    for entry in reply {
        let redis::Value::Bulk(fields) = entry else {
            return None;
        };
        if fields.len() < 3 {
            return None;
        }
        let redis::Value::Data(name) = &fields[0] else {
            return None;
        };
        let full_name = String::from_utf8_lossy(name).to_string();
        let redis::Value::Bulk(points) = &fields[2] else {
            return None;
        };
        let mut samples = Vec::with_capacity(points.len());
        for p in points {
            let redis::Value::Bulk(pair) = p else {
                return None;
            };
            if pair.len() != 2 {
                return None;
            }
            let ts = value_as_i64(&pair[0])? as Timestamp;
            let value = match &pair[1] {
                redis::Value::Data(d) => std::str::from_utf8(d).ok()?.parse::<f64>().ok()?,
                redis::Value::Int(i) => *i as f64,
                _ => return None,
            };
            samples.push((ts, value));
        }
        out.push(SeriesRange { full_name, samples });
    }
    Some(out)
}

/// In-memory [`StoreClient`] double used by the engine's own test suite.
///
/// Not a production backend: behavior (e.g. ordering of
/// `series_range_by_label`) is deterministic by construction so tests can
/// assert exact resume/replay semantics.
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::BTreeMap as Map;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, Default)]
    pub struct MockSeries {
        pub samples: Vec<(Timestamp, f64)>,
        pub labels: Map<String, String>,
    }

    #[derive(Default)]
    pub struct MockStore {
        pub series: Mutex<Map<String, MockSeries>>,
        pub scalars: Mutex<Map<String, Vec<u8>>>,
        pub rules: Mutex<Vec<(String, String, String, u64)>>,
        /// If set, the order returned by `series_range_by_label` is this
        /// explicit list instead of sorted-by-name — used to simulate a
        /// store that reorders keys between runs (seed scenario 5).
        pub forced_order: Mutex<Option<Vec<String>>>,
    }

    impl MockStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn seed_series(&self, full_name: &str, samples: Vec<(Timestamp, f64)>) {
            self.series.lock().await.insert(
                full_name.to_string(),
                MockSeries {
                    samples,
                    labels: Map::new(),
                },
            );
        }
    }

    #[async_trait]
    impl StoreClient for MockStore {
        async fn keys_matching(&self, pattern: &str) -> Result<BTreeSet<String>> {
            let prefix = pattern.trim_end_matches('*');
            Ok(self
                .series
                .lock()
                .await
                .keys()
                .chain(self.scalars.lock().await.keys())
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }

        async fn series_info(&self, full_name: &str) -> Result<SeriesMeta> {
            let map = self.series.lock().await;
            let s = map
                .get(full_name)
                .ok_or_else(|| eyre!("no such series {full_name}"))?;
            let first_ts = s.samples.first().map(|(t, _)| *t).unwrap_or(0);
            let last_ts = s.samples.last().map(|(t, _)| *t).unwrap_or(0);
            Ok(SeriesMeta {
                first_ts,
                last_ts,
                total_samples: s.samples.len() as u64,
            })
        }

        async fn scalar_get(&self, full_name: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.scalars.lock().await.get(full_name).cloned())
        }

        async fn scalar_set(&self, full_name: &str, value: &[u8]) -> Result<()> {
            self.scalars
                .lock()
                .await
                .insert(full_name.to_string(), value.to_vec());
            Ok(())
        }

        async fn scalar_delete(&self, full_name: &str) -> Result<()> {
            self.scalars.lock().await.remove(full_name);
            Ok(())
        }

        async fn series_create(
            &self,
            full_name: &str,
            labels: &Map<String, String>,
        ) -> Result<()> {
            self.series
                .lock()
                .await
                .entry(full_name.to_string())
                .or_insert_with(|| MockSeries {
                    samples: Vec::new(),
                    labels: labels.clone(),
                });
            Ok(())
        }

        async fn series_create_rule(
            &self,
            src: &str,
            dst: &str,
            aggregator: &str,
            bucket_ms: u64,
        ) -> Result<()> {
            self.rules.lock().await.push((
                src.to_string(),
                dst.to_string(),
                aggregator.to_string(),
                bucket_ms,
            ));
            Ok(())
        }

        async fn series_range_by_label(
            &self,
            start: Timestamp,
            end: Timestamp,
            _label_selector: &str,
        ) -> Result<Vec<SeriesRange>> {
            let map = self.series.lock().await;
            let order: Vec<String> = match self.forced_order.lock().await.clone() {
                Some(order) => order,
                None => {
                    let mut names: Vec<String> = map.keys().cloned().collect();
                    names.sort();
                    names
                }
            };

            let mut out = Vec::new();
            for name in order {
                let Some(s) = map.get(&name) else { continue };
                let samples: Vec<(Timestamp, f64)> = s
                    .samples
                    .iter()
                    .copied()
                    .filter(|(t, _)| *t >= start && *t <= end)
                    .collect();
                out.push(SeriesRange {
                    full_name: name,
                    samples,
                });
            }
            Ok(out)
        }

        async fn series_multi_add(
            &self,
            samples: &[(String, Timestamp, f64)],
        ) -> Result<Vec<SampleReply>> {
            let mut map = self.series.lock().await;
            let mut out = Vec::with_capacity(samples.len());
            for (name, ts, value) in samples {
                let entry = map.entry(name.clone()).or_default();
                if entry.samples.iter().any(|(t, _)| t == ts) {
                    out.push(SampleReply::Error(format!("duplicate sample at {ts}")));
                    continue;
                }
                entry.samples.push((*ts, *value));
                entry.samples.sort_by_key(|(t, _)| *t);
                out.push(SampleReply::Ok(*ts));
            }
            Ok(out)
        }
    }
}
