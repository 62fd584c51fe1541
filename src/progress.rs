//! Progress record (C5): the only mutable durable state, its resumability
//! verdict, and the bandwidth setting. See spec.md §3 ("Progress record"),
//! §4.5, and §6 (durable key table).

use crate::store::StoreClient;
use crate::time::Timestamp;
use eyre::Result;
use std::fmt;
use std::str::FromStr;

/// Sentinel for "unknown/never set" numeric fields (spec.md §3).
pub const UNSET: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandwidthLevel {
    None,
    Low,
    Medium,
    High,
}

impl Default for BandwidthLevel {
    fn default() -> Self {
        BandwidthLevel::Medium
    }
}

impl fmt::Display for BandwidthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BandwidthLevel::None => "none",
            BandwidthLevel::Low => "low",
            BandwidthLevel::Medium => "medium",
            BandwidthLevel::High => "high",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidBandwidthLevel;

impl fmt::Display for InvalidBandwidthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid bandwidth level")
    }
}

impl std::error::Error for InvalidBandwidthLevel {}

impl FromStr for BandwidthLevel {
    type Err = InvalidBandwidthLevel;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(BandwidthLevel::None),
            "low" => Ok(BandwidthLevel::Low),
            "medium" => Ok(BandwidthLevel::Medium),
            "high" => Ok(BandwidthLevel::High),
            _ => Err(InvalidBandwidthLevel),
        }
    }
}

/// Typed error for the one RPC-visible validation failure of §4.5: an
/// unknown bandwidth level string. Kept separate from the blanket
/// `eyre::Result` used everywhere else because the RPC shell needs to
/// branch on it ("reject, state unchanged") rather than just log and bail.
#[derive(Debug)]
pub struct BandwidthError(pub String);

impl fmt::Display for BandwidthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid bandwidth level \"{}\"", self.0)
    }
}

impl std::error::Error for BandwidthError {}

pub mod keys {
    pub const INTERVAL_INDEX: &str = "CLOUD_PUB_SYNC_INTERVAL_IDX";
    pub const INTERVAL_KEY: &str = "CLOUD_PUB_SYNC_INTERVAL_KEY";
    pub const INTERVAL_KEY_INDEX: &str = "CLOUD_PUB_SYNC_INTERVAL_KEY_IDX";
    pub const TS_START: &str = "CLOUD_PUB_SYNC_TS_START";
    pub const TS_END: &str = "CLOUD_PUB_SYNC_TS_END";
    pub const INTERVALS_TOTAL_CNT: &str = "CLOUD_PUB_SYNC_INTERVALS_TOTAL_CNT";
    pub const INTERVAL_SIZE: &str = "CLOUD_PUB_SYNC_INTERVAL_SIZE";
    pub const SYNC_FINISHED: &str = "CLOUD_PUB_SYNC_FINISHED";
    pub const BANDWIDTH_LEVEL: &str = "CLOUD_PUB_SYNC_BANDWIDTH_LEVEL";

    pub const ALL: &[&str] = &[
        INTERVAL_INDEX,
        INTERVAL_KEY,
        INTERVAL_KEY_INDEX,
        TS_START,
        TS_END,
        INTERVALS_TOTAL_CNT,
        INTERVAL_SIZE,
        SYNC_FINISHED,
        BANDWIDTH_LEVEL,
    ];
}

/// A restricted view of which fields to persist, used by the driver's
/// field-subset checkpoint writes (spec.md §4.6, the `(*)`/`(**)` marks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSpace {
    All,
    IntervalIndex,
    IntervalKeyAndIndex,
}

/// The in-memory + durable progress record.
///
/// Numeric fields use `i64` with `-1` as the "unset" sentinel, matching the
/// durable ASCII-integer encoding exactly (spec.md §3, §6). `interval_key`'s
/// durable encoding is a UTF-8 string, so its unset state is modeled as
/// `None` rather than a string `"-1"`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRecord {
    pub interval_index: i64,
    pub interval_key: Option<String>,
    pub interval_key_index: i64,
    pub ts_start: i64,
    pub ts_end: i64,
    pub intervals_total_cnt: i64,
    pub interval_size: i64,
    pub sync_finished: i64,
    pub bandwidth_level: BandwidthLevel,
}

/// Snapshot of what was actually read back from the store at load time —
/// kept alongside the in-memory record so [`is_sync_resumable`] can compare
/// "what we computed" against "what survived the last run" field by field,
/// the way `original_source/python/sync.py::SyncInfo` keeps `value` next to
/// `db_value`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DurableSnapshot {
    pub interval_index: Option<i64>,
    pub interval_key: Option<Option<String>>,
    pub interval_key_index: Option<i64>,
    pub ts_start: Option<i64>,
    pub ts_end: Option<i64>,
    pub intervals_total_cnt: Option<i64>,
    pub interval_size: Option<i64>,
    pub sync_finished: Option<i64>,
    pub bandwidth_level: Option<BandwidthLevel>,
}

impl fmt::Display for ProgressRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "interval_index={} interval_key={:?} interval_key_index={} ts_start={} ts_end={} \
             intervals_total_cnt={} interval_size={} sync_finished={} bandwidth_level={}",
            self.interval_index,
            self.interval_key,
            self.interval_key_index,
            self.ts_start,
            self.ts_end,
            self.intervals_total_cnt,
            self.interval_size,
            self.sync_finished,
            self.bandwidth_level,
        )
    }
}

impl ProgressRecord {
    /// Build the in-memory record from freshly computed plan/config values
    /// (spec.md §3, "init" column), before any resume reconciliation.
    pub fn from_plan(ts_start: Timestamp, ts_end: Timestamp, intervals_total_cnt: usize, interval_size: u64) -> Self {
        Self {
            interval_index: UNSET,
            interval_key: None,
            interval_key_index: UNSET,
            ts_start: ts_start as i64,
            ts_end: ts_end as i64,
            intervals_total_cnt: intervals_total_cnt as i64,
            interval_size: interval_size as i64,
            sync_finished: UNSET,
            bandwidth_level: BandwidthLevel::default(),
        }
    }

    pub fn is_sync_finished(&self) -> bool {
        self.sync_finished == 1
    }

    pub fn mark_sync_as_pending(&mut self) {
        self.sync_finished = 0;
    }

    pub fn set_bandwidth_level(&mut self, level: &str) -> std::result::Result<(), BandwidthError> {
        match level.parse::<BandwidthLevel>() {
            Ok(l) => {
                self.bandwidth_level = l;
                Ok(())
            }
            Err(_) => Err(BandwidthError(level.to_string())),
        }
    }

    pub fn get_bandwidth_level(&self) -> BandwidthLevel {
        self.bandwidth_level
    }
}

/// Read every durable progress key from `store` (spec.md §4.5, "Load").
/// `sync_finished` is copied verbatim into `record.sync_finished` — it is
/// the one field where durable wins unconditionally on load, since it
/// reflects the prior lifecycle state rather than something recomputed from
/// the current catalog.
pub async fn load(store: &dyn StoreClient, record: &mut ProgressRecord) -> Result<DurableSnapshot> {
    let mut snap = DurableSnapshot::default();

    if let Some(v) = get_int(store, keys::INTERVAL_INDEX).await? {
        snap.interval_index = Some(v);
    }
    if let Some(raw) = store.scalar_get(keys::INTERVAL_KEY).await? {
        let s = String::from_utf8_lossy(&raw).to_string();
        snap.interval_key = Some(if s == "-1" { None } else { Some(s) });
    }
    if let Some(v) = get_int(store, keys::INTERVAL_KEY_INDEX).await? {
        snap.interval_key_index = Some(v);
    }
    if let Some(v) = get_int(store, keys::TS_START).await? {
        snap.ts_start = Some(v);
    }
    if let Some(v) = get_int(store, keys::TS_END).await? {
        snap.ts_end = Some(v);
    }
    if let Some(v) = get_int(store, keys::INTERVALS_TOTAL_CNT).await? {
        snap.intervals_total_cnt = Some(v);
    }
    if let Some(v) = get_int(store, keys::INTERVAL_SIZE).await? {
        snap.interval_size = Some(v);
    }
    if let Some(v) = get_int(store, keys::SYNC_FINISHED).await? {
        snap.sync_finished = Some(v);
        record.sync_finished = v;
    }
    if let Some(raw) = store.scalar_get(keys::BANDWIDTH_LEVEL).await? {
        let s = String::from_utf8_lossy(&raw).to_string();
        if let Ok(level) = s.parse::<BandwidthLevel>() {
            snap.bandwidth_level = Some(level);
        }
    }

    tracing::debug!(record = %record, snapshot = ?snap, "progress record loaded");
    Ok(snap)
}

async fn get_int(store: &dyn StoreClient, key: &str) -> Result<Option<i64>> {
    Ok(match store.scalar_get(key).await? {
        Some(raw) => String::from_utf8_lossy(&raw).trim().parse::<i64>().ok(),
        None => None,
    })
}

/// Persist a field subset to durable storage (spec.md §4.6, the `(*)`/`(**)`
/// checkpoint writes). `FieldSpace::All` is used on initial persist and on
/// `mark_sync_as_finished`'s reset.
pub async fn persist(store: &dyn StoreClient, record: &ProgressRecord, space: FieldSpace) -> Result<()> {
    let write_int = |k: &'static str, v: i64| async move {
        store.scalar_set(k, v.to_string().as_bytes()).await
    };

    match space {
        FieldSpace::IntervalIndex => {
            write_int(keys::INTERVAL_INDEX, record.interval_index).await?;
        }
        FieldSpace::IntervalKeyAndIndex => {
            let key_str = record.interval_key.clone().unwrap_or_else(|| "-1".to_string());
            store
                .scalar_set(keys::INTERVAL_KEY, key_str.as_bytes())
                .await?;
            write_int(keys::INTERVAL_KEY_INDEX, record.interval_key_index).await?;
        }
        FieldSpace::All => {
            write_int(keys::INTERVAL_INDEX, record.interval_index).await?;
            let key_str = record.interval_key.clone().unwrap_or_else(|| "-1".to_string());
            store
                .scalar_set(keys::INTERVAL_KEY, key_str.as_bytes())
                .await?;
            write_int(keys::INTERVAL_KEY_INDEX, record.interval_key_index).await?;
            write_int(keys::TS_START, record.ts_start).await?;
            write_int(keys::TS_END, record.ts_end).await?;
            write_int(keys::INTERVALS_TOTAL_CNT, record.intervals_total_cnt).await?;
            write_int(keys::INTERVAL_SIZE, record.interval_size).await?;
            write_int(keys::SYNC_FINISHED, record.sync_finished).await?;
            store
                .scalar_set(
                    keys::BANDWIDTH_LEVEL,
                    record.bandwidth_level.to_string().as_bytes(),
                )
                .await?;
        }
    }

    tracing::debug!(record = %record, ?space, "progress record persisted");
    Ok(())
}

/// The resumable predicate of spec.md §4.5. On failure, the caller is
/// expected to `persist(store, record, FieldSpace::All)` the freshly
/// computed `record` so a subsequent crash-and-restart against the same
/// catalog can resume cleanly — this function does not perform that write
/// itself so tests can inspect the verdict without also depending on a
/// working store for every call.
pub fn is_sync_resumable(record: &ProgressRecord, snapshot: &DurableSnapshot) -> bool {
    let (
        Some(db_interval_index),
        Some(_db_interval_key),
        Some(_db_interval_key_index),
        Some(db_ts_start),
        Some(db_ts_end),
        Some(db_intervals_total_cnt),
        Some(db_interval_size),
        Some(_db_sync_finished),
        Some(db_bandwidth_level),
    ) = (
        snapshot.interval_index,
        snapshot.interval_key.clone(),
        snapshot.interval_key_index,
        snapshot.ts_start,
        snapshot.ts_end,
        snapshot.intervals_total_cnt,
        snapshot.interval_size,
        snapshot.sync_finished,
        snapshot.bandwidth_level,
    )
    else {
        tracing::info!("durable progress incomplete, cannot resume sync");
        return false;
    };

    if db_interval_index == UNSET {
        tracing::info!("interval index is -1, syncing from scratch");
        return false;
    }
    if db_ts_start != record.ts_start {
        tracing::info!(db_ts_start, int_ts_start = record.ts_start, "ts_start mismatch, cannot resume");
        return false;
    }
    if db_ts_end != record.ts_end {
        tracing::info!(db_ts_end, int_ts_end = record.ts_end, "ts_end mismatch, cannot resume");
        return false;
    }
    if db_intervals_total_cnt != record.intervals_total_cnt {
        tracing::info!(
            db_intervals_total_cnt,
            int_intervals_total_cnt = record.intervals_total_cnt,
            "intervals_total_cnt mismatch, cannot resume"
        );
        return false;
    }
    if db_interval_size != record.interval_size {
        tracing::info!(
            db_interval_size,
            int_interval_size = record.interval_size,
            "interval_size mismatch, cannot resume"
        );
        return false;
    }
    if db_bandwidth_level != record.bandwidth_level {
        tracing::info!(
            db_bandwidth_level = %db_bandwidth_level,
            int_bandwidth_level = %record.bandwidth_level,
            "bandwidth_level mismatch, cannot resume"
        );
        return false;
    }

    tracing::info!("resumption counters OK, sync is resumable");
    true
}

/// Hydrate `record`'s resumption fields from `snapshot` once
/// [`is_sync_resumable`] has returned `true`.
pub fn hydrate_from_snapshot(record: &mut ProgressRecord, snapshot: &DurableSnapshot) {
    if let Some(v) = snapshot.interval_index {
        record.interval_index = v;
    }
    if let Some(v) = snapshot.interval_key.clone() {
        record.interval_key = v;
    }
    if let Some(v) = snapshot.interval_key_index {
        record.interval_key_index = v;
    }
}

/// `mark_sync_as_finished` (spec.md §4.6): reset in-memory fields to
/// sentinels, delete every durable key except the terminal marker, then set
/// that marker. Deletion before the terminal write is load-bearing: a crash
/// between the two leaves the system "resume-from-scratch", never
/// "finished but progress keys lie".
pub async fn mark_sync_as_finished(store: &dyn StoreClient, record: &mut ProgressRecord) -> Result<()> {
    record.interval_index = UNSET;
    record.interval_key = None;
    record.interval_key_index = UNSET;
    record.ts_start = UNSET;
    record.ts_end = UNSET;
    record.intervals_total_cnt = UNSET;
    record.interval_size = UNSET;
    record.sync_finished = UNSET;
    record.bandwidth_level = BandwidthLevel::default();

    for key in keys::ALL {
        if *key != keys::SYNC_FINISHED {
            delete(store, key).await?;
        }
    }

    record.sync_finished = 1;
    store
        .scalar_set(keys::SYNC_FINISHED, b"1")
        .await?;

    tracing::info!("sync finished, progress keys cleaned up");
    Ok(())
}

async fn delete(store: &dyn StoreClient, key: &str) -> Result<()> {
    store.scalar_delete(key).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mock::MockStore;

    fn base_record() -> ProgressRecord {
        ProgressRecord::from_plan(0, 250, 3, 100)
    }

    #[test]
    fn display_shows_every_field() {
        let mut r = base_record();
        r.interval_index = 1;
        r.interval_key = Some("S2".to_string());
        let s = r.to_string();
        assert!(s.contains("interval_index=1"));
        assert!(s.contains("S2"));
        assert!(s.contains("bandwidth_level=medium"));
    }

    #[test]
    fn bandwidth_domain_is_closed() {
        let mut r = base_record();
        for ok in ["none", "low", "medium", "high"] {
            assert!(r.set_bandwidth_level(ok).is_ok());
        }
        assert!(r.set_bandwidth_level("turbo").is_err());
        // state unchanged on rejection
        assert_eq!(r.get_bandwidth_level(), BandwidthLevel::High);
    }

    #[test]
    fn missing_durable_field_is_not_resumable() {
        let record = base_record();
        let snapshot = DurableSnapshot::default();
        assert!(!is_sync_resumable(&record, &snapshot));
    }

    #[test]
    fn fresh_plan_with_interval_index_unset_is_not_resumable() {
        let record = base_record();
        let snapshot = DurableSnapshot {
            interval_index: Some(UNSET),
            interval_key: Some(None),
            interval_key_index: Some(UNSET),
            ts_start: Some(0),
            ts_end: Some(250),
            intervals_total_cnt: Some(3),
            interval_size: Some(100),
            sync_finished: Some(0),
            bandwidth_level: Some(BandwidthLevel::Medium),
        };
        assert!(!is_sync_resumable(&record, &snapshot));
    }

    #[test]
    fn matching_snapshot_is_resumable_and_hydrates() {
        let mut record = base_record();
        let snapshot = DurableSnapshot {
            interval_index: Some(1),
            interval_key: Some(Some("S2".to_string())),
            interval_key_index: Some(2),
            ts_start: Some(0),
            ts_end: Some(250),
            intervals_total_cnt: Some(3),
            interval_size: Some(100),
            sync_finished: Some(0),
            bandwidth_level: Some(BandwidthLevel::Medium),
        };
        assert!(is_sync_resumable(&record, &snapshot));
        hydrate_from_snapshot(&mut record, &snapshot);
        assert_eq!(record.interval_index, 1);
        assert_eq!(record.interval_key.as_deref(), Some("S2"));
        assert_eq!(record.interval_key_index, 2);
    }

    #[test]
    fn ts_end_mismatch_rejects_resume() {
        let record = base_record();
        let snapshot = DurableSnapshot {
            interval_index: Some(1),
            interval_key: Some(Some("S2".to_string())),
            interval_key_index: Some(2),
            ts_start: Some(0),
            ts_end: Some(999), // plan changed
            intervals_total_cnt: Some(3),
            interval_size: Some(100),
            sync_finished: Some(0),
            bandwidth_level: Some(BandwidthLevel::Medium),
        };
        assert!(!is_sync_resumable(&record, &snapshot));
    }

    #[test]
    fn bandwidth_mismatch_rejects_resume() {
        let mut record = base_record();
        record.bandwidth_level = BandwidthLevel::Medium;
        let snapshot = DurableSnapshot {
            interval_index: Some(1),
            interval_key: Some(Some("S2".to_string())),
            interval_key_index: Some(2),
            ts_start: Some(0),
            ts_end: Some(250),
            intervals_total_cnt: Some(3),
            interval_size: Some(100),
            sync_finished: Some(0),
            bandwidth_level: Some(BandwidthLevel::Low),
        };
        assert!(!is_sync_resumable(&record, &snapshot));
    }

    #[tokio::test]
    async fn round_trip_persist_and_load() {
        let store = MockStore::new();
        let mut record = base_record();
        record.interval_index = 1;
        record.interval_key = Some("S2".to_string());
        record.interval_key_index = 2;
        record.sync_finished = 0;

        persist(&store, &record, FieldSpace::All).await.unwrap();

        let mut loaded = ProgressRecord::from_plan(0, 250, 3, 100);
        let snap = load(&store, &mut loaded).await.unwrap();

        assert_eq!(snap.interval_index, Some(1));
        assert_eq!(snap.interval_key, Some(Some("S2".to_string())));
        assert_eq!(snap.interval_key_index, Some(2));
        assert_eq!(snap.ts_start, Some(0));
        assert_eq!(snap.ts_end, Some(250));
        assert_eq!(snap.bandwidth_level, Some(BandwidthLevel::Medium));
    }

    #[tokio::test]
    async fn mark_finished_deletes_all_but_terminal_marker() {
        let store = MockStore::new();
        let mut record = base_record();
        record.interval_index = 2;
        record.sync_finished = 0;
        persist(&store, &record, FieldSpace::All).await.unwrap();

        mark_sync_as_finished(&store, &mut record).await.unwrap();

        assert_eq!(record.sync_finished, 1);
        assert_eq!(
            store.scalar_get(keys::SYNC_FINISHED).await.unwrap(),
            Some(b"1".to_vec())
        );
        assert_eq!(store.scalar_get(keys::INTERVAL_INDEX).await.unwrap(), None);
    }
}
