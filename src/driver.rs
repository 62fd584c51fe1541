//! Replication driver (C6): walks the interval plan, mirrors samples from
//! the local store onto the remote store, and checkpoints progress after
//! every key and every interval. See spec.md §4.6.

use crate::catalog::Catalog;
use crate::planner::{self, Interval};
use crate::progress::{self, BandwidthLevel, DurableSnapshot, FieldSpace, ProgressRecord};
use crate::store::StoreClient;
use crate::time::Timestamp;
use eyre::{bail, Result};

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub interval_size: u64,
    pub interval_nb: i64,
    pub interval_start_idx: usize,
    pub label_selector: String,
    pub bandwidth_level: BandwidthLevel,
    /// Overrides the plan's lower bound instead of the catalog's global
    /// `firstTs` — set by the supervisor when it has detected newly
    /// appended samples past a completed sync, so the next pass replicates
    /// only `[previousLastTs, newLastTs]` rather than the whole history
    /// again (spec.md §4.7). `None` means "use the catalog's own window",
    /// which is what a cold start wants.
    pub window_start_override: Option<Timestamp>,
}

/// Outcome of one full driver pass, used by the supervisor to decide
/// whether to poll again immediately or wait out the normal period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub intervals_run: usize,
    pub samples_written: u64,
    pub resumed: bool,
    /// `true` if the pass did nothing because the durable progress record
    /// already said `sync_finished == 1` (spec.md §4.6's first pseudocode
    /// line) — the steady-state "nothing to do this poll" case.
    pub already_finished: bool,
    /// The catalog's global `lastTs` observed this pass, if the catalog had
    /// any series at all. The supervisor tracks this across passes to
    /// detect newly appended samples (spec.md §4.7).
    pub ts_end: Option<Timestamp>,
}

/// Run the replication driver once against the given local catalog.
///
/// `local` and `remote` are the same stores the catalog/bootstrap steps use.
/// This function does not perform bootstrap (spec.md §4.4) — the caller is
/// expected to have already mirrored missing series/scalars before calling
/// this.
pub async fn run(local: &dyn StoreClient, remote: &dyn StoreClient, catalog: &Catalog, cfg: &DriverConfig) -> Result<RunSummary> {
    let (catalog_first, ts_end) = match catalog.global_window() {
        Some(w) => w,
        None => {
            tracing::info!("catalog has no series, nothing to sync");
            return Ok(RunSummary {
                intervals_run: 0,
                samples_written: 0,
                resumed: false,
                already_finished: false,
                ts_end: None,
            });
        }
    };
    let ts_start = cfg.window_start_override.unwrap_or(catalog_first);

    let plan = planner::generate(
        Some(ts_start),
        Some(ts_end),
        cfg.interval_size,
        cfg.interval_nb,
        cfg.interval_start_idx,
    );

    let mut record = ProgressRecord::from_plan(ts_start, ts_end, plan.total, cfg.interval_size);
    record.bandwidth_level = cfg.bandwidth_level;

    let snapshot: DurableSnapshot = progress::load(remote, &mut record).await?;

    // spec.md §4.6, first pseudocode line: a prior pass already caught up
    // and nothing new has appeared since (the supervisor only clears this
    // flag when it detects new samples) — nothing to do this pass.
    if record.is_sync_finished() {
        tracing::info!("sync already finished, nothing to do this pass");
        return Ok(RunSummary {
            intervals_run: 0,
            samples_written: 0,
            resumed: false,
            already_finished: true,
            ts_end: Some(ts_end),
        });
    }

    let resumed = progress::is_sync_resumable(&record, &snapshot);

    if resumed {
        progress::hydrate_from_snapshot(&mut record, &snapshot);
        tracing::info!(interval_index = record.interval_index, "resuming sync in progress");
    } else {
        record.interval_index = progress::UNSET;
        record.interval_key = None;
        record.interval_key_index = progress::UNSET;
        record.sync_finished = 0;
        progress::persist(remote, &record, FieldSpace::All).await?;
        tracing::info!("starting sync from scratch");
    }

    let resume_interval_idx: usize = if resumed && record.interval_index != progress::UNSET {
        record.interval_index as usize
    } else {
        cfg.interval_start_idx
    };

    let expected_order: Vec<String> = catalog.series.keys().cloned().collect();

    let mut samples_written: u64 = 0;
    let mut intervals_run = 0usize;

    for (offset, interval) in plan
        .intervals
        .iter()
        .enumerate()
        .skip(resume_interval_idx.saturating_sub(cfg.interval_start_idx))
    {
        let interval_index = cfg.interval_start_idx + offset;
        let is_resumed_interval = resumed && interval_index == resume_interval_idx;

        if !is_resumed_interval {
            // Fresh interval: claim it durably before doing any work, so a
            // crash partway through still leaves `interval_index` pointing at
            // the interval in progress rather than at `-1`. This writes the
            // full record rather than just `interval_index` (spec.md's
            // narrower field-subset checkpoint) because `interval_key`/
            // `interval_key_index` must also be cleared durably here: an
            // interval with zero live keys never reaches the `(**)`
            // checkpoint below, and a stale durable key index left over from
            // two intervals back would otherwise be hydrated as if it
            // belonged to this one on the next resume.
            record.interval_index = interval_index as i64;
            record.interval_key = None;
            record.interval_key_index = progress::UNSET;
            progress::persist(remote, &record, FieldSpace::All).await?;
        }

        tracing::info!(
            interval_index,
            intervals_total = plan.total,
            interval_start = interval.start,
            interval_end = interval.end,
            "beginning interval"
        );

        let ranges = local
            .series_range_by_label(interval.start, interval.end, &cfg.label_selector)
            .await?;

        verify_determinism(&expected_order, &ranges, interval)?;

        // A recorded key index names the last *fully written* key, so resume
        // continues one past it. `record.interval_key_index` is `-1` when no
        // key in this interval has completed yet.
        let resume_key_idx: usize = if is_resumed_interval && record.interval_key_index != progress::UNSET {
            record.interval_key_index as usize + 1
        } else {
            0
        };

        for (key_idx, range) in ranges.iter().enumerate().skip(resume_key_idx) {
            if range.samples.is_empty() {
                continue;
            }
            let batch: Vec<(String, Timestamp, f64)> = range
                .samples
                .iter()
                .map(|(ts, v)| (range.full_name.clone(), *ts, *v))
                .collect();

            let replies = remote.series_multi_add(&batch).await?;
            for reply in &replies {
                match reply {
                    crate::store::SampleReply::Ok(_) => samples_written += 1,
                    crate::store::SampleReply::Error(msg) => {
                        // Duplicate/transient write errors are expected on resume
                        // (the interval may have been partially written before a
                        // crash) — logged, not fatal (spec.md §4.6, §7).
                        tracing::warn!(key = range.full_name, error = msg, "sample write rejected, continuing");
                    }
                }
            }

            record.interval_key = Some(range.full_name.clone());
            record.interval_key_index = key_idx as i64;
            progress::persist(remote, &record, FieldSpace::IntervalKeyAndIndex).await?;

            tracing::debug!(
                key_index = key_idx,
                keys_total = ranges.len(),
                key = range.full_name,
                samples = range.samples.len(),
                "committed key"
            );
        }

        intervals_run += 1;
    }

    progress::mark_sync_as_finished(remote, &mut record).await?;

    tracing::info!(intervals_run, samples_written, "sync pass complete");

    Ok(RunSummary {
        intervals_run,
        samples_written,
        resumed,
        already_finished: false,
        ts_end: Some(ts_end),
    })
}

/// Determinism guard (spec.md §3, §5, §8): `series_range_by_label` must
/// return the same key set, in the same order, as the catalog it was built
/// from. A violation means the store reordered keys between the catalog
/// snapshot and this query, which would silently corrupt a resumed
/// `interval_key_index` — so it is a fatal run error, not a recoverable one.
fn verify_determinism(expected_order: &[String], ranges: &[crate::store::SeriesRange], interval: &Interval) -> Result<()> {
    let actual: Vec<&str> = ranges.iter().map(|r| r.full_name.as_str()).collect();
    let expected: Vec<&str> = expected_order.iter().map(|s| s.as_str()).collect();
    if actual != expected {
        bail!(
            "key order returned by the store is not deterministic for interval [{}, {}]: expected {:?}, got {:?}",
            interval.start,
            interval.end,
            expected,
            actual
        );
    }
    Ok(())
}
