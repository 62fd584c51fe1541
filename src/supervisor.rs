//! Supervisor (C7): owns the background worker task, its `Idle` /
//! `Running` / `StopRequested` state machine, and the public RPC-style
//! surface (`ping`, `sync start`, `sync stop`, `bandwidth get/set`) that the
//! CLI shell drives. See spec.md §4.7 and §6.

use crate::catalog::{self, Catalog, CompactionConfig};
use crate::driver::{self, DriverConfig};
use crate::progress::{self, BandwidthError, BandwidthLevel};
use crate::store::StoreClient;
use crate::time::Timestamp;
use eyre::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Running,
    StopRequested,
}

pub struct SupervisorConfig {
    pub db_poll_freq: Duration,
    pub interval_size: u64,
    pub interval_nb: i64,
    pub interval_start_idx: usize,
    pub key_label_ts: String,
    pub key_label: String,
    pub label_selector: String,
    pub compaction: CompactionConfig,
}

/// Shared worker state. Cheap to clone: every field is an `Arc`.
pub struct Supervisor {
    local: Arc<dyn StoreClient>,
    remote: Arc<dyn StoreClient>,
    cfg: SupervisorConfig,
    state: Arc<Mutex<State>>,
    stop_flag: Arc<AtomicBool>,
    wake: Arc<Notify>,
    bandwidth: Arc<Mutex<BandwidthLevel>>,
    ping_count: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
    /// The local catalog's global `lastTs` as of the previous pass (spec.md
    /// §4.7). `None` means no pass has observed any samples yet. Compared
    /// against each new pass's `lastTs` to tell a steady-state poll (nothing
    /// new, leave `sync_finished` alone) apart from newly appended samples
    /// (clear `sync_finished` and resume from the old `lastTs`).
    previous_last_ts: Arc<Mutex<Option<Timestamp>>>,
}

impl Supervisor {
    pub fn new(local: Arc<dyn StoreClient>, remote: Arc<dyn StoreClient>, cfg: SupervisorConfig) -> Self {
        Self {
            local,
            remote,
            cfg,
            state: Arc::new(Mutex::new(State::Idle)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            bandwidth: Arc::new(Mutex::new(BandwidthLevel::default())),
            ping_count: Arc::new(AtomicU64::new(0)),
            handle: Mutex::new(None),
            previous_last_ts: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn state(&self) -> State {
        *self.state.lock().await
    }

    pub fn ping(&self) -> u64 {
        self.ping_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub async fn bandwidth_get(&self) -> BandwidthLevel {
        *self.bandwidth.lock().await
    }

    pub async fn bandwidth_set(&self, level: &str) -> std::result::Result<(), BandwidthError> {
        let parsed: BandwidthLevel = level.parse().map_err(|_| BandwidthError(level.to_string()))?;
        *self.bandwidth.lock().await = parsed;
        Ok(())
    }

    /// Start the background worker. Idempotent: calling `start` while
    /// already `Running` is a no-op (spec.md §4.7).
    pub async fn start(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if *state == State::Running {
            tracing::info!("sync already running, ignoring start request");
            return;
        }
        *state = State::Running;
        drop(state);

        self.stop_flag.store(false, Ordering::SeqCst);

        let this = Arc::clone(self);
        let join = tokio::spawn(async move { this.worker_loop().await });
        *self.handle.lock().await = Some(join);
        tracing::info!("sync started");
    }

    /// Request a cooperative stop and wait for the worker to actually exit.
    /// Idempotent: calling `stop` while `Idle` is a no-op.
    ///
    /// The original callback this replaces was a no-op (it acknowledged the
    /// request without ever interrupting the run); here the flag is checked
    /// between every interval and the poll sleep is interruptible, so a stop
    /// request takes effect within one interval's worth of work, not after a
    /// full pass completes.
    pub async fn stop(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if *state == State::Idle {
                tracing::info!("sync already idle, ignoring stop request");
                return;
            }
            *state = State::StopRequested;
        }
        self.stop_flag.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();

        let join = self.handle.lock().await.take();
        if let Some(join) = join {
            let _ = join.await;
        }
        *self.state.lock().await = State::Idle;
        tracing::info!("sync stopped");
    }

    fn stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    async fn worker_loop(self: Arc<Self>) {
        while !self.stop_requested() {
            if let Err(e) = self.run_once().await {
                tracing::error!(error = %e, "sync pass failed");
            }

            if self.stop_requested() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.cfg.db_poll_freq) => {}
                _ = self.wake.notified() => {}
            }
        }
    }

    async fn run_once(&self) -> Result<()> {
        let local_cat = Catalog::build(self.local.as_ref(), "local", &self.cfg.key_label_ts, &self.cfg.key_label).await?;
        let remote_cat = Catalog::build(self.remote.as_ref(), "cloud", &self.cfg.key_label_ts, &self.cfg.key_label).await?;

        catalog::bootstrap_remote(&local_cat, self.remote.as_ref(), &remote_cat, &self.cfg.key_label_ts, &self.cfg.compaction).await?;

        // spec.md §4.7: only a pass that actually observes new samples past
        // the previous pass's `lastTs` resumes the sync — an unchanged
        // `lastTs` across polls means the engine already caught up and
        // `driver::run`'s own `sync_finished` check (spec.md §4.6) is left to
        // no-op the pass.
        let new_last_ts = local_cat.global_window().map(|(_, last)| last);
        let mut previous_last_ts = self.previous_last_ts.lock().await;
        let window_start_override = match (*previous_last_ts, new_last_ts) {
            (Some(p), Some(n)) if p != n => {
                tracing::info!(previous_last_ts = p, new_last_ts = n, "new samples detected, resuming sync window");
                self.remote.scalar_set(progress::keys::SYNC_FINISHED, b"0").await?;
                Some(p)
            }
            _ => None,
        };
        *previous_last_ts = new_last_ts;
        drop(previous_last_ts);

        let bandwidth_level = self.bandwidth_get().await;
        let driver_cfg = DriverConfig {
            interval_size: self.cfg.interval_size,
            interval_nb: self.cfg.interval_nb,
            interval_start_idx: self.cfg.interval_start_idx,
            label_selector: self.cfg.label_selector.clone(),
            bandwidth_level,
            window_start_override,
        };

        let summary = driver::run(self.local.as_ref(), self.remote.as_ref(), &local_cat, &driver_cfg).await?;
        tracing::info!(
            intervals_run = summary.intervals_run,
            samples_written = summary.samples_written,
            resumed = summary.resumed,
            already_finished = summary.already_finished,
            "sync pass finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mock::MockStore;
    use std::time::Duration as StdDuration;

    fn test_cfg() -> SupervisorConfig {
        SupervisorConfig {
            db_poll_freq: StdDuration::from_millis(20),
            interval_size: 100,
            interval_nb: -1,
            interval_start_idx: 0,
            key_label_ts: "LBL".to_string(),
            key_label: "LBLCFG".to_string(),
            label_selector: "class=LBL".to_string(),
            compaction: CompactionConfig {
                enabled: false,
                key_suffix: "_compacted".to_string(),
                bucket_duration_ms: 60_000,
                aggregator: "avg".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn start_stop_is_idempotent_and_replicates() {
        let local = Arc::new(MockStore::new());
        local.seed_series("LBL.a", vec![(0, 1.0), (150, 2.0)]).await;
        let remote = Arc::new(MockStore::new());

        let sup = Arc::new(Supervisor::new(local.clone(), remote.clone(), test_cfg()));

        assert_eq!(sup.state().await, State::Idle);
        sup.start().await;
        sup.start().await; // no-op, already running
        assert_eq!(sup.state().await, State::Running);

        tokio::time::sleep(StdDuration::from_millis(50)).await;

        sup.stop().await;
        sup.stop().await; // no-op, already idle
        assert_eq!(sup.state().await, State::Idle);

        let a = remote.series.lock().await.get("LBL.a").cloned();
        assert!(a.is_some());
        assert!(!a.unwrap().samples.is_empty());
    }

    #[tokio::test]
    async fn steady_poll_leaves_finished_sync_alone_until_new_samples_arrive() {
        let local = Arc::new(MockStore::new());
        local.seed_series("LBL.a", vec![(0, 1.0), (150, 2.0)]).await;
        let remote = Arc::new(MockStore::new());

        let sup = Supervisor::new(local.clone(), remote.clone(), test_cfg());

        sup.run_once().await.unwrap();
        assert_eq!(
            remote.scalar_get(progress::keys::SYNC_FINISHED).await.unwrap(),
            Some(b"1".to_vec())
        );
        let first_count = remote.series.lock().await.get("LBL.a").unwrap().samples.len();

        // Second poll over an unchanged catalog: sync stays finished, nothing
        // is rewritten.
        sup.run_once().await.unwrap();
        assert_eq!(
            remote.scalar_get(progress::keys::SYNC_FINISHED).await.unwrap(),
            Some(b"1".to_vec())
        );
        assert_eq!(remote.series.lock().await.get("LBL.a").unwrap().samples.len(), first_count);

        // A new sample appears past the old lastTs: the next poll should
        // resume and pick it up.
        local.seed_series("LBL.a", vec![(0, 1.0), (150, 2.0), (400, 3.0)]).await;
        sup.run_once().await.unwrap();

        let samples = remote.series.lock().await.get("LBL.a").unwrap().samples.clone();
        assert!(samples.iter().any(|(ts, _)| *ts == 400));
        assert_eq!(
            remote.scalar_get(progress::keys::SYNC_FINISHED).await.unwrap(),
            Some(b"1".to_vec())
        );
    }

    #[tokio::test]
    async fn ping_counts_monotonically() {
        let local = Arc::new(MockStore::new());
        let remote = Arc::new(MockStore::new());
        let sup = Arc::new(Supervisor::new(local, remote, test_cfg()));
        assert_eq!(sup.ping(), 1);
        assert_eq!(sup.ping(), 2);
    }

    #[tokio::test]
    async fn bandwidth_round_trips_and_rejects_garbage() {
        let local = Arc::new(MockStore::new());
        let remote = Arc::new(MockStore::new());
        let sup = Arc::new(Supervisor::new(local, remote, test_cfg()));

        assert_eq!(sup.bandwidth_get().await, BandwidthLevel::Medium);
        sup.bandwidth_set("low").await.unwrap();
        assert_eq!(sup.bandwidth_get().await, BandwidthLevel::Low);
        assert!(sup.bandwidth_set("ludicrous").await.is_err());
        assert_eq!(sup.bandwidth_get().await, BandwidthLevel::Low);
    }
}
