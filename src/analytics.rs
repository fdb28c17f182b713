use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, NaiveDateTime};
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use xxhash_rust::xxh64::xxh64;

use crate::config::AnalyticsSettings;
use crate::geo::GeoService;
use crate::models::{AnalyticsSnapshot, Device, Visit};

// ── Visit events ───────────────────────────────────────────────────────────

/// One resolved redirect, as handed from the resolver to the aggregator.
///
/// `client_ip` exists only in flight, for the worker's geo enrichment; it is
/// never persisted. Everything else maps 1:1 onto a `visits` row.
#[derive(Debug, Clone)]
pub struct VisitEvent {
    pub code: String,
    pub visited_at: NaiveDateTime,
    pub country: Option<String>,
    pub device: Device,
    /// Referrer bucketed to its host; None means a direct visit.
    pub referrer: Option<String>,
    pub fingerprint: u64,
    pub client_ip: Option<String>,
}

/// Opaque visitor fingerprint: a 64-bit hash over client IP and user agent.
/// Stable for the same visitor, meaningless on its own.
pub fn fingerprint(ip: Option<&str>, user_agent: Option<&str>) -> u64 {
    let mut input = String::with_capacity(96);
    input.push_str(ip.unwrap_or(""));
    input.push('|');
    input.push_str(user_agent.unwrap_or(""));
    xxh64(input.as_bytes(), 0)
}

// ── Destination for drained events ─────────────────────────────────────────

/// Durable destination for drained visit events. The worker is the only
/// caller; failures are retried on the next flush tick, never propagated.
#[async_trait::async_trait]
pub trait VisitSink: Send + Sync {
    async fn append(&self, events: &[VisitEvent]) -> anyhow::Result<()>;
}

// ── Bounded intake queue ───────────────────────────────────────────────────

/// Fixed-capacity intake queue between the redirect hot path and the worker.
///
/// Push never blocks and never fails: at capacity, the OLDEST queued event
/// is discarded and counted. A plain mpsc channel can only shed the newest
/// event, which is why this is a ring under a mutex instead.
struct EventQueue {
    inner: Mutex<VecDeque<VisitEvent>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl EventQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, event: VisitEvent) {
        {
            let mut queue = self.inner.lock().expect("event queue mutex poisoned");
            if queue.len() == self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    fn drain(&self) -> Vec<VisitEvent> {
        let mut queue = self.inner.lock().expect("event queue mutex poisoned");
        queue.drain(..).collect()
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

// ── Per-code aggregates ────────────────────────────────────────────────────

#[derive(Default)]
struct CodeStats {
    total_clicks: u64,
    unique_visitors: u64,
    countries: BTreeMap<String, u64>,
    referrers: BTreeMap<String, u64>,
    devices: BTreeMap<String, u64>,
    /// Fingerprints seen per UTC day, exact up to the configured capacity.
    windows: BTreeMap<NaiveDate, HashSet<u64>>,
}

// ── Aggregator ─────────────────────────────────────────────────────────────

/// Per-code visit aggregation behind a bounded intake queue.
///
/// Handlers call `record` (non-blocking) and `snapshot`; a single worker
/// task drains the queue, so mutation of any one code's stats is naturally
/// serialized while different codes never contend beyond a DashMap shard.
pub struct Aggregator {
    settings: AnalyticsSettings,
    queue: EventQueue,
    stats: DashMap<String, CodeStats>,
    shutdown: AtomicBool,
}

impl Aggregator {
    pub fn new(settings: AnalyticsSettings) -> Self {
        Self {
            queue: EventQueue::new(settings.queue_capacity),
            settings,
            stats: DashMap::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &AnalyticsSettings {
        &self.settings
    }

    /// Enqueue a visit event. Hot path: a queue push and a wakeup, nothing
    /// else. Always succeeds from the caller's perspective.
    pub fn record(&self, event: VisitEvent) {
        self.queue.push(event);
    }

    /// Events shed so far (full queue or persistent sink failure).
    pub fn dropped_events(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn note_dropped(&self, n: u64) {
        self.queue.dropped.fetch_add(n, Ordering::Relaxed);
    }

    /// Current aggregate for a code. A code with no recorded events yields
    /// a zeroed snapshot; whether the code exists at all is the caller's
    /// question to answer against the mapping store.
    pub fn snapshot(&self, code: &str) -> AnalyticsSnapshot {
        match self.stats.get(code) {
            Some(stats) => AnalyticsSnapshot {
                code: code.to_owned(),
                total_clicks: stats.total_clicks,
                unique_visitors: stats.unique_visitors,
                countries: stats.countries.clone(),
                referrers: stats.referrers.clone(),
                devices: stats.devices.clone(),
            },
            None => AnalyticsSnapshot {
                code: code.to_owned(),
                ..Default::default()
            },
        }
    }

    /// Drop the in-memory aggregate for a deleted code. Its rows in the
    /// visit log are untouched.
    pub fn remove_code(&self, code: &str) {
        self.stats.remove(code);
    }

    /// Fold one event into the per-code stats.
    pub fn apply(&self, event: &VisitEvent) {
        let mut stats = self.stats.entry(event.code.clone()).or_default();
        let stats = stats.value_mut();

        stats.total_clicks += 1;

        let window = stats.windows.entry(event.visited_at.date()).or_default();
        if !window.contains(&event.fingerprint) {
            if window.len() < self.settings.unique_window_capacity {
                window.insert(event.fingerprint);
                stats.unique_visitors += 1;
            }
            // Past capacity the visitor is not counted as unique: an
            // undercount, which keeps uniqueVisitors <= totalClicks intact.
        }
        while stats.windows.len() > self.settings.unique_window_keep.max(1) {
            stats.windows.pop_first();
        }

        if let Some(ref country) = event.country {
            *stats.countries.entry(country.clone()).or_insert(0) += 1;
        }
        let referrer = event.referrer.as_deref().unwrap_or("direct");
        *stats.referrers.entry(referrer.to_owned()).or_insert(0) += 1;
        *stats
            .devices
            .entry(event.device.as_str().to_owned())
            .or_insert(0) += 1;
    }

    /// Rebuild aggregates from persisted visit rows, in event order.
    /// Replaying the same log from empty always produces the same snapshots.
    pub fn replay(&self, rows: &[Visit]) {
        for row in rows {
            self.apply(&VisitEvent {
                code: row.short_code.clone(),
                visited_at: row.visited_at,
                country: row.country.clone(),
                device: row.device.parse().unwrap_or(Device::Unknown),
                referrer: row.referrer.clone(),
                fingerprint: row.fingerprint as u64,
                client_ip: None,
            });
        }
        if !rows.is_empty() {
            tracing::info!("Rebuilt analytics from {} persisted visit(s)", rows.len());
        }
    }

    /// Drain the intake queue, enrich, and fold into the stats. Returns the
    /// drained events for the caller to persist.
    pub async fn process_queued(&self, geo: Option<&GeoService>) -> Vec<VisitEvent> {
        let mut events = self.queue.drain();
        for event in &mut events {
            if event.country.is_none() {
                if let (Some(geo), Some(ip)) = (geo, event.client_ip.as_deref()) {
                    event.country = geo.lookup_country(ip).await;
                }
            }
            self.apply(event);
        }
        events
    }

    /// Flag shutdown and wake the worker for its final drain-and-flush.
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.queue.notify.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

// ── Worker ─────────────────────────────────────────────────────────────────

/// Drive the aggregator: wake on new events, fold them into the stats, and
/// append them to the sink on the flush interval. A failing sink is retried
/// on the next tick; meanwhile the retry buffer is capped so a long outage
/// sheds oldest-first rather than growing without bound.
pub async fn run_worker(
    aggregator: Arc<Aggregator>,
    sink: Arc<dyn VisitSink>,
    geo: Option<GeoService>,
) {
    let mut tick = tokio::time::interval(aggregator.settings().flush_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let max_pending = aggregator.settings().queue_capacity * 4;
    let mut pending: Vec<VisitEvent> = Vec::new();

    loop {
        tokio::select! {
            _ = aggregator.queue.wait() => {}
            _ = tick.tick() => {
                flush(sink.as_ref(), &mut pending, &aggregator).await;
            }
        }

        pending.extend(aggregator.process_queued(geo.as_ref()).await);

        if pending.len() > max_pending {
            let excess = pending.len() - max_pending;
            pending.drain(..excess);
            aggregator.note_dropped(excess as u64);
            tracing::warn!(
                "visit sink falling behind, shed {} oldest buffered event(s)",
                excess
            );
        }

        if aggregator.is_shutting_down() {
            pending.extend(aggregator.process_queued(geo.as_ref()).await);
            flush(sink.as_ref(), &mut pending, &aggregator).await;
            break;
        }
    }

    tracing::info!("analytics worker stopped");
}

async fn flush(sink: &dyn VisitSink, pending: &mut Vec<VisitEvent>, aggregator: &Aggregator) {
    if pending.is_empty() {
        return;
    }
    match sink.append(pending).await {
        Ok(()) => {
            tracing::debug!("flushed {} visit event(s)", pending.len());
            pending.clear();
        }
        Err(e) => {
            // Keep the batch; next tick retries. Redirects are unaffected.
            tracing::warn!("visit flush failed ({} buffered): {e:#}", pending.len());
        }
    }
    let dropped = aggregator.dropped_events();
    if dropped > 0 {
        tracing::debug!("dropped visit events so far: {}", dropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn settings() -> AnalyticsSettings {
        AnalyticsSettings {
            queue_capacity: 1024,
            flush_interval_secs: 1,
            unique_window_capacity: 100_000,
            unique_window_keep: 7,
        }
    }

    fn event(code: &str, fp: u64) -> VisitEvent {
        VisitEvent {
            code: code.into(),
            visited_at: Utc::now().naive_utc(),
            country: None,
            device: Device::Desktop,
            referrer: None,
            fingerprint: fp,
            client_ip: None,
        }
    }

    #[test]
    fn fingerprints_are_stable_and_distinct() {
        let a = fingerprint(Some("203.0.113.9"), Some("agent"));
        assert_eq!(a, fingerprint(Some("203.0.113.9"), Some("agent")));
        assert_ne!(a, fingerprint(Some("203.0.113.10"), Some("agent")));
        assert_ne!(a, fingerprint(Some("203.0.113.9"), Some("other agent")));
    }

    #[test]
    fn repeat_visitors_counted_once_per_window() {
        let agg = Aggregator::new(settings());

        // 60 distinct fingerprints, then 40 repeats spread over 5 of them.
        for fp in 0..60u64 {
            agg.apply(&event("demo", fp));
        }
        for i in 0..40u64 {
            agg.apply(&event("demo", i % 5));
        }

        let snap = agg.snapshot("demo");
        assert_eq!(snap.total_clicks, 100);
        assert_eq!(snap.unique_visitors, 60);
        assert!(snap.unique_visitors <= snap.total_clicks);
    }

    #[test]
    fn window_capacity_bounds_unique_tracking() {
        let mut s = settings();
        s.unique_window_capacity = 3;
        let agg = Aggregator::new(s);

        for fp in 0..10u64 {
            agg.apply(&event("demo", fp));
        }

        let snap = agg.snapshot("demo");
        assert_eq!(snap.total_clicks, 10);
        // Past the cap, visitors are no longer counted as unique.
        assert_eq!(snap.unique_visitors, 3);
    }

    #[test]
    fn full_queue_sheds_oldest_first() {
        let mut s = settings();
        s.queue_capacity = 4;
        let agg = Aggregator::new(s);

        for fp in 0..6u64 {
            agg.record(event("demo", fp));
        }

        let drained = agg.queue.drain();
        let kept: Vec<u64> = drained.iter().map(|e| e.fingerprint).collect();
        assert_eq!(kept, vec![2, 3, 4, 5]);
        assert_eq!(agg.dropped_events(), 2);
    }

    #[test]
    fn snapshot_breakdowns() {
        let agg = Aggregator::new(settings());

        let mut ev = event("demo", 1);
        ev.country = Some("US".into());
        ev.referrer = Some("github.com".into());
        ev.device = Device::Mobile;
        agg.apply(&ev);

        let mut ev = event("demo", 2);
        ev.country = Some("US".into());
        agg.apply(&ev);

        let snap = agg.snapshot("demo");
        assert_eq!(snap.countries.get("US"), Some(&2));
        assert_eq!(snap.referrers.get("github.com"), Some(&1));
        assert_eq!(snap.referrers.get("direct"), Some(&1));
        assert_eq!(snap.devices.get("mobile"), Some(&1));
        assert_eq!(snap.devices.get("desktop"), Some(&1));
    }

    #[test]
    fn unknown_code_snapshot_is_zeroed() {
        let agg = Aggregator::new(settings());
        let snap = agg.snapshot("ghost");
        assert_eq!(snap.total_clicks, 0);
        assert_eq!(snap.unique_visitors, 0);
        assert!(snap.countries.is_empty());
    }

    #[tokio::test]
    async fn process_queued_applies_and_returns_events() {
        let agg = Aggregator::new(settings());
        agg.record(event("demo", 7));
        agg.record(event("demo", 8));

        let drained = agg.process_queued(None).await;
        assert_eq!(drained.len(), 2);
        assert_eq!(agg.snapshot("demo").total_clicks, 2);

        // Queue is now empty; nothing applied twice.
        assert!(agg.process_queued(None).await.is_empty());
        assert_eq!(agg.snapshot("demo").total_clicks, 2);
    }
}
