/// PollerCore: single-owner event loop for the polling lifecycle.
///
/// Timer ticks and client commands all arrive as `PollerEvent`s on one
/// channel, so `SchedulerState` is only ever touched from this loop.  Each
/// cycle runs in its own task and publishes into the shared `ResultCache`
/// when every user's fetch has settled.  Cycles may overlap (a reset while a
/// slow cycle is in flight); the cache drops results from cycles that were
/// started before the one it already holds, so a slow old cycle can never
/// replace a newer one.
///
/// Lifecycle:
///   Stopped --initialize/resetPolling (settings valid)--> Running
///   Running --teardown / settings invalid on tick or reset--> Stopped
use std::sync::Arc;
use std::time::Duration;

use scrobble_proto::cache::ResultCache;
use scrobble_proto::protocol::{CacheEntry, Command, CycleId, CycleResult};
use scrobble_proto::settings::{fill_defaults, Settings, SettingsRecord};
use scrobble_proto::tracks;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cycle::run_cycle;
use crate::fetch::Fetcher;
use crate::store::SettingsStore;
use crate::timer::{Timer, TimerCallback};

pub const POLL_TIMER: &str = "pollForRecentTracks";

// ── PollerEvent ───────────────────────────────────────────────────────────────

/// All inputs into the PollerCore loop.
#[derive(Debug)]
pub enum PollerEvent {
    /// A command from a socket client or the HTTP API.
    ClientCommand(Command),
    /// A named timer fired.
    TimerFired(String),
    /// Shutdown requested.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Stopped,
    Running,
}

#[derive(Debug, Default)]
pub struct SchedulerState {
    pub armed: bool,
    pub next_cycle_id: CycleId,
}

// ── PollerCore ────────────────────────────────────────────────────────────────

pub struct PollerCore {
    period: Duration,
    store: Arc<dyn SettingsStore>,
    timer: Arc<dyn Timer>,
    fetcher: Arc<dyn Fetcher>,
    cache: Arc<ResultCache>,
    scheduler: SchedulerState,
    /// Loops timer ticks back into our own event channel.
    event_tx: mpsc::Sender<PollerEvent>,
    /// Cycle tasks that may still be running; only aborted on shutdown.
    in_flight: Vec<JoinHandle<()>>,
}

impl PollerCore {
    pub fn new(
        period: Duration,
        store: Arc<dyn SettingsStore>,
        timer: Arc<dyn Timer>,
        fetcher: Arc<dyn Fetcher>,
        event_tx: mpsc::Sender<PollerEvent>,
    ) -> Self {
        Self {
            period,
            store,
            timer,
            fetcher,
            cache: Arc::new(ResultCache::new()),
            scheduler: SchedulerState::default(),
            event_tx,
            in_flight: Vec::new(),
        }
    }

    /// Handle for surfaces that read or subscribe to results.
    pub fn cache(&self) -> Arc<ResultCache> {
        Arc::clone(&self.cache)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if self.scheduler.armed {
            Lifecycle::Running
        } else {
            Lifecycle::Stopped
        }
    }

    /// Initialize, then process events until `Shutdown`.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<PollerEvent>) {
        info!("PollerCore: starting event loop");
        self.initialize();

        while let Some(evt) = event_rx.recv().await {
            if !self.handle_event(evt) {
                break;
            }
        }

        self.shutdown();
    }

    /// Returns false when the loop should stop.
    pub fn handle_event(&mut self, evt: PollerEvent) -> bool {
        match evt {
            PollerEvent::Shutdown => {
                info!("PollerCore: shutdown requested");
                return false;
            }
            PollerEvent::ClientCommand(cmd) => {
                info!("PollerCore: command {:?}", cmd);
                self.handle_command(cmd);
            }
            PollerEvent::TimerFired(name) => self.on_timer(&name),
        }
        debug!(
            "PollerCore: {:?}, next cycle {}",
            self.lifecycle(),
            self.scheduler.next_cycle_id
        );
        true
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            // Served straight from the cache by the transports.
            Command::GetLatest => {}
            Command::ResetPolling => self.reset_polling(),
            Command::Reinitialize => self.reinitialize(),
            Command::SaveSettings { settings } => self.save_settings(settings),
        }
    }

    // ── lifecycle operations ──────────────────────────────────────────────────

    pub fn initialize(&mut self) {
        let Some(settings) = self.gate() else {
            return;
        };
        self.arm();
        info!(
            "PollerCore: running, {} users every {:?}",
            settings.tracked_users.len(),
            self.period
        );
        self.start_cycle(settings);
    }

    pub fn teardown(&mut self) {
        self.disarm();
        self.cache.fence(self.scheduler.next_cycle_id);
        self.cache.reset();
        info!("PollerCore: stopped");
    }

    pub fn reinitialize(&mut self) {
        self.teardown();
        self.initialize();
    }

    /// Restart the period from now and run a cycle immediately.
    pub fn reset_polling(&mut self) {
        self.disarm();
        let Some(settings) = self.gate() else {
            return;
        };
        self.arm();
        self.start_cycle(settings);
    }

    fn on_timer(&mut self, name: &str) {
        if name != POLL_TIMER {
            warn!("PollerCore: no timer named {:?}", name);
            return;
        }
        if !self.scheduler.armed {
            debug!("PollerCore: ignoring tick while stopped");
            return;
        }
        if let Some(settings) = self.gate() {
            self.start_cycle(settings);
        }
    }

    fn save_settings(&mut self, record: SettingsRecord) {
        if let Err(e) = self.store.set(&record) {
            warn!("PollerCore: failed to save settings: {}", e);
        }
        self.reinitialize();
    }

    fn shutdown(&mut self) {
        self.disarm();
        for handle in self.in_flight.drain(..) {
            handle.abort();
        }
        info!("PollerCore: event loop finished");
    }

    // ── internals ─────────────────────────────────────────────────────────────

    /// Read settings fresh and validate them.  On failure, publish the
    /// settings error and stop scheduling.
    fn gate(&mut self) -> Option<Settings> {
        let settings = self.load_settings();
        match settings.validate() {
            Ok(()) => Some(settings),
            Err(reason) => {
                warn!("PollerCore: not polling: {}", reason);
                self.disarm();
                self.cache.fence(self.scheduler.next_cycle_id);
                self.cache.publish(CacheEntry::SettingsError { name: reason });
                None
            }
        }
    }

    fn load_settings(&self) -> Settings {
        let mut record = self.store.get().unwrap_or_else(|e| {
            warn!("PollerCore: failed to read settings: {}", e);
            SettingsRecord::new()
        });
        if fill_defaults(&mut record) {
            if let Err(e) = self.store.set(&record) {
                warn!("PollerCore: failed to store default settings: {}", e);
            }
        }
        Settings::from_record(&record)
    }

    fn arm(&mut self) {
        let tx = self.event_tx.clone();
        let on_fire: TimerCallback = Arc::new(move || {
            if let Err(e) = tx.try_send(PollerEvent::TimerFired(POLL_TIMER.to_string())) {
                warn!("PollerCore: dropped poll tick: {}", e);
            }
        });
        self.timer.schedule(POLL_TIMER, self.period, on_fire);
        self.scheduler.armed = true;
    }

    fn disarm(&mut self) {
        self.timer.cancel(POLL_TIMER);
        self.scheduler.armed = false;
    }

    fn start_cycle(&mut self, settings: Settings) -> CycleId {
        let cycle_id = self.scheduler.next_cycle_id;
        self.scheduler.next_cycle_id += 1;
        self.in_flight.retain(|h| !h.is_finished());

        let fetcher = Arc::clone(&self.fetcher);
        let cache = Arc::clone(&self.cache);
        debug!(
            "PollerCore: cycle {} started ({} in flight)",
            cycle_id,
            self.in_flight.len()
        );

        self.in_flight.push(tokio::spawn(async move {
            let result = run_cycle(fetcher.as_ref(), &settings, cycle_id).await;
            let summary = summarize(&result);
            if cache.publish(CacheEntry::Ready(result)) {
                info!("PollerCore: cycle {} published: {}", cycle_id, summary);
            } else {
                info!("PollerCore: cycle {} superseded, discarded", cycle_id);
            }
        }));
        cycle_id
    }
}

fn summarize(result: &CycleResult) -> String {
    let scrobbling = result
        .results
        .iter()
        .filter_map(|r| r.payload.as_ref().filter(|_| r.succeeded))
        .filter(|payload| tracks::now_playing(payload).is_some())
        .count();
    format!(
        "{}/{} ok, {} scrobbling now",
        result.succeeded_count(),
        result.results.len(),
        scrobbling
    )
}

// ── tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::tests::{Script, ScriptedFetcher};
    use crate::store::tests::MemoryStore;
    use crate::timer::tests::ManualTimer;
    use scrobble_proto::settings::ConfigError;
    use serde_json::{json, Value};
    use tokio::sync::broadcast;

    const PERIOD: Duration = Duration::from_secs(91);

    struct Harness {
        core: PollerCore,
        timer: Arc<ManualTimer>,
        fetcher: Arc<ScriptedFetcher>,
        store: Arc<MemoryStore>,
        events: mpsc::Receiver<PollerEvent>,
        pushes: broadcast::Receiver<CacheEntry>,
    }

    fn harness(settings: Value, fetcher: ScriptedFetcher) -> Harness {
        let (tx, events) = mpsc::channel(16);
        let timer = Arc::new(ManualTimer::default());
        let fetcher = Arc::new(fetcher);
        let store = Arc::new(MemoryStore::with(settings));
        let core = PollerCore::new(PERIOD, store.clone(), timer.clone(), fetcher.clone(), tx);
        let pushes = core.cache().subscribe();
        Harness {
            core,
            timer,
            fetcher,
            store,
            events,
            pushes,
        }
    }

    fn valid() -> Value {
        json!({ "apiKey": "key", "users": "alice;bob", "fetchLimit": "5" })
    }

    async fn next_push(rx: &mut broadcast::Receiver<CacheEntry>) -> CacheEntry {
        tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("no push within a minute")
            .expect("push channel closed")
    }

    fn settings_error(name: ConfigError) -> CacheEntry {
        CacheEntry::SettingsError { name }
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_credential_blocks_polling() {
        let mut h = harness(json!({ "users": "alice" }), ScriptedFetcher::new());
        h.core.initialize();

        assert_eq!(
            h.core.cache().snapshot(),
            settings_error(ConfigError::MissingCredential)
        );
        assert_eq!(h.core.lifecycle(), Lifecycle::Stopped);
        assert!(!h.timer.is_armed(POLL_TIMER));

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(h.fetcher.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_users_blocks_polling() {
        let mut h = harness(json!({ "apiKey": "key", "users": " ; " }), ScriptedFetcher::new());
        h.core.initialize();

        assert_eq!(
            next_push(&mut h.pushes).await,
            settings_error(ConfigError::MissingUsers)
        );
        assert_eq!(h.core.lifecycle(), Lifecycle::Stopped);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(h.fetcher.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_defaults_are_written_back_to_store() {
        let mut h = harness(json!({}), ScriptedFetcher::new());
        h.core.initialize();

        let stored = h.store.record();
        assert_eq!(stored["apiKey"], "");
        assert_eq!(stored["fetchLimit"], 10);
        assert_eq!(stored["users"], "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_arms_timer_and_runs_first_cycle() {
        let fetcher = ScriptedFetcher::new()
            .script("alice", Script::Ok { delay_ms: 400 })
            .script("bob", Script::Status { delay_ms: 20, code: 503 });
        let mut h = harness(valid(), fetcher);
        h.core.initialize();

        assert_eq!(h.core.lifecycle(), Lifecycle::Running);
        assert!(h.timer.is_armed(POLL_TIMER));
        assert_eq!(h.timer.armed.lock().unwrap()[POLL_TIMER].0, PERIOD);

        let CacheEntry::Ready(result) = next_push(&mut h.pushes).await else {
            panic!("expected a ready entry");
        };
        assert_eq!(result.cycle_id, 0);
        let users: Vec<_> = result.results.iter().map(|r| r.user.as_str()).collect();
        assert_eq!(users, vec!["alice", "bob"]);
        assert!(result.results[0].succeeded);
        assert_eq!(result.results[1].status_code, Some(503));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_tick_starts_next_cycle() {
        let mut h = harness(valid(), ScriptedFetcher::new());
        h.core.initialize();
        assert_eq!(next_push(&mut h.pushes).await.cycle_id(), Some(0));

        h.timer.fire(POLL_TIMER);
        let evt = h.events.recv().await.unwrap();
        assert!(matches!(evt, PollerEvent::TimerFired(ref n) if n == POLL_TIMER));
        assert!(h.core.handle_event(evt));

        assert_eq!(next_push(&mut h.pushes).await.cycle_id(), Some(1));
        assert_eq!(h.fetcher.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_does_not_wait_for_previous_cycle() {
        let fetcher = ScriptedFetcher::new().script("slow", Script::Ok { delay_ms: 5_000 });
        let mut h = harness(json!({ "apiKey": "k", "users": "slow" }), fetcher);
        h.core.initialize();
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.core.handle_event(PollerEvent::TimerFired(POLL_TIMER.into()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.fetcher.call_count(), 2);
        assert_eq!(next_push(&mut h.pushes).await.cycle_id(), Some(0));
        assert_eq!(next_push(&mut h.pushes).await.cycle_id(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_resets_keep_only_the_later_cycle() {
        // calls: 0 = initialize, 1 = first reset (slow), 2 = second reset (fast)
        let fetcher = ScriptedFetcher::new().call_delays(vec![0, 2_000, 10]);
        let mut h = harness(json!({ "apiKey": "k", "users": "alice" }), fetcher);
        h.core.initialize();
        assert_eq!(next_push(&mut h.pushes).await.cycle_id(), Some(0));

        h.core.reset_polling();
        tokio::time::sleep(Duration::from_millis(1)).await;
        h.core.reset_polling();
        assert_eq!(next_push(&mut h.pushes).await.cycle_id(), Some(2));

        // Let the slow cycle 1 finish; it must be discarded.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.fetcher.call_count(), 3);
        assert_eq!(h.core.cache().snapshot().cycle_id(), Some(2));
        assert!(h.pushes.try_recv().is_err());

        // Each reset cancels and re-creates the timer.
        assert!(h.timer.is_armed(POLL_TIMER));
        assert_eq!(h.timer.schedules.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_clears_cache_and_is_idempotent() {
        let fetcher = ScriptedFetcher::new().script("alice", Script::Ok { delay_ms: 500 });
        let mut h = harness(json!({ "apiKey": "k", "users": "alice" }), fetcher);
        h.core.initialize();

        // Tear down while cycle 0 is still in flight.
        h.core.teardown();
        h.core.teardown();
        assert_eq!(h.core.lifecycle(), Lifecycle::Stopped);
        assert!(!h.timer.is_armed(POLL_TIMER));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.core.cache().snapshot(), CacheEntry::Uninitialized);

        h.core.initialize();
        assert_eq!(next_push(&mut h.pushes).await.cycle_id(), Some(1));
        assert!(h.core.cache().snapshot().is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_settings_break_between_ticks() {
        let fetcher = ScriptedFetcher::new().script("alice", Script::Ok { delay_ms: 1_000 });
        let mut h = harness(json!({ "apiKey": "k", "users": "alice" }), fetcher);
        h.core.initialize();

        h.store
            .set(json!({ "apiKey": "" }).as_object().unwrap())
            .unwrap();
        h.core.handle_event(PollerEvent::TimerFired(POLL_TIMER.into()));

        assert_eq!(
            next_push(&mut h.pushes).await,
            settings_error(ConfigError::MissingCredential)
        );
        assert_eq!(h.core.lifecycle(), Lifecycle::Stopped);

        // Cycle 0 lands after the error and must not replace it.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(
            h.core.cache().snapshot(),
            settings_error(ConfigError::MissingCredential)
        );
        assert_eq!(h.fetcher.call_count(), 1);

        // A late tick while stopped does nothing.
        h.core.handle_event(PollerEvent::TimerFired(POLL_TIMER.into()));
        assert_eq!(h.fetcher.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_from_stopped_starts_running_once_settings_are_fixed() {
        let mut h = harness(json!({ "apiKey": "k" }), ScriptedFetcher::new());
        h.core.initialize();
        assert_eq!(
            next_push(&mut h.pushes).await,
            settings_error(ConfigError::MissingUsers)
        );

        h.store
            .set(json!({ "users": "carol" }).as_object().unwrap())
            .unwrap();
        h.core.reset_polling();

        assert_eq!(h.core.lifecycle(), Lifecycle::Running);
        let entry = next_push(&mut h.pushes).await;
        assert_eq!(entry.cycle_id(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_settings_command_reinitializes() {
        let mut h = harness(json!({}), ScriptedFetcher::new());
        h.core.initialize();
        assert_eq!(
            next_push(&mut h.pushes).await,
            settings_error(ConfigError::MissingCredential)
        );

        let settings = json!({ "apiKey": "k", "users": "dave;erin" })
            .as_object()
            .cloned()
            .unwrap();
        h.core
            .handle_event(PollerEvent::ClientCommand(Command::SaveSettings { settings }));

        assert_eq!(h.store.record()["users"], "dave;erin");
        let CacheEntry::Ready(result) = next_push(&mut h.pushes).await else {
            panic!("expected a ready entry");
        };
        assert_eq!(result.results.len(), 2);
        assert_eq!(h.core.lifecycle(), Lifecycle::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_timer_is_ignored() {
        let mut h = harness(valid(), ScriptedFetcher::new());
        h.core.initialize();
        next_push(&mut h.pushes).await;
        h.core.handle_event(PollerEvent::TimerFired("somethingElse".into()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.fetcher.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_loop_runs_commands_until_shutdown() {
        let (tx, rx) = mpsc::channel(16);
        let timer = Arc::new(ManualTimer::default());
        let store = Arc::new(MemoryStore::with(valid()));
        let core = PollerCore::new(
            PERIOD,
            store,
            timer.clone(),
            Arc::new(ScriptedFetcher::new()),
            tx.clone(),
        );
        let cache = core.cache();
        let mut pushes = cache.subscribe();
        let task = tokio::spawn(core.run(rx));

        assert_eq!(next_push(&mut pushes).await.cycle_id(), Some(0));
        tx.send(PollerEvent::ClientCommand(Command::ResetPolling))
            .await
            .unwrap();
        assert_eq!(next_push(&mut pushes).await.cycle_id(), Some(1));

        tx.send(PollerEvent::Shutdown).await.unwrap();
        task.await.unwrap();
        assert!(!timer.is_armed(POLL_TIMER));
    }

    #[test]
    fn test_summary_counts_now_playing() {
        use chrono::Utc;
        use scrobble_proto::protocol::UserFetchResult;

        let live = json!({ "recenttracks": { "track": [
            { "name": "x", "@attr": { "nowplaying": "true" } }
        ] } });
        let result = CycleResult {
            cycle_id: 0,
            results: vec![
                UserFetchResult {
                    user: "a".into(),
                    succeeded: true,
                    status_code: Some(200),
                    status_text: None,
                    payload: Some(live),
                    error_detail: None,
                },
                UserFetchResult::failed("b", "down"),
            ],
            completed_at: Utc::now(),
        };
        assert_eq!(summarize(&result), "1/2 ok, 1 scrobbling now");
    }
}
