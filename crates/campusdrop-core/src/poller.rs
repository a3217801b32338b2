// Fallback poller: periodically lists challenges and proposes a Drop for the
// one that is live on the device clock.
//
// Drop is the only thing the poller can propose. It has no way to clear,
// end or update the live challenge, so a stale directory can never regress
// a challenge the push channel made live.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::ClockService;
use crate::directory::ChallengeDirectory;
use crate::protocol::{Challenge, ChannelEvent, Envelope, Origin, PushEvent};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// The first challenge live at `now`, if any.
pub fn find_live(challenges: &[Challenge], now: DateTime<Utc>) -> Option<&Challenge> {
    challenges.iter().find(|c| c.is_live_at(now))
}

pub struct FallbackPoller {
    directory: Arc<dyn ChallengeDirectory>,
    clock: Arc<ClockService>,
    tx: mpsc::Sender<Envelope>,
    interval: Duration,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl FallbackPoller {
    pub fn new(
        directory: Arc<dyn ChallengeDirectory>,
        clock: Arc<ClockService>,
        tx: mpsc::Sender<Envelope>,
        interval: Duration,
    ) -> Self {
        FallbackPoller {
            directory,
            clock,
            tx,
            interval,
            generation: 0,
            task: None,
        }
    }

    /// Start (or restart) polling. The first cycle runs immediately.
    pub fn start(&mut self) -> u64 {
        self.stop();
        self.generation += 1;
        let generation = self.generation;
        info!(
            interval_secs = self.interval.as_secs_f64(),
            generation, "fallback poller started"
        );

        let directory = self.directory.clone();
        let clock = self.clock.clone();
        let tx = self.tx.clone();
        let period = self.interval;
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !poll_once(directory.as_ref(), &clock, &tx, generation).await {
                    debug!("poller receiver closed, stopping");
                    return;
                }
            }
        }));
        generation
    }

    /// Cancel the timer. Safe when not started.
    pub fn stop(&mut self) {
        self.generation += 1;
        if let Some(task) = self.task.take() {
            task.abort();
            info!("fallback poller stopped");
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for FallbackPoller {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// One fetch-and-evaluate cycle. Returns false once the receiver is gone.
async fn poll_once(
    directory: &dyn ChallengeDirectory,
    clock: &ClockService,
    tx: &mpsc::Sender<Envelope>,
    generation: u64,
) -> bool {
    let listing = match directory.list().await {
        Ok(listing) => listing,
        Err(e) => {
            warn!("poll failed, retrying next tick: {e}");
            return true;
        }
    };

    // The `Date` header only seeds the offset; push readings are finer.
    if let Some(server_time) = listing.server_time {
        if clock.seed_server_time(server_time) {
            debug!(offset_ms = clock.offset_ms(), "clock seeded from directory");
        }
    }
    // Liveness is judged on device time.
    let now = clock.local_now();

    let Some(live) = find_live(&listing.challenges, now) else {
        debug!(
            count = listing.challenges.len(),
            now = %now,
            "poll found no live challenge"
        );
        return true;
    };

    debug!(id = %live.id, "poll found live challenge");
    tx.send(Envelope {
        origin: Origin::Poll,
        generation,
        event: ChannelEvent::Proposal {
            event: PushEvent::Drop(live.clone()),
            event_id: None,
        },
    })
    .await
    .is_ok()
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTime;
    use crate::directory::{ChallengeListing, DirectoryError};
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn t0() -> DateTime<Utc> {
        "2026-10-18T17:00:00Z".parse().unwrap()
    }

    fn challenge(id: &str, start: DateTime<Utc>, minutes: i64) -> Challenge {
        Challenge {
            id: id.to_string(),
            title: format!("Challenge {id}"),
            description: String::new(),
            scheduled_at: start,
            expires_at: start + TimeDelta::minutes(minutes),
            campus_id: "uiuc123".to_string(),
            media_url: None,
            is_bonus: false,
        }
    }

    /// Directory that replays scripted responses, repeating the last one.
    struct ScriptedDirectory {
        responses: Mutex<Vec<Result<ChallengeListing, String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedDirectory {
        fn new(responses: Vec<Result<ChallengeListing, String>>) -> Arc<Self> {
            Arc::new(ScriptedDirectory {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            })
        }

        fn listing(challenges: Vec<Challenge>) -> Result<ChallengeListing, String> {
            Ok(ChallengeListing {
                challenges,
                server_time: None,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChallengeDirectory for ScriptedDirectory {
        async fn list(&self) -> Result<ChallengeListing, DirectoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            let next = if responses.len() > 1 {
                responses.remove(0)
            } else {
                responses[0].clone()
            };
            next.map_err(DirectoryError::Unavailable)
        }
    }

    fn manual_clock(start: DateTime<Utc>) -> (Arc<ManualTime>, Arc<ClockService>) {
        let manual = Arc::new(ManualTime::new(start));
        let clock = Arc::new(ClockService::with_source(manual.clone()));
        (manual, clock)
    }

    // -- find_live --

    #[test]
    fn find_live_respects_half_open_window() {
        let list = vec![
            challenge("past", t0() - TimeDelta::hours(2), 60),
            challenge("now", t0(), 60),
            challenge("later", t0() + TimeDelta::hours(2), 60),
        ];
        assert!(find_live(&list, t0() - TimeDelta::seconds(1)).is_none());
        assert_eq!(find_live(&list, t0()).unwrap().id, "now");
        assert!(find_live(&list, t0() + TimeDelta::hours(1)).is_none());
        assert!(find_live(&[], t0()).is_none());
    }

    // -- poll_once --

    #[tokio::test]
    async fn poll_before_and_after_start() {
        let c1 = challenge("c1", t0(), 60);
        let directory = ScriptedDirectory::new(vec![ScriptedDirectory::listing(vec![c1.clone()])]);
        let (manual, clock) = manual_clock(t0() - TimeDelta::milliseconds(1000));
        let (tx, mut rx) = mpsc::channel(4);

        assert!(poll_once(directory.as_ref(), &clock, &tx, 1).await);
        assert!(rx.try_recv().is_err(), "nothing is live before scheduledAt");

        manual.set(t0() + TimeDelta::milliseconds(500));
        assert!(poll_once(directory.as_ref(), &clock, &tx, 1).await);
        let env = rx.try_recv().unwrap();
        assert_eq!(env.origin, Origin::Poll);
        assert_eq!(env.generation, 1);
        assert_eq!(
            env.event,
            ChannelEvent::Proposal {
                event: PushEvent::Drop(c1),
                event_id: None
            }
        );
    }

    #[tokio::test]
    async fn poll_judges_liveness_on_device_time() {
        // Device is 30s into c1, but an earlier push put the server a minute behind.
        let c1 = challenge("c1", t0(), 60);
        let directory = ScriptedDirectory::new(vec![ScriptedDirectory::listing(vec![c1])]);
        let (_manual, clock) = manual_clock(t0() + TimeDelta::seconds(30));
        clock.set_server_time(t0() - TimeDelta::seconds(30));
        assert!(clock.now() < t0());
        let (tx, mut rx) = mpsc::channel(4);

        poll_once(directory.as_ref(), &clock, &tx, 1).await;
        assert!(rx.try_recv().is_ok(), "c1 is live on the device clock");
    }

    #[tokio::test]
    async fn listing_date_seeds_clock_without_overriding_push() {
        let listing = |server_time| {
            Ok(ChallengeListing {
                challenges: vec![],
                server_time: Some(server_time),
            })
        };

        let directory = ScriptedDirectory::new(vec![listing(t0() + TimeDelta::minutes(1))]);
        let (_manual, clock) = manual_clock(t0());
        let (tx, _rx) = mpsc::channel(4);
        poll_once(directory.as_ref(), &clock, &tx, 1).await;
        assert_eq!(clock.offset_ms(), 60_000);

        // A later push reading wins over every following header.
        clock.set_server_time(t0() + TimeDelta::milliseconds(2_250));
        let directory = ScriptedDirectory::new(vec![listing(t0() + TimeDelta::seconds(5))]);
        poll_once(directory.as_ref(), &clock, &tx, 1).await;
        assert_eq!(clock.offset_ms(), 2_250);
    }

    #[tokio::test]
    async fn poll_failure_is_swallowed() {
        let directory = ScriptedDirectory::new(vec![Err("boom".into())]);
        let (_manual, clock) = manual_clock(t0());
        let (tx, mut rx) = mpsc::channel(4);

        assert!(poll_once(directory.as_ref(), &clock, &tx, 1).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn poll_reports_closed_receiver() {
        let directory =
            ScriptedDirectory::new(vec![ScriptedDirectory::listing(vec![challenge("c1", t0(), 60)])]);
        let (_manual, clock) = manual_clock(t0());
        let (tx, rx) = mpsc::channel(4);
        drop(rx);

        assert!(!poll_once(directory.as_ref(), &clock, &tx, 1).await);
    }

    #[tokio::test]
    async fn empty_directory_proposes_nothing() {
        // The live challenge came from push; a stale directory must not touch it.
        let directory = ScriptedDirectory::new(vec![ScriptedDirectory::listing(vec![])]);
        let (_manual, clock) = manual_clock(t0());
        let (tx, mut rx) = mpsc::channel(4);

        poll_once(directory.as_ref(), &clock, &tx, 1).await;
        assert!(rx.try_recv().is_err());
    }

    // -- Timer --

    #[tokio::test(start_paused = true)]
    async fn start_polls_immediately_then_every_interval() {
        let directory = ScriptedDirectory::new(vec![ScriptedDirectory::listing(vec![])]);
        let (_manual, clock) = manual_clock(t0());
        let (tx, _rx) = mpsc::channel(4);
        let mut poller = FallbackPoller::new(directory.clone(), clock, tx, Duration::from_secs(15));

        poller.start();
        tokio::task::yield_now().await;
        assert_eq!(directory.calls(), 1);

        tokio::time::sleep(Duration::from_secs(14)).await;
        assert_eq!(directory.calls(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(directory.calls(), 2);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(directory.calls(), 4);
        assert!(poller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_then_recovery_on_next_tick() {
        let c1 = challenge("c1", t0(), 60);
        let directory = ScriptedDirectory::new(vec![
            Err("timeout".into()),
            ScriptedDirectory::listing(vec![c1]),
        ]);
        let (_manual, clock) = manual_clock(t0() + TimeDelta::minutes(1));
        let (tx, mut rx) = mpsc::channel(4);
        let mut poller = FallbackPoller::new(directory.clone(), clock, tx, Duration::from_secs(15));

        poller.start();
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(16)).await;
        let env = rx.try_recv().unwrap();
        assert!(matches!(
            env.event,
            ChannelEvent::Proposal {
                event: PushEvent::Drop(ref c),
                ..
            } if c.id == "c1"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_timer_and_advances_generation() {
        let directory = ScriptedDirectory::new(vec![ScriptedDirectory::listing(vec![])]);
        let (_manual, clock) = manual_clock(t0());
        let (tx, _rx) = mpsc::channel(4);
        let mut poller = FallbackPoller::new(directory.clone(), clock, tx, Duration::from_secs(15));

        poller.stop();
        assert!(!poller.is_running());

        let started = poller.start();
        tokio::task::yield_now().await;
        poller.stop();
        assert!(poller.generation() > started);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(directory.calls(), 1);
        assert!(!poller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_gets_new_generation() {
        let directory =
            ScriptedDirectory::new(vec![ScriptedDirectory::listing(vec![challenge("c1", t0(), 60)])]);
        let (_manual, clock) = manual_clock(t0());
        let (tx, mut rx) = mpsc::channel(8);
        let mut poller = FallbackPoller::new(directory, clock, tx, Duration::from_secs(15));

        let first = poller.start();
        tokio::task::yield_now().await;
        let second = poller.start();
        tokio::task::yield_now().await;
        assert!(second > first);

        assert_eq!(rx.try_recv().unwrap().generation, first);
        assert_eq!(rx.try_recv().unwrap().generation, second);
    }
}
