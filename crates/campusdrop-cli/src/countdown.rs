// Per-second countdown for the live challenge.
//
// Reads the published snapshot and the shared clock; never touches the
// session. Redraws once a second and immediately on every transition.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use campusdrop_core::clock::ClockService;
use campusdrop_core::protocol::Origin;
use campusdrop_core::store::{Phase, SyncSnapshot};
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::info;

const TICK: Duration = Duration::from_secs(1);
const BELL: char = '\u{7}';

/// `HH:MM:SS`, or `Expired` once nothing remains.
pub fn format_countdown(remaining: TimeDelta) -> String {
    if remaining <= TimeDelta::zero() {
        return "Expired".to_string();
    }
    let secs = remaining.num_seconds();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// One status line for `snapshot` at server time `now`.
pub fn render_line(snapshot: &SyncSnapshot, now: DateTime<Utc>) -> String {
    let link = if snapshot.push_connected { "push" } else { "polling" };
    let body = match (&snapshot.phase, &snapshot.current) {
        (Phase::Live, Some(c)) => {
            let bonus = if c.is_bonus { " [BONUS]" } else { "" };
            if now < c.scheduled_at {
                format!(
                    "{}{bonus} starts in {}",
                    c.title,
                    format_countdown(c.scheduled_at - now)
                )
            } else {
                format!(
                    "LIVE: {}{bonus} | {}",
                    c.title,
                    format_countdown(c.expires_at - now)
                )
            }
        }
        (Phase::Results, Some(c)) => format!("Ended: {}", c.title),
        _ => "No live challenge".to_string(),
    };
    format!("{body} ({link})")
}

/// Tracks which drops have already been announced.
#[derive(Debug, Default)]
pub struct Countdown {
    /// `drop_revision` of the last announced drop.
    announced: u64,
}

impl Countdown {
    /// Render a frame, prefixed with a bell the first time a pushed drop
    /// is seen. A repeat drop of the same id after results rings again.
    pub fn frame(&mut self, snapshot: &SyncSnapshot, now: DateTime<Utc>) -> String {
        let line = render_line(snapshot, now);
        let fresh_drop = snapshot.phase == Phase::Live
            && snapshot.last_source == Some(Origin::Push)
            && snapshot.drop_revision != self.announced;
        if !fresh_drop {
            return line;
        }
        self.announced = snapshot.drop_revision;
        if let Some(c) = &snapshot.current {
            info!(id = %c.id, revision = snapshot.drop_revision, "announcing challenge drop");
        }
        format!("{BELL}{line}")
    }
}

/// Redraw until the session's snapshot channel closes.
pub async fn run<W: Write>(
    mut rx: watch::Receiver<SyncSnapshot>,
    clock: Arc<ClockService>,
    out: &mut W,
) -> anyhow::Result<()> {
    let mut countdown = Countdown::default();
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
        let snapshot = rx.borrow_and_update().clone();
        let frame = countdown.frame(&snapshot, clock.now());
        write!(out, "\r{frame}\u{1b}[K")?;
        out.flush()?;
    }
}
