//! Quota-exhaustion handling.
//!
//! The Data API quota resets at midnight Pacific Time, DST included. When
//! the platform reports `QuotaExceeded` the scheduler parks here: we sleep
//! in cancellable slices until the next reset, showing progress at the
//! configured check interval, and give up once the cumulative wait passes
//! the configured cap.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::America::Los_Angeles;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Api;

/// Observable state, mostly for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaState {
    Idle,
    Waiting,
    Probing,
    GaveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Slept through the reset; the caller should probe by retrying.
    Resumed,
    /// The interrupt token fired mid-sleep.
    Cancelled,
    /// Auto-wait is disabled or the cumulative cap was exceeded.
    GaveUp,
}

pub struct QuotaManager {
    auto_wait: bool,
    max_wait: Duration,
    check_interval: Duration,
    waited: Mutex<Duration>,
    state: Mutex<QuotaState>,
}

impl QuotaManager {
    pub fn new(api: &Api) -> Self {
        Self {
            auto_wait: api.quota_auto_wait,
            max_wait: api.quota_max_wait,
            check_interval: api.quota_check_interval,
            waited: Mutex::new(Duration::ZERO),
            state: Mutex::new(QuotaState::Idle),
        }
    }

    pub fn state(&self) -> QuotaState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: QuotaState) {
        *self.state.lock().unwrap() = state;
    }

    /// The next quota reset: the upcoming midnight in Pacific Time.
    pub fn next_reset(now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&Los_Angeles);
        let next_day = local
            .date_naive()
            .succ_opt()
            .expect("date arithmetic in range");
        let midnight = next_day.and_hms_opt(0, 0, 0).expect("midnight exists");
        Los_Angeles
            .from_local_datetime(&midnight)
            .earliest()
            .expect("midnight is never skipped by DST")
            .with_timezone(&Utc)
    }

    /// Sleeps until the next reset. Returns what the scheduler should do.
    pub async fn wait_for_reset(&self, ct: &CancellationToken) -> WaitOutcome {
        if !self.auto_wait {
            warn!("API quota exceeded and quota_auto_wait is disabled");
            self.set_state(QuotaState::GaveUp);
            return WaitOutcome::GaveUp;
        }

        let now = Utc::now();
        let reset = Self::next_reset(now);
        let wait = (reset - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            // A little slack so we do not probe a second early.
            + Duration::from_secs(60);

        {
            let waited = self.waited.lock().unwrap();
            if *waited + wait > self.max_wait {
                warn!(
                    "cumulative quota wait would exceed the cap ({:?}), giving up",
                    self.max_wait
                );
                self.set_state(QuotaState::GaveUp);
                return WaitOutcome::GaveUp;
            }
        }

        info!(
            "API quota exceeded; sleeping until reset at {} ({} from now)",
            reset.to_rfc3339(),
            humanize(wait)
        );
        self.set_state(QuotaState::Waiting);

        let bar = ProgressBar::new(wait.as_secs());
        bar.set_style(
            ProgressStyle::with_template(
                "quota wait [{elapsed_precise}] [{wide_bar:.yellow}] {eta} left",
            )
            .expect("static template parses"),
        );

        let mut remaining = wait;
        while !remaining.is_zero() {
            let slice = remaining.min(self.check_interval);
            select! {
                () = ct.cancelled() => {
                    bar.finish_and_clear();
                    info!("quota wait interrupted");
                    self.set_state(QuotaState::Idle);
                    return WaitOutcome::Cancelled;
                }
                () = tokio::time::sleep(slice) => {}
            }
            remaining -= slice;
            bar.set_position((wait - remaining).as_secs());
            if !remaining.is_zero() {
                info!("still waiting for quota reset, {} left", humanize(remaining));
            }
        }
        bar.finish_and_clear();

        *self.waited.lock().unwrap() += wait;
        self.set_state(QuotaState::Probing);
        info!("quota reset reached, probing the API again");
        WaitOutcome::Resumed
    }

    /// Called by the scheduler once a probe succeeded.
    pub fn probe_succeeded(&self) {
        self.set_state(QuotaState::Idle);
    }
}

fn humanize(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}
