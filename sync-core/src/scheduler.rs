//! Scheduler: a tick loop that fires one sync run per calendar day at a
//! configured local time, in a configured IANA timezone.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use tracing::{info, warn};

use crate::engine::{RunSummary, SyncEngine};
use crate::error::EngineError;

struct TickState {
    is_running: bool,
    last_run_date_key: Option<String>,
}

pub struct Scheduler {
    engine: SyncEngine,
    timezone: Tz,
    daily_at: (u32, u32),
    tick_interval: Duration,
    run_on_start: bool,
    state: Mutex<TickState>,
}

impl Scheduler {
    pub fn new(
        engine: SyncEngine,
        timezone: Tz,
        daily_at: (u32, u32),
        tick_interval: Duration,
        run_on_start: bool,
    ) -> Self {
        Self {
            engine,
            timezone,
            daily_at,
            tick_interval,
            run_on_start,
            state: Mutex::new(TickState {
                is_running: false,
                last_run_date_key: None,
            }),
        }
    }

    /// Runs until the process is killed: an optional immediate run, then a
    /// tick every `tick_interval`, each tick firing at most one sync run.
    pub async fn run_forever(&self) -> ! {
        if self.run_on_start {
            self.force_run(Utc::now()).await;
        }
        loop {
            tokio::time::sleep(self.tick_interval).await;
            self.check_and_run(Utc::now()).await;
        }
    }

    /// Runs the engine once if due and not already running; otherwise a
    /// no-op. Returns `None` when no run was attempted.
    async fn check_and_run(&self, now: DateTime<Utc>) -> Option<Result<RunSummary, EngineError>> {
        let local = now.with_timezone(&self.timezone);
        let date_key = local.format("%Y-%m-%d").to_string();

        {
            let mut state = self.state.lock().expect("scheduler mutex poisoned");
            if state.is_running {
                warn!("scheduler tick skipped: a sync run is already in progress");
                return None;
            }
            if state.last_run_date_key.as_deref() == Some(date_key.as_str()) {
                return None;
            }
            if !is_due(local.hour(), local.minute(), self.daily_at) {
                return None;
            }
            state.is_running = true;
        }

        Some(self.execute(date_key).await)
    }

    /// Runs the engine immediately, ignoring the due-time check, used for
    /// `run_on_start`. Still serializes against a concurrent tick.
    async fn force_run(&self, now: DateTime<Utc>) -> Option<Result<RunSummary, EngineError>> {
        let local = now.with_timezone(&self.timezone);
        let date_key = local.format("%Y-%m-%d").to_string();

        {
            let mut state = self.state.lock().expect("scheduler mutex poisoned");
            if state.is_running {
                return None;
            }
            state.is_running = true;
        }

        Some(self.execute(date_key).await)
    }

    async fn execute(&self, date_key: String) -> Result<RunSummary, EngineError> {
        let result = self.engine.run().await;

        {
            let mut state = self.state.lock().expect("scheduler mutex poisoned");
            state.is_running = false;
            if !matches!(&result, Ok(summary) if summary.skipped_by_lock) {
                state.last_run_date_key = Some(date_key);
            }
        }

        match &result {
            Ok(summary) if summary.skipped_by_lock => {
                info!("scheduled sync run skipped: job lock already held");
            }
            Ok(summary) => {
                let uploaded: u32 = summary.accounts.iter().map(|a| a.uploaded).sum();
                let failed: u32 = summary.accounts.iter().map(|a| a.failed).sum();
                info!(uploaded, failed, "scheduled sync run complete");
            }
            Err(e) => {
                warn!(error = %e, "scheduled sync run failed");
                if looks_like_auth_failure(e) {
                    warn!(
                        "hint: this looks like an authentication failure — check \
                         SOURCE_COOKIES_JSON and SOURCE_WEB_BEARER_TOKEN"
                    );
                }
            }
        }

        result
    }
}

fn is_due(hour: u32, minute: u32, daily_at: (u32, u32)) -> bool {
    (hour, minute) >= daily_at
}

fn looks_like_auth_failure(e: &EngineError) -> bool {
    e.to_string().to_lowercase().contains("auth")
}
