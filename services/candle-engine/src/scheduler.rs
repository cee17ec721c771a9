//! Finalization/flush scheduler and task supervision
//!
//! Three timer loops (stale sweep, market-close flush, memory eviction)
//! that only send `Control` messages to the core loop. The close instant
//! is recomputed from the market calendar every cycle so DST shifts are
//! picked up without a restart.
//!
//! `supervise` keeps a background task alive: a panic or an early return
//! is logged and the task is started again.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bucket::MarketCalendar;
use crate::events::Control;
use crate::metrics::EngineMetrics;

/// Delay before restarting a task that died before shutdown.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Run `factory`'s task until it finishes after `cancel`, restarting it
/// whenever it panics or returns early.
pub async fn supervise<F, Fut>(
    name: String,
    cancel: CancellationToken,
    metrics: Arc<EngineMetrics>,
    mut factory: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        match tokio::spawn(factory()).await {
            Ok(()) if cancel.is_cancelled() => {
                debug!(task = %name, "Task stopped");
                return;
            }
            Ok(()) => error!(task = %name, "Task exited before shutdown, restarting"),
            Err(err) if err.is_panic() => error!(task = %name, "Task panicked, restarting"),
            Err(err) => {
                warn!(task = %name, error = %err, "Task aborted");
                return;
            }
        }
        metrics.record_scheduler_error();

        // During shutdown restart straight away so drains still complete.
        if !cancel.is_cancelled() {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = time::sleep(RESTART_DELAY) => {}
            }
        }
    }
}

/// Timer loops feeding the core loop.
pub struct Scheduler {
    control: mpsc::Sender<Control>,
    calendar: MarketCalendar,
    sweep_interval: Duration,
    eviction_interval: Duration,
}

impl Scheduler {
    pub fn new(
        control: mpsc::Sender<Control>,
        calendar: MarketCalendar,
        sweep_interval: Duration,
        eviction_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            control,
            calendar,
            sweep_interval,
            eviction_interval,
        })
    }

    /// Periodic stale 1-minute bucket sweep.
    pub async fn sweep_loop(self: Arc<Self>, cancel: CancellationToken) {
        self.periodic("sweep", self.sweep_interval, cancel, || Control::Sweep)
            .await
    }

    /// Periodic memory eviction.
    pub async fn eviction_loop(self: Arc<Self>, cancel: CancellationToken) {
        self.periodic("evict", self.eviction_interval, cancel, || Control::Evict)
            .await
    }

    /// Fires once per market close, at the close instant.
    pub async fn market_close_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut last_fired: Option<DateTime<Utc>> = None;
        loop {
            let now = Utc::now();
            let reference = last_fired.map_or(now, |fired| fired.max(now));
            let close_at = self.calendar.next_close_after(reference);
            let wait = (close_at - now).to_std().unwrap_or(Duration::ZERO);
            info!(
                close_at = %close_at,
                close_hour_utc = self.calendar.market_close_utc_hour(close_at.date_naive()),
                wait_secs = wait.as_secs(),
                "Next market-close flush scheduled"
            );

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = time::sleep(wait) => {}
            }
            if !self.send(Control::MarketClose { close_at }, &cancel).await {
                return;
            }
            last_fired = Some(close_at);
        }
    }

    async fn periodic(
        &self,
        name: &'static str,
        period: Duration,
        cancel: CancellationToken,
        command: impl Fn() -> Control,
    ) {
        let period = period.max(Duration::from_millis(1));
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(timer = name, period_ms = period.as_millis() as u64, "Timer started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if !self.send(command(), &cancel).await {
                return;
            }
        }
    }

    /// Hand a command to the core loop. False once shutting down.
    async fn send(&self, command: Control, cancel: &CancellationToken) -> bool {
        let label = command.label();
        tokio::select! {
            _ = cancel.cancelled() => false,
            sent = self.control.send(command) => match sent {
                Ok(()) => true,
                Err(_) => {
                    warn!(command = label, "Core loop not receiving control messages");
                    false
                }
            },
        }
    }
}
