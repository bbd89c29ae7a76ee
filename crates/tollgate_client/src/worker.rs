//! Background tasks that keep durable licensing state current.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ConfigWatch;
use crate::error::AlreadyRunning;
use crate::remote::{license_token, ValidityAuthority};
use crate::users::UserCounter;
use crate::validity::ValidityChecker;
use crate::Licensing;

/// Shortest period either worker ticks at.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

fn clamp_interval(name: &str, interval: Duration) -> Duration {
    if interval < MIN_INTERVAL {
        log::warn!("{} of {:?} is too short, using {:?}", name, interval, MIN_INTERVAL);
        return MIN_INTERVAL;
    }
    interval
}

/// Handle to the validity supervisor and the max-user sampler.
///
/// At most one set of workers runs per [`Licensing`]. Both stop when the
/// token given to [`LicenseWorkers::start`] is cancelled or on
/// [`LicenseWorkers::shutdown`].
pub struct LicenseWorkers {
    licensing: Arc<Licensing>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl LicenseWorkers {
    pub fn start<A: ValidityAuthority>(
        licensing: Arc<Licensing>,
        authority: Arc<A>,
        users: Arc<dyn UserCounter>,
        shutdown: CancellationToken,
    ) -> Result<Self, AlreadyRunning> {
        if !licensing.claim_workers() {
            return Err(AlreadyRunning);
        }

        let cancel = shutdown.child_token();
        let options = licensing.options();
        let checker = Arc::new(ValidityChecker::new(Arc::clone(&licensing), authority));

        let handles = vec![
            tokio::spawn(supervise_validity(
                checker,
                licensing.subscribe_config(),
                clamp_interval("check interval", options.check_interval),
                cancel.clone(),
            )),
            tokio::spawn(sample_max_users(
                Arc::clone(&licensing),
                users,
                clamp_interval("max users interval", options.max_users_interval),
                cancel.clone(),
            )),
        ];
        log::info!("license workers started");

        Ok(Self {
            licensing,
            cancel,
            handles,
        })
    }

    /// Stop both workers and wait for them to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                log::error!("license worker ended abnormally: {}", e);
            }
        }
        log::info!("license workers stopped");
    }
}

impl Drop for LicenseWorkers {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.licensing.release_workers();
    }
}

/// A validity loop bound to one license token.
struct RunningCheck {
    token: Option<String>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningCheck {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            log::error!("license validity loop ended abnormally: {}", e);
        }
    }
}

/// Keeps exactly one validity loop running for the configured license,
/// restarting it whenever the license token changes.
async fn supervise_validity<A: ValidityAuthority>(
    checker: Arc<ValidityChecker<A>>,
    mut config: ConfigWatch,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut running: Option<RunningCheck> = None;

    loop {
        let key_text = config.borrow_and_update().license_key().map(str::to_string);
        let token = key_text.as_deref().map(license_token);

        if running.as_ref().map(|r| &r.token) != Some(&token) {
            if let Some(previous) = running.take() {
                log::info!("license changed, restarting validity checks");
                previous.stop().await;
            }
            let loop_cancel = cancel.child_token();
            running = Some(RunningCheck {
                token,
                cancel: loop_cancel.clone(),
                handle: tokio::spawn(check_periodically(
                    Arc::clone(&checker),
                    key_text,
                    interval,
                    loop_cancel,
                )),
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = config.changed() => {
                if changed.is_err() {
                    // Config source gone: keep the current loop until shutdown.
                    cancel.cancelled().await;
                    break;
                }
            }
        }
    }

    if let Some(running) = running.take() {
        running.stop().await;
    }
}

async fn check_periodically<A: ValidityAuthority>(
    checker: Arc<ValidityChecker<A>>,
    key_text: Option<String>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let delay = match key_text.as_deref() {
        Some(key_text) => checker
            .first_check_delay(key_text, interval)
            .unwrap_or_else(|e| {
                log::error!("reading license validity state failed: {}", e);
                Duration::ZERO
            }),
        None => Duration::ZERO,
    };
    if !delay.is_zero() {
        log::debug!("next license validity check in {:?}", delay);
    }

    let mut ticker = tokio::time::interval_at(Instant::now() + delay, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            result = checker.run_once() => match result {
                Ok(outcome) => log::debug!("license validity check finished: {:?}", outcome),
                Err(e) => log::error!("license validity check failed, keeping previous verdict: {}", e),
            },
        }
    }
}

async fn sample_max_users(
    licensing: Arc<Licensing>,
    users: Arc<dyn UserCounter>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if let Err(e) = licensing.record_max_users(users.as_ref()) {
            log::error!("recording max user count failed: {}", e);
        }
    }
}
