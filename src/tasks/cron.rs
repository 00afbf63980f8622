//! The cron loop: periodic work registered at process start. Leader-only
//! entries take a named lock so only one process per store runs them each
//! period.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::locker;
use crate::runtime::Runtime;

/// Spawns every cron entry, returning their handles for shutdown.
pub fn start(rt: Arc<Runtime>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    vec![
        spawn_cron(rt.clone(), shutdown.clone(), "retry_ivr_calls", Duration::from_secs(60), true, |rt| {
            Box::pin(async move { super::ivr::retry_calls(&rt).await })
        }),
        spawn_cron(rt.clone(), shutdown.clone(), "expire_waits", Duration::from_secs(60), true, |rt| {
            Box::pin(async move { super::expirations::expire_waits(&rt).await })
        }),
        spawn_cron(rt, shutdown, "fire_campaign_events", Duration::from_secs(60), true, |rt| {
            Box::pin(async move { super::campaigns::queue_due_fires(&rt).await })
        }),
    ]
}

type CronFn = fn(
    Arc<Runtime>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = crate::error::Result<()>> + Send>>;

fn spawn_cron(
    rt: Arc<Runtime>,
    mut shutdown: watch::Receiver<bool>,
    name: &'static str,
    period: Duration,
    leader_only: bool,
    run: CronFn,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(cron = name, period_secs = period.as_secs(), "cron started");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!(cron = name, "cron stopped");
                    return;
                }
            }

            if leader_only {
                let lock_name = format!("cron:{name}");
                let token = match locker::try_acquire_once(&rt.db, &lock_name, period).await {
                    Ok(Some(token)) => token,
                    Ok(None) => continue,
                    Err(err) => {
                        error!(cron = name, error = %err, "error taking cron lock");
                        continue;
                    }
                };

                if let Err(err) = run(rt.clone()).await {
                    error!(cron = name, error = %err, "cron run failed");
                }
                let _ = locker::release(&rt.db, &lock_name, &token).await;
            } else if let Err(err) = run(rt.clone()).await {
                error!(cron = name, error = %err, "cron run failed");
            }
        }
    })
}
