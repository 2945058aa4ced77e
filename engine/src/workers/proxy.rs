//! Startup proxy push worker

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{error, info};

use crate::proxy::ProxySynchronizer;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Proxy worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Backoff between failed pushes
    pub cooldown: CooldownOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cooldown: CooldownOptions {
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                multiplier: 2.0,
            },
        }
    }
}

/// Push the routing document once, retrying until the proxy accepts it.
/// Returns whether the push succeeded before shutdown.
pub async fn run<S, F>(
    options: &Options,
    proxy: &ProxySynchronizer,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) -> bool
where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Proxy worker starting...");

    let mut attempt = 0;
    loop {
        match proxy.force_sync("startup").await {
            Ok(_) => {
                info!("Proxy config in place after {} attempt(s)", attempt + 1);
                return true;
            }
            Err(e) => {
                let wait = calc_exp_backoff(&options.cooldown, attempt);
                error!("Proxy push failed, retrying in {:?}: {}", wait, e);
                attempt += 1;

                tokio::select! {
                    _ = &mut shutdown_signal => {
                        info!("Proxy worker shutting down...");
                        return false;
                    }
                    _ = sleep_fn(wait) => {}
                }
            }
        }
    }
}
