//! Reconnection of hosts whose connection dropped without a goodbye.
//!
//! Each lost url gets one timer task tagged with a generation number. A timer
//! stops as soon as its entry in the reconnect table is gone or belongs to a
//! newer generation, so cancelling is just removing the entry.

use std::sync::atomic::Ordering;
use std::sync::Weak;
use std::time::{Duration, Instant};

use super::{Host, HostInner, Settings};

/// Lower bound of the retry delay.
const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(10);

impl Host {
    /// Urls currently waiting to be reconnected, sorted.
    pub fn reconnecting(&self) -> Vec<String> {
        super::sorted_keys(&self.inner.reconnects)
    }

    pub(crate) fn schedule_reconnect(&self, url: String) {
        let generation = self.inner.next_timer.fetch_add(1, Ordering::Relaxed);
        self.inner.reconnects.insert(url.clone(), generation);
        tracing::debug!(%url, generation, "scheduling reconnect");
        let timer = Timer {
            url,
            generation,
            epoch: self.epoch(),
        };
        tokio::spawn(reconnect(self.downgrade(), timer, self.settings()));
    }

    pub(crate) fn cancel_reconnect(&self, url: &str) {
        self.inner.reconnects.remove(url);
    }

    /// Whether `timer` still owns its url and the host was not closed since.
    fn timer_is_current(&self, timer: &Timer) -> bool {
        self.epoch() == timer.epoch
            && self
                .inner
                .reconnects
                .get(&timer.url)
                .is_some_and(|g| *g == timer.generation)
    }

    fn finish_timer(&self, timer: &Timer) {
        self.inner
            .reconnects
            .remove_if(&timer.url, |_, g| *g == timer.generation);
    }
}

struct Timer {
    url: String,
    generation: u64,
    epoch: u64,
}

async fn reconnect(weak: Weak<HostInner>, timer: Timer, settings: Settings) {
    let url = timer.url.as_str();
    let started = Instant::now();
    let mut delay = settings.reconnect_delay;

    loop {
        tokio::time::sleep(delay).await;

        let Some(inner) = weak.upgrade() else {
            return;
        };
        let host = Host::from_inner(inner);
        if !host.timer_is_current(&timer) {
            return;
        }

        if started.elapsed() > settings.reconnect_timeout {
            host.finish_timer(&timer);
            host.forget_addresses(url);
            tracing::info!(%url, "gave up reconnecting");
            return;
        }

        if host.inner.connections.contains_key(url) {
            host.finish_timer(&timer);
            return;
        }

        let joined = host.join(url).await;
        if host.epoch() != timer.epoch {
            tracing::debug!(%url, "host closed during reconnect");
            return;
        }
        match joined {
            Ok(()) => {
                host.finish_timer(&timer);
                tracing::info!(%url, "reconnected");
                return;
            }
            Err(e) => {
                tracing::debug!(%url, error = %e, ?delay, "reconnect attempt failed");
                delay = next_delay(delay, settings.reconnect_decay);
            }
        }
    }
}

/// Delay before the next attempt: the current one divided by `decay`.
fn next_delay(delay: Duration, decay: f64) -> Duration {
    match Duration::try_from_secs_f64(delay.as_secs_f64() / decay) {
        Ok(next) => next.max(MIN_RECONNECT_DELAY),
        Err(_) => delay,
    }
}
