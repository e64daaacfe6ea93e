//! Per-UID proxy accounting.
//!
//! Counts live remote proxies by the UID that caused their creation and
//! raises warning/limit callbacks as counts cross configured watermarks.
//! Callback invocation is deferred to the caller so no user code runs under
//! the tracker lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{error, warn};

/// Watermarks for per-UID proxy counts.
#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    /// Count at which the limit callback fires and, with throttling enabled,
    /// further creations are refused.
    pub high: u32,
    /// Count at or below which a UID's warning/limit flags reset.
    pub low: u32,
    /// Count at which the warning callback first fires.
    pub warning: u32,
    /// Additional proxies above the last warning before it fires again.
    pub warn_interval: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            high: 2500,
            low: 2000,
            warning: 2250,
            warn_interval: 5000,
        }
    }
}

type UidCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// A callback captured under the tracker lock, to be run after release.
pub(crate) struct Notice {
    callback: UidCallback,
    uid: u32,
}

impl Notice {
    pub(crate) fn deliver(self) {
        (self.callback)(self.uid);
    }
}

/// Outcome of charging a proxy creation to a UID.
pub(crate) struct CreateOutcome {
    /// True when the creation was counted and must be refunded on destroy.
    pub charged: bool,
    /// Callbacks to run once all locks are released.
    pub notices: Vec<Notice>,
}

#[derive(Default)]
struct UidState {
    count: u32,
    warning_hit: bool,
    limit_hit: bool,
    last_warn_count: u32,
}

#[derive(Default)]
struct TrackerInner {
    config: TrackerConfig,
    enabled: bool,
    throttle: bool,
    counts: HashMap<u32, UidState>,
    warning_cb: Option<UidCallback>,
    limit_cb: Option<UidCallback>,
}

/// Watermark-based accounting of live proxies per originating UID.
#[derive(Default)]
pub(crate) struct ProxyTracker {
    inner: Mutex<TrackerInner>,
}

impl ProxyTracker {
    pub(crate) fn set_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.enabled = enabled;
        if !enabled {
            inner.counts.clear();
        }
    }

    pub(crate) fn set_throttling(&self, throttle: bool) {
        self.inner.lock().unwrap().throttle = throttle;
    }

    pub(crate) fn set_watermarks(&self, config: TrackerConfig) {
        self.inner.lock().unwrap().config = config;
    }

    pub(crate) fn set_warning_callback(&self, cb: UidCallback) {
        self.inner.lock().unwrap().warning_cb = Some(cb);
    }

    pub(crate) fn set_limit_callback(&self, cb: UidCallback) {
        self.inner.lock().unwrap().limit_cb = Some(cb);
    }

    pub(crate) fn count_for_uid(&self, uid: u32) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .counts
            .get(&uid)
            .map_or(0, |s| s.count)
    }

    /// Charges one proxy creation to `uid`.
    ///
    /// Returns `Err(())` when throttling refuses the creation; the caller
    /// must not build the proxy. On success the caller delivers the returned
    /// notices after dropping its own locks.
    pub(crate) fn on_create(&self, uid: u32) -> Result<CreateOutcome, ()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.enabled {
            return Ok(CreateOutcome {
                charged: false,
                notices: Vec::new(),
            });
        }

        let config = inner.config;
        let throttle = inner.throttle;
        let warning_cb = inner.warning_cb.clone();
        let limit_cb = inner.limit_cb.clone();
        let state = inner.counts.entry(uid).or_default();

        // The limit flag, not the instantaneous count, gates creation: once a
        // UID trips the high watermark it stays refused until a destruction
        // brings it back to the low watermark.
        if throttle && state.limit_hit {
            warn!(uid, count = state.count, "refusing proxy creation over limit");
            return Err(());
        }

        state.count += 1;
        let mut notices = Vec::new();

        if state.count >= config.high && !state.limit_hit {
            state.limit_hit = true;
            error!(uid, count = state.count, "uid crossed proxy limit watermark");
            if let Some(cb) = limit_cb {
                notices.push(Notice { callback: cb, uid });
            }
        }
        let rewarn = state.warning_hit
            && state.count >= state.last_warn_count.saturating_add(config.warn_interval);
        if (state.count >= config.warning && !state.warning_hit) || rewarn {
            state.warning_hit = true;
            state.last_warn_count = state.count;
            warn!(uid, count = state.count, "uid crossed proxy warning watermark");
            if let Some(cb) = warning_cb {
                notices.push(Notice { callback: cb, uid });
            }
        }

        Ok(CreateOutcome {
            charged: true,
            notices,
        })
    }

    /// Refunds a charge made by [`ProxyTracker::on_create`].
    pub(crate) fn on_destroy(&self, uid: u32) {
        let mut inner = self.inner.lock().unwrap();
        let low = inner.config.low;
        let remaining = {
            let Some(state) = inner.counts.get_mut(&uid) else {
                // Tracking was reset while this proxy was alive.
                return;
            };
            state.count = state.count.saturating_sub(1);
            if state.count <= low {
                state.warning_hit = false;
                state.limit_hit = false;
                state.last_warn_count = 0;
            }
            state.count
        };
        if remaining == 0 {
            inner.counts.remove(&uid);
        }
    }
}
