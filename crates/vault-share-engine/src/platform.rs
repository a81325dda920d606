//! Platform hooks the engines call out to but never depend on concretely
//! (§6): a background-execution budget and a deferred-task scheduler. Both
//! ship a no-op implementation so the engines run unmodified on a platform
//! that has neither.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Opaque handle to a background-execution grant. Platforms without a real
/// background-execution budget (servers, CLIs) can make this whatever they
/// like; the engines only ever pass it back to `end`.
pub type BackgroundToken = u64;

/// Interface to the host's background-execution budget (e.g. an OS
/// background-task assertion on mobile). The engines call `begin()` once
/// before the first job starts and `end(token)` once after the last job
/// tied to that grant finishes; see spec §4.5's "global background-execution
/// token is shared" rule.
pub trait BackgroundExecution: Send + Sync {
    fn begin(&self) -> BackgroundToken;
    fn end(&self, token: BackgroundToken);
}

/// Interface to the host's ability to wake this process again later (e.g.
/// `BGTaskScheduler` on iOS, a cron-like facility elsewhere). `register`
/// installs a handler once per `id`; `schedule` requests a call no sooner
/// than `earliest_in`; `cancel` withdraws a pending request.
pub trait DeferredTaskScheduler: Send + Sync {
    fn register(&self, id: &str, handler: Arc<dyn Fn() + Send + Sync>);
    fn schedule(&self, id: &str, earliest_in: Duration);
    fn cancel(&self, id: &str);
}

/// No-op implementation of both platform traits: `begin`/`schedule` do
/// nothing observable, matching spec §6's "callers on platforms without
/// them simply get no-op implementations".
#[derive(Default)]
pub struct NoopPlatform {
    handlers: Mutex<HashMap<String, Arc<dyn Fn() + Send + Sync>>>,
}

impl NoopPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BackgroundExecution for NoopPlatform {
    fn begin(&self) -> BackgroundToken {
        0
    }

    fn end(&self, _token: BackgroundToken) {}
}

impl DeferredTaskScheduler for NoopPlatform {
    fn register(&self, id: &str, handler: Arc<dyn Fn() + Send + Sync>) {
        self.handlers.lock().expect("lock poisoned").insert(id.to_string(), handler);
    }

    fn schedule(&self, _id: &str, _earliest_in: Duration) {}

    fn cancel(&self, _id: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_platform_begin_end_is_harmless() {
        let platform = NoopPlatform::new();
        let token = platform.begin();
        platform.end(token);
    }

    #[test]
    fn noop_scheduler_register_then_cancel_is_harmless() {
        let platform = NoopPlatform::new();
        platform.register("resume-upload", Arc::new(|| {}));
        platform.schedule("resume-upload", Duration::from_secs(15));
        platform.cancel("resume-upload");
    }
}
