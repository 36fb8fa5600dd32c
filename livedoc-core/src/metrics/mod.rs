//! Metrics emitted by the observation and access-control layers
//!
//! Everything goes through the `metrics` facade. Installing a recorder
//! (Prometheus or otherwise) is the embedding application's job; without one
//! these calls are no-ops.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Instant;

/// Describe every metric livedoc emits
pub fn init_metrics() {
    describe_gauge!("observe.multiplexers.active", "Live multiplexers (one per distinct query)");
    describe_gauge!("observe.listeners.active", "Listeners attached to multiplexers");
    describe_counter!("observe.drivers.started", "Change drivers started, by kind");
    describe_counter!("observe.drivers.stopped", "Change drivers torn down, by kind");
    describe_counter!("observe.events.delivered", "Change events handed to listeners");
    describe_counter!("observe.driver.resyncs", "Full re-queries after a lagging change feed");
    describe_counter!("observe.listeners.overflowed", "Listeners dropped because their queue was full");

    describe_counter!("access.allowed", "Untrusted mutations that passed allow/deny");
    describe_counter!("access.denied", "Untrusted mutations rejected, by operation");
    describe_histogram!("access.authorize.duration_ms", "Time spent running validators");

    describe_counter!("pubsub.events.published", "Events emitted on broadcast channels");
    describe_counter!("pubsub.events.ignored_echo", "Broadcast echoes of optimistic writes dropped");
}

pub(crate) fn multiplexer_opened() {
    gauge!("observe.multiplexers.active").increment(1.0);
}

pub(crate) fn multiplexer_closed() {
    gauge!("observe.multiplexers.active").decrement(1.0);
}

pub(crate) fn listener_attached() {
    gauge!("observe.listeners.active").increment(1.0);
}

pub(crate) fn listener_detached() {
    gauge!("observe.listeners.active").decrement(1.0);
}

pub(crate) fn driver_started(kind: &'static str) {
    counter!("observe.drivers.started", "kind" => kind).increment(1);
}

pub(crate) fn driver_stopped(kind: &'static str) {
    counter!("observe.drivers.stopped", "kind" => kind).increment(1);
}

pub(crate) fn event_delivered() {
    counter!("observe.events.delivered").increment(1);
}

pub(crate) fn listener_overflowed() {
    counter!("observe.listeners.overflowed").increment(1);
}

pub(crate) fn driver_resync() {
    counter!("observe.driver.resyncs").increment(1);
}

pub(crate) fn access_allowed(operation: &'static str) {
    counter!("access.allowed", "operation" => operation).increment(1);
}

pub(crate) fn access_denied(operation: &'static str) {
    counter!("access.denied", "operation" => operation).increment(1);
}

pub(crate) fn event_published() {
    counter!("pubsub.events.published").increment(1);
}

pub(crate) fn echo_ignored() {
    counter!("pubsub.events.ignored_echo").increment(1);
}

/// Timer for measuring operation duration
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Stop the timer and record the duration in milliseconds
    pub fn stop(self) {
        let duration = self.start.elapsed();
        histogram!(self.name).record(duration.as_secs_f64() * 1000.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init() {
        init_metrics();
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        multiplexer_opened();
        driver_started("poll");
        access_denied("update");
        let timer = Timer::new("access.authorize.duration_ms");
        timer.stop();
        multiplexer_closed();
    }
}
