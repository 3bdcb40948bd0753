//! Process-wide prometheus metrics.

use once_cell::sync::{Lazy, OnceCell};
use prometheus::{
    histogram_opts, Histogram, IntCounter, IntCounterVec, Opts, Registry,
};
use tracing::error;

static GLOBAL_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
static REGISTER_ONCE: OnceCell<()> = OnceCell::new();

static RUNS: OnceCell<IntCounterVec> = OnceCell::new();
static STEPS: OnceCell<IntCounter> = OnceCell::new();
static CAPTCHA: OnceCell<IntCounterVec> = OnceCell::new();
static REPLAY_COMMANDS: OnceCell<IntCounterVec> = OnceCell::new();
static STEP_LATENCY: OnceCell<Histogram> = OnceCell::new();

pub fn global_registry() -> &'static Registry {
    &GLOBAL_REGISTRY
}

pub fn register_metrics() {
    REGISTER_ONCE.get_or_init(|| {
        let registry = global_registry();

        let runs = IntCounterVec::new(
            Opts::new("webpilot_runs_total", "Run lifecycle transitions"),
            &["outcome"],
        )
        .expect("create runs counter");
        register(registry, Box::new(runs.clone()));
        let _ = RUNS.set(runs);

        let steps = IntCounter::new("webpilot_steps_total", "Decision-loop steps executed")
            .expect("create steps counter");
        register(registry, Box::new(steps.clone()));
        let _ = STEPS.set(steps);

        let captcha = IntCounterVec::new(
            Opts::new("webpilot_captcha_total", "Captcha detections and outcomes"),
            &["event"],
        )
        .expect("create captcha counter");
        register(registry, Box::new(captcha.clone()));
        let _ = CAPTCHA.set(captcha);

        let replay = IntCounterVec::new(
            Opts::new("webpilot_replay_commands_total", "Replayed trace commands"),
            &["result"],
        )
        .expect("create replay counter");
        register(registry, Box::new(replay.clone()));
        let _ = REPLAY_COMMANDS.set(replay);

        let latency = Histogram::with_opts(histogram_opts!(
            "webpilot_step_latency_ms",
            "Wall time per decision-loop step (milliseconds)",
            vec![50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0]
        ))
        .expect("create step latency histogram");
        register(registry, Box::new(latency.clone()));
        let _ = STEP_LATENCY.set(latency);
    });
}

fn register(registry: &Registry, collector: Box<dyn prometheus::core::Collector>) {
    if let Err(err) = registry.register(collector) {
        error!(?err, "failed to register metric");
    }
}

pub fn record_run(outcome: &str) {
    register_metrics();
    if let Some(counter) = RUNS.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_step(latency_ms: f64) {
    register_metrics();
    if let Some(counter) = STEPS.get() {
        counter.inc();
    }
    if let Some(histogram) = STEP_LATENCY.get() {
        histogram.observe(latency_ms);
    }
}

pub fn record_captcha(event: &str) {
    register_metrics();
    if let Some(counter) = CAPTCHA.get() {
        counter.with_label_values(&[event]).inc();
    }
}

pub fn record_replay_command(result: &str) {
    register_metrics();
    if let Some(counter) = REPLAY_COMMANDS.get() {
        counter.with_label_values(&[result]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        register_metrics();
        register_metrics();
        record_run("completed");
        record_step(12.5);
        record_captcha("detected");
        record_replay_command("ok");
        let families = global_registry().gather();
        assert!(families
            .iter()
            .any(|family| family.get_name() == "webpilot_runs_total"));
    }
}
