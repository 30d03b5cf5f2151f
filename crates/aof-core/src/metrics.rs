//! Prometheus metrics registry.
//!
//! Gauges are recomputed from each poll snapshot; counters accumulate for
//! the process lifetime. `encode` produces the text exposition served at
//! `GET /metrics`.

use std::collections::HashMap;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

/// All metrics exported by the engine.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// `aof_tasks_total{state, agent}`
    pub tasks_total: IntGaugeVec,
    /// `aof_scheduler_up`
    pub scheduler_up: IntGauge,
    /// `aof_scheduler_loop_duration_seconds`
    pub loop_duration: Histogram,
    /// `aof_scheduler_poll_failures_total`
    pub poll_failures: IntCounter,
    /// `aof_gate_timeouts_total{project, workflow, gate}`
    pub gate_timeouts: IntCounterVec,
    /// `aof_gate_escalations_total{project, workflow, gate, to_role}`
    pub gate_escalations: IntCounterVec,
    /// `aof_dispatch_failures_total{agent}`
    pub dispatch_failures: IntCounterVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let tasks_total = IntGaugeVec::new(
            Opts::new("aof_tasks_total", "Tasks by state and routed agent"),
            &["state", "agent"],
        )?;
        let scheduler_up = IntGauge::new("aof_scheduler_up", "1 while the scheduler is running")?;
        let loop_duration = Histogram::with_opts(HistogramOpts::new(
            "aof_scheduler_loop_duration_seconds",
            "Wall time of one scheduler poll",
        ))?;
        let poll_failures = IntCounter::new(
            "aof_scheduler_poll_failures_total",
            "Polls that failed or timed out",
        )?;
        let gate_timeouts = IntCounterVec::new(
            Opts::new("aof_gate_timeouts_total", "Gate timeouts observed"),
            &["project", "workflow", "gate"],
        )?;
        let gate_escalations = IntCounterVec::new(
            Opts::new(
                "aof_gate_escalations_total",
                "Gate timeouts that escalated to another role",
            ),
            &["project", "workflow", "gate", "to_role"],
        )?;
        let dispatch_failures = IntCounterVec::new(
            Opts::new("aof_dispatch_failures_total", "Failed dispatch attempts"),
            &["agent"],
        )?;

        registry.register(Box::new(tasks_total.clone()))?;
        registry.register(Box::new(scheduler_up.clone()))?;
        registry.register(Box::new(loop_duration.clone()))?;
        registry.register(Box::new(poll_failures.clone()))?;
        registry.register(Box::new(gate_timeouts.clone()))?;
        registry.register(Box::new(gate_escalations.clone()))?;
        registry.register(Box::new(dispatch_failures.clone()))?;

        Ok(Self {
            registry,
            tasks_total,
            scheduler_up,
            loop_duration,
            poll_failures,
            gate_timeouts,
            gate_escalations,
            dispatch_failures,
        })
    }

    /// Replace the task gauges with a fresh `(state, agent) -> count` map.
    pub fn set_task_gauges(&self, counts: &HashMap<(String, String), i64>) {
        self.tasks_total.reset();
        for ((state, agent), count) in counts {
            self.tasks_total
                .with_label_values(&[state.as_str(), agent.as_str()])
                .set(*count);
        }
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::error!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
