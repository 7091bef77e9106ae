use std::collections::HashMap;
use std::time::Instant;

use crate::decision::domain::action::{Action, Reason};

/// Cross-cutting logger for worker cycle events.
///
/// Keeps the worker loop free of output concerns; the server logs through
/// the `log` crate while tests plug in a silent logger.
pub trait PipelineLogger: Send {
    /// Report one completed cycle over `clients` frames.
    fn cycle(&mut self, clients: usize, duration_ms: f64);

    /// Record how long a named stage (lane) took for one cycle.
    fn timing(&mut self, stage: &str, duration_ms: f64);

    /// Count one decision.
    fn decision(&mut self, action: Action, reason: Reason);

    /// Log a human-readable status message.
    fn info(&mut self, message: &str);

    /// Emit an end-of-worker summary. Default: no-op.
    fn summary(&self) {}
}

/// Silent logger that discards all events.
pub struct NullPipelineLogger;

impl PipelineLogger for NullPipelineLogger {
    fn cycle(&mut self, _clients: usize, _duration_ms: f64) {}
    fn timing(&mut self, _stage: &str, _duration_ms: f64) {}
    fn decision(&mut self, _action: Action, _reason: Reason) {}
    fn info(&mut self, _message: &str) {}
}

/// `log`-backed logger that tracks per-stage timing and decision counts,
/// reporting a summary when the worker exits.
///
/// Cycle output is throttled to every `throttle_cycles` cycles.
pub struct LogPipelineLogger {
    label: String,
    throttle_cycles: usize,
    timings: HashMap<String, Vec<f64>>,
    decisions: HashMap<(Action, Reason), usize>,
    start_time: Instant,
    cycles: usize,
    frames: usize,
}

impl LogPipelineLogger {
    pub fn new(label: impl Into<String>, throttle_cycles: usize) -> Self {
        Self {
            label: label.into(),
            throttle_cycles: throttle_cycles.max(1),
            timings: HashMap::new(),
            decisions: HashMap::new(),
            start_time: Instant::now(),
            cycles: 0,
            frames: 0,
        }
    }

    /// Returns the formatted summary string, or `None` if nothing ran.
    pub fn summary_string(&self) -> Option<String> {
        if self.cycles == 0 {
            return None;
        }

        let elapsed_s = self.start_time.elapsed().as_secs_f64();
        let mut lines = vec![format!(
            "{} summary ({} cycles, {} frames, {elapsed_s:.1}s):",
            self.label, self.cycles, self.frames
        )];

        let mut stages: Vec<_> = self.timings.keys().collect();
        stages.sort();
        for stage in stages {
            let durations = &self.timings[stage];
            let total_ms: f64 = durations.iter().sum();
            let avg_ms = total_ms / durations.len().max(1) as f64;
            lines.push(format!("  {stage:12}: avg {avg_ms:6.1}ms  total {total_ms:7.0}ms"));
        }

        let mut outcomes: Vec<_> = self.decisions.iter().collect();
        outcomes.sort_by_key(|((a, r), _)| (a.evidence_name(), r.evidence_name()));
        for ((action, reason), count) in outcomes {
            lines.push(format!("  {action}/{reason}: {count}"));
        }

        Some(lines.join("\n"))
    }

    pub fn timings_for(&self, stage: &str) -> Option<&[f64]> {
        self.timings.get(stage).map(|v| v.as_slice())
    }

    pub fn decisions_for(&self, action: Action, reason: Reason) -> usize {
        self.decisions.get(&(action, reason)).copied().unwrap_or(0)
    }
}

impl PipelineLogger for LogPipelineLogger {
    fn cycle(&mut self, clients: usize, duration_ms: f64) {
        self.cycles += 1;
        self.frames += clients;
        if self.cycles % self.throttle_cycles == 0 {
            log::debug!(
                "{}: cycle {} processed {clients} frames in {duration_ms:.1}ms",
                self.label,
                self.cycles
            );
        }
    }

    fn timing(&mut self, stage: &str, duration_ms: f64) {
        self.timings
            .entry(stage.to_string())
            .or_default()
            .push(duration_ms);
    }

    fn decision(&mut self, action: Action, reason: Reason) {
        *self.decisions.entry((action, reason)).or_default() += 1;
    }

    fn info(&mut self, message: &str) {
        log::info!("{}: {message}", self.label);
    }

    fn summary(&self) {
        if let Some(text) = self.summary_string() {
            log::info!("\n\n{text}");
        }
    }
}
