//! Step timing for long-running jobs

use std::time::{Duration, Instant};
use tracing::info;

/// Collects elapsed time per named step and logs a summary
#[derive(Debug)]
pub struct JobTimer {
    job: String,
    started: Instant,
    steps: Vec<(String, Duration)>,
}

impl JobTimer {
    pub fn start(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            started: Instant::now(),
            steps: Vec::new(),
        }
    }

    /// Run `f` as a named step and record how long it took
    pub fn step<T>(&mut self, name: impl Into<String>, f: impl FnOnce() -> T) -> T {
        let begin = Instant::now();
        let out = f();
        self.record(name, begin.elapsed());
        out
    }

    pub fn record(&mut self, name: impl Into<String>, elapsed: Duration) {
        let name = name.into();
        info!(job = %self.job, step = %name, elapsed_ms = elapsed.as_millis() as u64, "[time] step finished");
        self.steps.push((name, elapsed));
    }

    pub fn steps(&self) -> &[(String, Duration)] {
        &self.steps
    }

    pub fn total(&self) -> Duration {
        self.started.elapsed()
    }

    /// Log one line per step plus the total, then hand back the total
    pub fn finish(self) -> Duration {
        for (name, elapsed) in &self.steps {
            info!(job = %self.job, step = %name, elapsed = %format_duration(*elapsed), "[time]");
        }
        let total = self.total();
        info!(job = %self.job, total = %format_duration(total), "[time] job finished");
        total
    }
}

/// `h:mm:ss.mmm`
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    let secs = millis / 1000;
    format!(
        "{}:{:02}:{:02}.{:03}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        millis % 1000
    )
}
