// TIMELINE / EVENT SURFACE
//
// A structured, probabilistically-sampled event stream. The engine emits
// breath-start, pull, push, breath-end, sleep, and wakeup events through a
// `Timeline`; each carries a detail level (Severity), and whether an event
// actually gets logged depends on an "effective" level re-sampled once per
// breath.
//
// This keeps the average cost of tracing near zero (most breaths only
// unlock the coarsest, `Warning`, level) while still producing detailed
// traces often enough to catch rare conditions over a long run.
//
//   Severity - detail level of an event, from coarsest to finest
//   Timeline - per-engine sampler/emitter
//   Timeline::resample() - draw a fresh effective level for this breath
//   Timeline::emit(severity, event) - log `event` if unlocked this breath

use rand::Rng;

// Ordered from coarsest (always-on) to finest (vanishingly rare). The
// probabilities below are cumulative thresholds on a single draw in
// [0, 1): packet (1e-5), app (1e-4), trace (1e-2), info (1e-1), otherwise
// warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning = 0,
    Info = 1,
    Trace = 2,
    App = 3,
    Packet = 4,
}

impl Severity {
    fn to_log_level(self) -> log::Level {
        match self {
            Severity::Warning => log::Level::Warn,
            Severity::Info => log::Level::Info,
            Severity::Trace => log::Level::Debug,
            Severity::App | Severity::Packet => log::Level::Trace,
        }
    }
}

pub struct Timeline {
    effective: Severity,
}

impl Timeline {
    pub fn new() -> Self {
        Timeline { effective: Severity::Warning }
    }

    // Re-sample the effective severity for the upcoming breath.
    pub fn resample(&mut self) {
        let r: f64 = rand::thread_rng().gen();
        self.effective = if r < 1e-5 { Severity::Packet }
            else if r < 1e-4 { Severity::App }
            else if r < 1e-2 { Severity::Trace }
            else if r < 1e-1 { Severity::Info }
            else { Severity::Warning };
    }

    // Emit `event` if its severity is at or below the level unlocked for
    // this breath (i.e. no more detailed than what was sampled).
    pub fn emit(&self, severity: Severity, event: &str) {
        if severity <= self.effective {
            log::log!(target: "timeline", severity.to_log_level(), "{}", event);
        }
    }
}

impl Default for Timeline {
    fn default() -> Self { Timeline::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_events_always_emit() {
        // Warning is the coarsest level and the default effective level, so
        // it is always <= effective regardless of sampling.
        let t = Timeline::new();
        assert!(Severity::Warning <= t.effective);
    }

    #[test]
    fn severity_ordering_matches_detail_level() {
        assert!(Severity::Warning < Severity::Info);
        assert!(Severity::Info < Severity::Trace);
        assert!(Severity::Trace < Severity::App);
        assert!(Severity::App < Severity::Packet);
    }

    #[test]
    fn resample_picks_a_valid_severity() {
        let mut t = Timeline::new();
        for _ in 0..1000 {
            t.resample();
            assert!(t.effective >= Severity::Warning);
        }
    }
}
