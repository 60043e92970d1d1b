//! Threshold step detection on raw acceleration magnitude.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{MotionSample, DEFAULT_STEP_THRESHOLD};

/// How threshold crossings are turned into steps.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepTrigger {
    /// Every sample above the threshold is a step. Sustained shaking counts
    /// once per sample.
    PerSample,
    /// One step per upward crossing of the threshold.
    RisingEdge,
}

impl Default for StepTrigger {
    fn default() -> Self {
        StepTrigger::PerSample
    }
}

#[derive(Clone, Debug)]
pub struct StepDetector {
    threshold: f64,
    trigger: StepTrigger,
    above: bool,
    rejected: u64,
}

impl Default for StepDetector {
    fn default() -> Self {
        Self::new(DEFAULT_STEP_THRESHOLD, StepTrigger::PerSample)
    }
}

impl StepDetector {
    pub fn new(threshold: f64, trigger: StepTrigger) -> Self {
        Self {
            threshold,
            trigger,
            above: false,
            rejected: 0,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn trigger(&self) -> StepTrigger {
        self.trigger
    }

    /// Number of non-finite samples dropped so far.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Evaluate one sample. Returns true iff it registers a new step.
    ///
    /// Session gating is the caller's job; the detector only applies the
    /// threshold rule.
    pub fn observe(&mut self, sample: &MotionSample) -> bool {
        if !sample.is_finite() {
            self.rejected += 1;
            debug!(?sample, "dropping non-finite motion sample");
            return false;
        }
        let over = sample.magnitude() > self.threshold;
        let step = match self.trigger {
            StepTrigger::PerSample => over,
            StepTrigger::RisingEdge => over && !self.above,
        };
        self.above = over;
        step
    }

    /// Forget edge state, e.g. when a new session begins.
    pub fn reset(&mut self) {
        self.above = false;
    }
}
