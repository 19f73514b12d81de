use std::fmt;

/// Stages reported by the long-running analysis loops.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AnalysisStage {
    PriceThresholdSearch,
    EvsiResampling,
}

impl AnalysisStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::PriceThresholdSearch => "probability-threshold price search",
            Self::EvsiResampling => "EVSI resampling",
        }
    }
}

impl fmt::Display for AnalysisStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress through an analysis stage.
pub trait AnalysisProgressObserver {
    fn on_stage_start(&mut self, stage: AnalysisStage, total_steps: usize) {
        let _ = (stage, total_steps);
    }
    fn on_stage_advance(&mut self, stage: AnalysisStage, completed_steps: usize) {
        let _ = (stage, completed_steps);
    }
    fn on_stage_finish(&mut self, stage: AnalysisStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl AnalysisProgressObserver for NoopProgress {}
