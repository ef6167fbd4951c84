//! Weighted multi-stage progress tracking for a single render job.
//!
//! Every job walks the same seven [`Stage`]s. Each stage owns a fixed share
//! of the 0..=100 range; the tracker folds stage completion and the current
//! stage's fractional progress into one integer and pushes throttled
//! [`ProgressUpdate`]s to a sink.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The seven phases of the render pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initializing,
    FetchingAssets,
    SynthesizingVoice,
    GeneratingTones,
    Mixing,
    Normalizing,
    Publishing,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Initializing,
        Stage::FetchingAssets,
        Stage::SynthesizingVoice,
        Stage::GeneratingTones,
        Stage::Mixing,
        Stage::Normalizing,
        Stage::Publishing,
    ];

    /// Share of total progress owned by this stage. The weights sum to 100.
    pub fn weight(self) -> u32 {
        match self {
            Stage::Initializing => 5,
            Stage::FetchingAssets => 10,
            Stage::SynthesizingVoice => 30,
            Stage::GeneratingTones => 10,
            Stage::Mixing => 25,
            Stage::Normalizing => 10,
            Stage::Publishing => 10,
        }
    }

    pub fn index(self) -> usize {
        Stage::ALL
            .iter()
            .position(|s| *s == self)
            .unwrap_or_default()
    }

    pub fn next(self) -> Option<Stage> {
        Stage::ALL.get(self.index() + 1).copied()
    }

    pub fn default_message(self) -> &'static str {
        match self {
            Stage::Initializing => "Validating job",
            Stage::FetchingAssets => "Fetching background assets",
            Stage::SynthesizingVoice => "Synthesizing narration",
            Stage::GeneratingTones => "Generating tones",
            Stage::Mixing => "Mixing layers",
            Stage::Normalizing => "Normalizing loudness",
            Stage::Publishing => "Encoding and uploading",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Initializing => write!(f, "INITIALIZING"),
            Stage::FetchingAssets => write!(f, "FETCHING_ASSETS"),
            Stage::SynthesizingVoice => write!(f, "SYNTHESIZING_VOICE"),
            Stage::GeneratingTones => write!(f, "GENERATING_TONES"),
            Stage::Mixing => write!(f, "MIXING"),
            Stage::Normalizing => write!(f, "NORMALIZING"),
            Stage::Publishing => write!(f, "PUBLISHING"),
        }
    }
}

/// One progress notification delivered to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub progress: u8,
    pub stage: Option<Stage>,
    pub message: String,
}

/// An error recorded against a stage. Does not move progress.
#[derive(Debug, Clone, PartialEq)]
pub struct StageError {
    pub stage: Option<Stage>,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct StageState {
    fraction: f64,
    completed: bool,
    started_at: Option<Instant>,
    duration: Option<Duration>,
}

pub type ProgressSink = Box<dyn Fn(&ProgressUpdate) + Send + Sync>;

pub struct ProgressTracker {
    stages: [StageState; 7],
    current: Option<Stage>,
    auto_advance: bool,
    throttle: Duration,
    last_emit: Option<Instant>,
    last_reported: u8,
    finished: bool,
    custom_message: Option<String>,
    errors: Vec<StageError>,
    sink: Option<ProgressSink>,
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("current", &self.current)
            .field("last_reported", &self.last_reported)
            .field("errors", &self.errors.len())
            .finish()
    }
}

impl ProgressTracker {
    pub fn new(throttle: Duration, auto_advance: bool) -> Self {
        Self {
            stages: Default::default(),
            current: None,
            auto_advance,
            throttle,
            last_emit: None,
            last_reported: 0,
            finished: false,
            custom_message: None,
            errors: Vec::new(),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: impl Fn(&ProgressUpdate) + Send + Sync + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn current_stage(&self) -> Option<Stage> {
        self.current
    }

    /// Enter `stage`. A no-op when it is already current.
    ///
    /// In auto-advance mode the previous stage is completed first.
    pub fn start_stage(&mut self, stage: Stage) {
        if self.current == Some(stage) {
            return;
        }
        if let Some(prev) = self.current
            && self.auto_advance
        {
            self.mark_complete(prev);
        }
        let state = &mut self.stages[stage.index()];
        state.fraction = 0.0;
        state.completed = false;
        state.started_at = Some(Instant::now());
        state.duration = None;
        self.current = Some(stage);
        self.emit(true);
    }

    /// Set the current stage's fractional progress, clamped to [0, 1].
    pub fn update_fraction(&mut self, fraction: f64) {
        let Some(stage) = self.current else {
            return;
        };
        let clamped = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        self.stages[stage.index()].fraction = clamped;
        self.emit(false);
    }

    /// Complete the current stage and, in auto-advance mode, enter the next.
    pub fn complete_stage(&mut self) {
        let Some(stage) = self.current else {
            return;
        };
        self.mark_complete(stage);
        match (self.auto_advance, stage.next()) {
            (true, Some(next)) => {
                self.current = None;
                self.start_stage(next);
            }
            _ => {
                self.current = None;
                self.emit(true);
            }
        }
    }

    /// Mark every stage complete and report 100. Only for successful jobs.
    pub fn finish(&mut self) {
        for stage in Stage::ALL {
            self.mark_complete(stage);
        }
        self.current = None;
        self.finished = true;
        self.custom_message = None;
        self.emit(true);
    }

    /// Overlay a custom message on the stage default until cleared.
    pub fn set_message(&mut self, message: impl Into<String>) {
        let message = message.into();
        if self.custom_message.as_deref() == Some(message.as_str()) {
            return;
        }
        self.custom_message = Some(message);
        self.emit(true);
    }

    pub fn clear_message(&mut self) {
        if self.custom_message.take().is_some() {
            self.emit(true);
        }
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(StageError {
            stage: self.current,
            message: message.into(),
            at: Utc::now(),
        });
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[StageError] {
        &self.errors
    }

    pub fn stage_duration(&self, stage: Stage) -> Option<Duration> {
        self.stages[stage.index()].duration
    }

    /// Clear all stage progress and the error log.
    pub fn reset(&mut self) {
        self.stages = Default::default();
        self.current = None;
        self.last_emit = None;
        self.last_reported = 0;
        self.finished = false;
        self.custom_message = None;
        self.errors.clear();
    }

    /// Weighted total in 0..=100, rounded.
    ///
    /// Stays below 100 until [`finish`](Self::finish) is called.
    pub fn total_progress(&self) -> u8 {
        let current_index = self.current.map(Stage::index);
        let mut total = 0.0;
        for stage in Stage::ALL {
            let state = &self.stages[stage.index()];
            let before_current = current_index.is_some_and(|i| stage.index() < i);
            if state.completed || before_current {
                total += f64::from(stage.weight());
            } else if Some(stage) == self.current {
                total += f64::from(stage.weight()) * state.fraction;
            }
        }
        let rounded = total.round().clamp(0.0, 100.0) as u8;
        if self.finished { 100 } else { rounded.min(99) }
    }

    pub fn message(&self) -> String {
        if let Some(custom) = &self.custom_message {
            return custom.clone();
        }
        match self.current {
            Some(stage) => stage.default_message().to_string(),
            None if self.finished => "Completed".to_string(),
            None => "Waiting".to_string(),
        }
    }

    fn mark_complete(&mut self, stage: Stage) {
        let state = &mut self.stages[stage.index()];
        if state.completed {
            return;
        }
        state.fraction = 1.0;
        state.completed = true;
        state.duration = state.started_at.map(|t| t.elapsed());
    }

    fn emit(&mut self, force: bool) {
        let now = Instant::now();
        let due = self
            .last_emit
            .is_none_or(|last| now.duration_since(last) >= self.throttle);
        if !force && !due {
            return;
        }
        // Reported progress never moves backwards.
        let progress = self.total_progress().max(self.last_reported);
        self.last_reported = progress;
        self.last_emit = Some(now);
        if let Some(sink) = &self.sink {
            sink(&ProgressUpdate {
                progress,
                stage: self.current,
                message: self.message(),
            });
        }
    }
}
