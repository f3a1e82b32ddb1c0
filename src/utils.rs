use std::collections::VecDeque;
use std::time::Duration;

use crate::analysis::{AnalysisResult, Detections};

/// Fixed window mean over the last `period` durations.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: VecDeque<Duration>,
    sum: Duration,
    period: usize,
}

impl MovingAverage {
    pub fn new(period: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(period + 1),
            sum: Duration::ZERO,
            period: period.max(1),
        }
    }

    pub fn push(&mut self, value: Duration) {
        self.sum += value;
        self.window.push_back(value);

        if self.window.len() > self.period {
            if let Some(oldest) = self.window.pop_front() {
                self.sum -= oldest;
            }
        }
    }

    pub fn is_full(&self) -> bool {
        self.window.len() == self.period
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Mean in milliseconds, only once the window is full.
    pub fn average_ms(&self) -> Option<f32> {
        if !self.is_full() {
            return None;
        }
        Some(self.sum.as_secs_f32() * 1000.0 / self.period as f32)
    }
}

pub fn format_ms(duration: Duration) -> String {
    format!("{}ms", duration.as_millis())
}

pub fn format_avg_ms(avg_ms: f32) -> String {
    format!("avg:{:.0}ms", avg_ms)
}

/// Frames per second implied by one analysis. Durations below 1ms count as 1ms.
pub fn format_fps(analysis_duration: Duration) -> String {
    let ms = analysis_duration.as_millis().max(1) as f32;
    format!("{:.1}FPS", 1000.0 / ms)
}

pub fn format_score(score: f32) -> String {
    format!("{:.2}", score)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub name: String,
    pub score: String,
}

/// Text shown for one analysis result.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentedResult {
    pub rows: Vec<ResultRow>,
    pub ms_text: String,
    pub fps_text: String,
    /// Absent until the moving average window has filled.
    pub avg_text: Option<String>,
}

/// Turns analysis results into display rows and keeps the rolling forward latency.
#[derive(Debug, Clone)]
pub struct ResultPresenter {
    moving_avg: MovingAverage,
}

impl ResultPresenter {
    pub fn new(moving_avg_period: usize) -> Self {
        Self {
            moving_avg: MovingAverage::new(moving_avg_period),
        }
    }

    pub fn apply(&mut self, result: &AnalysisResult) -> PresentedResult {
        self.moving_avg.push(result.module_forward_duration);

        let rows = match &result.detections {
            Detections::Classes(classes) => classes
                .iter()
                .map(|c| ResultRow {
                    name: c.label.clone(),
                    score: format_score(c.score),
                })
                .collect(),
            Detections::Faces(faces) => faces
                .iter()
                .enumerate()
                .map(|(i, f)| ResultRow {
                    name: format!("face {}", i + 1),
                    score: format_score(f.score),
                })
                .collect(),
        };

        PresentedResult {
            rows,
            ms_text: format_ms(result.module_forward_duration),
            fps_text: format_fps(result.analysis_duration),
            avg_text: self.moving_avg.average_ms().map(format_avg_ms),
        }
    }
}
