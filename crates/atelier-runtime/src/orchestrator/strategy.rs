//! Per-iteration strategy selection and plateau detection.

use atelier_kernel::judge::Severity;
use atelier_kernel::request::GenerationMode;
use tracing::warn;

/// How the next iteration produces candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Regenerate,
    Edit,
}

/// Scores within this band over the last three iterations suggest editing
/// instead of regenerating.
const EDIT_PLATEAU_BAND: f64 = 3.0;

/// Score above which editing becomes viable at all.
const EDIT_MIN_SCORE: f64 = 50.0;

/// Score above which a flat stretch switches to editing.
const EDIT_PLATEAU_MIN_SCORE: f64 = 65.0;

/// Edits in a row before MIXED mode forces a regeneration.
const MAX_CONSECUTIVE_EDITS: u32 = 3;

/// Consecutive edits after which pure EDIT mode logs a warning.
const EDIT_MODE_WARN_AFTER: u32 = 5;

/// Inputs to strategy selection, all derived from committed history.
#[derive(Debug, Clone)]
pub struct StrategyInputs {
    pub mode: GenerationMode,
    /// 1-based iteration about to run.
    pub iteration: u32,
    pub last_score: Option<f64>,
    pub last_top_severity: Option<Severity>,
    pub consecutive_edit_count: u32,
    /// Committed aggregate scores, oldest first.
    pub scores: Vec<f64>,
}

/// Choose the strategy for the next iteration.
///
/// Pure modes override: REGENERATION always regenerates; EDIT forces edits
/// from iteration 2 onward (the first iteration has no source image). In
/// MIXED mode editing is reserved for decent, mildly flawed images and for
/// high plateaus.
pub fn select_strategy(inputs: &StrategyInputs) -> Strategy {
    match inputs.mode {
        GenerationMode::Regeneration => Strategy::Regenerate,
        GenerationMode::Edit => {
            if inputs.iteration < 2 {
                return Strategy::Regenerate;
            }
            if inputs.consecutive_edit_count >= EDIT_MODE_WARN_AFTER {
                warn!(
                    consecutive_edits = inputs.consecutive_edit_count,
                    "EDIT mode has run many consecutive edits; honoring the mode anyway"
                );
            }
            Strategy::Edit
        }
        GenerationMode::Mixed => select_mixed(inputs),
    }
}

fn select_mixed(inputs: &StrategyInputs) -> Strategy {
    let Some(score) = inputs.last_score else {
        return Strategy::Regenerate; // iteration 1
    };

    if inputs.iteration <= 1
        || score < EDIT_MIN_SCORE
        || inputs.consecutive_edit_count >= MAX_CONSECUTIVE_EDITS
    {
        return Strategy::Regenerate;
    }

    if inputs
        .last_top_severity
        .map(Severity::is_blocking)
        .unwrap_or(false)
    {
        return Strategy::Regenerate;
    }

    // Flat recent scores at a decent level: small corrections beat rerolls.
    if score >= EDIT_PLATEAU_MIN_SCORE && is_flat(&inputs.scores, 3, EDIT_PLATEAU_BAND) {
        return Strategy::Edit;
    }

    if score >= EDIT_MIN_SCORE
        && matches!(
            inputs.last_top_severity,
            Some(Severity::Moderate) | Some(Severity::Minor) | None
        )
    {
        return Strategy::Edit;
    }

    Strategy::Regenerate
}

/// Whether the last `window` scores span less than `band`.
fn is_flat(scores: &[f64], window: usize, band: f64) -> bool {
    if scores.len() < window {
        return false;
    }
    let tail = &scores[scores.len() - window..];
    let max = tail.iter().cloned().fold(f64::MIN, f64::max);
    let min = tail.iter().cloned().fold(f64::MAX, f64::min);
    max - min < band
}

/// Diminishing-returns detection over committed aggregate scores.
///
/// Declared when the last `window_size` scores (including the current
/// iteration) span less than `threshold * 100`. The threshold is stored as
/// a fraction of the 0–100 scale.
pub fn is_plateaued(scores: &[f64], window_size: usize, threshold: f64) -> bool {
    let window = window_size.max(2);
    if scores.len() < window {
        return false;
    }
    let tail = &scores[scores.len() - window..];
    let max = tail.iter().cloned().fold(f64::MIN, f64::max);
    let min = tail.iter().cloned().fold(f64::MAX, f64::min);
    max - min < threshold * 100.0
}
