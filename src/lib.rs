#![warn(clippy::all)]

//! Real-time piano-performance engine.
//!
//! A human pianist plays alongside pre-recorded score fragments. The
//! [`follow`] module tracks the performer's position in a reference
//! [`score`], the [`player`] and [`multi`] sequencers emit recorded MIDI
//! at sample-accurate times, [`preset`] maps score locations to DSP
//! parameter presets, and [`program`] sequences all of them across a
//! rehearsable segment list. Components communicate through the typed
//! [`record`] bus and are driven by a host that calls each `exec` once
//! per cycle.

pub mod error;
pub mod follow;
pub mod measure;
pub mod midi;
pub mod multi;
pub mod player;
pub mod preset;
pub mod program;
pub mod record;
pub mod score;
pub mod veltbl;

#[cfg(test)]
pub mod test_helpers;

use index_vec::define_index_type;

define_index_type! {
    /// Dense score location id. Unique and strictly monotone across the
    /// score; doubles as the index into per-location arenas.
    pub struct LocId = usize;
}

define_index_type! {
    /// Index into the score's event arena.
    pub struct EvtIdx = usize;
}

define_index_type! {
    /// Index into the score's set arena.
    pub struct SetIdx = usize;
}

define_index_type! {
    /// Index into the score's section arena.
    pub struct SectionIdx = usize;
}

pub use error::{Error, Result};

/// Ratio of elapsed performance time to elapsed score time between two
/// matches, clamped to a sane range so a single flam or hesitation cannot
/// blow up the onset prediction. Degenerate spans yield 1.0.
pub fn stretch_factor(d_score_sec: f64, d_perf_sec: f64) -> f64 {
    if d_score_sec <= 0.0 || d_perf_sec <= 0.0 {
        1.0
    } else {
        (d_perf_sec / d_score_sec).clamp(0.25, 4.0)
    }
}

/// Map an elapsed score duration into performance time.
pub fn stretch(d_sec: f64, factor: f64) -> f64 {
    d_sec * factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stretch_factor_is_perf_over_score() {
        assert_eq!(stretch_factor(1.0, 2.0), 2.0);
        assert_eq!(stretch_factor(2.0, 1.0), 0.5);
    }

    #[test]
    fn stretch_factor_guards_degenerate_spans() {
        assert_eq!(stretch_factor(0.0, 1.0), 1.0);
        assert_eq!(stretch_factor(1.0, 0.0), 1.0);
        assert_eq!(stretch_factor(0.001, 100.0), 4.0);
    }
}
