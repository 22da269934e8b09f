//! Real-time score follower.
//!
//! The follower keeps a floating-point expectation envelope over score
//! locations. Every accepted match adds an affinity bump centered on the
//! matched location; every cycle decays the envelope inside the current
//! search window. Candidates for a new live note are collected from the
//! search window and scored by expectation weight minus an onset-time
//! penalty; a gauntlet of distance gates rejects implausible jumps.

use crate::error::{Error, Result};
use crate::score::Score;
use crate::{stretch, stretch_factor, LocId};
use index_vec::IndexVec;
use log::{debug, info};

/// Tracking window and rejection thresholds.
#[derive(Clone, Copy, Debug)]
pub struct FollowArgs {
    /// Look-back affinity duration, seconds.
    pub pre_affinity_sec: f64,
    /// Look-forward affinity duration, seconds.
    pub post_affinity_sec: f64,
    /// Minimum location count on each side of the affinity window.
    pub min_affinity_loc_cnt: usize,
    /// Look-back search duration, seconds.
    pub pre_wnd_sec: f64,
    /// Look-forward search duration, seconds.
    pub post_wnd_sec: f64,
    /// Minimum location count on each side of the search window.
    pub min_wnd_loc_cnt: usize,
    /// Per-cycle decay applied to the envelope inside the search window.
    pub decay_coeff: f64,
    pub d_sec_err_thresh_lo: f64,
    pub d_loc_thresh_lo: i64,
    pub d_sec_err_thresh_hi: f64,
    pub d_loc_thresh_hi: i64,
    /// Matches farther than this from the expected location do not update
    /// the time-alignment statistics.
    pub d_loc_stats_thresh: i64,
}

impl Default for FollowArgs {
    fn default() -> Self {
        Self {
            pre_affinity_sec: 1.0,
            post_affinity_sec: 3.0,
            min_affinity_loc_cnt: 2,
            pre_wnd_sec: 2.0,
            post_wnd_sec: 5.0,
            min_wnd_loc_cnt: 2,
            decay_coeff: 0.995,
            d_sec_err_thresh_lo: 0.4,
            d_loc_thresh_lo: 3,
            d_sec_err_thresh_hi: 1.5,
            d_loc_thresh_hi: 7,
            d_loc_stats_thresh: 3,
        }
    }
}

/// A matched live note.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OnNote {
    pub loc: LocId,
    pub meas: u32,
    pub score_vel: u8,
}

/// Tracking summary for one performance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    /// Count of matched notes.
    pub match_n: u32,
    /// Count of note-on locations inside the tracked range never matched.
    pub miss_n: u32,
    /// Count of live notes with no acceptable candidate.
    pub spurious_n: u32,
    /// Count of calls to `on_new_note`.
    pub perf_note_n: u32,
}

/// The last match accepted for time-alignment statistics; anchors the
/// mapping between performance time and score time.
#[derive(Clone, Copy, Debug)]
struct Anchor {
    perf_sec: f64,
    score_sec: f64,
}

pub struct Follower<'a> {
    score: &'a Score,
    args: FollowArgs,
    /// Expectation envelope, one weight per score location.
    exp_v: IndexVec<LocId, f64>,
    /// Onset time per location, carried forward over event-free locations.
    loc_sec: IndexVec<LocId, f64>,
    loc_matched: IndexVec<LocId, bool>,
    beg_loc: LocId,
    end_loc: LocId,
    expected_loc: LocId,
    anchor: Option<Anchor>,
    stretch_factor: f64,
    enable_fl: bool,
    match_n: u32,
    spurious_n: u32,
    perf_note_n: u32,
}

struct Candidate {
    loc: LocId,
    meas: u32,
    score_vel: u8,
    sec: f64,
    weight: f64,
    d_loc: i64,
    d_sec_err: f64,
}

impl<'a> Follower<'a> {
    pub fn new(args: FollowArgs, score: &'a Score) -> Result<Self> {
        if score.loc_count() == 0 {
            return Err(Error::InvalidArg("the score is empty".to_string()));
        }
        if !(0.0..1.0).contains(&args.decay_coeff) {
            return Err(Error::InvalidArg(format!(
                "the decay coefficient {} is outside (0,1)",
                args.decay_coeff
            )));
        }

        // fill onset times, carrying the previous time over silent locations
        let mut loc_sec = IndexVec::with_capacity(score.loc_count());
        let mut last = 0.0;
        for i in 0..score.loc_count() {
            if let Some(sec) = score.loc_sec(LocId::from(i)) {
                last = sec;
            }
            loc_sec.push(last);
        }

        let end_loc = score.max_loc_id().unwrap_or(LocId::from(0usize));
        Ok(Self {
            score,
            args,
            exp_v: IndexVec::from_vec(vec![0.0; score.loc_count()]),
            loc_sec,
            loc_matched: IndexVec::from_vec(vec![false; score.loc_count()]),
            beg_loc: LocId::from(0usize),
            end_loc,
            expected_loc: LocId::from(0usize),
            anchor: None,
            stretch_factor: 1.0,
            enable_fl: true,
            match_n: 0,
            spurious_n: 0,
            perf_note_n: 0,
        })
    }

    /// Clamp tracking to `[beg_loc, end_loc]` and clear the envelope and
    /// alignment state. The summary counters survive across resets.
    pub fn reset(&mut self, beg_loc: LocId, end_loc: LocId) -> Result<()> {
        let max = self.score.max_loc_id().unwrap_or(LocId::from(0usize));
        if beg_loc > end_loc || end_loc > max {
            return Err(Error::InvalidId(format!(
                "the reset range {}..={} is outside the score (max loc {})",
                usize::from(beg_loc),
                usize::from(end_loc),
                usize::from(max)
            )));
        }
        self.beg_loc = beg_loc;
        self.end_loc = end_loc;
        self.expected_loc = beg_loc;
        self.anchor = None;
        self.stretch_factor = 1.0;
        for w in self.exp_v.iter_mut() {
            *w = 0.0;
        }
        info!(
            "follower reset: {}..={}",
            usize::from(beg_loc),
            usize::from(end_loc)
        );
        Ok(())
    }

    pub fn set_enable(&mut self, enable_fl: bool) {
        self.enable_fl = enable_fl;
        info!("follower enable: {}", enable_fl);
    }

    pub fn enabled(&self) -> bool {
        self.enable_fl
    }

    pub fn max_loc_id(&self) -> LocId {
        self.score.max_loc_id().unwrap_or(LocId::from(0usize))
    }

    /// Process one live note-on. Returns the matched location, or `None`
    /// when the note is spurious, outside the tracked range, or rejected
    /// by the distance gates. At most one location is emitted per note.
    pub fn on_new_note(&mut self, uid: u32, sec: f64, pitch: u8, vel: u8) -> Option<OnNote> {
        if !self.enable_fl {
            return None;
        }
        self.perf_note_n += 1;

        let best = match self.best_candidate(sec, pitch) {
            Some(c) => c,
            None => {
                self.spurious_n += 1;
                debug!(
                    "note uid:{} pitch:{} vel:{} sec:{:.3}: no candidate",
                    uid, pitch, vel, sec
                );
                return None;
            }
        };

        if self.is_rejected(&best) {
            self.spurious_n += 1;
            debug!(
                "note uid:{} pitch:{} sec:{:.3}: rejected d_loc:{} d_sec_err:{:.3}",
                uid, pitch, sec, best.d_loc, best.d_sec_err
            );
            return None;
        }

        // the match is accepted: bump the envelope and re-center tracking
        self.add_affinity(best.loc);
        self.expected_loc = best.loc;
        self.loc_matched[best.loc] = true;
        self.match_n += 1;

        // only near matches feed the onset-time prediction
        if best.d_loc.abs() <= self.args.d_loc_stats_thresh {
            if let Some(a) = self.anchor {
                self.stretch_factor = stretch_factor(best.sec - a.score_sec, sec - a.perf_sec);
            }
            self.anchor = Some(Anchor {
                perf_sec: sec,
                score_sec: best.sec,
            });
        }

        debug!(
            "note uid:{} pitch:{} sec:{:.3} -> loc:{} d_loc:{} d_sec_err:{:.3}",
            uid,
            pitch,
            sec,
            usize::from(best.loc),
            best.d_loc,
            best.d_sec_err
        );

        Some(OnNote {
            loc: best.loc,
            meas: best.meas,
            score_vel: best.score_vel,
        })
    }

    /// Cycle tick: decay the envelope inside the current search window.
    pub fn do_exec(&mut self) {
        let (lo, hi) = self.search_window();
        for i in usize::from(lo)..=usize::from(hi) {
            self.exp_v[LocId::from(i)] *= self.args.decay_coeff;
        }
    }

    pub fn report_summary(&self) -> Summary {
        let mut miss_n = 0;
        let last = self
            .loc_matched
            .iter_enumerated()
            .filter(|(_, m)| **m)
            .map(|(l, _)| l)
            .last();
        if let Some(last) = last {
            for i in usize::from(self.beg_loc)..=usize::from(last) {
                let loc = LocId::from(i);
                let has_note_on = self
                    .score
                    .evts_at(loc)
                    .iter()
                    .any(|&ei| self.score.event(ei).is_note_on());
                if has_note_on && !self.loc_matched[loc] {
                    miss_n += 1;
                }
            }
        }
        Summary {
            match_n: self.match_n,
            miss_n,
            spurious_n: self.spurious_n,
            perf_note_n: self.perf_note_n,
        }
    }

    /// Predicted performance time of a score onset, through the anchor and
    /// the current stretch factor.
    fn predict_perf_sec(&self, score_sec: f64) -> f64 {
        match self.anchor {
            Some(a) => a.perf_sec + stretch(score_sec - a.score_sec, self.stretch_factor),
            // before the first match score time maps onto performance time
            None => score_sec,
        }
    }

    /// The search window as an inclusive location range, widened to the
    /// configured minimum location counts and clamped to the reset range.
    fn search_window(&self) -> (LocId, LocId) {
        self.window(
            self.expected_loc,
            self.args.pre_wnd_sec,
            self.args.post_wnd_sec,
            self.args.min_wnd_loc_cnt,
        )
    }

    fn affinity_window(&self, center: LocId) -> (LocId, LocId) {
        self.window(
            center,
            self.args.pre_affinity_sec,
            self.args.post_affinity_sec,
            self.args.min_affinity_loc_cnt,
        )
    }

    fn window(&self, center: LocId, pre_sec: f64, post_sec: f64, min_loc_cnt: usize) -> (LocId, LocId) {
        let center_sec = self.loc_sec[center];
        let center = usize::from(center);
        let beg = usize::from(self.beg_loc);
        let end = usize::from(self.end_loc);

        let mut lo = center;
        while lo > beg
            && (self.loc_sec[LocId::from(lo - 1)] >= center_sec - pre_sec
                || center - (lo - 1) <= min_loc_cnt)
        {
            lo -= 1;
        }

        let mut hi = center;
        while hi < end
            && (self.loc_sec[LocId::from(hi + 1)] <= center_sec + post_sec
                || (hi + 1) - center <= min_loc_cnt)
        {
            hi += 1;
        }

        (LocId::from(lo), LocId::from(hi))
    }

    /// Score every pitch-matching note-on inside the search window and
    /// return the winner. Ties break toward the smaller location jump,
    /// then the smaller onset error.
    fn best_candidate(&self, perf_sec: f64, pitch: u8) -> Option<Candidate> {
        let (lo, hi) = self.search_window();
        let expected = usize::from(self.expected_loc) as i64;
        let mut best: Option<(f64, Candidate)> = None;

        for i in usize::from(lo)..=usize::from(hi) {
            let loc = LocId::from(i);
            for &ei in self.score.evts_at(loc) {
                let evt = self.score.event(ei);
                if !evt.is_note_on() || evt.pitch != pitch {
                    continue;
                }
                let d_sec_err = perf_sec - self.predict_perf_sec(evt.sec);
                let cand = Candidate {
                    loc,
                    meas: evt.meas,
                    score_vel: evt.d1,
                    sec: evt.sec,
                    weight: self.exp_v[loc],
                    d_loc: i as i64 - expected,
                    d_sec_err,
                };
                let score = cand.weight - d_sec_err.abs();
                let better = match &best {
                    None => true,
                    Some((best_score, best_cand)) => {
                        score > *best_score
                            || (score == *best_score
                                && (cand.d_loc.abs() < best_cand.d_loc.abs()
                                    || (cand.d_loc.abs() == best_cand.d_loc.abs()
                                        && cand.d_sec_err.abs() < best_cand.d_sec_err.abs())))
                    }
                };
                if better {
                    best = Some((score, cand));
                }
            }
        }

        best.map(|(_, c)| c)
    }

    fn is_rejected(&self, c: &Candidate) -> bool {
        let a = &self.args;
        // both low thresholds violated
        if c.d_loc.abs() > a.d_loc_thresh_lo && c.d_sec_err.abs() > a.d_sec_err_thresh_lo {
            return true;
        }
        // far outside the expected location
        if c.d_loc.abs() > a.d_loc_thresh_hi {
            return true;
        }
        // far outside the expected time, and not at the expected location
        if c.d_sec_err.abs() > a.d_sec_err_thresh_hi && c.d_loc != 0 {
            return true;
        }
        false
    }

    /// Add a triangular affinity bump centered on the matched location.
    fn add_affinity(&mut self, match_loc: LocId) {
        let (lo, hi) = self.affinity_window(match_loc);
        let center = usize::from(match_loc) as f64;
        let span_lo = (center - usize::from(lo) as f64).max(1.0);
        let span_hi = (usize::from(hi) as f64 - center).max(1.0);
        for i in usize::from(lo)..=usize::from(hi) {
            let d = i as f64 - center;
            let w = if d < 0.0 {
                1.0 + d / span_lo
            } else {
                1.0 - d / span_hi
            };
            self.exp_v[LocId::from(i)] += w.max(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::note_score;

    fn smoke_score() -> Score {
        // four notes at locs 0..=3, onsets every half second
        note_score(&[(0, 0.0, 60), (1, 0.5, 62), (2, 1.0, 64), (3, 1.5, 65)])
    }

    #[test]
    fn follows_a_clean_performance() {
        let score = smoke_score();
        let mut sf = Follower::new(FollowArgs::default(), &score).unwrap();
        let played = [(0.02, 60u8), (0.51, 62), (1.01, 64), (1.52, 65)];
        let locs: Vec<usize> = played
            .iter()
            .enumerate()
            .filter_map(|(uid, &(sec, pitch))| {
                let got = sf.on_new_note(uid as u32, sec, pitch, 64);
                sf.do_exec();
                got.map(|m| usize::from(m.loc))
            })
            .collect();
        assert_eq!(locs, vec![0, 1, 2, 3]);
        let rpt = sf.report_summary();
        assert_eq!(rpt.match_n, 4);
        assert_eq!(rpt.spurious_n, 0);
        assert_eq!(rpt.miss_n, 0);
        assert_eq!(rpt.perf_note_n, 4);
    }

    #[test]
    fn rejects_a_spurious_note() {
        let score = smoke_score();
        let mut sf = Follower::new(FollowArgs::default(), &score).unwrap();
        let played = [(0.02, 60u8), (0.51, 62), (0.60, 70), (1.01, 64), (1.52, 65)];
        let locs: Vec<usize> = played
            .iter()
            .enumerate()
            .filter_map(|(uid, &(sec, pitch))| {
                let got = sf.on_new_note(uid as u32, sec, pitch, 64);
                sf.do_exec();
                got.map(|m| usize::from(m.loc))
            })
            .collect();
        assert_eq!(locs, vec![0, 1, 2, 3]);
        let rpt = sf.report_summary();
        assert_eq!(rpt.match_n, 4);
        assert_eq!(rpt.spurious_n, 1);
        assert_eq!(rpt.perf_note_n, 5);
    }

    #[test]
    fn emitted_locs_stay_inside_the_reset_range() {
        let score = smoke_score();
        let mut sf = Follower::new(FollowArgs::default(), &score).unwrap();
        sf.reset(LocId::from(1usize), LocId::from(2usize)).unwrap();
        // the notes at locs 0 and 3 are outside the tracked range
        assert_eq!(sf.on_new_note(0, 0.02, 60, 64), None);
        let m = sf.on_new_note(1, 0.51, 62, 64).unwrap();
        assert_eq!(m.loc, LocId::from(1usize));
        let m = sf.on_new_note(2, 1.01, 64, 64).unwrap();
        assert_eq!(m.loc, LocId::from(2usize));
        assert_eq!(sf.on_new_note(3, 1.52, 65, 64), None);
    }

    #[test]
    fn reset_rejects_an_out_of_range_window() {
        let score = smoke_score();
        let mut sf = Follower::new(FollowArgs::default(), &score).unwrap();
        assert!(matches!(
            sf.reset(LocId::from(0usize), LocId::from(99usize)),
            Err(Error::InvalidId(_))
        ));
        assert!(matches!(
            sf.reset(LocId::from(3usize), LocId::from(1usize)),
            Err(Error::InvalidId(_))
        ));
    }

    #[test]
    fn disabled_follower_consumes_without_emitting() {
        let score = smoke_score();
        let mut sf = Follower::new(FollowArgs::default(), &score).unwrap();
        sf.set_enable(false);
        assert_eq!(sf.on_new_note(0, 0.02, 60, 64), None);
        assert_eq!(sf.report_summary().perf_note_n, 0);
        sf.set_enable(true);
        assert!(sf.on_new_note(1, 0.03, 60, 64).is_some());
    }

    #[test]
    fn matched_velocity_and_measure_come_from_the_score() {
        let score = note_score(&[(0, 0.0, 60)]);
        let mut sf = Follower::new(FollowArgs::default(), &score).unwrap();
        let m = sf.on_new_note(0, 0.01, 60, 100).unwrap();
        assert_eq!(m.score_vel, 64);
        assert_eq!(m.meas, 1);
    }

    #[test]
    fn repeated_pitch_prefers_the_expected_location() {
        // the same pitch at locs 0 and 2; after matching loc 0 the next
        // C4 at its predicted onset must land on loc 2
        let score = note_score(&[(0, 0.0, 60), (1, 0.5, 62), (2, 1.0, 60)]);
        let mut sf = Follower::new(FollowArgs::default(), &score).unwrap();
        assert_eq!(
            sf.on_new_note(0, 0.0, 60, 64).map(|m| usize::from(m.loc)),
            Some(0)
        );
        sf.do_exec();
        assert_eq!(
            sf.on_new_note(1, 0.5, 62, 64).map(|m| usize::from(m.loc)),
            Some(1)
        );
        sf.do_exec();
        assert_eq!(
            sf.on_new_note(2, 1.0, 60, 64).map(|m| usize::from(m.loc)),
            Some(2)
        );
    }
}
