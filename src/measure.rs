//! Per-section performance measurement.
//!
//! Sets of performed events are evaluated lazily: a set is scored when all
//! of its events have been performed, and a section's aggregate fires
//! exactly once, on the first performed event at or past the section
//! boundary. A *calc* point sits at the location of the last event of the
//! last set feeding a section so the section value is ready before the
//! section itself is reached.

use crate::error::{Error, Result};
use crate::score::{Score, VarId};
use crate::{EvtIdx, LocId, SectionIdx, SetIdx};
use index_vec::IndexVec;
use log::{debug, info, warn};

pub const VAL_CNT: usize = 4;

/// Slot of a section aggregate value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValId {
    Dyn = 0,
    Even = 1,
    Tempo = 2,
    MatchCost = 3,
}

/// Dynamics reference: maps between dynamic marks, level ordinals and
/// MIDI velocities.
#[derive(Clone, Debug)]
pub struct DynRef {
    rows: Vec<(String, u32, u8)>,
}

impl Default for DynRef {
    fn default() -> Self {
        let rows = [
            ("silent", 0u32, 0u8),
            ("pppp", 1, 8),
            ("ppp", 2, 16),
            ("pp", 3, 26),
            ("p", 4, 38),
            ("mp", 5, 50),
            ("mf", 6, 62),
            ("f", 7, 74),
            ("ff", 8, 88),
            ("fff", 9, 104),
            ("ffff", 10, 120),
        ];
        Self {
            rows: rows
                .iter()
                .map(|(m, l, v)| (m.to_string(), *l, *v))
                .collect(),
        }
    }
}

impl DynRef {
    pub fn marker_to_level(&self, marker: &str) -> Option<u32> {
        self.rows
            .iter()
            .find(|(m, _, _)| m == marker)
            .map(|(_, l, _)| *l)
    }

    pub fn level_to_velocity(&self, level: u32) -> Option<u8> {
        self.rows
            .iter()
            .find(|(_, l, _)| *l == level)
            .map(|(_, _, v)| *v)
    }

    /// MIDI velocity to the nearest dynamic level.
    pub fn velocity_to_level(&self, vel: u8) -> u32 {
        self.rows
            .iter()
            .min_by_key(|(_, _, v)| (*v as i32 - vel as i32).abs())
            .map(|(_, l, _)| *l)
            .unwrap_or(0)
    }
}

/// One performed note, as reported by the score follower.
#[derive(Clone, Copy, Debug)]
pub struct PerfNote {
    pub loc: LocId,
    pub pitch: u8,
    pub perf_sec: f64,
    /// Dynamic level of the performed velocity (see [`DynRef`]).
    pub perf_dlevel: u32,
    /// Match cost reported by the tracker for this note.
    pub cost: f64,
}

/// A section aggregate, produced exactly once per section.
#[derive(Clone, Debug, PartialEq)]
pub struct SectionResult {
    /// Location that triggered the section.
    pub loc: LocId,
    /// Location of the section's first event.
    pub section_loc: LocId,
    pub section_label: String,
    /// Aggregates indexed by [`ValId`]; `None` when no set supplied the slot.
    pub values: [Option<f64>; VAL_CNT],
}

#[derive(Clone, Copy, Debug, Default)]
struct EvtPerf {
    performed: bool,
    sec: f64,
    dlevel: u32,
    cost: f64,
}

#[derive(Clone, Debug, Default)]
struct SetState {
    value: Option<f64>,
    update_cnt: u32,
    eval_cnt: u32,
}

#[derive(Clone, Debug, Default)]
struct LocRec {
    section_start: Option<SectionIdx>,
    set_ends: Vec<SetIdx>,
    calc_section: Option<SectionIdx>,
}

pub struct PerfMeasure<'a> {
    score: &'a Score,
    locs: IndexVec<LocId, LocRec>,
    evt_perf: IndexVec<EvtIdx, EvtPerf>,
    set_states: IndexVec<SetIdx, SetState>,
    section_triggered: IndexVec<SectionIdx, bool>,
    section_values: IndexVec<SectionIdx, [Option<f64>; VAL_CNT]>,
    last_section_loc: Option<LocId>,
    next_section_loc: Option<LocId>,
    next_calc_loc: Option<LocId>,
}

impl<'a> PerfMeasure<'a> {
    pub fn new(score: &'a Score) -> Result<Self> {
        if score.loc_count() == 0 {
            return Err(Error::InvalidArg("the score is empty".to_string()));
        }
        let mut locs: IndexVec<LocId, LocRec> =
            IndexVec::from_vec(vec![LocRec::default(); score.loc_count()]);

        for (si, set) in score.sets().iter_enumerated() {
            if let Some(&last_evt) = set.evts.last() {
                locs[score.event(last_evt).loc].set_ends.push(si);
            }
        }

        for (xi, section) in score.sections().iter_enumerated() {
            let section_loc = score.event(section.beg_evt).loc;
            locs[section_loc].section_start = Some(xi);

            // the calc point is the last event of the last set feeding
            // this section
            let calc_evt = section
                .sets
                .iter()
                .filter_map(|&si| score.set(si).evts.last().copied())
                .max();
            if let Some(calc_evt) = calc_evt {
                let calc_loc = score.event(calc_evt).loc;
                if calc_loc > section_loc {
                    return Err(Error::InvalidState(format!(
                        "the calc point at loc {} lands after the start of section '{}' at loc {}",
                        usize::from(calc_loc),
                        section.label,
                        usize::from(section_loc)
                    )));
                }
                if locs[calc_loc].calc_section.is_some() {
                    return Err(Error::InvalidState(format!(
                        "location {} already carries a calc record",
                        usize::from(calc_loc)
                    )));
                }
                locs[calc_loc].calc_section = Some(xi);
            }
        }

        let mut meas = Self {
            score,
            locs,
            evt_perf: IndexVec::from_vec(vec![EvtPerf::default(); score.event_count()]),
            set_states: IndexVec::from_vec(vec![SetState::default(); score.sets().len()]),
            section_triggered: IndexVec::from_vec(vec![false; score.sections().len()]),
            section_values: IndexVec::from_vec(
                vec![[None; VAL_CNT]; score.sections().len()],
            ),
            last_section_loc: None,
            next_section_loc: None,
            next_calc_loc: None,
        };
        meas.reset(LocId::from(0usize))?;
        Ok(meas)
    }

    /// Re-arm every section and set at or after `init_loc`.
    pub fn reset(&mut self, init_loc: LocId) -> Result<()> {
        if usize::from(init_loc) >= self.locs.len() {
            return Err(Error::InvalidId(format!(
                "the initial location id {} is not in the score",
                usize::from(init_loc)
            )));
        }

        for i in usize::from(init_loc)..self.locs.len() {
            let loc = LocId::from(i);
            if let Some(si) = self.locs[loc].section_start {
                self.section_triggered[si] = false;
                self.section_values[si] = [None; VAL_CNT];
                for &set_idx in &self.score.section(si).sets {
                    self.set_states[set_idx] = SetState::default();
                }
            }
            for &set_idx in &self.locs[loc].set_ends {
                self.set_states[set_idx] = SetState::default();
            }
        }
        for (ei, evt) in self.score.events().iter_enumerated() {
            if evt.loc >= init_loc {
                self.evt_perf[ei] = EvtPerf::default();
            }
        }

        self.last_section_loc = Some(init_loc);
        self.advance(init_loc);
        Ok(())
    }

    /// Feed one performed note. Returns the section aggregate when this
    /// note triggers a section boundary, else `None`.
    pub fn exec(&mut self, note: PerfNote) -> Result<Option<SectionResult>> {
        if usize::from(note.loc) >= self.locs.len() {
            return Err(Error::InvalidId(format!(
                "the performed location {} is not in the score",
                usize::from(note.loc)
            )));
        }

        self.mark_performed(&note);

        // events arriving before the last triggered section are stale
        if let Some(last) = self.last_section_loc {
            if note.loc < last {
                warn!(
                    "backtrack before the last triggered section: {} < {}",
                    usize::from(note.loc),
                    usize::from(last)
                );
                return Ok(None);
            }
        }

        self.update_sets(note.loc);
        self.update_calc(note.loc);
        Ok(self.update_section(note.loc))
    }

    /// Latest aggregate values of a section, if its calc point has fired.
    pub fn section_values(&self, si: SectionIdx) -> &[Option<f64>; VAL_CNT] {
        &self.section_values[si]
    }

    fn mark_performed(&mut self, note: &PerfNote) {
        // the first not-yet-performed note-on with this pitch at this loc
        let evt = self
            .score
            .evts_at(note.loc)
            .iter()
            .copied()
            .find(|&ei| {
                let e = self.score.event(ei);
                e.is_note_on() && e.pitch == note.pitch && !self.evt_perf[ei].performed
            });
        let ei = match evt {
            Some(ei) => ei,
            None => return,
        };
        self.evt_perf[ei] = EvtPerf {
            performed: true,
            sec: note.perf_sec,
            dlevel: note.perf_dlevel,
            cost: note.cost,
        };
        for set_idx in self.score.event(ei).sets.iter().flatten() {
            self.set_states[*set_idx].update_cnt += 1;
        }
    }

    fn set_complete(&self, si: SetIdx) -> bool {
        self.score
            .set(si)
            .evts
            .iter()
            .all(|&ei| self.evt_perf[ei].performed)
    }

    /// Evaluate the sets ending at `loc` once they are complete.
    fn update_sets(&mut self, loc: LocId) {
        let ends = self.locs[loc].set_ends.clone();
        for si in ends {
            if self.set_complete(si) {
                self.eval_set(si);
            }
        }
    }

    /// At or past the calc point, evaluate all of the target section's
    /// sets (complete or not) and aggregate them.
    fn update_calc(&mut self, loc: LocId) {
        let calc_loc = match self.next_calc_loc {
            Some(l) => l,
            None => return,
        };
        let all_performed_here = self.locs[loc]
            .set_ends
            .iter()
            .all(|&si| self.set_complete(si));
        if loc > calc_loc || (loc == calc_loc && all_performed_here) {
            let section_idx = match self.locs[calc_loc].calc_section {
                Some(si) => si,
                None => return,
            };
            debug!(
                "calc at loc {} for section '{}'",
                usize::from(calc_loc),
                self.score.section(section_idx).label
            );
            for &si in &self.score.section(section_idx).sets.clone() {
                let s = &self.set_states[si];
                if s.eval_cnt == 0 || s.update_cnt > s.eval_cnt {
                    self.eval_set(si);
                }
            }
            self.aggregate(section_idx);
        }
    }

    fn update_section(&mut self, loc: LocId) -> Option<SectionResult> {
        let section_loc = self.next_section_loc?;
        if section_loc > loc {
            return None;
        }
        let si = self.locs[section_loc].section_start?;
        if self.section_triggered[si] {
            return None;
        }
        self.section_triggered[si] = true;
        let label = self.score.section(si).label.clone();
        info!("section '{}' triggered at loc {}", label, usize::from(loc));

        self.advance(section_loc);
        self.last_section_loc = Some(section_loc);

        Some(SectionResult {
            loc,
            section_loc,
            section_label: label,
            values: self.section_values[si],
        })
    }

    /// Find the next section and calc locations after `cur`.
    fn advance(&mut self, cur: LocId) {
        self.next_section_loc = None;
        self.next_calc_loc = None;
        for i in (usize::from(cur) + 1)..self.locs.len() {
            let loc = LocId::from(i);
            if self.next_section_loc.is_none() && self.locs[loc].section_start.is_some() {
                self.next_section_loc = Some(loc);
            }
            if self.next_calc_loc.is_none() && self.locs[loc].calc_section.is_some() {
                self.next_calc_loc = Some(loc);
            }
            if self.next_section_loc.is_some() && self.next_calc_loc.is_some() {
                break;
            }
        }
        if self.next_section_loc.is_none() {
            info!("end-of-score reached on section scan");
        }
    }

    fn eval_set(&mut self, si: SetIdx) {
        let value = match self.score.set(si).var {
            VarId::Dyn => Some(self.eval_dyn_set(si)),
            VarId::Even => self.eval_even_set(si),
            VarId::Tempo => Some(3.0),
        };
        let state = &mut self.set_states[si];
        state.value = value.or(state.value);
        state.eval_cnt = state.update_cnt.max(1);
        debug!(
            "set {} ({}) = {:?}",
            self.score.set(si).id,
            self.score.set(si).var,
            state.value
        );
    }

    /// RMS of the score-vs-performed dynamic level over performed events.
    fn eval_dyn_set(&self, si: SetIdx) -> f64 {
        let mut sum = 0.0;
        let mut n = 0u32;
        for &ei in &self.score.set(si).evts {
            let perf = &self.evt_perf[ei];
            if perf.performed {
                let score_dlevel = self.score.event(ei).dlevel.unwrap_or(0) as f64;
                let d = score_dlevel - perf.dlevel as f64;
                sum += d * d;
                n += 1;
            }
        }
        if n == 0 {
            0.0
        } else {
            (sum / n as f64).sqrt()
        }
    }

    /// Standard deviation of successive onset deltas within the set.
    ///
    /// The onset of a chord is the mean onset of its performed members;
    /// unplayed interior locations are interpolated by splitting the
    /// surrounding gap evenly. Sets with fewer than three usable
    /// locations are skipped.
    fn eval_even_set(&self, si: SetIdx) -> Option<f64> {
        let set = self.score.set(si);

        // mean performed onset per distinct location, in set order
        let mut loc_sec: Vec<f64> = vec![];
        let mut loc_cnt: Vec<u32> = vec![];
        let mut cur_loc: Option<LocId> = None;
        for &ei in &set.evts {
            let loc = self.score.event(ei).loc;
            if cur_loc != Some(loc) {
                loc_sec.push(0.0);
                loc_cnt.push(0);
                cur_loc = Some(loc);
            }
            let li = loc_sec.len() - 1;
            let perf = &self.evt_perf[ei];
            if perf.performed {
                loc_sec[li] += perf.sec;
                loc_cnt[li] += 1;
            }
        }
        for (s, n) in loc_sec.iter_mut().zip(loc_cnt.iter()) {
            if *n > 0 {
                *s /= *n as f64;
            }
        }

        // interpolate interior gaps between played locations
        let mut beg = None;
        let mut end: Option<usize> = None;
        let mut miss_n = 0usize;
        for i in 0..loc_sec.len() {
            let out_of_order = end.map(|e| loc_sec[i] < loc_sec[e]).unwrap_or(false);
            if loc_cnt[i] == 0 || out_of_order {
                miss_n += 1;
                continue;
            }
            if miss_n > 0 {
                if let Some(e) = end {
                    let d_sec = (loc_sec[i] - loc_sec[e]) / (miss_n + 1) as f64;
                    for j in (e + 1)..i {
                        loc_sec[j] = loc_sec[j - 1] + d_sec;
                    }
                }
            }
            if beg.is_none() {
                beg = Some(i);
            }
            miss_n = 0;
            end = Some(i);
        }

        let (beg, end) = (beg?, end?);
        if end - beg + 1 <= 2 {
            return None;
        }

        let deltas: Vec<f64> = (beg + 1..=end).map(|i| loc_sec[i] - loc_sec[i - 1]).collect();
        Some(std_dev(&deltas))
    }

    /// Aggregate the section's set values and its match cost.
    fn aggregate(&mut self, section_idx: SectionIdx) {
        let section = self.score.section(section_idx);

        for (val, var) in [
            (ValId::Dyn, VarId::Dyn),
            (ValId::Even, VarId::Even),
            (ValId::Tempo, VarId::Tempo),
        ] {
            let vals: Vec<f64> = section
                .sets
                .iter()
                .filter(|&&si| self.score.set(si).var == var)
                .filter_map(|&si| self.set_states[si].value)
                .collect();
            self.section_values[section_idx][val as usize] = if vals.is_empty() {
                None
            } else {
                Some(vals.iter().sum::<f64>() / vals.len() as f64)
            };
        }

        // mean match cost over the passage leading into this section: the
        // previous section's events
        let cost = section.prev.and_then(|p| {
            let beg = usize::from(self.score.section(p).beg_evt);
            let end = usize::from(section.beg_evt); // exclusive
            let mut sum = 0.0;
            let mut n = 0u32;
            for ei in beg..end {
                let perf = &self.evt_perf[EvtIdx::from(ei)];
                if perf.performed {
                    sum += perf.cost;
                    n += 1;
                }
            }
            (n > 0).then(|| sum / n as f64)
        });
        self.section_values[section_idx][ValId::MatchCost as usize] = cost;
    }
}

fn std_dev(v: &[f64]) -> f64 {
    if v.len() < 2 {
        return 0.0;
    }
    let mean = v.iter().sum::<f64>() / v.len() as f64;
    let var = v.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (v.len() - 1) as f64;
    var.sqrt()
}
