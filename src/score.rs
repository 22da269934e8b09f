//! The symbolic score: an immutable arena of events keyed by location id,
//! with set and section membership expressed as indices into sibling
//! arenas. Loaded once from a line-oriented CSV; every other component
//! borrows it read-only for its whole lifetime.

use crate::error::{Error, Result};
use crate::{midi, EvtIdx, LocId, SectionIdx, SetIdx};
use index_vec::IndexVec;
use log::warn;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Measurement variable a set of events is evaluated under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VarId {
    Dyn,
    Even,
    Tempo,
}

pub const VAR_CNT: usize = 3;

pub const VAR_IDS: [VarId; VAR_CNT] = [VarId::Dyn, VarId::Even, VarId::Tempo];

impl VarId {
    pub fn index(&self) -> usize {
        match self {
            VarId::Dyn => 0,
            VarId::Even => 1,
            VarId::Tempo => 2,
        }
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VarId::Dyn => "dyn",
            VarId::Even => "even",
            VarId::Tempo => "tempo",
        };
        f.write_str(s)
    }
}

/// Event opcode; the top nibble of the event hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Invalid = 0,
    Bar = 1,
    Section = 2,
    Bpm = 3,
    NoteOn = 4,
    NoteOff = 5,
    Pedal = 6,
    Rest = 7,
    Ctl = 8,
}

/// Pack an event identity into 32 bits: `[op:4 | bar:12 | pitch:8 | bar_pitch_idx:8]`.
pub fn form_hash(op: Opcode, bar: u32, pitch: u8, bar_pitch_idx: u32) -> u32 {
    ((op as u32) << 28) | ((bar & 0x0fff) << 16) | ((pitch as u32) << 8) | (bar_pitch_idx & 0xff)
}

/// Unpack a hash formed by [`form_hash`].
pub fn parse_hash(hash: u32) -> (u8, u32, u8, u32) {
    (
        (hash >> 28) as u8,
        (hash >> 16) & 0x0fff,
        ((hash >> 8) & 0xff) as u8,
        hash & 0xff,
    )
}

pub const DAMPER_DOWN_FL: u8 = 0x01;
pub const SOST_DOWN_FL: u8 = 0x02;
pub const SOFT_DOWN_FL: u8 = 0x04;

/// Per-section statistics loaded from the score file, one quad per
/// measurement variable plus match cost.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StatQuad {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
}

pub type EventStats = [StatQuad; 4];

/// One row of the score. Immutable after load; everything that changes at
/// performance time lives in the component that observes the change.
#[derive(Clone, Debug)]
pub struct ScoreEvent {
    pub uid: u32,
    pub loc: LocId,
    pub meas: u32,
    pub sec: f64,
    pub bar: u32,
    /// MIDI status with the channel nibble removed; 0 for non-MIDI rows.
    pub status: u8,
    pub ch: u8,
    pub d0: u8,
    pub d1: u8,
    pub pitch: u8,
    pub sci_pitch: String,
    pub bar_pitch_idx: u32,
    pub hash: u32,
    pub op: Opcode,
    /// Dynamic level ordinal decoded from the score's dynamic marks.
    pub dlevel: Option<u32>,
    pub grace_fl: bool,
    pub chord_note_idx: Option<u32>,
    pub chord_note_cnt: Option<u32>,
    pub player_id: Option<u32>,
    pub piano_id: Option<u32>,
    /// Damper/sostenuto/soft state after this event is applied.
    pub pedal_flags: u8,
    pub section: Option<SectionIdx>,
    /// Set membership per measurement variable.
    pub sets: [Option<SetIdx>; VAR_CNT],
    pub stats: Option<EventStats>,
}

impl ScoreEvent {
    pub fn is_note_on(&self) -> bool {
        midi::is_note_on(self.status, self.d1)
    }

    pub fn is_note_off(&self) -> bool {
        self.status != 0 && midi::is_note_off(self.status, self.d1)
    }

    pub fn has_midi(&self) -> bool {
        self.status != 0
    }
}

/// An ordered group of events measured under one variable.
#[derive(Clone, Debug)]
pub struct Set {
    pub id: u32,
    pub var: VarId,
    pub evts: Vec<EvtIdx>,
    /// Section whose aggregate this set's measurement feeds: the first
    /// section beginning after the set's last event.
    pub target_section: Option<SectionIdx>,
}

impl Set {
    /// Count of distinct locations covered by the set's events.
    pub fn loc_count(&self, score: &Score) -> usize {
        let mut n = 0;
        let mut last: Option<LocId> = None;
        for &ei in &self.evts {
            let loc = score.event(ei).loc;
            if last != Some(loc) {
                n += 1;
                last = Some(loc);
            }
        }
        n
    }
}

/// A contiguous range of events; the unit of measurement aggregation.
#[derive(Clone, Debug)]
pub struct Section {
    pub label: String,
    pub beg_evt: EvtIdx,
    pub end_evt: EvtIdx,
    pub prev: Option<SectionIdx>,
    /// Sets whose measurements accrue into this section's aggregate.
    pub sets: Vec<SetIdx>,
}

/// Events sharing one location id.
#[derive(Clone, Debug, Default)]
pub struct Loc {
    pub evts: Vec<EvtIdx>,
}

/// Raw event description handed to the score builder, either by the CSV
/// loader or directly by tests.
#[derive(Clone, Debug)]
pub struct EventSpec {
    pub meas: u32,
    pub sec: f64,
    /// `None` assigns the row uid as the location (MIDI-only files).
    pub loc: Option<usize>,
    pub status: u8,
    pub ch: u8,
    pub d0: u8,
    pub d1: u8,
    pub sci_pitch: String,
    pub bar: u32,
    pub dlevel: Option<u32>,
    pub grace_fl: bool,
    pub section_label: Option<String>,
    pub set_ids: [Option<u32>; VAR_CNT],
    pub player_id: Option<u32>,
    pub piano_id: Option<u32>,
    pub stats: Option<EventStats>,
}

impl Default for EventSpec {
    fn default() -> Self {
        Self {
            meas: 0,
            sec: 0.0,
            loc: None,
            status: 0,
            ch: 0,
            d0: 0,
            d1: 0,
            sci_pitch: String::new(),
            bar: 0,
            dlevel: None,
            grace_fl: false,
            section_label: None,
            set_ids: [None; VAR_CNT],
            player_id: None,
            piano_id: None,
            stats: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Score {
    events: IndexVec<EvtIdx, ScoreEvent>,
    locs: IndexVec<LocId, Loc>,
    sets: IndexVec<SetIdx, Set>,
    sections: IndexVec<SectionIdx, Section>,
    has_loc_info: bool,
}

impl Score {
    /// Build a score from raw event specs.
    ///
    /// Location ids must be non-decreasing; a decrease is a hard error.
    /// Pedal state, chord grouping, bar-pitch indices and event hashes are
    /// derived here so that starting playback mid-score stays cheap.
    pub fn from_events(specs: Vec<EventSpec>) -> Result<Self> {
        let mut score = Score {
            has_loc_info: specs.iter().any(|s| s.loc.is_some()),
            ..Score::default()
        };

        let mut pedal_flags: u8 = 0;
        let mut last_loc = 0usize;
        let mut bar_pitch_cnt: HashMap<(u32, u8), u32> = HashMap::new();
        let mut open_sets: HashMap<(usize, u32), SetIdx> = HashMap::new();

        for (uid, spec) in specs.into_iter().enumerate() {
            let loc_id = match spec.loc {
                Some(l) => {
                    if l < last_loc {
                        return Err(Error::InvalidState(format!(
                            "the score is not in order by location ({} follows {}) at row {}",
                            l, last_loc, uid
                        )));
                    }
                    last_loc = l;
                    l
                }
                None => {
                    last_loc = uid;
                    uid
                }
            };

            let status = spec.status & 0xf0;
            let pitch = match midi::name_to_pitch(&spec.sci_pitch) {
                Some(p) => p,
                None if status == midi::NOTE_ON || status == midi::NOTE_OFF => spec.d0,
                None => 0,
            };

            let op = Self::classify(status, spec.d0, spec.d1, spec.section_label.is_some());

            if midi::is_sustain_pedal(status, spec.d0) {
                pedal_flags = Self::toggle_pedal(
                    pedal_flags,
                    DAMPER_DOWN_FL,
                    midi::is_pedal_down(spec.d1),
                    "damper",
                    spec.meas,
                )?;
            }
            if midi::is_sostenuto_pedal(status, spec.d0) {
                pedal_flags = Self::toggle_pedal(
                    pedal_flags,
                    SOST_DOWN_FL,
                    midi::is_pedal_down(spec.d1),
                    "sostenuto",
                    spec.meas,
                )?;
            }
            if midi::is_soft_pedal(status, spec.d0) {
                // the soft pedal may repeat a direction; just track it
                if midi::is_pedal_down(spec.d1) {
                    pedal_flags |= SOFT_DOWN_FL;
                } else {
                    pedal_flags &= !SOFT_DOWN_FL;
                }
            }

            let bar_pitch_idx = if op == Opcode::NoteOn {
                let n = bar_pitch_cnt.entry((spec.bar, pitch)).or_insert(0);
                *n += 1;
                *n - 1
            } else {
                0
            };

            let evt_idx = EvtIdx::from(score.events.len());

            // open a new section on a labeled row
            let section_idx = if let Some(label) = &spec.section_label {
                let prev = score.cur_section();
                if let Some(p) = prev {
                    // the previous section ends just before this event
                    score.sections[p].end_evt =
                        EvtIdx::from(usize::from(evt_idx).saturating_sub(1));
                }
                Some(score.sections.push(Section {
                    label: label.clone(),
                    beg_evt: evt_idx,
                    end_evt: evt_idx,
                    prev,
                    sets: vec![],
                }))
            } else {
                score.cur_section()
            };

            // set membership per variable
            let mut sets = [None; VAR_CNT];
            for (vi, set_id) in spec.set_ids.iter().enumerate() {
                if let Some(id) = set_id {
                    let set_idx = *open_sets.entry((vi, *id)).or_insert_with(|| {
                        score.sets.push(Set {
                            id: *id,
                            var: VAR_IDS[vi],
                            evts: vec![],
                            target_section: None,
                        })
                    });
                    score.sets[set_idx].evts.push(evt_idx);
                    sets[vi] = Some(set_idx);
                }
            }

            score.events.push(ScoreEvent {
                uid: uid as u32,
                loc: LocId::from(loc_id),
                meas: spec.meas,
                sec: spec.sec,
                bar: spec.bar,
                status,
                ch: spec.ch & 0x0f,
                d0: spec.d0,
                d1: spec.d1,
                pitch,
                sci_pitch: spec.sci_pitch,
                bar_pitch_idx,
                hash: form_hash(op, spec.bar, pitch, bar_pitch_idx),
                op,
                dlevel: spec.dlevel,
                grace_fl: spec.grace_fl,
                chord_note_idx: None,
                chord_note_cnt: None,
                player_id: spec.player_id,
                piano_id: spec.piano_id,
                pedal_flags,
                section: section_idx,
                sets,
                stats: spec.stats,
            });

            while score.locs.len() <= loc_id {
                score.locs.push(Loc::default());
            }
            score.locs[LocId::from(loc_id)].evts.push(evt_idx);
        }

        if let Some(last) = score.cur_section() {
            score.sections[last].end_evt = EvtIdx::from(score.events.len().saturating_sub(1));
        }

        score.assign_chords();
        score.assign_set_targets();
        Ok(score)
    }

    fn classify(status: u8, d0: u8, d1: u8, section_fl: bool) -> Opcode {
        if status == 0 {
            if section_fl {
                Opcode::Section
            } else {
                Opcode::Bar
            }
        } else if midi::is_note_on(status, d1) {
            Opcode::NoteOn
        } else if midi::is_note_off(status, d1) {
            Opcode::NoteOff
        } else if midi::is_sustain_pedal(status, d0)
            || midi::is_sostenuto_pedal(status, d0)
            || midi::is_soft_pedal(status, d0)
        {
            Opcode::Pedal
        } else if midi::is_ctl(status) {
            Opcode::Ctl
        } else {
            Opcode::Invalid
        }
    }

    fn toggle_pedal(flags: u8, flag: u8, down_fl: bool, name: &str, meas: u32) -> Result<u8> {
        let was_down = flags & flag != 0;
        if was_down == down_fl {
            return Err(Error::InvalidState(format!(
                "two {} pedal {} msgs without an intervening {} msg at meas {}",
                name,
                if down_fl { "down" } else { "up" },
                if down_fl { "up" } else { "down" },
                meas
            )));
        }
        Ok(if down_fl { flags | flag } else { flags & !flag })
    }

    /// Group note-ons that share a location into chords.
    fn assign_chords(&mut self) {
        for loc in self.locs.iter() {
            let ons: Vec<EvtIdx> = loc
                .evts
                .iter()
                .copied()
                .filter(|&ei| self.events[ei].is_note_on())
                .collect();
            let cnt = ons.len() as u32;
            for (i, &ei) in ons.iter().enumerate() {
                self.events[ei].chord_note_idx = Some(i as u32);
                self.events[ei].chord_note_cnt = Some(cnt);
            }
        }
    }

    /// A set feeds the first section that begins after its last event.
    fn assign_set_targets(&mut self) {
        let starts: Vec<(EvtIdx, SectionIdx)> = self
            .sections
            .iter_enumerated()
            .map(|(si, s)| (s.beg_evt, si))
            .collect();
        for si in 0..self.sets.len() {
            let set_idx = SetIdx::from(si);
            let last_evt = match self.sets[set_idx].evts.last() {
                Some(&e) => e,
                None => continue,
            };
            let target = starts
                .iter()
                .find(|(beg, _)| *beg > last_evt)
                .map(|(_, si)| *si);
            self.sets[set_idx].target_section = target;
            if let Some(t) = target {
                self.sections[t].sets.push(set_idx);
            } else {
                warn!(
                    "set {} has no target section; its measurements are dropped",
                    self.sets[set_idx].id
                );
            }
        }
    }

    pub fn from_csv_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(&path).map_err(|e| {
            Error::OpFail(format!(
                "score file '{}' could not be read: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_csv_str(&text)
    }

    /// Parse the line-oriented score CSV.
    ///
    /// A file with an `oloc` column is a full score export and `oloc`
    /// supplies the location id; a file without one is a MIDI-only record
    /// and each row's uid doubles as its location.
    pub fn from_csv_str(text: &str) -> Result<Self> {
        let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
        let (_, header) = lines
            .next()
            .ok_or_else(|| Error::OpFail("the score CSV is empty".to_string()))?;
        let hdr = CsvHeader::parse(header);
        let oloc_fl = hdr.has("oloc");

        let mut specs = vec![];
        for (line_no, line) in lines {
            let row: Vec<&str> = line.split(',').map(|f| f.trim()).collect();
            let ctx = |e: String| Error::OpFail(format!("score CSV line {}: {}", line_no + 1, e));

            let stats = if hdr.get_bool(&row, "has_stats_fl")?.unwrap_or(false) {
                Some(Self::parse_stats(&hdr, &row).map_err(|e| ctx(e.to_string()))?)
            } else {
                None
            };

            specs.push(EventSpec {
                meas: hdr.get(&row, "meas")?.unwrap_or(0),
                sec: hdr.get(&row, "sec")?.unwrap_or(0.0),
                loc: if oloc_fl { hdr.get(&row, "oloc")? } else { None },
                status: hdr.get::<u8>(&row, "status")?.unwrap_or(0),
                ch: hdr.get::<u8>(&row, "status")?.unwrap_or(0) & 0x0f,
                d0: hdr.get(&row, "d0")?.unwrap_or(0),
                d1: hdr.get(&row, "d1")?.unwrap_or(0),
                sci_pitch: hdr.raw(&row, "sci_pitch").unwrap_or("").to_string(),
                bar: hdr.get(&row, "bar")?.unwrap_or(0),
                dlevel: hdr.get(&row, "dlevel")?,
                grace_fl: hdr.get_bool(&row, "grace")?.unwrap_or(false),
                section_label: hdr.raw(&row, "section").map(|s| s.to_string()),
                set_ids: [
                    hdr.get(&row, "dyn")?,
                    hdr.get(&row, "even")?,
                    hdr.get(&row, "tempo")?,
                ],
                player_id: hdr.get(&row, "player_id")?,
                piano_id: hdr.get(&row, "piano_id")?,
                stats,
            });
        }

        Self::from_events(specs)
    }

    fn parse_stats(hdr: &CsvHeader, row: &[&str]) -> Result<EventStats> {
        let mut stats = EventStats::default();
        for (i, var) in ["even", "dyn", "tempo", "cost"].iter().enumerate() {
            stats[i] = StatQuad {
                min: hdr.get(row, &format!("{}_min", var))?.unwrap_or(0.0),
                max: hdr.get(row, &format!("{}_max", var))?.unwrap_or(0.0),
                mean: hdr.get(row, &format!("{}_mean", var))?.unwrap_or(0.0),
                std: hdr.get(row, &format!("{}_std", var))?.unwrap_or(0.0),
            };
        }
        Ok(stats)
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn events(&self) -> &IndexVec<EvtIdx, ScoreEvent> {
        &self.events
    }

    pub fn event(&self, i: EvtIdx) -> &ScoreEvent {
        &self.events[i]
    }

    pub fn loc_count(&self) -> usize {
        self.locs.len()
    }

    pub fn max_loc_id(&self) -> Option<LocId> {
        if self.locs.is_empty() {
            None
        } else {
            Some(LocId::from(self.locs.len() - 1))
        }
    }

    fn cur_section(&self) -> Option<SectionIdx> {
        if self.sections.is_empty() {
            None
        } else {
            Some(SectionIdx::from(self.sections.len() - 1))
        }
    }

    /// Events at one location, in file order.
    pub fn evts_at(&self, loc: LocId) -> &[EvtIdx] {
        self.locs
            .get(loc)
            .map(|l| l.evts.as_slice())
            .unwrap_or(&[])
    }

    /// Onset time of a location: the time of its first note-on, else of
    /// its first event.
    pub fn loc_sec(&self, loc: LocId) -> Option<f64> {
        let evts = self.evts_at(loc);
        evts.iter()
            .map(|&ei| &self.events[ei])
            .find(|e| e.is_note_on())
            .or_else(|| evts.first().map(|&ei| &self.events[ei]))
            .map(|e| e.sec)
    }

    pub fn loc_to_first_event(&self, loc: LocId) -> Option<EvtIdx> {
        self.evts_at(loc).first().copied()
    }

    pub fn sets(&self) -> &IndexVec<SetIdx, Set> {
        &self.sets
    }

    pub fn set(&self, i: SetIdx) -> &Set {
        &self.sets[i]
    }

    pub fn sections(&self) -> &IndexVec<SectionIdx, Section> {
        &self.sections
    }

    pub fn section(&self, i: SectionIdx) -> &Section {
        &self.sections[i]
    }

    pub fn has_loc_info(&self) -> bool {
        self.has_loc_info
    }
}

struct CsvHeader {
    cols: HashMap<String, usize>,
}

impl CsvHeader {
    fn parse(line: &str) -> Self {
        let cols = line
            .split(',')
            .enumerate()
            .map(|(i, t)| (t.trim().to_string(), i))
            .collect();
        Self { cols }
    }

    fn has(&self, name: &str) -> bool {
        self.cols.contains_key(name)
    }

    /// Raw cell text; `None` when the column is missing or the cell empty.
    fn raw<'a>(&self, row: &[&'a str], name: &str) -> Option<&'a str> {
        self.cols
            .get(name)
            .and_then(|&i| row.get(i))
            .copied()
            .filter(|s| !s.is_empty())
    }

    fn get<T: std::str::FromStr>(&self, row: &[&str], name: &str) -> Result<Option<T>> {
        match self.raw(row, name) {
            None => Ok(None),
            Some(s) => s.parse::<T>().map(Some).map_err(|_| {
                Error::OpFail(format!("the '{}' field value '{}' is malformed", name, s))
            }),
        }
    }

    fn get_bool(&self, row: &[&str], name: &str) -> Result<Option<bool>> {
        match self.raw(row, name) {
            None => Ok(None),
            Some("0") | Some("false") => Ok(Some(false)),
            Some("1") | Some("true") => Ok(Some(true)),
            Some(s) => Err(Error::OpFail(format!(
                "the '{}' field value '{}' is not a flag",
                name, s
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::NOTE_ON;

    fn note(loc: usize, sec: f64, pitch: u8) -> EventSpec {
        EventSpec {
            loc: Some(loc),
            sec,
            status: NOTE_ON,
            d0: pitch,
            d1: 64,
            bar: 1,
            ..EventSpec::default()
        }
    }

    #[test]
    fn hash_round_trip() {
        let h = form_hash(Opcode::NoteOn, 37, 60, 2);
        assert_eq!(parse_hash(h), (Opcode::NoteOn as u8, 37, 60, 2));
    }

    #[test]
    fn loc_decrease_is_a_hard_error() {
        let specs = vec![note(2, 0.0, 60), note(1, 0.1, 62)];
        let err = Score::from_events(specs).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn chord_members_are_grouped_by_loc() {
        let score =
            Score::from_events(vec![note(0, 0.0, 60), note(0, 0.0, 64), note(1, 0.5, 67)])
                .unwrap();
        let e0 = score.event(EvtIdx::from(0usize));
        assert_eq!(e0.chord_note_idx, Some(0));
        assert_eq!(e0.chord_note_cnt, Some(2));
        let e2 = score.event(EvtIdx::from(2usize));
        assert_eq!(e2.chord_note_cnt, Some(1));
    }

    #[test]
    fn bar_pitch_index_counts_repeats_within_a_bar() {
        let score =
            Score::from_events(vec![note(0, 0.0, 60), note(1, 0.5, 60), note(2, 1.0, 62)])
                .unwrap();
        assert_eq!(score.event(EvtIdx::from(0usize)).bar_pitch_idx, 0);
        assert_eq!(score.event(EvtIdx::from(1usize)).bar_pitch_idx, 1);
        assert_eq!(score.event(EvtIdx::from(2usize)).bar_pitch_idx, 0);
    }

    #[test]
    fn double_pedal_down_is_rejected() {
        let pedal = |loc: usize, d1: u8| EventSpec {
            loc: Some(loc),
            status: midi::CONTROL,
            d0: midi::SUSTAIN_CTL,
            d1,
            ..EventSpec::default()
        };
        let err = Score::from_events(vec![pedal(0, 127), pedal(1, 127)]).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(Score::from_events(vec![pedal(0, 127), pedal(1, 0)]).is_ok());
    }

    #[test]
    fn sections_and_sets_are_linked() {
        let mut a = note(0, 0.0, 60);
        a.section_label = Some("intro".into());
        a.set_ids[VarId::Even.index()] = Some(7);
        let mut b = note(1, 0.5, 62);
        b.set_ids[VarId::Even.index()] = Some(7);
        let mut c = note(2, 1.0, 64);
        c.section_label = Some("6a".into());

        let score = Score::from_events(vec![a, b, c]).unwrap();
        assert_eq!(score.sections().len(), 2);
        assert_eq!(score.sets().len(), 1);

        let set = score.set(SetIdx::from(0usize));
        assert_eq!(set.evts.len(), 2);
        assert_eq!(set.var, VarId::Even);
        // the set's measurement feeds the section that starts after it
        assert_eq!(set.target_section, Some(SectionIdx::from(1usize)));
        assert_eq!(score.section(SectionIdx::from(1usize)).sets.len(), 1);
        assert_eq!(score.section(SectionIdx::from(0usize)).end_evt, EvtIdx::from(1usize));
    }

    #[test]
    fn csv_with_oloc_is_a_score_file() {
        let csv = "\
meas,loc,sec,sci_pitch,status,d0,d1,bar,oloc,section
1,0,0.0,C4,144,60,64,1,0,intro
1,1,0.5,D4,144,62,64,1,1,
2,2,1.0,E4,144,64,64,2,2,
";
        let score = Score::from_csv_str(csv).unwrap();
        assert!(score.has_loc_info());
        assert_eq!(score.event_count(), 3);
        assert_eq!(score.loc_count(), 3);
        assert_eq!(score.event(EvtIdx::from(0usize)).pitch, 60);
        assert_eq!(score.sections().len(), 1);
        assert_eq!(score.max_loc_id(), Some(LocId::from(2usize)));
    }

    #[test]
    fn csv_without_oloc_assigns_uid_as_loc() {
        let csv = "\
meas,loc,sec,sci_pitch,status,d0,d1,bar
1,9,0.0,C4,144,60,64,1
1,9,0.5,D4,144,62,64,1
";
        let score = Score::from_csv_str(csv).unwrap();
        assert!(!score.has_loc_info());
        assert_eq!(score.event(EvtIdx::from(1usize)).loc, LocId::from(1usize));
    }

    #[test]
    fn out_of_order_oloc_fails_to_load() {
        let csv = "\
meas,loc,sec,sci_pitch,status,d0,d1,bar,oloc
1,0,0.0,C4,144,60,64,1,5
1,1,0.5,D4,144,62,64,1,4
";
        assert!(matches!(
            Score::from_csv_str(csv).unwrap_err(),
            Error::InvalidState(_)
        ));
    }
}
