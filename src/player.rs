//! Sample-accurate, rewindable playback of a recorded score.
//!
//! The player walks a message list derived from the score, emitting every
//! message whose sample time has been reached by the cycle cursor. A stop
//! is graceful: note-ons are dropped while sounding notes drain, then
//! all-notes-off and reset-all-controllers close the stream.

use crate::error::{Error, Result};
use crate::midi::ChMsg;
use crate::record::{Record, RecordBuf};
use crate::score::{Score, DAMPER_DOWN_FL, SOST_DOWN_FL};
use crate::LocId;
use log::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Play,
    Stopping,
}

/// Variable change notifications, delivered between `exec` cycles.
#[derive(Clone, Copy, Debug)]
pub enum PlayerVar {
    Start,
    Stop,
    BLoc(LocId),
    BMeas(u32),
    ELoc(LocId),
    EMeas(u32),
}

#[derive(Clone, Debug)]
struct Msg {
    sample_idx: u64,
    loc: LocId,
    meas: u32,
    piano_id: Option<u32>,
    pedal_flags: u8,
    midi: ChMsg,
}

pub struct ScorePlayer {
    sample_rate: f64,
    frames_per_cycle: u32,
    stopping_ms: u32,
    msgs: Vec<Msg>,
    score_end_loc: LocId,
    score_end_meas: u32,
    out: RecordBuf,

    b_loc: LocId,
    b_meas: u32,
    e_loc: LocId,
    e_meas: u32,
    /// Which of the begin/end pair changed since the last cycle.
    b_changed: Option<bool>, // Some(true) = loc, Some(false) = meas
    e_changed: Option<bool>,
    start_trig_fl: bool,
    stop_trig_fl: bool,

    sample_idx: u64,
    msg_idx: usize,
    /// Last message to play before stopping; `None` plays the whole score.
    end_msg_idx: Option<usize>,
    cur_meas: u32,
    note_cnt: u32,
    state: PlayerState,
    stopping_sample_idx: u64,
    done_fl: bool,
}

impl ScorePlayer {
    pub fn new(
        score: &Score,
        sample_rate: f64,
        frames_per_cycle: u32,
        stopping_ms: u32,
        out_capacity: usize,
    ) -> Result<Self> {
        if sample_rate <= 0.0 || frames_per_cycle == 0 {
            return Err(Error::InvalidArg(format!(
                "invalid cycle geometry: sample rate {} frames {}",
                sample_rate, frames_per_cycle
            )));
        }

        let mut msgs = vec![];
        let mut score_end_loc = LocId::from(0usize);
        let mut score_end_meas = 0;
        for evt in score.events().iter() {
            if !evt.has_midi() {
                continue;
            }
            if evt.loc > score_end_loc {
                score_end_loc = evt.loc;
            }
            if evt.meas > score_end_meas {
                score_end_meas = evt.meas;
            }
            msgs.push(Msg {
                sample_idx: (sample_rate * evt.sec) as u64,
                loc: evt.loc,
                meas: evt.meas,
                piano_id: evt.piano_id,
                pedal_flags: evt.pedal_flags,
                midi: ChMsg {
                    sec: evt.sec,
                    uid: evt.uid,
                    ..ChMsg::new(evt.ch, evt.status, evt.d0, evt.d1)
                },
            });
        }
        if msgs.is_empty() {
            return Err(Error::InvalidArg("the score has no playable messages".to_string()));
        }

        Ok(Self {
            sample_rate,
            frames_per_cycle,
            stopping_ms,
            msgs,
            score_end_loc,
            score_end_meas,
            out: RecordBuf::new(out_capacity),
            b_loc: LocId::from(0usize),
            b_meas: 0,
            // play to the end of the score by default
            e_loc: LocId::from(usize::from(score_end_loc) + 1),
            e_meas: score_end_meas + 1,
            b_changed: None,
            e_changed: None,
            start_trig_fl: false,
            stop_trig_fl: false,
            sample_idx: 0,
            msg_idx: 0,
            end_msg_idx: None,
            cur_meas: 0,
            note_cnt: 0,
            state: PlayerState::Idle,
            stopping_sample_idx: 0,
            done_fl: false,
        })
    }

    pub fn notify(&mut self, var: PlayerVar) {
        match var {
            PlayerVar::Start => self.start_trig_fl = true,
            PlayerVar::Stop => self.stop_trig_fl = true,
            PlayerVar::BLoc(loc) => {
                self.b_loc = loc;
                self.b_changed = Some(true);
            }
            PlayerVar::BMeas(meas) => {
                self.b_meas = meas;
                self.b_changed = Some(false);
            }
            PlayerVar::ELoc(loc) => {
                self.e_loc = loc;
                self.e_changed = Some(true);
            }
            PlayerVar::EMeas(meas) => {
                self.e_meas = meas;
                self.e_changed = Some(false);
            }
        }
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn done_fl(&self) -> bool {
        self.done_fl
    }

    /// One past the highest location id, as advertised to hosts.
    pub fn loc_cnt(&self) -> usize {
        usize::from(self.score_end_loc) + 1
    }

    /// Records emitted by the most recent `exec`.
    pub fn out(&self) -> &[Record] {
        self.out.as_slice()
    }

    pub fn exec(&mut self) -> Result<()> {
        self.out.clear();

        if let Some(is_loc) = self.b_changed.take() {
            self.on_new_begin(is_loc)?;
        }
        if let Some(is_loc) = self.e_changed.take() {
            self.on_new_end(is_loc);
        }
        if self.start_trig_fl {
            self.start_trig_fl = false;
            self.on_start()?;
        }
        if self.stop_trig_fl {
            self.stop_trig_fl = false;
            self.do_stop_now()?;
        }

        if self.state == PlayerState::Idle {
            return Ok(());
        }

        self.sample_idx += self.frames_per_cycle as u64;

        while self.msg_idx < self.msgs.len()
            && self.sample_idx >= self.msgs[self.msg_idx].sample_idx
        {
            if self.state == PlayerState::Play {
                if let Some(end) = self.end_msg_idx {
                    if self.msg_idx > end {
                        self.begin_stopping();
                    }
                }
            }

            let msg = self.msgs[self.msg_idx].clone();
            let note_on_fl = msg.midi.is_note_on();

            // drop note-ons while stopping; let everything else through
            if self.state == PlayerState::Play || !note_on_fl {
                self.emit(&msg)?;
                if note_on_fl {
                    self.note_cnt += 1;
                }
                if msg.midi.is_note_off() && self.note_cnt > 0 {
                    self.note_cnt -= 1;
                }
            }

            self.msg_idx += 1;

            if msg.meas > self.cur_meas {
                info!("meas: {}", msg.meas);
                self.cur_meas = msg.meas;
            }
        }

        let stopping_done = self.state == PlayerState::Stopping
            && (self.note_cnt == 0 || self.sample_idx > self.stopping_sample_idx);
        if stopping_done || self.msg_idx >= self.msgs.len() {
            info!(
                "end of stopping: note_cnt:{}{}{}",
                self.note_cnt,
                if self.sample_idx > self.stopping_sample_idx { " timed-out" } else { "" },
                if self.msg_idx >= self.msgs.len() { " score-done" } else { "" }
            );
            self.do_stop_now()?;
        }

        Ok(())
    }

    /// Snap the begin position to the first message at or after it and
    /// update the sibling field.
    fn on_new_begin(&mut self, is_loc: bool) -> Result<()> {
        let found = self.msgs.iter().position(|m| {
            if is_loc {
                m.loc >= self.b_loc
            } else {
                m.meas >= self.b_meas
            }
        });
        match found {
            Some(i) => {
                if is_loc {
                    self.b_meas = self.msgs[i].meas;
                } else {
                    self.b_loc = self.msgs[i].loc;
                }
                Ok(())
            }
            None => Err(Error::InvalidArg(format!(
                "invalid begin {} {}",
                if is_loc { "location" } else { "measure" },
                if is_loc { usize::from(self.b_loc) } else { self.b_meas as usize }
            ))),
        }
    }

    /// The end position may be one past the last event, meaning play to
    /// the end of the score.
    fn on_new_end(&mut self, is_loc: bool) {
        let found = self.msgs.iter().position(|m| {
            if is_loc {
                m.loc >= self.e_loc
            } else {
                m.meas >= self.e_meas
            }
        });
        self.end_msg_idx = found;
        match (found, self.msgs.last()) {
            (Some(i), _) => {
                if is_loc {
                    self.e_meas = self.msgs[i].meas;
                } else {
                    self.e_loc = self.msgs[i].loc;
                }
            }
            (None, Some(last)) => {
                if is_loc {
                    self.e_meas = last.meas + 1;
                } else {
                    self.e_loc = LocId::from(usize::from(last.loc) + 1);
                }
            }
            (None, None) => {}
        }
    }

    fn on_start(&mut self) -> Result<()> {
        if self.state != PlayerState::Idle {
            self.do_stop_now()?;
        }

        // rewind the cursor to the begin location
        if let Some(i) = self.msgs.iter().position(|m| m.loc >= self.b_loc) {
            self.sample_idx = self.msgs[i].sample_idx;
            self.msg_idx = i;
            self.cur_meas = self.msgs[i].meas;

            // restore the pedal position for a mid-score start
            if self.msgs[i].pedal_flags & DAMPER_DOWN_FL != 0 {
                self.emit_bare(ChMsg::damper_down(0))?;
            }
            if self.msgs[i].pedal_flags & SOST_DOWN_FL != 0 {
                self.emit_bare(ChMsg::sostenuto_down(0))?;
            }
            info!(
                "start: msg_idx:{} meas:{} loc:{}",
                i,
                self.msgs[i].meas,
                usize::from(self.msgs[i].loc)
            );
        }

        self.stopping_sample_idx = 0;
        self.note_cnt = 0;
        self.done_fl = false;
        self.state = PlayerState::Play;
        Ok(())
    }

    fn begin_stopping(&mut self) {
        self.state = PlayerState::Stopping;
        self.stopping_sample_idx =
            self.sample_idx + ((self.sample_rate * self.stopping_ms as f64) / 1000.0) as u64;
        info!("stopping ...");
    }

    fn do_stop_now(&mut self) -> Result<()> {
        self.emit_bare(ChMsg::all_notes_off(0))?;
        self.emit_bare(ChMsg::reset_all_ctls(0))?;
        self.state = PlayerState::Idle;
        self.done_fl = true;
        info!("stopped");
        Ok(())
    }

    fn emit(&mut self, msg: &Msg) -> Result<()> {
        let mut r = Record::from_midi(msg.midi)
            .with_loc(msg.loc)
            .with_meas(msg.meas);
        if let Some(piano_id) = msg.piano_id {
            r = r.with_piano_id(piano_id);
        }
        self.out.push(r)
    }

    fn emit_bare(&mut self, midi: ChMsg) -> Result<()> {
        self.out.push(Record::from_midi(midi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::{self, NOTE_ON};
    use crate::score::EventSpec;

    const SR: f64 = 48_000.0;
    const FPC: u32 = 128;

    fn on(loc: usize, sec: f64, pitch: u8) -> EventSpec {
        EventSpec {
            loc: Some(loc),
            sec,
            meas: 1 + loc as u32 / 4,
            bar: 1,
            status: NOTE_ON,
            d0: pitch,
            d1: 64,
            ..EventSpec::default()
        }
    }

    fn off(loc: usize, sec: f64, pitch: u8) -> EventSpec {
        EventSpec {
            status: NOTE_ON,
            d1: 0,
            ..on(loc, sec, pitch)
        }
    }

    fn run_cycles(p: &mut ScorePlayer, n: usize) -> Vec<Record> {
        let mut all = vec![];
        for _ in 0..n {
            p.exec().unwrap();
            all.extend_from_slice(p.out());
        }
        all
    }

    fn note_on_count(recs: &[Record]) -> usize {
        recs.iter()
            .filter(|r| r.midi.map(|m| m.is_note_on()).unwrap_or(false))
            .count()
    }

    #[test]
    fn plays_the_whole_score_and_returns_to_idle() {
        let score = Score::from_events(vec![
            on(0, 0.0, 60),
            off(1, 0.1, 60),
            on(2, 0.2, 62),
            off(3, 0.3, 62),
        ])
        .unwrap();
        let mut p = ScorePlayer::new(&score, SR, FPC, 2000, 64).unwrap();
        p.notify(PlayerVar::Start);
        let recs = run_cycles(&mut p, 200);
        assert_eq!(note_on_count(&recs), 2);
        assert_eq!(p.state(), PlayerState::Idle);
        assert!(p.done_fl());
    }

    #[test]
    fn stop_emits_cleanup_and_quiesces() {
        // one thousand note-ons, ten milliseconds apart
        let specs: Vec<EventSpec> = (0..1000).map(|i| on(i, i as f64 * 0.01, 60)).collect();
        let score = Score::from_events(specs).unwrap();
        let mut p = ScorePlayer::new(&score, SR, FPC, 2000, 4096).unwrap();
        p.notify(PlayerVar::Start);

        let mut emitted = 0;
        while emitted < 200 {
            p.exec().unwrap();
            emitted += note_on_count(p.out());
        }

        p.notify(PlayerVar::Stop);
        p.exec().unwrap();
        let cleanup: Vec<ChMsg> = p.out().iter().filter_map(|r| r.midi).collect();
        assert!(cleanup
            .iter()
            .any(|m| m.status == midi::CONTROL && m.d0.as_int() == midi::ALL_NOTES_OFF));
        assert!(cleanup
            .iter()
            .any(|m| m.status == midi::CONTROL && m.d0.as_int() == midi::RESET_ALL_CTLS));
        assert!(p.done_fl());
        assert_eq!(p.state(), PlayerState::Idle);

        p.exec().unwrap();
        assert!(p.out().is_empty());
    }

    #[test]
    fn note_on_counts_match_the_played_range() {
        let specs: Vec<EventSpec> = (0..50).map(|i| on(i, i as f64 * 0.01, 60)).collect();
        let score = Score::from_events(specs).unwrap();
        let mut p = ScorePlayer::new(&score, SR, FPC, 0, 1024).unwrap();
        p.notify(PlayerVar::BLoc(LocId::from(10usize)));
        p.notify(PlayerVar::ELoc(LocId::from(20usize)));
        p.notify(PlayerVar::Start);
        let recs = run_cycles(&mut p, 400);
        // b_loc..=e_loc inclusive, stopping drops everything after
        assert_eq!(note_on_count(&recs), 11);
        assert_eq!(p.state(), PlayerState::Idle);
    }

    #[test]
    fn starting_under_a_held_damper_pedal_restores_it() {
        let pedal_down = EventSpec {
            loc: Some(0),
            sec: 0.0,
            meas: 1,
            status: midi::CONTROL,
            d0: midi::SUSTAIN_CTL,
            d1: 127,
            ..EventSpec::default()
        };
        let score = Score::from_events(vec![pedal_down, on(1, 0.5, 60), on(2, 1.0, 62)]).unwrap();
        let mut p = ScorePlayer::new(&score, SR, FPC, 2000, 64).unwrap();
        p.notify(PlayerVar::BLoc(LocId::from(1usize)));
        p.notify(PlayerVar::Start);
        p.exec().unwrap();
        let first = p.out().first().and_then(|r| r.midi).unwrap();
        assert!(midi::is_sustain_pedal(first.status, first.d0.as_int()));
        assert!(midi::is_pedal_down(first.d1.as_int()));
    }

    #[test]
    fn end_loc_one_past_the_last_event_plays_to_the_end() {
        let specs: Vec<EventSpec> = (0..10).map(|i| on(i, i as f64 * 0.01, 60)).collect();
        let score = Score::from_events(specs).unwrap();
        let mut p = ScorePlayer::new(&score, SR, FPC, 0, 256).unwrap();
        p.notify(PlayerVar::ELoc(LocId::from(10usize)));
        p.notify(PlayerVar::Start);
        let recs = run_cycles(&mut p, 100);
        assert_eq!(note_on_count(&recs), 10);
        assert_eq!(p.state(), PlayerState::Idle);
        assert!(p.done_fl());
    }

    #[test]
    fn begin_loc_snaps_to_the_sibling_measure() {
        let specs: Vec<EventSpec> = (0..16).map(|i| on(i, i as f64 * 0.25, 60)).collect();
        let score = Score::from_events(specs).unwrap();
        let mut p = ScorePlayer::new(&score, SR, FPC, 0, 256).unwrap();
        p.notify(PlayerVar::BLoc(LocId::from(9usize)));
        p.exec().unwrap();
        // loc 9 sits in measure 1 + 9/4 = 3
        assert_eq!(p.b_meas, 3);
    }

    #[test]
    fn invalid_begin_loc_is_an_error() {
        let score = Score::from_events(vec![on(0, 0.0, 60)]).unwrap();
        let mut p = ScorePlayer::new(&score, SR, FPC, 0, 64).unwrap();
        p.notify(PlayerVar::BLoc(LocId::from(40usize)));
        assert!(matches!(p.exec(), Err(Error::InvalidArg(_))));
    }

    #[test]
    fn restart_mid_play_rewinds_cleanly() {
        let specs: Vec<EventSpec> = (0..20).map(|i| on(i, i as f64 * 0.01, 60)).collect();
        let score = Score::from_events(specs).unwrap();
        let mut p = ScorePlayer::new(&score, SR, FPC, 0, 1024).unwrap();
        p.notify(PlayerVar::Start);
        run_cycles(&mut p, 3);
        assert_eq!(p.state(), PlayerState::Play);

        // a second start while playing performs a stop-now first
        p.notify(PlayerVar::Start);
        let recs = run_cycles(&mut p, 100);
        let ons = note_on_count(&recs);
        assert_eq!(ons, 20);
        assert_eq!(p.state(), PlayerState::Idle);
    }
}
