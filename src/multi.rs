//! Many named, independently startable MIDI timelines.
//!
//! Each *player* is a message list replayed against the global sample
//! clock from the moment it is armed. Key and controller state is tracked
//! per player so that a `clear` can close every sounding note and held
//! controller, and a `reset` can silence every unique output port.

use crate::error::{Error, Result};
use crate::midi::{self, ChMsg};
use crate::record::{Record, RecordBuf};
use crate::LocId;
use log::info;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

const KEY_CNT: usize = midi::CH_CNT * midi::NOTE_CNT;
const CTL_CNT: usize = midi::CH_CNT * midi::CTL_CNT;

#[derive(Clone, Debug)]
struct PMsg {
    sample_idx: u64,
    meas: u32,
    loc: Option<LocId>,
    midi: ChMsg,
}

struct Player {
    id: u32,
    label: String,
    port_id: u32,
    msgs: Vec<PMsg>,
    /// Last velocity per `(ch, pitch)`.
    key_state: Vec<u8>,
    /// Last value per `(ch, controller)`.
    ctl_state: Vec<u8>,
    /// Next message to emit; `None` when the player is not armed.
    next_msg_idx: Option<usize>,
    start_smp_idx: u64,
}

/// Notifications processed at the top of the next `exec`.
#[derive(Clone, Debug)]
pub enum MultiCmd {
    /// Start the player named by the configured start label or segment id.
    Start,
    SetStartLabel(String),
    SetStartSegId(u32),
    /// Arm an additional player.
    Play(u32),
    /// Reset everything, then start one player.
    PlayExcl(u32),
    /// Close sounding notes and held controllers; players stop.
    Clear,
    /// Clear, zero the sample clock, and silence every unique port.
    Reset,
}

#[derive(Deserialize)]
struct MsgRec {
    #[allow(dead_code)]
    uid: u32,
    sec: f64,
    ch: u8,
    status: u8,
    d0: u8,
    d1: u8,
}

#[derive(Deserialize)]
struct PlayerRec {
    player_id: u32,
    port_id: u32,
    #[serde(rename = "msgL")]
    msg_l: Vec<MsgRec>,
}

pub struct MultiPlayer {
    players: Vec<Player>,
    /// Unique port ids across all players.
    port_ids: Vec<u32>,
    out: RecordBuf,
    sample_rate: f64,
    frames_per_cycle: u32,
    global_smp_idx: u64,

    start_label: Option<String>,
    start_seg_id: Option<u32>,
    start_trig_fl: bool,
    clear_trig_fl: bool,
    reset_trig_fl: bool,
    play_trigs: Vec<u32>,
    play_excl_trig: Option<u32>,

    done_ids: Vec<u32>,
}

impl MultiPlayer {
    pub fn from_cfg_path<P: AsRef<Path>>(
        path: P,
        sample_rate: f64,
        frames_per_cycle: u32,
        out_capacity: usize,
    ) -> Result<Self> {
        let text = std::fs::read_to_string(&path).map_err(|e| {
            Error::OpFail(format!(
                "the multi-player cfg '{}' could not be read: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_cfg_str(&text, sample_rate, frames_per_cycle, out_capacity)
    }

    /// Parse the player dictionary: label -> `{player_id, port_id, msgL}`.
    /// Pitch-bend entries are measure-number markers, not playable MIDI.
    pub fn from_cfg_str(
        text: &str,
        sample_rate: f64,
        frames_per_cycle: u32,
        out_capacity: usize,
    ) -> Result<Self> {
        if sample_rate <= 0.0 || frames_per_cycle == 0 {
            return Err(Error::InvalidArg(format!(
                "invalid cycle geometry: sample rate {} frames {}",
                sample_rate, frames_per_cycle
            )));
        }
        let cfg: HashMap<String, PlayerRec> = serde_json::from_str(text)?;

        let mut players = vec![];
        let mut port_ids = vec![];
        for (label, rec) in cfg {
            let mut msgs = vec![];
            let mut meas = 0u32;
            for m in &rec.msg_l {
                match m.status & 0xf0 {
                    midi::PITCH_BEND => {
                        meas = midi::to_14_bits(m.d0, m.d1) as u32;
                    }
                    midi::NOTE_ON | midi::NOTE_OFF | midi::CONTROL => {
                        msgs.push(PMsg {
                            sample_idx: (sample_rate * m.sec) as u64,
                            meas,
                            loc: None,
                            midi: ChMsg {
                                sec: m.sec,
                                port_idx: rec.port_id,
                                ..ChMsg::new(m.ch, m.status, m.d0, m.d1)
                            },
                        });
                    }
                    _ => {}
                }
            }
            if !port_ids.contains(&rec.port_id) {
                port_ids.push(rec.port_id);
            }
            players.push(Player {
                id: rec.player_id,
                label,
                port_id: rec.port_id,
                msgs,
                key_state: vec![0; KEY_CNT],
                ctl_state: vec![0; CTL_CNT],
                next_msg_idx: None,
                start_smp_idx: 0,
            });
        }
        players.sort_by_key(|p| p.id);

        Ok(Self {
            players,
            port_ids,
            out: RecordBuf::new(out_capacity),
            sample_rate,
            frames_per_cycle,
            global_smp_idx: 0,
            start_label: None,
            start_seg_id: None,
            start_trig_fl: false,
            clear_trig_fl: false,
            reset_trig_fl: false,
            play_trigs: vec![],
            play_excl_trig: None,
            done_ids: vec![],
        })
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn player_label(&self, id: u32) -> Option<&str> {
        self.players
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.label.as_str())
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Records emitted by the most recent `exec`.
    pub fn out(&self) -> &[Record] {
        self.out.as_slice()
    }

    /// Players whose last message was emitted in the most recent `exec`.
    pub fn done_ids(&self) -> &[u32] {
        &self.done_ids
    }

    pub fn is_armed(&self, id: u32) -> bool {
        self.players
            .iter()
            .any(|p| p.id == id && p.next_msg_idx.is_some())
    }

    pub fn notify(&mut self, cmd: MultiCmd) {
        match cmd {
            MultiCmd::Start => {
                self.start_trig_fl = true;
                info!("multi-player: start");
            }
            MultiCmd::SetStartLabel(label) => self.start_label = Some(label),
            MultiCmd::SetStartSegId(id) => self.start_seg_id = Some(id),
            MultiCmd::Play(id) => {
                self.play_trigs.push(id);
                info!("multi-player: play id:{}", id);
            }
            MultiCmd::PlayExcl(id) => {
                self.play_excl_trig = Some(id);
                info!("multi-player: play_excl id:{}", id);
            }
            MultiCmd::Clear => {
                self.clear_trig_fl = true;
                info!("multi-player: clear");
            }
            MultiCmd::Reset => {
                self.reset_trig_fl = true;
                info!("multi-player: reset");
            }
        }
    }

    pub fn exec(&mut self) -> Result<()> {
        self.out.clear();
        self.done_ids.clear();

        self.global_smp_idx += self.frames_per_cycle as u64;

        // play-excl first: its embedded reset would otherwise eat the
        // other trigger flags
        if let Some(id) = self.play_excl_trig.take() {
            self.do_reset()?;
            self.start_player_by_id(id)?;
        }
        if self.clear_trig_fl {
            self.clear_trig_fl = false;
            self.do_clear()?;
        }
        if self.reset_trig_fl {
            self.reset_trig_fl = false;
            self.do_reset()?;
        }
        if self.start_trig_fl {
            self.start_trig_fl = false;
            self.on_start_trigger()?;
        }
        let play_trigs = std::mem::take(&mut self.play_trigs);
        for id in play_trigs {
            self.start_player_by_id(id)?;
        }

        // drain every due message from every armed player
        for pi in 0..self.players.len() {
            loop {
                let (msg, port_id, finished) = {
                    let p = &self.players[pi];
                    let ni = match p.next_msg_idx {
                        Some(ni) if ni < p.msgs.len() => ni,
                        _ => break,
                    };
                    let player_smp = self.global_smp_idx.saturating_sub(p.start_smp_idx);
                    if p.msgs[ni].sample_idx > player_smp {
                        break;
                    }
                    (p.msgs[ni].clone(), p.port_id, ni + 1 >= p.msgs.len())
                };

                self.emit(pi, msg.midi, msg.loc, Some(msg.meas), port_id)?;

                let p = &mut self.players[pi];
                p.next_msg_idx = p.next_msg_idx.map(|ni| ni + 1);
                if finished {
                    p.next_msg_idx = None;
                    p.start_smp_idx = 0;
                    self.done_ids.push(p.id);
                    info!("multi-player: done id:{}", p.id);
                }
            }
        }

        Ok(())
    }

    fn player_index_by_id(&self, id: u32) -> Result<usize> {
        self.players
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| Error::InvalidArg(format!("the player id {} was not found", id)))
    }

    fn start_player_by_id(&mut self, id: u32) -> Result<()> {
        let pi = self.player_index_by_id(id)?;
        self.players[pi].next_msg_idx = Some(0);
        self.players[pi].start_smp_idx = self.global_smp_idx;
        Ok(())
    }

    fn on_start_trigger(&mut self) -> Result<()> {
        if let Some(id) = self.start_seg_id {
            return self.start_player_by_id(id);
        }
        if let Some(label) = self.start_label.clone() {
            let pi = self
                .players
                .iter()
                .position(|p| p.label == label)
                .ok_or_else(|| {
                    Error::InvalidArg(format!("the start player '{}' was not found", label))
                })?;
            self.players[pi].next_msg_idx = Some(0);
            self.players[pi].start_smp_idx = self.global_smp_idx;
            return Ok(());
        }
        Err(Error::InvalidArg(
            "no start player is configured".to_string(),
        ))
    }

    /// Emit offs for every non-zero key/controller entry of every player,
    /// then mark all players stopped. The sample clock keeps running.
    fn do_clear(&mut self) -> Result<()> {
        for pi in 0..self.players.len() {
            for ch in 0..midi::CH_CNT {
                for note in 0..midi::NOTE_CNT {
                    if self.players[pi].key_state[ch * midi::NOTE_CNT + note] > 0 {
                        let port_id = self.players[pi].port_id;
                        let m = ChMsg::new(ch as u8, midi::NOTE_ON, note as u8, 0);
                        self.emit(pi, m, None, None, port_id)?;
                    }
                }
                for ctl in 0..midi::CTL_CNT {
                    if self.players[pi].ctl_state[ch * midi::CTL_CNT + ctl] > 0 {
                        let port_id = self.players[pi].port_id;
                        let m = ChMsg::control(ch as u8, ctl as u8, 0);
                        self.emit(pi, m, None, None, port_id)?;
                    }
                }
            }
            let p = &mut self.players[pi];
            p.key_state.iter_mut().for_each(|v| *v = 0);
            p.ctl_state.iter_mut().for_each(|v| *v = 0);
            p.next_msg_idx = None;
            p.start_smp_idx = 0;
        }
        Ok(())
    }

    /// Clear, zero the sample clock, and send reset-all-controllers plus
    /// all-notes-off out every unique port.
    fn do_reset(&mut self) -> Result<()> {
        for i in 0..self.port_ids.len() {
            let port_id = self.port_ids[i];
            self.push_record(ChMsg::reset_all_ctls(0), None, None, port_id)?;
            self.push_record(ChMsg::all_notes_off(0), None, None, port_id)?;
        }

        self.global_smp_idx = 0;
        self.start_trig_fl = false;
        self.clear_trig_fl = false;
        self.play_trigs.clear();
        self.play_excl_trig = None;

        self.do_clear()?;
        info!("multi-player reset");
        Ok(())
    }

    fn emit(
        &mut self,
        pi: usize,
        m: ChMsg,
        loc: Option<LocId>,
        meas: Option<u32>,
        port_id: u32,
    ) -> Result<()> {
        self.update_key_state(pi, &m);
        self.push_record(m, loc, meas, port_id)
    }

    fn push_record(
        &mut self,
        m: ChMsg,
        loc: Option<LocId>,
        meas: Option<u32>,
        port_id: u32,
    ) -> Result<()> {
        let mut r = Record::from_midi(m).with_port_id(port_id);
        if let Some(loc) = loc {
            r = r.with_loc(loc);
        }
        if let Some(meas) = meas {
            r = r.with_meas(meas);
        }
        self.out.push(r)
    }

    fn update_key_state(&mut self, pi: usize, m: &ChMsg) {
        let p = &mut self.players[pi];
        let ch = m.ch.as_int() as usize;
        match m.status {
            midi::NOTE_ON => {
                p.key_state[ch * midi::NOTE_CNT + m.d0.as_int() as usize] = m.d1.as_int();
            }
            midi::NOTE_OFF => {
                p.key_state[ch * midi::NOTE_CNT + m.d0.as_int() as usize] = 0;
            }
            midi::CONTROL => {
                p.ctl_state[ch * midi::CTL_CNT + m.d0.as_int() as usize] = m.d1.as_int();
            }
            _ => {}
        }
    }

    #[cfg(test)]
    fn key_ctl_state_is_zero(&self) -> bool {
        self.players
            .iter()
            .all(|p| p.key_state.iter().all(|&v| v == 0) && p.ctl_state.iter().all(|&v| v == 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    const SR: f64 = 48_000.0;
    const FPC: u32 = 64;

    /// A player with one hanging note-on and a held damper pedal.
    const HANGING_NOTE_CFG: &str = r#"{
        "gutim_1": {
            "player_id": 3,
            "port_id": 0,
            "msgL": [
                { "uid": 0, "sec": 0.0, "ch": 0, "status": 224, "d0": 5, "d1": 0 },
                { "uid": 1, "sec": 0.0, "ch": 0, "status": 144, "d0": 60, "d1": 90 },
                { "uid": 2, "sec": 0.0, "ch": 0, "status": 176, "d0": 64, "d1": 127 }
            ]
        }
    }"#;

    const TWO_PLAYER_CFG: &str = r#"{
        "one": {
            "player_id": 1,
            "port_id": 0,
            "msgL": [
                { "uid": 0, "sec": 0.0, "ch": 0, "status": 144, "d0": 60, "d1": 80 },
                { "uid": 1, "sec": 0.01, "ch": 0, "status": 128, "d0": 60, "d1": 0 }
            ]
        },
        "two": {
            "player_id": 2,
            "port_id": 7,
            "msgL": [
                { "uid": 0, "sec": 0.0, "ch": 1, "status": 144, "d0": 62, "d1": 70 },
                { "uid": 1, "sec": 0.01, "ch": 1, "status": 128, "d0": 62, "d1": 0 }
            ]
        }
    }"#;

    fn run_until_quiet(mp: &mut MultiPlayer, max_cycles: usize) -> Vec<Record> {
        let mut all = vec![];
        for _ in 0..max_cycles {
            mp.exec().unwrap();
            all.extend_from_slice(mp.out());
        }
        all
    }

    #[test]
    fn pitch_bend_rows_become_measure_markers() {
        let mp = MultiPlayer::from_cfg_str(HANGING_NOTE_CFG, SR, FPC, 64).unwrap();
        assert_eq!(mp.player_count(), 1);
        assert_eq!(mp.player_label(3), Some("gutim_1"));
        // the pitch-bend row is consumed as a marker, two playable msgs remain
        assert_eq!(mp.players[0].msgs.len(), 2);
        assert_eq!(mp.players[0].msgs[0].meas, 5);
    }

    #[test]
    fn clear_closes_the_hanging_note() {
        let mut mp = MultiPlayer::from_cfg_str(HANGING_NOTE_CFG, SR, FPC, 64).unwrap();
        mp.notify(MultiCmd::Play(3));
        mp.exec().unwrap();
        // the note-on and pedal were emitted
        assert!(mp
            .out()
            .iter()
            .any(|r| r.midi.map(|m| m.is_note_on()).unwrap_or(false)));

        mp.notify(MultiCmd::Clear);
        mp.exec().unwrap();
        let offs: Vec<ChMsg> = mp.out().iter().filter_map(|r| r.midi).collect();
        assert!(offs
            .iter()
            .any(|m| m.status == midi::NOTE_ON && m.d0.as_int() == 60 && m.d1.as_int() == 0));
        // the held damper controller is released too
        assert!(offs
            .iter()
            .any(|m| m.status == midi::CONTROL && m.d0.as_int() == 64 && m.d1.as_int() == 0));
        assert!(mp.key_ctl_state_is_zero());
        assert!(!mp.is_armed(3));

        // with no further start the output stays silent
        mp.exec().unwrap();
        assert!(mp.out().is_empty());
    }

    #[test]
    fn note_on_off_counts_balance_after_clear() {
        let mut mp = MultiPlayer::from_cfg_str(TWO_PLAYER_CFG, SR, FPC, 128).unwrap();
        mp.notify(MultiCmd::Play(1));
        mp.notify(MultiCmd::Play(2));
        let mut recs = run_until_quiet(&mut mp, 32);
        mp.notify(MultiCmd::Clear);
        mp.exec().unwrap();
        recs.extend_from_slice(mp.out());

        let mut balance: StdHashMap<(u32, u8, u8), i32> = StdHashMap::new();
        for r in &recs {
            if let (Some(m), Some(port)) = (r.midi, r.port_id) {
                if m.is_note_on() {
                    *balance.entry((port, m.ch.as_int(), m.d0.as_int())).or_insert(0) += 1;
                } else if m.is_note_off() {
                    *balance.entry((port, m.ch.as_int(), m.d0.as_int())).or_insert(0) -= 1;
                }
            }
        }
        assert!(balance.values().all(|&v| v == 0));
    }

    #[test]
    fn done_is_published_when_a_player_finishes() {
        let mut mp = MultiPlayer::from_cfg_str(TWO_PLAYER_CFG, SR, FPC, 128).unwrap();
        mp.notify(MultiCmd::Play(1));
        let mut done = vec![];
        for _ in 0..32 {
            mp.exec().unwrap();
            done.extend_from_slice(mp.done_ids());
        }
        assert_eq!(done, vec![1]);
        assert!(!mp.is_armed(1));
    }

    #[test]
    fn play_excl_resets_before_starting() {
        let mut mp = MultiPlayer::from_cfg_str(TWO_PLAYER_CFG, SR, FPC, 128).unwrap();
        mp.notify(MultiCmd::Play(1));
        mp.exec().unwrap();
        assert!(mp.is_armed(1));

        mp.notify(MultiCmd::PlayExcl(2));
        mp.exec().unwrap();
        // the reset silences every unique port
        let cleanup: Vec<(u32, u8)> = mp
            .out()
            .iter()
            .filter_map(|r| {
                r.midi.and_then(|m| {
                    (m.status == midi::CONTROL && m.d0.as_int() == midi::ALL_NOTES_OFF)
                        .then(|| (r.port_id.unwrap(), m.d0.as_int()))
                })
            })
            .collect();
        assert_eq!(cleanup.len(), 2);
        assert!(!mp.is_armed(1));
        assert!(mp.is_armed(2) || !mp.done_ids().is_empty());
    }

    #[test]
    fn start_uses_the_configured_segment_id() {
        let mut mp = MultiPlayer::from_cfg_str(TWO_PLAYER_CFG, SR, FPC, 128).unwrap();
        mp.notify(MultiCmd::SetStartSegId(2));
        mp.notify(MultiCmd::Start);
        mp.exec().unwrap();
        assert!(mp.is_armed(2) || !mp.done_ids().is_empty());
        assert!(!mp.is_armed(1));
    }

    #[test]
    fn unknown_start_player_is_an_error() {
        let mut mp = MultiPlayer::from_cfg_str(TWO_PLAYER_CFG, SR, FPC, 128).unwrap();
        mp.notify(MultiCmd::Play(99));
        assert!(matches!(mp.exec(), Err(Error::InvalidArg(_))));
    }
}
