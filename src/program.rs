//! Top-level performance sequencing.
//!
//! A configuration pins an ordered list of control records to score
//! locations. As the live location stream crosses a record, its
//! sub-commands reconfigure the two score-follower outlets and cue the
//! players. The controller itself only emits [`Effect`]s; the host wires
//! them to the follower, the multi-player and the preset engine.

use crate::error::{Error, Result};
use crate::record::Record;
use crate::LocId;
use log::info;
use serde::Deserialize;
use std::path::Path;

/// The two score-follower outlets owned by the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SfId {
    A,
    B,
}

impl SfId {
    fn from_cfg(v: u32) -> Result<Self> {
        match v {
            0 => Ok(SfId::A),
            1 => Ok(SfId::B),
            _ => Err(Error::InvalidArg(format!(
                "the SF id must be either 0 or 1, not '{}'",
                v
            ))),
        }
    }
}

/// Which player a play command addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayerKind {
    /// The player-piano segment player.
    Spirio,
    /// The simulated (sampled) segment player.
    Simul,
}

impl PlayerKind {
    fn from_seg_type(label: &str) -> Result<Self> {
        match label {
            "spirio" => Ok(PlayerKind::Spirio),
            "simul" => Ok(PlayerKind::Simul),
            _ => Err(Error::InvalidArg(format!(
                "unknown seg type label: '{}'",
                label
            ))),
        }
    }
}

/// Host-visible effects, drained once per cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    /// Reconfigure one follower outlet and reset it.
    SfConfig {
        sf: SfId,
        beg_loc: LocId,
        end_loc: LocId,
        enable_fl: bool,
    },
    /// Enable or disable one follower outlet in place.
    SfEnable { sf: SfId, enable_fl: bool },
    /// Cue a player segment; `excl_fl` starts it exclusively.
    Play {
        player: PlayerKind,
        seg_id: u32,
        excl_fl: bool,
    },
    Clear { player: PlayerKind },
    PlayerReset { player: PlayerKind },
    /// The location echoed downstream.
    LocOut(LocId),
    /// The controller's own reset output.
    ResetOut,
}

#[derive(Clone, Debug)]
struct SfCmd {
    sf_id: SfId,
    beg_loc: LocId,
    end_loc: LocId,
    enable_fl: bool,
}

#[derive(Clone, Debug)]
struct PlayCmd {
    player: PlayerKind,
    seg_id: u32,
    seg_label: String,
    person_label: String,
    person_seg_num: u32,
}

#[derive(Clone, Debug)]
enum Cmd {
    Sf(SfCmd),
    Play(PlayCmd),
}

#[derive(Clone, Debug)]
struct Ctl {
    seg_id: u32,
    loc_id: LocId,
    active_sf_id: SfId,
    cmds: Vec<Cmd>,
}

#[derive(Deserialize)]
struct CtlFile {
    #[serde(rename = "ctlL")]
    ctl_l: Vec<CtlRec>,
}

#[derive(Deserialize)]
struct CtlRec {
    loc_id: usize,
    seg_id: u32,
    active_sf_id: u32,
    #[serde(rename = "cmdL")]
    cmd_l: Vec<CmdRec>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum CmdRec {
    #[serde(rename = "sf")]
    Sf {
        sf_id: u32,
        bloc: usize,
        eloc: usize,
        enable_fl: bool,
    },
    #[serde(rename = "play")]
    Play {
        seg_type: String,
        seg_label: String,
        seg_id: u32,
        player_seg_num: u32,
        player_label: String,
    },
}

pub struct ProgramCtl {
    ctls: Vec<Ctl>,
    last_ctl_idx: Option<usize>,
    last_loc_id: Option<LocId>,
    /// Segment re-entered by `reset`.
    cur_goto_seg: Option<u32>,
    effects: Vec<Effect>,
}

impl ProgramCtl {
    pub fn from_cfg_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(&path).map_err(|e| {
            Error::OpFail(format!(
                "the program cfg '{}' could not be read: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_cfg_str(&text)
    }

    pub fn from_cfg_str(text: &str) -> Result<Self> {
        let file: CtlFile = serde_json::from_str(text)?;
        let mut ctls = vec![];
        for rec in file.ctl_l {
            let mut cmds = vec![];
            for cmd in rec.cmd_l {
                cmds.push(match cmd {
                    CmdRec::Sf { sf_id, bloc, eloc, enable_fl } => Cmd::Sf(SfCmd {
                        sf_id: SfId::from_cfg(sf_id)?,
                        beg_loc: LocId::from(bloc),
                        end_loc: LocId::from(eloc),
                        enable_fl,
                    }),
                    CmdRec::Play {
                        seg_type,
                        seg_label,
                        seg_id,
                        player_seg_num,
                        player_label,
                    } => Cmd::Play(PlayCmd {
                        player: PlayerKind::from_seg_type(&seg_type)?,
                        seg_id,
                        seg_label,
                        person_label: player_label,
                        person_seg_num: player_seg_num,
                    }),
                });
            }
            ctls.push(Ctl {
                seg_id: rec.seg_id,
                loc_id: LocId::from(rec.loc_id),
                active_sf_id: SfId::from_cfg(rec.active_sf_id)?,
                cmds,
            });
        }
        Ok(Self {
            ctls,
            last_ctl_idx: None,
            last_loc_id: None,
            cur_goto_seg: None,
            effects: vec![],
        })
    }

    /// Effects accumulated since the last drain.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub fn segment_count(&self) -> usize {
        self.ctls.len()
    }

    /// Process the follower's location stream for one cycle.
    pub fn exec(&mut self, input: &[Record]) -> Result<()> {
        for r in input {
            if let Some(loc) = r.loc {
                self.on_rt_loc(loc)?;
            }
        }
        Ok(())
    }

    /// React to a live location: when it lands on a control record that
    /// differs from the last seen location, apply the record.
    pub fn on_rt_loc(&mut self, loc: LocId) -> Result<()> {
        if self.last_loc_id == Some(loc) {
            return Ok(());
        }
        if let Some(idx) = self.ctls.iter().position(|c| c.loc_id == loc) {
            self.apply_ctl_record(idx, true, false)?;
        }
        self.effects.push(Effect::LocOut(loc));
        self.last_loc_id = Some(loc);
        Ok(())
    }

    /// Move to a segment without playing it: the record's SF commands are
    /// applied, both players are reset, and the local reset output fires.
    pub fn goto_seg(&mut self, seg_id: u32) -> Result<()> {
        self.exec_seg(seg_id, false, false)?;
        self.effects.push(Effect::PlayerReset { player: PlayerKind::Simul });
        self.effects.push(Effect::PlayerReset { player: PlayerKind::Spirio });
        self.effects.push(Effect::ResetOut);
        self.cur_goto_seg = Some(seg_id);
        info!("goto: seg:{}", seg_id);
        Ok(())
    }

    /// Apply a segment with its play command; the segment starts
    /// immediately because the player is commanded exclusively.
    pub fn play_now(&mut self, seg_id: u32) -> Result<()> {
        self.exec_seg(seg_id, true, true)?;
        info!("play now: seg:{}", seg_id);
        Ok(())
    }

    /// Advance to the next segment whose active SF differs from the one
    /// presumed unresponsive, then disable the stuck SF. It will be
    /// re-enabled by the next tracked segment's own commands.
    pub fn recover(&mut self) -> Result<()> {
        let last_idx = self.last_ctl_idx.ok_or_else(|| {
            Error::InvalidState(
                "the last control index is not set; no recovery is possible".to_string(),
            )
        })?;
        let cur_active = self.ctls[last_idx].active_sf_id;

        if let Some(idx) = ((last_idx + 1)..self.ctls.len())
            .find(|&i| self.ctls[i].active_sf_id != cur_active)
        {
            let seg_id = self.ctls[idx].seg_id;
            self.exec_seg(seg_id, false, false)?;
        }

        self.effects.push(Effect::SfEnable {
            sf: cur_active,
            enable_fl: false,
        });
        info!("recover: disabled {:?}", cur_active);
        Ok(())
    }

    /// Clear memoized state and re-enter the current starting segment.
    pub fn reset(&mut self) -> Result<()> {
        self.last_ctl_idx = None;
        self.last_loc_id = None;
        match self.cur_goto_seg {
            Some(seg_id) => self.goto_seg(seg_id),
            None => Ok(()),
        }
    }

    fn exec_seg(&mut self, seg_id: u32, exec_play_fl: bool, play_now_fl: bool) -> Result<()> {
        let idx = self
            .ctls
            .iter()
            .position(|c| c.seg_id == seg_id)
            .ok_or_else(|| {
                Error::InvalidArg(format!("the segment id '{}' was not found", seg_id))
            })?;
        self.apply_ctl_record(idx, exec_play_fl, play_now_fl)
    }

    fn apply_ctl_record(
        &mut self,
        ctl_idx: usize,
        exec_play_fl: bool,
        play_now_fl: bool,
    ) -> Result<()> {
        if ctl_idx >= self.ctls.len() {
            return Err(Error::InvalidArg(format!(
                "the requested ctl index {} is out of range {}",
                ctl_idx,
                self.ctls.len()
            )));
        }
        let ctl = self.ctls[ctl_idx].clone();

        for cmd in &ctl.cmds {
            match cmd {
                Cmd::Sf(sf) => {
                    self.effects.push(Effect::SfConfig {
                        sf: sf.sf_id,
                        beg_loc: sf.beg_loc,
                        end_loc: sf.end_loc,
                        enable_fl: sf.enable_fl,
                    });
                }
                Cmd::Play(play) if exec_play_fl => {
                    match play.player {
                        PlayerKind::Spirio => {
                            self.effects.push(Effect::Play {
                                player: PlayerKind::Spirio,
                                seg_id: play.seg_id,
                                excl_fl: play_now_fl,
                            });
                            if play_now_fl {
                                self.effects.push(Effect::Clear { player: PlayerKind::Simul });
                            }
                        }
                        PlayerKind::Simul => {
                            self.effects.push(Effect::Play {
                                player: PlayerKind::Simul,
                                seg_id: play.seg_id,
                                excl_fl: false,
                            });
                        }
                    }
                    info!(
                        "active: seg_id:{} '{}' {}-{}",
                        ctl.seg_id, play.seg_label, play.person_label, play.person_seg_num
                    );
                }
                Cmd::Play(_) => {}
            }
        }

        self.last_ctl_idx = Some(ctl_idx);
        Ok(())
    }
}
