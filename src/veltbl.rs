//! Velocity remapping through named lookup tables.
//!
//! When the input record carries a score-matched velocity the table is
//! indexed by it instead of the raw key velocity, so the mapped dynamics
//! follow the score rather than the performer's hardware.

use crate::error::{Error, Result};
use crate::record::{Record, RecordBuf};
use log::{info, warn};
use serde::Deserialize;
use std::path::Path;

#[derive(Deserialize)]
struct TableRec {
    name: String,
    table: Vec<u8>,
}

#[derive(Deserialize)]
struct TableFile {
    tables: Vec<TableRec>,
}

pub struct VelTableMap {
    tables: Vec<TableRec>,
    active: usize,
    out: RecordBuf,
}

impl VelTableMap {
    pub fn from_cfg_path<P: AsRef<Path>>(
        path: P,
        active_label: &str,
        out_capacity: usize,
    ) -> Result<Self> {
        let text = std::fs::read_to_string(&path).map_err(|e| {
            Error::OpFail(format!(
                "the velocity table file '{}' could not be read: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_cfg_str(&text, active_label, out_capacity)
    }

    pub fn from_cfg_str(text: &str, active_label: &str, out_capacity: usize) -> Result<Self> {
        let file: TableFile = serde_json::from_str(text)?;
        if file.tables.is_empty() {
            return Err(Error::InvalidArg(
                "the velocity table file has no tables".to_string(),
            ));
        }
        for t in &file.tables {
            if t.table.is_empty() {
                return Err(Error::InvalidArg(format!(
                    "the velocity table named '{}' appears to be blank",
                    t.name
                )));
            }
        }
        let active = match file.tables.iter().position(|t| t.name == active_label) {
            Some(i) => i,
            None => {
                warn!(
                    "the requested velocity table '{}' was not found; using '{}'",
                    active_label, file.tables[0].name
                );
                0
            }
        };
        Ok(Self {
            tables: file.tables,
            active,
            out: RecordBuf::new(out_capacity),
        })
    }

    pub fn active_label(&self) -> &str {
        &self.tables[self.active].name
    }

    /// Switch the active table. An unknown label keeps the current table.
    pub fn activate(&mut self, label: &str) {
        match self.tables.iter().position(|t| t.name == label) {
            Some(i) => {
                self.active = i;
                info!("velocity table '{}' activated", label);
            }
            None => warn!("the requested velocity table '{}' was not found", label),
        }
    }

    pub fn out(&self) -> &[Record] {
        self.out.as_slice()
    }

    /// Copy the input records through, remapping note-on velocities.
    pub fn exec(&mut self, input: &[Record]) -> Result<()> {
        self.out.clear();
        let tbl = &self.tables[self.active].table;

        for r in input {
            let mut r = *r;
            if let Some(mut m) = r.midi {
                if m.is_note_on() {
                    // a score-matched velocity drives the map when present
                    let idx = r.score_vel.unwrap_or_else(|| m.d1.as_int()) as usize;
                    if idx >= tbl.len() {
                        return Err(Error::InvalidArg(format!(
                            "the pre-mapped velocity {} is outside the range ({}) of the \
                             velocity table '{}'",
                            idx,
                            tbl.len(),
                            self.tables[self.active].name
                        )));
                    }
                    m.d1 = tbl[idx].into();
                    r.midi = Some(m);
                }
            }
            self.out.push(r)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::{self, ChMsg};

    fn cfg() -> String {
        let half: Vec<u8> = (0..128u32).map(|v| (v / 2) as u8).collect();
        let double: Vec<u8> = (0..128u32).map(|v| (v * 2).min(127) as u8).collect();
        serde_json::json!({
            "tables": [
                { "name": "half", "table": half },
                { "name": "double", "table": double },
            ]
        })
        .to_string()
    }

    fn note_on(vel: u8) -> Record {
        Record::from_midi(ChMsg::new(0, midi::NOTE_ON, 60, vel))
    }

    #[test]
    fn raw_velocity_is_mapped_through_the_active_table() {
        let mut vt = VelTableMap::from_cfg_str(&cfg(), "half", 16).unwrap();
        vt.exec(&[note_on(100)]).unwrap();
        assert_eq!(vt.out()[0].midi.unwrap().d1.as_int(), 50);
    }

    #[test]
    fn score_velocity_drives_the_map_when_present() {
        let mut vt = VelTableMap::from_cfg_str(&cfg(), "half", 16).unwrap();
        vt.exec(&[note_on(100).with_score_vel(40)]).unwrap();
        assert_eq!(vt.out()[0].midi.unwrap().d1.as_int(), 20);
    }

    #[test]
    fn non_note_records_pass_through_unchanged() {
        let mut vt = VelTableMap::from_cfg_str(&cfg(), "half", 16).unwrap();
        let ctl = Record::from_midi(ChMsg::control(0, midi::SUSTAIN_CTL, 127));
        vt.exec(&[ctl]).unwrap();
        assert_eq!(vt.out()[0], ctl);
    }

    #[test]
    fn switching_tables_takes_effect() {
        let mut vt = VelTableMap::from_cfg_str(&cfg(), "half", 16).unwrap();
        vt.activate("double");
        vt.exec(&[note_on(30)]).unwrap();
        assert_eq!(vt.out()[0].midi.unwrap().d1.as_int(), 60);

        // an unknown label keeps the current table
        vt.activate("missing");
        assert_eq!(vt.active_label(), "double");
    }

    #[test]
    fn out_of_range_score_velocity_is_an_error() {
        let short = serde_json::json!({
            "tables": [ { "name": "short", "table": [0, 1, 2, 3] } ]
        })
        .to_string();
        let mut vt = VelTableMap::from_cfg_str(&short, "short", 16).unwrap();
        assert!(matches!(
            vt.exec(&[note_on(100)]),
            Err(Error::InvalidArg(_))
        ));
    }

    #[test]
    fn unknown_startup_label_falls_back_to_the_first_table() {
        let vt = VelTableMap::from_cfg_str(&cfg(), "missing", 16).unwrap();
        assert_eq!(vt.active_label(), "half");
    }
}
