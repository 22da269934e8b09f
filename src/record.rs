//! The record bus: a typed tuple flowing between components, and the
//! bounded ring each producer owns.
//!
//! Every component documents which fields it sets; unset fields stay
//! `None` so a downstream consumer can tell "no value" from zero.

use crate::error::{Error, Result};
use crate::midi::ChMsg;
use crate::LocId;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Record {
    pub midi: Option<ChMsg>,
    pub loc: Option<LocId>,
    pub meas: Option<u32>,
    pub port_id: Option<u32>,
    pub score_vel: Option<u8>,
    pub piano_id: Option<u32>,
}

impl Record {
    pub fn from_midi(midi: ChMsg) -> Self {
        Self {
            midi: Some(midi),
            ..Self::default()
        }
    }

    pub fn with_loc(mut self, loc: LocId) -> Self {
        self.loc = Some(loc);
        self
    }

    pub fn with_meas(mut self, meas: u32) -> Self {
        self.meas = Some(meas);
        self
    }

    pub fn with_port_id(mut self, port_id: u32) -> Self {
        self.port_id = Some(port_id);
        self
    }

    pub fn with_score_vel(mut self, score_vel: u8) -> Self {
        self.score_vel = Some(score_vel);
        self
    }

    pub fn with_piano_id(mut self, piano_id: u32) -> Self {
        self.piano_id = Some(piano_id);
        self
    }
}

/// A bounded record ring. Storage is allocated once at create time; the
/// producing component clears it at the top of each `exec` and consumers
/// borrow the emitted slice until the next `exec`.
#[derive(Debug)]
pub struct RecordBuf {
    recs: Vec<Record>,
    len: usize,
}

impl RecordBuf {
    pub fn new(capacity: usize) -> Self {
        Self {
            recs: vec![Record::default(); capacity],
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.recs.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn push(&mut self, r: Record) -> Result<()> {
        if self.len >= self.recs.len() {
            return Err(Error::BufTooSmall(format!(
                "record buffer overflowed (capacity {})",
                self.recs.len()
            )));
        }
        self.recs[self.len] = r;
        self.len += 1;
        Ok(())
    }

    pub fn as_slice(&self) -> &[Record] {
        &self.recs[..self.len]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.as_slice().iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi;

    #[test]
    fn push_and_drain() {
        let mut buf = RecordBuf::new(4);
        buf.push(Record::from_midi(ChMsg::new(0, midi::NOTE_ON, 60, 64)))
            .unwrap();
        buf.push(Record::default().with_loc(LocId::from(3usize)))
            .unwrap();
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.as_slice()[1].loc, Some(LocId::from(3usize)));
        buf.clear();
        assert!(buf.is_empty());
    }

    #[test]
    fn overflow_reports_buf_too_small() {
        let mut buf = RecordBuf::new(1);
        buf.push(Record::default()).unwrap();
        let err = buf.push(Record::default()).unwrap_err();
        assert!(matches!(err, Error::BufTooSmall(_)));
    }
}
