use crate::midi::NOTE_ON;
use crate::score::{EventSpec, Score};

/// Build a score of plain note-ons from `(loc, sec, pitch)` triples.
/// Every note lands in measure 1, bar 1, with velocity 64.
pub fn note_score(notes: &[(usize, f64, u8)]) -> Score {
    let specs = notes
        .iter()
        .map(|&(loc, sec, pitch)| EventSpec {
            loc: Some(loc),
            sec,
            meas: 1,
            bar: 1,
            status: NOTE_ON,
            d0: pitch,
            d1: 64,
            ..EventSpec::default()
        })
        .collect();
    Score::from_events(specs).unwrap()
}
