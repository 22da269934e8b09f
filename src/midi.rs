//! MIDI channel-message model shared by the sequencers and the follower.
//!
//! Status bytes are carried with the channel nibble removed; the channel
//! lives in its own field. This mirrors the wire format of the score and
//! player files, where `status` and `ch` are separate columns.

use midly::num::{u4, u7};
use once_cell::sync::Lazy;
use std::collections::HashMap;

pub const NOTE_OFF: u8 = 0x80;
pub const NOTE_ON: u8 = 0x90;
pub const POLY_PRESSURE: u8 = 0xa0;
pub const CONTROL: u8 = 0xb0;
pub const PROGRAM: u8 = 0xc0;
pub const CH_PRESSURE: u8 = 0xd0;
pub const PITCH_BEND: u8 = 0xe0;

pub const SUSTAIN_CTL: u8 = 64;
pub const SOSTENUTO_CTL: u8 = 66;
pub const SOFT_CTL: u8 = 67;
pub const RESET_ALL_CTLS: u8 = 121;
pub const ALL_NOTES_OFF: u8 = 123;

pub const CH_CNT: usize = 16;
pub const NOTE_CNT: usize = 128;
pub const CTL_CNT: usize = 128;

/// A timestamped MIDI channel message with routing tags.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChMsg {
    pub sec: f64,
    pub port_idx: u32,
    pub dev_idx: u32,
    pub uid: u32,
    pub ch: u4,
    pub status: u8,
    pub d0: u7,
    pub d1: u7,
}

impl Default for ChMsg {
    fn default() -> Self {
        Self {
            sec: 0.0,
            port_idx: 0,
            dev_idx: 0,
            uid: 0,
            ch: u4::from(0),
            status: 0,
            d0: u7::from(0),
            d1: u7::from(0),
        }
    }
}

impl ChMsg {
    pub fn new(ch: u8, status: u8, d0: u8, d1: u8) -> Self {
        Self {
            ch: u4::from(ch & 0x0f),
            status: status & 0xf0,
            d0: u7::from(d0 & 0x7f),
            d1: u7::from(d1 & 0x7f),
            ..Self::default()
        }
    }

    pub fn control(ch: u8, ctl: u8, value: u8) -> Self {
        Self::new(ch, CONTROL, ctl, value)
    }

    pub fn all_notes_off(ch: u8) -> Self {
        Self::control(ch, ALL_NOTES_OFF, 0)
    }

    pub fn reset_all_ctls(ch: u8) -> Self {
        Self::control(ch, RESET_ALL_CTLS, 0)
    }

    pub fn damper_down(ch: u8) -> Self {
        Self::control(ch, SUSTAIN_CTL, 64)
    }

    pub fn sostenuto_down(ch: u8) -> Self {
        Self::control(ch, SOSTENUTO_CTL, 64)
    }

    pub fn is_note_on(&self) -> bool {
        is_note_on(self.status, self.d1.as_int())
    }

    pub fn is_note_off(&self) -> bool {
        is_note_off(self.status, self.d1.as_int())
    }
}

/// A note-on with velocity zero is a note-off in disguise.
pub fn is_note_on(status: u8, d1: u8) -> bool {
    status == NOTE_ON && d1 > 0
}

pub fn is_note_off(status: u8, d1: u8) -> bool {
    status == NOTE_OFF || (status == NOTE_ON && d1 == 0)
}

pub fn is_ctl(status: u8) -> bool {
    status == CONTROL
}

pub fn is_sustain_pedal(status: u8, d0: u8) -> bool {
    status == CONTROL && d0 == SUSTAIN_CTL
}

pub fn is_sostenuto_pedal(status: u8, d0: u8) -> bool {
    status == CONTROL && d0 == SOSTENUTO_CTL
}

pub fn is_soft_pedal(status: u8, d0: u8) -> bool {
    status == CONTROL && d0 == SOFT_CTL
}

pub fn is_pedal_down(d1: u8) -> bool {
    d1 >= 64
}

/// Join two 7-bit data bytes into the 14-bit value of a pitch-bend message.
pub fn to_14_bits(d0: u8, d1: u8) -> u16 {
    ((d1 as u16) << 7) | d0 as u16
}

const PITCH_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

static NAME_TO_SEMITONE: Lazy<HashMap<&'static str, u8>> = Lazy::new(|| {
    let mut m = HashMap::new();
    for (i, n) in PITCH_NAMES.iter().enumerate() {
        m.insert(*n, i as u8);
    }
    // flat spellings map onto the same semitones
    for (n, i) in [("Db", 1u8), ("Eb", 3), ("Gb", 6), ("Ab", 8), ("Bb", 10)] {
        m.insert(n, i);
    }
    m
});

/// Convert a MIDI pitch to scientific pitch notation, e.g. 60 -> "C4".
pub fn pitch_to_name(pitch: u8) -> String {
    let octave = (pitch as i32) / 12 - 1;
    format!("{}{}", PITCH_NAMES[(pitch % 12) as usize], octave)
}

/// Parse scientific pitch notation, e.g. "C4" -> 60, "Eb5" -> 75.
/// Returns `None` for anything that is not a pitch (bar rows, rests).
pub fn name_to_pitch(name: &str) -> Option<u8> {
    let name = name.trim();
    let split = name
        .char_indices()
        .find(|(_, c)| c.is_ascii_digit() || *c == '-')
        .map(|(i, _)| i)?;
    let (letters, octave) = name.split_at(split);
    let semitone = *NAME_TO_SEMITONE.get(letters)?;
    let octave: i32 = octave.parse().ok()?;
    let pitch = (octave + 1) * 12 + semitone as i32;
    (0..128).contains(&pitch).then(|| pitch as u8)
}
