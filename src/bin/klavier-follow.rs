//! Offline score-follower run: replay a recorded performance CSV against
//! a reference score CSV and report the tracking result.

use anyhow::{bail, Context, Result};
use crossbeam_channel::unbounded;
use klavier::follow::{FollowArgs, Follower};
use klavier::midi::pitch_to_name;
use klavier::score::Score;
use klavier::LocId;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "klavier-follow", about = "Track a recorded performance against a score")]
struct Cli {
    /// Reference score CSV (with an 'oloc' column).
    #[structopt(short = "s", long = "score-file", parse(from_os_str))]
    score_file: PathBuf,

    /// Performance CSV (MIDI-only: sec, status, d0, d1).
    #[structopt(short = "p", long = "perf-file", parse(from_os_str))]
    perf_file: PathBuf,

    /// First tracked location.
    #[structopt(short = "b", long = "b-loc")]
    b_loc: Option<usize>,

    /// Last tracked location.
    #[structopt(short = "e", long = "e-loc")]
    e_loc: Option<usize>,
}

struct PerfNote {
    uid: u32,
    sec: f64,
    pitch: u8,
    vel: u8,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Cli::from_args();

    let score = Score::from_csv_path(&args.score_file)
        .with_context(|| format!("score load failed on {}", args.score_file.display()))?;
    if !score.has_loc_info() {
        bail!(
            "{} has no 'oloc' column; it is not a score CSV",
            args.score_file.display()
        );
    }

    let perf = Score::from_csv_path(&args.perf_file)
        .with_context(|| format!("performance load failed on {}", args.perf_file.display()))?;

    let mut follower = Follower::new(FollowArgs::default(), &score)?;
    let max_loc = usize::from(follower.max_loc_id());
    let beg = args.b_loc.unwrap_or(0);
    let end = args.e_loc.unwrap_or(max_loc);
    follower.reset(LocId::from(beg), LocId::from(end))?;

    // feed the performance through a channel, the same shape a live MIDI
    // callback thread would use
    let (tx, rx) = unbounded::<PerfNote>();
    let feeder = std::thread::spawn(move || {
        for evt in perf.events().iter().filter(|e| e.is_note_on()) {
            if tx
                .send(PerfNote {
                    uid: evt.uid,
                    sec: evt.sec,
                    pitch: evt.pitch,
                    vel: evt.d1,
                })
                .is_err()
            {
                break;
            }
        }
    });

    for note in rx.iter() {
        match follower.on_new_note(note.uid, note.sec, note.pitch, note.vel) {
            Some(m) => println!(
                "{:>7.3} {:<4} -> loc {:>5} meas {:>4}",
                note.sec,
                pitch_to_name(note.pitch),
                usize::from(m.loc),
                m.meas
            ),
            None => println!("{:>7.3} {:<4} -> ignored", note.sec, pitch_to_name(note.pitch)),
        }
        follower.do_exec();
    }
    feeder.join().ok();

    let rpt = follower.report_summary();
    println!(
        "notes:{} matched:{} missed:{} spurious:{}",
        rpt.perf_note_n, rpt.match_n, rpt.miss_n, rpt.spurious_n
    );
    Ok(())
}
