//! Gapless console audio player.
//!
//! The main thread runs its own event loop: a raw-mode stdin watch maps
//! keys onto player controls, and engine callbacks are trampolined back
//! here as delegates so all terminal output happens on one thread. A
//! background worker scans the playlist for track durations while playback
//! runs.

mod decoder;
mod logging;
mod sink;

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};

use clap::Parser;
use crossterm::terminal;
use log::{info, warn};

use auris_lib::decoder::DecoderStream;
use auris_lib::delegate::Delegator;
use auris_lib::event_loop::{EventLoop, LoopHandle, PollFlags};
use auris_lib::player::{Cookie, Player, PlayerEvents};
use auris_lib::sink::SinkInfo;
use auris_lib::worker::Worker;

use crate::decoder::{probe_duration, FileStream};
use crate::sink::AudioSink;

const SEEK_STEP_MS: i64 = 5_000;
const JOB_SCAN: u32 = 1;

#[derive(Parser, Debug)]
#[command(author, version, about = "Gapless console audio player", long_about = None)]
struct Cli {
    /// Playback gain in percent
    #[arg(short, long, default_value_t = 80.0, value_name = "GAIN")]
    gain: f32,

    /// Files to play, in order
    #[arg(required = true)]
    files: Vec<String>,
}

struct App {
    player: Player,
    handle: LoopHandle<App>,
    worker: Worker<(String, f64)>,
}

struct PlaylistHost {
    main: Arc<Delegator<App>>,
    queue: Mutex<VecDeque<(String, u64)>>,
    names: Vec<String>,
}

impl PlaylistHost {
    fn name_of(&self, cookie: Cookie) -> String {
        self.names
            .get(cookie.0 as usize)
            .cloned()
            .unwrap_or_default()
    }
}

impl PlayerEvents for PlaylistHost {
    fn position_changed(&self, seconds: u32) {
        self.main.post(move |_app| {
            print!("\r{:>3}:{:02} ", seconds / 60, seconds % 60);
            let _ = std::io::stdout().flush();
        });
    }

    fn track_changed(&self, cookie: Option<Cookie>) {
        match cookie {
            Some(cookie) => {
                let name = self.name_of(cookie);
                self.main.post(move |_app| {
                    print!("\r\nplaying: {name}\r\n");
                    let _ = std::io::stdout().flush();
                });
            }
            None => {
                self.main.post(|app| {
                    print!("\r\nplaylist finished\r\n");
                    let _ = std::io::stdout().flush();
                    app.handle.stop(0);
                });
            }
        }
    }

    fn sink_info_changed(&self, info: SinkInfo) {
        self.main.post(move |_app| {
            print!(
                "\r\noutput: paused={} mute={} stopped={} volume={}/{}\r\n",
                info.paused, info.mute, info.stopped, info.vol_left, info.vol_right
            );
            let _ = std::io::stdout().flush();
        });
    }

    fn next_track(&self) -> Option<(Box<dyn DecoderStream>, Cookie)> {
        loop {
            let (path, id) = self.queue.lock().unwrap().pop_front()?;
            match FileStream::open(&path, &AudioSink::accepted_range()) {
                Ok(stream) => {
                    return Some((Box::new(stream) as Box<dyn DecoderStream>, Cookie(id)))
                }
                Err(err) => warn!("skipping {path}: {err}"),
            }
        }
    }
}

fn read_key() -> Option<u8> {
    let mut byte = 0u8;
    let rc = unsafe { libc::read(0, (&mut byte as *mut u8).cast(), 1) };
    (rc == 1).then_some(byte)
}

fn handle_stdin(app: &mut App) {
    let Some(key) = read_key() else {
        app.handle.stop(0);
        return;
    };
    match key {
        b'c' | b' ' => app.player.toggle_pause(),
        b'm' => app.player.toggle_mute(),
        b'h' => app.player.seek(-SEEK_STEP_MS),
        b'l' => app.player.seek(SEEK_STEP_MS),
        b'n' => app.player.goto_next(),
        // 0x03 is ^C, delivered as a byte in raw mode.
        b'q' | 0x03 => app.handle.stop(0),
        _ => {}
    }
}

fn main() {
    logging::init();
    let args = Cli::parse();

    let main_delegator = Arc::new(Delegator::<App>::new());
    let names = args.files.clone();
    let queue: VecDeque<(String, u64)> = names
        .iter()
        .cloned()
        .enumerate()
        .map(|(id, path)| (path, id as u64))
        .collect();
    let host = Arc::new(PlaylistHost {
        main: main_delegator.clone(),
        queue: Mutex::new(queue),
        names,
    });

    let Some((first, cookie)) = host.next_track() else {
        eprintln!("error: no playable files");
        std::process::exit(1);
    };

    let player = Player::new(host.clone() as Arc<dyn PlayerEvents>);
    let audio = AudioSink::new(player.sink_controller(), args.gain / 100.0);
    player.set_sink(Box::new(audio));
    player.set_input(first, cookie);

    let worker: Worker<(String, f64)> = Worker::new();
    for path in args.files.iter().cloned() {
        worker.submit(JOB_SCAN, move |ctx| {
            if ctx.cancelled() {
                return;
            }
            if let Some(secs) = probe_duration(&path) {
                ctx.push_result((path, secs));
            }
        });
    }

    let event_loop = EventLoop::with_delegator(main_delegator);
    let handle = event_loop.handle();

    let stdin_watch = handle.add_watch(|app: &mut App, _fd, _events| handle_stdin(app));
    stdin_watch.set(0, PollFlags::POLLIN);

    let scan_watch = handle.add_watch(|app: &mut App, _fd, _events| {
        app.worker.clear_result_fd();
        while let Some((path, secs)) = app.worker.try_result() {
            let total = secs as u32;
            print!("\r{path}: {}:{:02}\r\n", total / 60, total % 60);
            let _ = std::io::stdout().flush();
        }
    });
    scan_watch.set(worker.result_fd(), PollFlags::POLLIN);

    let mut app = App {
        player,
        handle: event_loop.handle(),
        worker,
    };

    let raw_mode = terminal::enable_raw_mode().is_ok();
    if !raw_mode {
        warn!("terminal raw mode unavailable; key handling may be line buffered");
    }
    info!("keys: c pause, m mute, h/l seek 5s, n next track, q quit");

    event_loop.run(&mut app);

    if raw_mode {
        let _ = terminal::disable_raw_mode();
    }
    println!();
    app.player.shutdown();
}
