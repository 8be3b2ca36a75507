// a small target for the integration tests. prints "ready", then reads one
// command per line and prints "done <total ticks>" after each:
//   N           main thread calls fixture_tick N times
//   worker N    the worker thread started at launch does it
//   spawn N     a new thread does it
//   both N      the worker and a new thread each do it at the same time
// "quit" or end of input exits.

use crossbeam::channel::{unbounded, Receiver, Sender};
use std::{
    hint::black_box,
    io::{self, BufRead, Write},
    sync::atomic::{AtomicU64, Ordering},
    thread,
};

static TICKS: AtomicU64 = AtomicU64::new(0);

#[no_mangle]
#[inline(never)]
pub extern "C" fn fixture_tick(n: u64) -> u64 {
    TICKS.fetch_add(1, Ordering::SeqCst);
    black_box(n).wrapping_add(1)
}

fn run_ticks(count: u64) {
    let mut acc = 0u64;
    for i in 0..count {
        acc = acc.wrapping_add(fixture_tick(i));
    }
    black_box(acc);
}

struct Worker {
    work_tx: Sender<u64>,
    done_rx: Receiver<()>,
}

impl Worker {
    fn start() -> io::Result<Worker> {
        let (work_tx, work_rx) = unbounded::<u64>();
        let (done_tx, done_rx) = unbounded();
        thread::Builder::new().name("fixture-worker".to_owned()).spawn(move || {
            for count in work_rx {
                run_ticks(count);
                if done_tx.send(()).is_err() {
                    break;
                }
            }
        })?;
        Ok(Worker { work_tx, done_rx })
    }

    fn submit(&self, count: u64) -> bool {
        self.work_tx.send(count).is_ok()
    }

    fn finish(&self) -> bool {
        self.done_rx.recv().is_ok()
    }
}

fn spawn_ticks(count: u64) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name("fixture-spawned".to_owned()).spawn(move || run_ticks(count))
}

fn run_command(worker: &Worker, command: &str, count: u64) -> bool {
    match command {
        "" => {
            run_ticks(count);
            true
        }
        "worker" => worker.submit(count) && worker.finish(),
        "spawn" => spawn_ticks(count).map(|t| t.join().is_ok()).unwrap_or(false),
        "both" => {
            if !worker.submit(count) {
                return false;
            }
            let spawned = spawn_ticks(count).map(|t| t.join().is_ok()).unwrap_or(false);
            worker.finish() && spawned
        }
        _ => false,
    }
}

fn main() {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    // running before anything attaches
    let worker = match Worker::start() {
        Ok(worker) => worker,
        Err(e) => {
            let _ = writeln!(out, "can't start worker: {}", e);
            return;
        }
    };
    let _ = writeln!(out, "ready");
    let _ = out.flush();

    for line in io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line == "quit" {
            break;
        }
        let (command, arg) = line.split_once(' ').unwrap_or(("", line));
        let ok = match arg.parse::<u64>() {
            Ok(count) => run_command(&worker, command, count),
            Err(_) => false,
        };
        if ok {
            let _ = writeln!(out, "done {}", TICKS.load(Ordering::SeqCst));
        } else {
            let _ = writeln!(out, "bad command {:?}", line);
        }
        let _ = out.flush();
    }
}
