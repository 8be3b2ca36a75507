use super::{
    control_loop::{ControlLoop, LoopChannels, Request, SessionShared},
    debugger::{
        BreakpointCallback, BreakpointHandle, BreakpointInfo, CallbackError, ReadMode, Result, SessionState, TraceError,
        Tracee,
    },
    host_debuggers::debugger_linux::{signal_target, PtraceTracee},
};
use crate::binary_formats::elf::debug_symbols::SymbolTable;
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, info};
use std::{
    path::Path,
    sync::{atomic::Ordering, Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Deliver signals other than job-control stops to the target when it
    /// resumes. Stops are always swallowed since they double as checkpoints.
    pub forward_signals: bool,
    /// Name of the control thread, `livetrace-<pid>` when unset.
    pub thread_name: Option<String>,
    /// What the caller knows the target to be ("worker", "server" ...).
    /// Only used to label log output.
    pub role: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            forward_signals: true,
            thread_name: None,
            role: None,
        }
    }
}

/// A live process with breakpoints that run closures when hit.
///
/// All process control happens on a dedicated thread started by
/// [`TraceSession::attach`]. Every method here enqueues a request for that
/// thread, stops the target with `SIGSTOP` so the request gets picked up, and
/// blocks until it is answered. Dropping the session detaches from the target
/// and restores every patched byte.
pub struct TraceSession {
    pid: i32,
    req_tx: Sender<Request>,
    doorbell_tx: Sender<()>,
    shared: Arc<SessionShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TraceSession {
    pub fn attach<P: AsRef<Path>>(pid: i32, exe: P, symbols: Arc<SymbolTable>) -> Result<TraceSession> {
        Self::attach_with(pid, exe, symbols, SessionOptions::default())
    }

    /// Attaches to `pid`, whose main executable is `exe` and was described by
    /// `symbols`, and returns once the target is running under the session.
    pub fn attach_with<P: AsRef<Path>>(
        pid: i32,
        exe: P,
        symbols: Arc<SymbolTable>,
        options: SessionOptions,
    ) -> Result<TraceSession> {
        let (req_tx, req_rx) = unbounded();
        let (doorbell_tx, doorbell_rx) = bounded(1);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let shared = Arc::new(SessionShared::new());

        let exe = exe.as_ref().to_owned();
        let thread_shared = Arc::clone(&shared);
        let forward_signals = options.forward_signals;
        let thread_name = options.thread_name.unwrap_or_else(|| format!("livetrace-{}", pid));
        let role = options.role.unwrap_or_else(|| "target".to_owned());

        let thread = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                // runs in: dbg thread
                let tracee = match PtraceTracee::attach(pid, &exe) {
                    Ok(v) => v,
                    Err(e) => {
                        thread_shared.publish(SessionState::Exited, 0);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let load_bias = match tracee.load_bias(symbols.layout()) {
                    Ok(v) => v,
                    Err(e) => {
                        let mut tracee = tracee;
                        if let Err(detach_err) = tracee.detach(&[]) {
                            debug!("couldn't detach from {}: {}", pid, detach_err);
                        }
                        thread_shared.publish(SessionState::Exited, 0);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                info!("attached to {} {} ({:?}), load bias {:#x}", role, pid, exe, load_bias);
                thread_shared.publish(SessionState::Attaching, load_bias);
                *thread_shared.lock_gate() = true;
                let _ = ready_tx.send(Ok(()));

                let channels = LoopChannels { req_rx, doorbell_rx };
                ControlLoop::new(tracee, symbols, load_bias, forward_signals, channels, thread_shared).run();
            })
            .map_err(|e| TraceError::process_control("spawn", e.raw_os_error().unwrap_or(libc::EAGAIN)))?;

        let ready = ready_rx.recv().unwrap_or(Err(TraceError::SessionEnded));
        if let Err(e) = ready {
            let _ = thread.join();
            return Err(e);
        }

        Ok(TraceSession {
            pid,
            req_tx,
            doorbell_tx,
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    // runs in: caller threads
    // enqueue and signal under the gate so a request can never be sent to a
    // target the loop has already let go of
    fn request<V>(&self, make: impl FnOnce(Sender<V>) -> Request) -> Result<V> {
        let (reply_tx, reply_rx): (Sender<V>, Receiver<V>) = bounded(1);
        {
            let alive = self.shared.lock_gate();
            if !*alive {
                return Err(TraceError::SessionEnded);
            }
            self.req_tx.send(make(reply_tx)).map_err(|_| TraceError::SessionEnded)?;
            if let Err(e) = signal_target(self.pid, libc::SIGSTOP) {
                // the loop sees the exit and drops the request
                debug!("couldn't interrupt {}: {}", self.pid, e);
            }
        }
        reply_rx.recv().map_err(|_| TraceError::SessionEnded)
    }

    /// Installs a breakpoint on the entry of `symbol`. `callback` runs on the
    /// control thread, with the target stopped, every time the entry executes.
    pub fn create_breakpoint<F>(&self, symbol: &str, callback: F) -> Result<BreakpointHandle>
    where
        F: FnMut() -> std::result::Result<(), CallbackError> + Send + 'static,
    {
        let callback: BreakpointCallback = Box::new(callback);
        let symbol = symbol.to_owned();
        self.request(|reply| Request::Install { symbol, callback, reply })?
    }

    pub fn remove_breakpoint(&self, handle: &BreakpointHandle) -> Result<()> {
        let id = handle.id();
        self.request(|reply| Request::Remove { id, reply })?
    }

    pub fn breakpoints(&self) -> Result<Vec<BreakpointInfo>> {
        self.request(|reply| Request::List { reply })
    }

    pub fn read_memory(&self, addr: u64, len: usize, mode: ReadMode) -> Result<Vec<u8>> {
        self.request(|reply| Request::ReadMemory { addr, len, mode, reply })?
    }

    /// Holds the target stopped until [`TraceSession::resume`]. Requests are
    /// still serviced while paused.
    pub fn pause(&self) -> Result<()> {
        let alive = self.shared.lock_gate();
        if !*alive {
            return Err(TraceError::SessionEnded);
        }
        self.shared.suspended.store(true, Ordering::SeqCst);
        signal_target(self.pid, libc::SIGSTOP)
    }

    pub fn resume(&self) -> Result<()> {
        let alive = self.shared.lock_gate();
        if !*alive {
            return Err(TraceError::SessionEnded);
        }
        self.shared.suspended.store(false, Ordering::SeqCst);
        let _ = self.doorbell_tx.try_send(());
        signal_target(self.pid, libc::SIGCONT)
    }

    /// Restores every breakpoint, detaches and waits for the control thread.
    /// Does nothing once the session has ended.
    pub fn stop(&self) {
        if let Err(e) = self.request(|reply| Request::Stop { reply }) {
            debug!("stop on {}: {}", self.pid, e);
        }

        let thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.status().state
    }

    pub fn load_bias(&self) -> u64 {
        self.shared.status().load_bias
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        self.stop();
    }
}
