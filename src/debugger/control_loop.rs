use super::{
    breakpoint::{BreakpointContainer, BreakpointEntry, TrapBytes},
    debugger::{
        BreakpointCallback, BreakpointHandle, BreakpointInfo, ReadMode, Result, SessionState, StopEvent, TraceError,
        Tracee, TrapKind,
    },
};
use crate::{
    binary_formats::elf::debug_symbols::SymbolTable,
    consts::arch::{TRAP_PC_ADJUST, TRAP_WIDTH},
};
use arc_swap::ArcSwap;
use crossbeam::{
    channel::{Receiver, Sender},
    select,
};
use log::{debug, error, info, trace, warn};
use smallvec::SmallVec;
use std::{
    any::Any,
    collections::VecDeque,
    mem,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

pub(crate) enum Request {
    Install {
        symbol: String,
        callback: BreakpointCallback,
        reply: Sender<Result<BreakpointHandle>>,
    },
    Remove {
        id: u32,
        reply: Sender<Result<()>>,
    },
    List {
        reply: Sender<Vec<BreakpointInfo>>,
    },
    ReadMemory {
        addr: u64,
        len: usize,
        mode: ReadMode,
        reply: Sender<Result<Vec<u8>>>,
    },
    Stop {
        reply: Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SessionStatus {
    pub state: SessionState,
    pub load_bias: u64,
}

// everything both sides of a session touch
pub(crate) struct SessionShared {
    pub status: ArcSwap<SessionStatus>,
    // true while the target is traced. callers hold this across enqueue and
    // signal, the loop clears it before detaching.
    pub gate: Mutex<bool>,
    pub suspended: AtomicBool,
}

impl SessionShared {
    pub fn new() -> SessionShared {
        SessionShared {
            status: ArcSwap::from_pointee(SessionStatus {
                state: SessionState::Attaching,
                load_bias: 0,
            }),
            gate: Mutex::new(false),
            suspended: AtomicBool::new(false),
        }
    }

    pub fn lock_gate(&self) -> MutexGuard<'_, bool> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> SessionStatus {
        **self.status.load()
    }

    pub fn publish(&self, state: SessionState, load_bias: u64) {
        self.status.store(Arc::new(SessionStatus { state, load_bias }));
    }
}

// stop signals a caller may use to force a checkpoint. never forwarded.
pub(crate) fn is_checkpoint_signal(signal: i32) -> bool {
    matches!(signal, libc::SIGSTOP | libc::SIGTSTP | libc::SIGTTIN | libc::SIGTTOU)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Next {
    Resume(i32),
    Stop,
    Gone,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Flow {
    Continue,
    Stop,
}

// signals a thread received while it was being stepped
type HeldSignals = SmallVec<i32, 4>;

enum StepResult {
    Done { held: HeldSignals },
    // the stepped thread exited, the rest of the process carries on
    ThreadGone,
    Gone,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LoopExit {
    Stopped,
    TargetGone,
}

pub(crate) struct LoopChannels {
    pub req_rx: Receiver<Request>,
    pub doorbell_rx: Receiver<()>,
}

// the session's control thread. owns the tracee and the breakpoint table;
// nothing else touches either.
pub(crate) struct ControlLoop<T: Tracee> {
    tracee: T,
    symbols: Arc<SymbolTable>,
    load_bias: u64,
    forward_signals: bool,
    bps: BreakpointContainer,
    channels: LoopChannels,
    shared: Arc<SessionShared>,
    stop_replies: Vec<Sender<()>>,
    // stops not handled yet. nothing resumes until this is empty.
    pending: VecDeque<StopEvent>,
    // (tid, signal) to deliver on the next resume
    resume_signals: Vec<(i32, i32)>,
    // breakpoints removed since the process last stopped. a thread may
    // already be sitting on one of these traps.
    retired: Vec<u64>,
}

impl<T: Tracee> ControlLoop<T> {
    pub fn new(
        tracee: T,
        symbols: Arc<SymbolTable>,
        load_bias: u64,
        forward_signals: bool,
        channels: LoopChannels,
        shared: Arc<SessionShared>,
    ) -> ControlLoop<T> {
        ControlLoop {
            tracee,
            symbols,
            load_bias,
            forward_signals,
            bps: BreakpointContainer::new(),
            channels,
            shared,
            stop_replies: Vec::new(),
            pending: VecDeque::new(),
            resume_signals: Vec::new(),
            retired: Vec::new(),
        }
    }

    // runs in: dbg thread
    // the target must be stopped on entry. returns once the session is over
    // and the target has been detached (or is gone).
    pub fn run(mut self) {
        let outcome = self.run_inner();
        self.finish(outcome);
    }

    fn publish(&self, state: SessionState) {
        self.shared.publish(state, self.load_bias);
    }

    fn run_inner(&mut self) -> Result<LoopExit> {
        self.publish(SessionState::Running);
        loop {
            let signals = mem::take(&mut self.resume_signals);
            self.tracee.resume_all(&signals)?;

            let event = self.tracee.wait_for_stop()?;
            if event.is_exit() {
                info!("{}", event);
                return Ok(LoopExit::TargetGone);
            }

            // every thread stays stopped until the whole batch is handled
            let others = self.tracee.stop_others()?;
            self.retired.clear();
            self.pending.push_back(event);
            self.pending.extend(others);
            // traps first, so no request can pull a breakpoint out from under a
            // thread that already hit it
            self.pending
                .make_contiguous()
                .sort_by_key(|event| !matches!(event, StopEvent::Trap { .. }));

            while let Some(event) = self.pending.pop_front() {
                trace!("{}", event);
                match self.handle_stop(event)? {
                    Next::Resume(0) => (),
                    Next::Resume(signal) => self.resume_signals.push((event.tid(), signal)),
                    Next::Stop => return Ok(LoopExit::Stopped),
                    Next::Gone => return Ok(LoopExit::TargetGone),
                }
            }
        }
    }

    fn handle_stop(&mut self, event: StopEvent) -> Result<Next> {
        match event {
            StopEvent::Exited { .. } | StopEvent::Killed { .. } => {
                info!("{}", event);
                Ok(Next::Gone)
            }
            StopEvent::Trap { tid, kind } => match kind {
                TrapKind::SoftwareBreakpoint => self.on_breakpoint_trap(tid),
                TrapKind::StepComplete => {
                    trace!("stray single-step completion on {}", tid);
                    Ok(Next::Resume(0))
                }
                TrapKind::Sent => self.checkpoint(libc::SIGTRAP),
                TrapKind::Other(si_code) => {
                    warn!("unexpected trap on {} (si_code {}), resuming", tid, si_code);
                    Ok(Next::Resume(0))
                }
            },
            StopEvent::Signal { signal, .. } => self.checkpoint(signal),
            StopEvent::GroupStop { .. } => self.checkpoint(0),
        }
    }

    fn on_breakpoint_trap(&mut self, tid: i32) -> Result<Next> {
        let pc = self.tracee.read_pc(tid)?;
        let addr = pc.wrapping_sub(TRAP_PC_ADJUST);
        match self.bps.get_breakpoint(addr) {
            Some(bp) if bp.armed() => self.dispatch(tid, addr),
            _ if self.retired.contains(&addr) => {
                // the original instruction is back, run it
                debug!("thread {} hit breakpoint at {:#x} after it was removed", tid, addr);
                self.tracee.write_pc(tid, addr)?;
                Ok(Next::Resume(0))
            }
            _ => {
                warn!("trap at {:#x} on {} doesn't belong to any breakpoint, resuming", addr, tid);
                Ok(Next::Resume(0))
            }
        }
    }

    fn dispatch(&mut self, tid: i32, addr: u64) -> Result<Next> {
        self.publish(SessionState::Dispatching);

        let Some(bp) = self.bps.get_breakpoint_mut(addr) else {
            return Ok(Next::Resume(0));
        };
        self.tracee.poke(addr, bp.orig_bytes())?;
        bp.set_armed(false);
        self.tracee.write_pc(tid, addr)?;
        bp.record_hit();
        trace!("breakpoint {} ({}) hit #{} on {}", bp.id(), bp.description(), bp.hits(), tid);
        Self::run_callback(bp);

        let held = match self.step_over(tid)? {
            StepResult::Done { held } => held,
            StepResult::ThreadGone => HeldSignals::new(),
            StepResult::Gone => return Ok(Next::Gone),
        };

        // the callback can't touch the table, so the entry is still there
        if let Some(bp) = self.bps.get_breakpoint_mut(addr) {
            self.tracee.poke(addr, bp.bp_bytes())?;
            bp.set_armed(true);
        }
        self.publish(SessionState::Running);

        self.deliver_held(tid, held)
    }

    fn run_callback(bp: &mut BreakpointEntry) {
        let callback = bp.callback_mut();
        match panic::catch_unwind(AssertUnwindSafe(|| callback())) {
            Ok(Ok(())) => (),
            Ok(Err(e)) => warn!("callback for {} failed: {}", bp.description(), e),
            Err(payload) => warn!("callback for {} panicked: {}", bp.description(), panic_message(&*payload)),
        }
    }

    // executes the instruction under a disarmed breakpoint while every other
    // thread stays stopped. signals that show up before the step completes
    // are held back and handed to the caller.
    fn step_over(&mut self, tid: i32) -> Result<StepResult> {
        let mut held = HeldSignals::new();
        self.tracee.singlestep(tid)?;
        loop {
            let event = self.tracee.wait_for_stop()?;
            if event.is_exit() {
                if event.tid() != self.tracee.pid() {
                    return Ok(StepResult::ThreadGone);
                }
                info!("{}", event);
                return Ok(StepResult::Gone);
            }
            if event.tid() != tid {
                // handled with the rest of this stop
                self.pending.push_back(event);
                continue;
            }
            match event {
                StopEvent::Trap { kind: TrapKind::StepComplete, .. } => break,
                StopEvent::Trap { kind, .. } => {
                    trace!("trap {:?} while stepping over, treating as complete", kind);
                    break;
                }
                StopEvent::Signal { signal, .. } => {
                    trace!("signal {} arrived while stepping over, holding it", signal);
                    held.push(signal);
                    self.tracee.singlestep(tid)?;
                }
                StopEvent::GroupStop { .. } | StopEvent::Exited { .. } | StopEvent::Killed { .. } => {
                    self.tracee.singlestep(tid)?;
                }
            }
        }
        Ok(StepResult::Done { held })
    }

    // one signal can go out with the resume. any others are raised on the
    // thread again and come back as ordinary stops.
    fn deliver_held(&mut self, tid: i32, held: HeldSignals) -> Result<Next> {
        let mut saw_checkpoint = false;
        let mut deliver = None;
        for signal in held {
            if is_checkpoint_signal(signal) {
                saw_checkpoint = true;
            } else if deliver.is_none() {
                deliver = Some(signal);
            } else if self.forward_signals {
                debug!("raising held signal {} on {} again", signal, tid);
                self.tracee.requeue_signal(tid, signal)?;
            } else {
                trace!("dropping held signal {} on {}", signal, tid);
            }
        }

        match deliver {
            Some(signal) => self.checkpoint(signal),
            None if saw_checkpoint => self.checkpoint(libc::SIGSTOP),
            None => Ok(Next::Resume(0)),
        }
    }

    fn checkpoint(&mut self, signal: i32) -> Result<Next> {
        if self.service_requests()? == Flow::Stop {
            return Ok(Next::Stop);
        }
        if self.shared.suspended.load(Ordering::SeqCst) && self.park()? == Flow::Stop {
            return Ok(Next::Stop);
        }

        let deliver = if signal == 0 || is_checkpoint_signal(signal) || !self.forward_signals {
            0
        } else {
            signal
        };
        if deliver != 0 {
            debug!("forwarding signal {} to {}", deliver, self.tracee.pid());
        }
        Ok(Next::Resume(deliver))
    }

    fn service_requests(&mut self) -> Result<Flow> {
        while let Ok(request) = self.channels.req_rx.try_recv() {
            if self.handle_request(request)? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    // holds the target stopped until resume() clears the flag. requests are
    // still serviced in the meantime.
    fn park(&mut self) -> Result<Flow> {
        let req_rx = self.channels.req_rx.clone();
        let doorbell_rx = self.channels.doorbell_rx.clone();

        info!("{} paused", self.tracee.pid());
        self.publish(SessionState::Paused);
        while self.shared.suspended.load(Ordering::SeqCst) {
            select! {
                recv(req_rx) -> msg => match msg {
                    Ok(request) => {
                        if self.handle_request(request)? == Flow::Stop {
                            return Ok(Flow::Stop);
                        }
                    }
                    Err(_) => return Ok(Flow::Stop),
                },
                recv(doorbell_rx) -> msg => {
                    if msg.is_err() {
                        return Ok(Flow::Stop);
                    }
                },
            }
        }
        info!("{} resumed", self.tracee.pid());
        self.publish(SessionState::Running);
        Ok(Flow::Continue)
    }

    // replies go back to the caller. an error that means the target is gone
    // also ends the loop.
    fn handle_request(&mut self, request: Request) -> Result<Flow> {
        match request {
            Request::Install { symbol, callback, reply } => {
                let result = self.install(symbol, callback);
                let fatal = fatal_error(&result);
                let _ = reply.send(result);
                fatal.map_or(Ok(Flow::Continue), Err)
            }
            Request::Remove { id, reply } => {
                let result = self.remove(id);
                let fatal = fatal_error(&result);
                let _ = reply.send(result);
                fatal.map_or(Ok(Flow::Continue), Err)
            }
            Request::List { reply } => {
                let _ = reply.send(self.bps.infos());
                Ok(Flow::Continue)
            }
            Request::ReadMemory { addr, len, mode, reply } => {
                let result = self.read_memory(addr, len, mode);
                let fatal = fatal_error(&result);
                let _ = reply.send(result);
                fatal.map_or(Ok(Flow::Continue), Err)
            }
            Request::Stop { reply } => {
                self.stop_replies.push(reply);
                Ok(Flow::Stop)
            }
        }
    }

    fn install(&mut self, symbol: String, callback: BreakpointCallback) -> Result<BreakpointHandle> {
        let link_addr = self.symbols.lookup(&symbol)?;
        let addr = link_addr.wrapping_add(self.load_bias);
        // checked before reading so the saved bytes are never trap bytes
        if self.bps.contains_addr(addr) {
            return Err(TraceError::AlreadyArmed(addr));
        }

        let mut orig_bytes = [0u8; TRAP_WIDTH];
        self.tracee.peek(addr, &mut orig_bytes)?;
        let mut entry = BreakpointEntry::new(addr, symbol.clone(), &orig_bytes, callback);
        self.tracee.poke(addr, entry.bp_bytes())?;
        entry.set_armed(true);
        let id = self.bps.add_breakpoint(entry)?;

        debug!("installed breakpoint {} on {} at {:#x}", id, symbol, addr);
        Ok(BreakpointHandle { id, address: addr, symbol })
    }

    fn remove(&mut self, id: u32) -> Result<()> {
        let (addr, armed, orig_bytes) = match self.bps.get_by_id(id) {
            Some(bp) => (bp.addr(), bp.armed(), bp.orig_bytes().iter().copied().collect::<TrapBytes>()),
            None => return Err(TraceError::UnknownBreakpoint(id)),
        };
        if armed {
            self.tracee.poke(addr, &orig_bytes)?;
        }
        let entry = self.bps.remove_breakpoint(id)?;
        self.retired.push(addr);
        debug!("removed breakpoint {} on {} after {} hits", id, entry.description(), entry.hits());
        Ok(())
    }

    fn read_memory(&mut self, addr: u64, len: usize, mode: ReadMode) -> Result<Vec<u8>> {
        let mut data = vec![0u8; len];
        self.tracee.peek(addr, &mut data)?;
        if mode == ReadMode::Original {
            self.bps.fixup_bp_memory(&mut data, addr);
        }
        Ok(data)
    }

    // threads that trapped but were never dispatched would otherwise carry on
    // one byte into the restored instruction
    fn settle_pending(&mut self, trap_addrs: &[u64]) {
        while let Some(event) = self.pending.pop_front() {
            match event {
                StopEvent::Trap { tid, kind: TrapKind::SoftwareBreakpoint } => {
                    let rewound = self.tracee.read_pc(tid).and_then(|pc| {
                        let addr = pc.wrapping_sub(TRAP_PC_ADJUST);
                        if trap_addrs.contains(&addr) {
                            self.tracee.write_pc(tid, addr)?;
                        }
                        Ok(())
                    });
                    if let Err(e) = rewound {
                        warn!("couldn't rewind thread {}: {}", tid, e);
                    }
                }
                StopEvent::Signal { tid, signal } if self.forward_signals && !is_checkpoint_signal(signal) => {
                    self.resume_signals.push((tid, signal));
                }
                _ => (),
            }
        }
    }

    fn finish(mut self, outcome: Result<LoopExit>) {
        let target_alive = match &outcome {
            Ok(LoopExit::Stopped) => true,
            Ok(LoopExit::TargetGone) => false,
            Err(e) => {
                error!("control loop for {} failed: {}", self.tracee.pid(), e);
                !e.is_target_gone()
            }
        };

        // no caller may signal the target past this point
        *self.shared.lock_gate() = false;

        let bps = self.bps.drain();
        if target_alive {
            // detaching needs every thread stopped
            match self.tracee.stop_others() {
                Ok(events) => self.pending.extend(events),
                Err(e) => warn!("couldn't stop every thread of {}: {}", self.tracee.pid(), e),
            }
            let mut trap_addrs: Vec<u64> = bps.iter().filter(|bp| bp.armed()).map(|bp| bp.addr()).collect();
            trap_addrs.extend_from_slice(&self.retired);
            self.settle_pending(&trap_addrs);

            for bp in bps.iter().filter(|bp| bp.armed()) {
                if let Err(e) = self.tracee.poke(bp.addr(), bp.orig_bytes()) {
                    warn!("couldn't restore {} at {:#x}: {}", bp.description(), bp.addr(), e);
                }
            }
            let signals = mem::take(&mut self.resume_signals);
            match self.tracee.detach(&signals) {
                Ok(()) => info!("detached from {}", self.tracee.pid()),
                Err(e) => warn!("couldn't detach from {}: {}", self.tracee.pid(), e),
            }
        }
        drop(bps);

        self.publish(SessionState::Exited);

        // the gate is closed, nothing new can arrive
        while let Ok(request) = self.channels.req_rx.try_recv() {
            if let Request::Stop { reply } = request {
                self.stop_replies.push(reply);
            }
        }
        for reply in self.stop_replies.drain(..) {
            let _ = reply.send(());
        }
    }
}

fn fatal_error<V>(result: &Result<V>) -> Option<TraceError> {
    match result {
        Err(e) if e.is_target_gone() => Some(e.clone()),
        _ => None,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{binary_formats::elf::file::ImageLayout, consts::arch::TRAP_BYTES};
    use crossbeam::channel::{bounded, unbounded};
    use std::{
        cell::RefCell,
        collections::{HashMap, VecDeque},
        rc::Rc,
        sync::atomic::AtomicU64,
    };

    const MEM_BASE: u64 = 0x1000;
    const MEM_SIZE: usize = 0x100;
    const BIAS: u64 = 0x1000;
    const TICK: u64 = BIAS + 0x20;
    const TOCK: u64 = BIAS + 0x40;
    const MAIN: i32 = 4242;
    const WORKER: i32 = 4243;

    enum Action {
        // the main thread executes the instruction at this address
        Call(u64),
        // both threads execute an instruction at once, main then worker
        CallTogether(u64, u64),
        // an int3 nobody installed
        StrayTrap(u64),
        Signal(i32),
        // a caller enqueues this and forces a checkpoint
        Request(Request),
        // enqueued without a stop, picked up at the next checkpoint
        Enqueue(Request),
        // a single-step is interrupted by this signal first
        InterruptNextStep(i32),
        // every primitive fails with ESRCH from now on
        Vanish,
        Exit(i32),
    }

    #[derive(Default)]
    struct FakeState {
        mem: Vec<u8>,
        pcs: HashMap<i32, u64>,
        stepping: Option<i32>,
        step_interrupts: VecDeque<i32>,
        // what the worker reports when it is asked to stop
        halted_events: Vec<StopEvent>,
        // raised again, reported after the next resume
        requeued: VecDeque<(i32, i32)>,
        raised: Vec<(i32, i32)>,
        gone: bool,
        // the signal the main thread got on each resume
        delivered: Vec<i32>,
        // instructions executed while still patched
        trap_executed: usize,
        detached: bool,
        script: VecDeque<Action>,
    }

    struct FakeTracee {
        state: Rc<RefCell<FakeState>>,
        req_tx: Sender<Request>,
    }

    fn pristine() -> Vec<u8> {
        (0..MEM_SIZE).map(|i| (i % 0x80) as u8).collect()
    }

    fn esrch(op: &'static str) -> TraceError {
        TraceError::process_control(op, libc::ESRCH)
    }

    impl FakeState {
        fn range(&self, addr: u64, len: usize) -> Result<std::ops::Range<usize>> {
            if addr < MEM_BASE || addr + len as u64 > MEM_BASE + MEM_SIZE as u64 {
                return Err(TraceError::process_control("peek", libc::EIO));
            }
            let start = (addr - MEM_BASE) as usize;
            Ok(start..start + len)
        }

        fn byte_at(&self, addr: u64) -> u8 {
            self.mem[(addr - MEM_BASE) as usize]
        }

        fn check(&self, op: &'static str) -> Result<()> {
            if self.gone {
                return Err(esrch(op));
            }
            Ok(())
        }
    }

    impl Tracee for FakeTracee {
        fn pid(&self) -> i32 {
            MAIN
        }

        fn read_pc(&mut self, tid: i32) -> Result<u64> {
            let state = self.state.borrow();
            state.check("getregs")?;
            state.pcs.get(&tid).copied().ok_or_else(|| esrch("getregs"))
        }

        fn write_pc(&mut self, tid: i32, pc: u64) -> Result<()> {
            let mut state = self.state.borrow_mut();
            state.check("setregs")?;
            state.pcs.insert(tid, pc);
            Ok(())
        }

        fn peek(&mut self, addr: u64, out_data: &mut [u8]) -> Result<()> {
            let state = self.state.borrow();
            state.check("peek")?;
            let range = state.range(addr, out_data.len())?;
            out_data.copy_from_slice(&state.mem[range]);
            Ok(())
        }

        fn poke(&mut self, addr: u64, data: &[u8]) -> Result<()> {
            let mut state = self.state.borrow_mut();
            state.check("poke")?;
            let range = state.range(addr, data.len())?;
            state.mem[range].copy_from_slice(data);
            Ok(())
        }

        fn resume_all(&mut self, signals: &[(i32, i32)]) -> Result<()> {
            let mut state = self.state.borrow_mut();
            state.check("cont")?;
            let signal = signals.iter().find(|(tid, _)| *tid == MAIN).map_or(0, |(_, s)| *s);
            state.delivered.push(signal);
            Ok(())
        }

        fn singlestep(&mut self, tid: i32) -> Result<()> {
            let mut state = self.state.borrow_mut();
            state.check("singlestep")?;
            state.stepping = Some(tid);
            Ok(())
        }

        fn wait_for_stop(&mut self) -> Result<StopEvent> {
            let mut state = self.state.borrow_mut();
            if let Some(tid) = state.stepping {
                if let Some(signal) = state.step_interrupts.pop_front() {
                    return Ok(StopEvent::Signal { tid, signal });
                }
                let pc = state.pcs[&tid];
                if state.byte_at(pc) == TRAP_BYTES[0] {
                    state.trap_executed += 1;
                }
                state.pcs.insert(tid, pc + 1);
                state.stepping = None;
                return Ok(StopEvent::Trap { tid, kind: TrapKind::StepComplete });
            }
            if let Some((tid, signal)) = state.requeued.pop_front() {
                return Ok(StopEvent::Signal { tid, signal });
            }

            loop {
                let action = match state.script.pop_front() {
                    Some(action) => action,
                    None => return Ok(StopEvent::Exited { tid: MAIN, code: 0 }),
                };
                match action {
                    Action::Call(addr) => {
                        if state.byte_at(addr) == TRAP_BYTES[0] {
                            state.pcs.insert(MAIN, addr + TRAP_PC_ADJUST);
                            return Ok(StopEvent::Trap { tid: MAIN, kind: TrapKind::SoftwareBreakpoint });
                        }
                    }
                    Action::CallTogether(main_addr, worker_addr) => {
                        state.pcs.insert(MAIN, main_addr + TRAP_PC_ADJUST);
                        state.pcs.insert(WORKER, worker_addr + TRAP_PC_ADJUST);
                        state.halted_events.push(StopEvent::Trap {
                            tid: WORKER,
                            kind: TrapKind::SoftwareBreakpoint,
                        });
                        return Ok(StopEvent::Trap { tid: MAIN, kind: TrapKind::SoftwareBreakpoint });
                    }
                    Action::StrayTrap(addr) => {
                        state.pcs.insert(MAIN, addr + TRAP_PC_ADJUST);
                        return Ok(StopEvent::Trap { tid: MAIN, kind: TrapKind::SoftwareBreakpoint });
                    }
                    Action::Signal(signal) => return Ok(StopEvent::Signal { tid: MAIN, signal }),
                    Action::Request(request) => {
                        self.req_tx.send(request).unwrap();
                        return Ok(StopEvent::Signal { tid: MAIN, signal: libc::SIGSTOP });
                    }
                    Action::Enqueue(request) => self.req_tx.send(request).unwrap(),
                    Action::InterruptNextStep(signal) => state.step_interrupts.push_back(signal),
                    Action::Vanish => state.gone = true,
                    Action::Exit(code) => return Ok(StopEvent::Exited { tid: MAIN, code }),
                }
            }
        }

        fn stop_others(&mut self) -> Result<Vec<StopEvent>> {
            Ok(self.state.borrow_mut().halted_events.drain(..).collect())
        }

        fn requeue_signal(&mut self, tid: i32, signal: i32) -> Result<()> {
            let mut state = self.state.borrow_mut();
            state.requeued.push_back((tid, signal));
            state.raised.push((tid, signal));
            Ok(())
        }

        fn detach(&mut self, _signals: &[(i32, i32)]) -> Result<()> {
            let mut state = self.state.borrow_mut();
            state.check("detach")?;
            state.detached = true;
            Ok(())
        }
    }

    struct Harness {
        state: Rc<RefCell<FakeState>>,
        shared: Arc<SessionShared>,
        forward_signals: bool,
    }

    impl Harness {
        fn new() -> Harness {
            let state = FakeState {
                mem: pristine(),
                pcs: HashMap::from([(MAIN, MEM_BASE), (WORKER, MEM_BASE)]),
                ..Default::default()
            };
            let shared = Arc::new(SessionShared::new());
            *shared.lock_gate() = true;
            Harness {
                state: Rc::new(RefCell::new(state)),
                shared,
                forward_signals: true,
            }
        }

        fn script(&self, actions: Vec<Action>) {
            self.state.borrow_mut().script.extend(actions);
        }

        fn run(&mut self) {
            self.run_with(unbounded());
        }

        fn run_with(&mut self, (req_tx, req_rx): (Sender<Request>, Receiver<Request>)) {
            let (_doorbell_tx, doorbell_rx) = bounded(1);
            let symbols = Arc::new(SymbolTable::from_entries(
                ImageLayout {
                    position_independent: true,
                    link_base: 0,
                },
                &[("tick", TICK - BIAS), ("tock", TOCK - BIAS)],
            ));
            let tracee = FakeTracee {
                state: Rc::clone(&self.state),
                req_tx,
            };
            let channels = LoopChannels { req_rx, doorbell_rx };
            ControlLoop::new(tracee, symbols, BIAS, self.forward_signals, channels, Arc::clone(&self.shared)).run();
        }
    }

    fn counting_callback(counter: &Arc<AtomicU64>) -> BreakpointCallback {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn install(symbol: &str, callback: BreakpointCallback) -> (Action, Receiver<Result<BreakpointHandle>>) {
        let (reply, rx) = bounded(1);
        let request = Request::Install {
            symbol: symbol.to_owned(),
            callback,
            reply,
        };
        (Action::Request(request), rx)
    }

    fn remove(id: u32) -> (Action, Receiver<Result<()>>) {
        let (reply, rx) = bounded(1);
        (Action::Request(Request::Remove { id, reply }), rx)
    }

    fn list() -> (Action, Receiver<Vec<BreakpointInfo>>) {
        let (reply, rx) = bounded(1);
        (Action::Request(Request::List { reply }), rx)
    }

    fn read(addr: u64, len: usize, mode: ReadMode) -> (Action, Receiver<Result<Vec<u8>>>) {
        let (reply, rx) = bounded(1);
        (Action::Request(Request::ReadMemory { addr, len, mode, reply }), rx)
    }

    fn stop() -> (Action, Receiver<()>) {
        let (reply, rx) = bounded(1);
        (Action::Request(Request::Stop { reply }), rx)
    }

    // the same request, but nothing stops the target to deliver it
    fn queued<R>((action, rx): (Action, R)) -> (Action, R) {
        match action {
            Action::Request(request) => (Action::Enqueue(request), rx),
            other => (other, rx),
        }
    }

    #[test]
    fn every_execution_runs_the_callback_once() {
        let mut harness = Harness::new();
        let hits = Arc::new(AtomicU64::new(0));
        let (install_action, install_rx) = install("tick", counting_callback(&hits));
        let (list_action, list_rx) = list();
        let mut actions = vec![install_action];
        actions.extend((0..3).map(|_| Action::Call(TICK)));
        actions.push(list_action);
        actions.push(Action::Exit(0));
        harness.script(actions);

        harness.run();

        let handle = install_rx.try_recv().unwrap().unwrap();
        assert_eq!(handle.address(), TICK);
        assert_eq!(handle.symbol(), "tick");
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        let infos = list_rx.try_recv().unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].hits, 3);
        assert!(infos[0].armed);
        assert_eq!(infos[0].description, "tick");

        let state = harness.state.borrow();
        assert_eq!(state.trap_executed, 0);
        assert!(!state.detached);
        assert_eq!(harness.shared.status().state, SessionState::Exited);
        assert_eq!(harness.shared.status().load_bias, BIAS);
    }

    #[test]
    fn removal_stops_callbacks_and_restores_bytes() {
        let mut harness = Harness::new();
        let hits = Arc::new(AtomicU64::new(0));
        let (install_action, install_rx) = install("tick", counting_callback(&hits));
        // ids start at 1
        let (remove_action, remove_rx) = remove(1);
        let (stop_action, stop_rx) = stop();
        harness.script(vec![
            install_action,
            Action::Call(TICK),
            Action::Call(TICK),
            remove_action,
            Action::Call(TICK),
            Action::Call(TICK),
            Action::Call(TICK),
            stop_action,
        ]);

        harness.run();

        assert_eq!(install_rx.try_recv().unwrap().unwrap().id(), 1);
        remove_rx.try_recv().unwrap().unwrap();
        stop_rx.try_recv().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(harness.state.borrow().mem, pristine());
        assert!(harness.state.borrow().detached);
        assert!(!*harness.shared.lock_gate());
    }

    #[test]
    fn second_install_at_an_address_is_rejected() {
        let mut harness = Harness::new();
        let first_hits = Arc::new(AtomicU64::new(0));
        let second_hits = Arc::new(AtomicU64::new(0));
        let (first, first_rx) = install("tick", counting_callback(&first_hits));
        let (second, second_rx) = install("tick", counting_callback(&second_hits));
        let (stop_action, _stop_rx) = stop();
        harness.script(vec![first, second, Action::Call(TICK), stop_action]);

        harness.run();

        first_rx.try_recv().unwrap().unwrap();
        match second_rx.try_recv().unwrap() {
            Err(TraceError::AlreadyArmed(addr)) => assert_eq!(addr, TICK),
            other => panic!("unexpected install result {:?}", other),
        }
        assert_eq!(first_hits.load(Ordering::SeqCst), 1);
        assert_eq!(second_hits.load(Ordering::SeqCst), 0);
        // teardown restored what the first install saved
        assert_eq!(harness.state.borrow().mem, pristine());
    }

    #[test]
    fn unknown_symbols_and_stale_ids_are_errors() {
        let mut harness = Harness::new();
        let (install_action, install_rx) = install("no_such_fn", Box::new(|| Ok(())));
        let (remove_action, remove_rx) = remove(77);
        let (stop_action, _stop_rx) = stop();
        harness.script(vec![install_action, remove_action, stop_action]);

        harness.run();

        assert!(matches!(install_rx.try_recv().unwrap(), Err(TraceError::SymbolNotFound(_))));
        assert!(matches!(remove_rx.try_recv().unwrap(), Err(TraceError::UnknownBreakpoint(77))));
        assert_eq!(harness.state.borrow().mem, pristine());
    }

    #[test]
    fn memory_reads_see_raw_or_original_bytes() {
        let mut harness = Harness::new();
        let (install_action, _install_rx) = install("tick", Box::new(|| Ok(())));
        let (raw_action, raw_rx) = read(TICK - 4, 8, ReadMode::Raw);
        let (orig_action, orig_rx) = read(TICK - 4, 8, ReadMode::Original);
        let (remove_action, _remove_rx) = remove(1);
        let (after_action, after_rx) = read(TICK - 4, 8, ReadMode::Raw);
        let (bad_action, bad_rx) = read(0x10, 4, ReadMode::Raw);
        let (stop_action, _stop_rx) = stop();
        harness.script(vec![
            install_action,
            raw_action,
            orig_action,
            remove_action,
            after_action,
            bad_action,
            stop_action,
        ]);

        harness.run();

        let before = pristine()[(TICK - 4 - MEM_BASE) as usize..(TICK + 4 - MEM_BASE) as usize].to_vec();
        let raw = raw_rx.try_recv().unwrap().unwrap();
        assert_eq!(raw[4], TRAP_BYTES[0]);
        assert_eq!(raw[..4], before[..4]);
        assert_eq!(orig_rx.try_recv().unwrap().unwrap(), before);
        assert_eq!(after_rx.try_recv().unwrap().unwrap(), before);
        assert!(matches!(
            bad_rx.try_recv().unwrap(),
            Err(TraceError::ProcessControl { os_code: libc::EIO, .. })
        ));
    }

    #[test]
    fn target_exit_ends_the_session() {
        let mut harness = Harness::new();
        let (req_tx, req_rx) = unbounded();
        let (reply, pending_rx) = bounded(1);
        harness.script(vec![Action::Exit(3)]);
        // queued but never reached a checkpoint
        req_tx.send(Request::List { reply }).unwrap();

        harness.run_with((req_tx, req_rx));

        assert!(pending_rx.recv().is_err());
        assert_eq!(harness.shared.status().state, SessionState::Exited);
        assert!(!*harness.shared.lock_gate());
        assert!(!harness.state.borrow().detached);
    }

    #[test]
    fn stray_traps_resume_without_a_signal() {
        let mut harness = Harness::new();
        let (stop_action, stop_rx) = stop();
        harness.script(vec![Action::StrayTrap(MEM_BASE + 0x80), stop_action]);

        harness.run();

        stop_rx.try_recv().unwrap();
        let state = harness.state.borrow();
        // initial resume, then the one after the stray trap
        assert_eq!(state.delivered, vec![0, 0]);
        assert_eq!(state.pcs[&MAIN], MEM_BASE + 0x80 + TRAP_PC_ADJUST);
    }

    #[test]
    fn failing_and_panicking_callbacks_are_contained() {
        let mut harness = Harness::new();
        let failing_hits = Arc::new(AtomicU64::new(0));
        let panicking_hits = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&failing_hits);
        let (fail_action, _fail_rx) = install(
            "tick",
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("callback refused".into())
            }),
        );
        let counter = Arc::clone(&panicking_hits);
        let (panic_action, _panic_rx) = install(
            "tock",
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                panic!("callback blew up");
            }),
        );
        let (list_action, list_rx) = list();
        let (stop_action, _stop_rx) = stop();
        harness.script(vec![
            fail_action,
            panic_action,
            Action::Call(TICK),
            Action::Call(TOCK),
            Action::Call(TICK),
            Action::Call(TOCK),
            list_action,
            stop_action,
        ]);

        harness.run();

        assert_eq!(failing_hits.load(Ordering::SeqCst), 2);
        assert_eq!(panicking_hits.load(Ordering::SeqCst), 2);
        let infos = list_rx.try_recv().unwrap();
        assert!(infos.iter().all(|info| info.hits == 2 && info.armed));
        assert_eq!(harness.state.borrow().mem, pristine());
    }

    #[test]
    fn plain_signals_are_forwarded_and_stops_suppressed() {
        let mut harness = Harness::new();
        harness.script(vec![
            Action::Signal(libc::SIGUSR1),
            Action::Signal(libc::SIGTSTP),
            Action::Signal(libc::SIGSTOP),
            Action::Exit(0),
        ]);

        harness.run();

        assert_eq!(harness.state.borrow().delivered, vec![0, libc::SIGUSR1, 0, 0]);
    }

    #[test]
    fn forwarding_can_be_turned_off() {
        let mut harness = Harness::new();
        harness.forward_signals = false;
        harness.script(vec![Action::Signal(libc::SIGUSR1), Action::Exit(0)]);

        harness.run();

        assert_eq!(harness.state.borrow().delivered, vec![0, 0]);
    }

    #[test]
    fn signal_during_step_over_is_delivered_after_rearming() {
        let mut harness = Harness::new();
        let hits = Arc::new(AtomicU64::new(0));
        let (install_action, _install_rx) = install("tick", counting_callback(&hits));
        harness.script(vec![
            install_action,
            Action::InterruptNextStep(libc::SIGUSR1),
            Action::Call(TICK),
            Action::Call(TICK),
            Action::Exit(0),
        ]);

        harness.run();

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        let state = harness.state.borrow();
        assert_eq!(state.trap_executed, 0);
        // initial, after install, after the first hit (with the held signal), after the second
        assert_eq!(state.delivered, vec![0, 0, libc::SIGUSR1, 0]);
        assert_eq!(state.byte_at(TICK), TRAP_BYTES[0]);
    }

    #[test]
    fn vanished_target_ends_the_loop() {
        let mut harness = Harness::new();
        let (install_action, install_rx) = install("tick", Box::new(|| Ok(())));
        let (list_action, list_rx) = list();
        harness.script(vec![Action::Vanish, install_action, list_action]);

        harness.run();

        let err = install_rx.try_recv().unwrap().unwrap_err();
        assert!(err.is_target_gone());
        // never serviced, the loop ended on the install failure
        assert!(list_rx.try_recv().is_err());
        assert_eq!(harness.shared.status().state, SessionState::Exited);
        assert!(!harness.state.borrow().detached);
    }

    #[test]
    fn extra_signals_during_step_over_are_raised_again() {
        let mut harness = Harness::new();
        let hits = Arc::new(AtomicU64::new(0));
        let (install_action, _install_rx) = install("tick", counting_callback(&hits));
        harness.script(vec![
            install_action,
            Action::InterruptNextStep(libc::SIGSTOP),
            Action::InterruptNextStep(libc::SIGUSR1),
            Action::InterruptNextStep(libc::SIGTERM),
            Action::Call(TICK),
            Action::Exit(0),
        ]);

        harness.run();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let state = harness.state.borrow();
        assert_eq!(state.trap_executed, 0);
        // the first plain signal goes out with the resume, the next one comes
        // back as its own stop and is forwarded from there
        assert_eq!(state.raised, vec![(MAIN, libc::SIGTERM)]);
        assert_eq!(state.delivered, vec![0, 0, libc::SIGUSR1, libc::SIGTERM]);
    }

    #[test]
    fn threads_hitting_a_breakpoint_together_each_run_the_callback() {
        let mut harness = Harness::new();
        let hits = Arc::new(AtomicU64::new(0));
        let (install_action, _install_rx) = install("tick", counting_callback(&hits));
        let (list_action, list_rx) = list();
        harness.script(vec![
            install_action,
            Action::CallTogether(TICK, TICK),
            list_action,
            Action::Exit(0),
        ]);

        harness.run();

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(list_rx.try_recv().unwrap()[0].hits, 2);
        let state = harness.state.borrow();
        assert_eq!(state.trap_executed, 0);
        // both stepped past the original instruction
        assert_eq!(state.pcs[&MAIN], TICK + 1);
        assert_eq!(state.pcs[&WORKER], TICK + 1);
        assert_eq!(state.byte_at(TICK), TRAP_BYTES[0]);
    }

    #[test]
    fn thread_sitting_on_a_removed_breakpoint_is_rewound() {
        let mut harness = Harness::new();
        let tick_hits = Arc::new(AtomicU64::new(0));
        let tock_hits = Arc::new(AtomicU64::new(0));
        let (tick_action, _tick_rx) = install("tick", counting_callback(&tick_hits));
        let (tock_action, _tock_rx) = install("tock", counting_callback(&tock_hits));
        let (remove_action, remove_rx) = queued(remove(1));
        harness.script(vec![
            tick_action,
            tock_action,
            remove_action,
            // the removal is serviced while the main thread steps over tock
            Action::InterruptNextStep(libc::SIGSTOP),
            Action::CallTogether(TOCK, TICK),
            Action::Exit(0),
        ]);

        harness.run();

        remove_rx.try_recv().unwrap().unwrap();
        assert_eq!(tock_hits.load(Ordering::SeqCst), 1);
        assert_eq!(tick_hits.load(Ordering::SeqCst), 0);
        let state = harness.state.borrow();
        assert_eq!(state.pcs[&WORKER], TICK);
        assert_eq!(state.byte_at(TICK), pristine()[(TICK - MEM_BASE) as usize]);
    }

    #[test]
    fn teardown_rewinds_threads_left_on_a_breakpoint() {
        let mut harness = Harness::new();
        let hits = Arc::new(AtomicU64::new(0));
        let (install_action, _install_rx) = install("tick", counting_callback(&hits));
        let (stop_action, stop_rx) = queued(stop());
        harness.script(vec![
            install_action,
            stop_action,
            Action::InterruptNextStep(libc::SIGSTOP),
            Action::CallTogether(TICK, TICK),
        ]);

        harness.run();

        stop_rx.try_recv().unwrap();
        // the stop was serviced before the worker's hit was dispatched
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let state = harness.state.borrow();
        assert_eq!(state.pcs[&WORKER], TICK);
        assert_eq!(state.mem, pristine());
        assert!(state.detached);
    }
}
