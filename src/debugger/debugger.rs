use crate::memory::memview::MemViewError;
use std::{error::Error, fmt, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TraceError {
    #[error("can't parse executable {path:?}: {reason}")]
    BinaryFormat { path: PathBuf, reason: String },
    #[error("executable {0:?} carries no debug info")]
    DebugInfoMissing(PathBuf),
    #[error("symbol {0:?} has no subprogram entry with an address")]
    SymbolNotFound(String),
    #[error("{op} failed (os error {os_code})")]
    ProcessControl { op: &'static str, os_code: i32 },
    #[error("a breakpoint is already armed at {0:#x}")]
    AlreadyArmed(u64),
    #[error("breakpoint {0} doesn't exist")]
    UnknownBreakpoint(u32),
    #[error("the trace session has ended")]
    SessionEnded,
}

pub type Result<T> = std::result::Result<T, TraceError>;

impl TraceError {
    pub fn process_control(op: &'static str, os_code: i32) -> TraceError {
        TraceError::ProcessControl { op, os_code }
    }

    pub fn os_code(&self) -> Option<i32> {
        match self {
            TraceError::ProcessControl { os_code, .. } => Some(*os_code),
            _ => None,
        }
    }

    // the target is gone, nothing else will succeed either
    pub fn is_target_gone(&self) -> bool {
        self.os_code() == Some(libc::ESRCH)
    }
}

impl From<MemViewError> for TraceError {
    fn from(e: MemViewError) -> Self {
        match e {
            MemViewError::EndOfStream { .. } => TraceError::process_control("peek", libc::EIO),
            MemViewError::ReadAccessDenied { os_code, .. } => TraceError::process_control("peek", os_code),
            MemViewError::WriteAccessDenied { os_code, .. } => TraceError::process_control("poke", os_code),
        }
    }
}

pub type CallbackError = Box<dyn Error + Send + Sync>;

/// Runs on the session's control thread every time its breakpoint is hit.
///
/// The target is stopped while the callback runs. Callbacks must not call
/// back into the session that owns them; the request would only be serviced
/// after the callback returns, so the call would never complete.
pub type BreakpointCallback = Box<dyn FnMut() -> std::result::Result<(), CallbackError> + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, strum_macros::Display)]
pub enum SessionState {
    Attaching,
    Running,
    Dispatching,
    Paused,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrapKind {
    // int3 (or the platform equivalent) was executed
    SoftwareBreakpoint,
    StepComplete,
    // someone sent SIGTRAP with kill/tgkill
    Sent,
    Other(i32),
}

// `tid` is the thread that changed state. exits are reported for the
// process itself and for a thread that exits while being single-stepped;
// other threads come and go without being reported.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopEvent {
    Trap { tid: i32, kind: TrapKind },
    Signal { tid: i32, signal: i32 },
    GroupStop { tid: i32, signal: i32 },
    Exited { tid: i32, code: i32 },
    Killed { tid: i32, signal: i32 },
}

impl StopEvent {
    pub fn tid(&self) -> i32 {
        match *self {
            StopEvent::Trap { tid, .. } => tid,
            StopEvent::Signal { tid, .. } => tid,
            StopEvent::GroupStop { tid, .. } => tid,
            StopEvent::Exited { tid, .. } => tid,
            StopEvent::Killed { tid, .. } => tid,
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, StopEvent::Exited { .. } | StopEvent::Killed { .. })
    }
}

impl fmt::Display for StopEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StopEvent::Trap { tid, kind } => write!(f, "thread {} trapped ({:?})", tid, kind),
            StopEvent::Signal { tid, signal } => write!(f, "thread {} stopped by signal {}", tid, signal),
            StopEvent::GroupStop { tid, signal } => write!(f, "thread {} entered group stop ({})", tid, signal),
            StopEvent::Exited { tid, code } => write!(f, "{} exited with code {}", tid, code),
            StopEvent::Killed { tid, signal } => write!(f, "{} was killed by signal {}", tid, signal),
        }
    }
}

/// The process-control primitives the control loop needs from an attached
/// target. Only the thread that attached may call these.
///
/// Threads are either all running or all stopped, apart from the one being
/// single-stepped. Register access and stepping name a thread; memory is
/// shared by all of them.
pub trait Tracee {
    fn pid(&self) -> i32;

    fn read_pc(&mut self, tid: i32) -> Result<u64>;
    fn write_pc(&mut self, tid: i32, pc: u64) -> Result<()>;

    fn peek(&mut self, addr: u64, out_data: &mut [u8]) -> Result<()>;
    fn poke(&mut self, addr: u64, data: &[u8]) -> Result<()>;

    // resumes every stopped thread. threads listed in `signals` get that
    // signal delivered as they go, the rest get nothing.
    fn resume_all(&mut self, signals: &[(i32, i32)]) -> Result<()>;
    fn singlestep(&mut self, tid: i32) -> Result<()>;

    // blocks until a thread stops or the process exits. other members of
    // the process group are waited on too and resumed without being reported.
    fn wait_for_stop(&mut self) -> Result<StopEvent>;

    // stops every thread that is still running. whatever they report other
    // than that stop is returned so it can be handled before resuming.
    fn stop_others(&mut self) -> Result<Vec<StopEvent>>;

    // makes `signal` pending on `tid` again so it is reported after resuming
    fn requeue_signal(&mut self, tid: i32, signal: i32) -> Result<()>;

    // every thread must be stopped. `signals` as for resume_all.
    fn detach(&mut self, signals: &[(i32, i32)]) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct BreakpointHandle {
    pub(crate) id: u32,
    pub(crate) address: u64,
    pub(crate) symbol: String,
}

impl BreakpointHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BreakpointInfo {
    pub id: u32,
    pub address: u64,
    pub description: String,
    pub armed: bool,
    pub hits: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadMode {
    // exactly what is in the target, trap bytes included
    Raw,
    // trap bytes replaced by the original bytes they cover
    Original,
}
