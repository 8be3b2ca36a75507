use super::{
    debugger_linux_amd64 as arch, debugger_linux_maps as maps, debugger_linux_memview::LinuxMemView,
    debugger_linux_superpt as superpt,
};
use crate::{
    binary_formats::elf::file::ImageLayout,
    debugger::debugger::{Result, StopEvent, TraceError, Tracee},
    memory::memview::MemView,
};
use log::{debug, trace, warn};
use std::{
    collections::{HashMap, HashSet},
    fmt, fs,
    path::{Path, PathBuf},
};

// what wait reports for a thread stopped at its clone event
const CLONE_EVENT_STATUS: i32 = libc::SIGTRAP | (libc::PTRACE_EVENT_CLONE << 8);

#[derive(Debug, Clone, Copy, PartialEq)]
enum LinuxThreadState {
    Running,
    Stepping,
    Stopped,
}

impl fmt::Display for LinuxThreadState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LinuxThreadState::Running => write!(f, "Running"),
            LinuxThreadState::Stepping => write!(f, "Stepping"),
            LinuxThreadState::Stopped => write!(f, "Stopped"),
        }
    }
}

// a process attached with PTRACE_ATTACH, every thread of it. ptrace requests
// are only accepted from the thread that attached, so this never leaves the
// control thread.
pub struct PtraceTracee {
    pid: i32,
    pgid: i32,
    exe: PathBuf,
    mem: LinuxMemView,
    threads: HashMap<i32, LinuxThreadState>,
    // new threads whose first stop was seen before their parent's clone event
    early_children: HashSet<i32>,
    // set while stop_others brings everything to a halt
    halting: bool,
}

// runs in: caller threads
pub fn signal_target(pid: i32, signal: i32) -> Result<()> {
    superpt::kill(pid, signal).map_err(|e| TraceError::process_control("kill", e))
}

fn task_ids(pid: i32) -> Result<Vec<i32>> {
    let entries = fs::read_dir(format!("/proc/{}/task", pid))
        .map_err(|e| TraceError::process_control("list threads", e.raw_os_error().unwrap_or(libc::ESRCH)))?;
    Ok(entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
        .collect())
}

fn is_thread_of(pid: i32, tid: i32) -> bool {
    Path::new(&format!("/proc/{}/task/{}", pid, tid)).exists()
}

impl PtraceTracee {
    // runs in: dbg thread
    // attaches to every thread and waits for the stops that produces. the
    // whole process is stopped when this returns.
    pub fn attach<P: AsRef<Path>>(pid: i32, exe: P) -> Result<PtraceTracee> {
        let pgid = superpt::getpgid(pid).map_err(|e| TraceError::process_control("getpgid", e))?;
        let mut threads = HashMap::new();
        if let Err(e) = Self::attach_threads(pid, &mut threads) {
            Self::release_attached(pid, &mut threads);
            return Err(e);
        }
        debug!("attached to {} (process group {}, {} threads)", pid, pgid, threads.len());

        Ok(PtraceTracee {
            pid,
            pgid,
            exe: exe.as_ref().to_owned(),
            // only readable once we're its tracer
            mem: LinuxMemView::new(pid),
            threads,
            early_children: HashSet::new(),
            halting: false,
        })
    }

    // threads can start while we attach, so repeat until a pass finds nothing new
    fn attach_threads(pid: i32, threads: &mut HashMap<i32, LinuxThreadState>) -> Result<()> {
        loop {
            let mut found_new = false;
            for tid in task_ids(pid)? {
                if threads.contains_key(&tid) {
                    continue;
                }
                found_new = true;
                match Self::attach_thread(tid) {
                    Ok(()) => {
                        threads.insert(tid, LinuxThreadState::Stopped);
                    }
                    Err(e) if tid != pid && e.is_target_gone() => debug!("thread {} exited while attaching", tid),
                    Err(e) => return Err(e),
                }
            }
            if !found_new {
                return Ok(());
            }
        }
    }

    fn attach_thread(tid: i32) -> Result<()> {
        superpt::attach(tid).map_err(|e| TraceError::process_control("attach", e))?;
        loop {
            let (_, status) = match superpt::waitpid(tid, libc::__WALL) {
                Ok(v) => v,
                Err(e) => {
                    let _ = superpt::detach(tid, 0);
                    return Err(TraceError::process_control("waitpid", e));
                }
            };
            if libc::WIFSTOPPED(status) {
                let signal = libc::WSTOPSIG(status);
                if signal != libc::SIGSTOP {
                    // the attach SIGSTOP is still pending and shows up later
                    debug!("first stop after attaching to {} was signal {}", tid, signal);
                }
                break;
            }
            if libc::WIFEXITED(status) || libc::WIFSIGNALED(status) {
                return Err(TraceError::process_control("attach", libc::ESRCH));
            }
        }

        if let Err(e) = superpt::setoptions(tid, libc::PTRACE_O_TRACECLONE) {
            let _ = superpt::detach(tid, 0);
            return Err(TraceError::process_control("setoptions", e));
        }
        Ok(())
    }

    // undoes a partial attach
    fn release_attached(pid: i32, threads: &mut HashMap<i32, LinuxThreadState>) {
        for (tid, _) in threads.drain() {
            if let Err(e) = superpt::detach(tid, 0) {
                debug!("couldn't detach from thread {}: {}", tid, e);
            }
        }
        let _ = superpt::kill(pid, libc::SIGCONT);
    }

    // runs in: dbg thread
    // zero for fixed-address images, otherwise where the image's first page
    // landed minus where it was linked to go
    pub fn load_bias(&self, layout: ImageLayout) -> Result<u64> {
        if !layout.position_independent {
            return Ok(0);
        }

        let mappings = maps::read_maps(self.pid)
            .map_err(|e| TraceError::process_control("read maps", e.raw_os_error().unwrap_or(libc::EIO)))?;
        let base = maps::image_base(&mappings, &self.exe).ok_or_else(|| {
            warn!("{:?} isn't mapped in {}", self.exe, self.pid);
            TraceError::process_control("read maps", libc::ENOENT)
        })?;
        Ok(base.wrapping_sub(layout.link_base))
    }

    fn set_state(&mut self, tid: i32, state: LinuxThreadState) {
        if let Some(thread) = self.threads.get_mut(&tid) {
            trace!("thread {}: {} -> {}", tid, thread, state);
            *thread = state;
        }
    }

    // the new thread starts out with a SIGSTOP that has to be consumed
    fn adopt_child(&mut self, child: i32) -> Result<()> {
        if !self.early_children.remove(&child) {
            loop {
                let (_, status) =
                    superpt::waitpid(child, libc::__WALL).map_err(|e| TraceError::process_control("waitpid", e))?;
                if libc::WIFSTOPPED(status) {
                    break;
                }
                if libc::WIFEXITED(status) || libc::WIFSIGNALED(status) {
                    debug!("thread {} exited before its first stop", child);
                    return Ok(());
                }
            }
        }
        debug!("thread {} started in {}", child, self.pid);
        self.threads.insert(child, LinuxThreadState::Stopped);
        Ok(())
    }

    fn on_clone_event(&mut self, tid: i32, prev: LinuxThreadState) -> Result<()> {
        let child = superpt::geteventmsg(tid).map_err(|e| TraceError::process_control("geteventmsg", e))? as i32;
        self.adopt_child(child)?;

        // only run the child if everything else is running too
        if prev == LinuxThreadState::Running && !self.halting && self.threads.contains_key(&child) {
            superpt::cont(child, 0).map_err(|e| TraceError::process_control("cont", e))?;
            self.set_state(child, LinuxThreadState::Running);
        }
        self.continue_as(tid, prev)
    }

    // puts a thread back the way it was going after a stop we handle here
    fn continue_as(&mut self, tid: i32, prev: LinuxThreadState) -> Result<()> {
        if prev == LinuxThreadState::Stepping {
            superpt::singlestep(tid).map_err(|e| TraceError::process_control("singlestep", e))?;
            self.set_state(tid, LinuxThreadState::Stepping);
        } else {
            superpt::cont(tid, 0).map_err(|e| TraceError::process_control("cont", e))?;
            self.set_state(tid, LinuxThreadState::Running);
        }
        Ok(())
    }

    // something else in the group that happens to be ours. returns the
    // signal it was continued with, None if it is gone.
    fn pass_through(pid: i32, status: i32) -> Option<i32> {
        if !libc::WIFSTOPPED(status) {
            debug!("{} left the process group (status {:#x})", pid, status);
            return None;
        }
        let signal = libc::WSTOPSIG(status);
        let deliver = if signal == libc::SIGTRAP || signal == libc::SIGSTOP {
            0
        } else {
            warn!("passing signal {} through to {}", signal, pid);
            signal
        };
        match superpt::cont(pid, deliver) {
            Ok(()) => Some(deliver),
            Err(e) => {
                debug!("couldn't continue {}: {}", pid, e);
                None
            }
        }
    }

    // bookkeeping for one wait status. None when nothing needs reporting.
    fn process_status(&mut self, tid: i32, status: i32) -> Result<Option<StopEvent>> {
        let Some(&prev) = self.threads.get(&tid) else {
            if libc::WIFSTOPPED(status) && is_thread_of(self.pid, tid) {
                // its parent's clone event is still on the way
                self.early_children.insert(tid);
            } else {
                Self::pass_through(tid, status);
            }
            return Ok(None);
        };

        if libc::WIFEXITED(status) || libc::WIFSIGNALED(status) {
            self.threads.remove(&tid);
            if tid != self.pid && prev != LinuxThreadState::Stepping {
                debug!("thread {} of {} is gone", tid, self.pid);
                return Ok(None);
            }
            return Ok(Some(if libc::WIFEXITED(status) {
                StopEvent::Exited { tid, code: libc::WEXITSTATUS(status) }
            } else {
                StopEvent::Killed { tid, signal: libc::WTERMSIG(status) }
            }));
        }
        if !libc::WIFSTOPPED(status) {
            return Ok(None);
        }
        self.set_state(tid, LinuxThreadState::Stopped);

        if status >> 8 == CLONE_EVENT_STATUS {
            self.on_clone_event(tid, prev)?;
            return Ok(None);
        }
        if status >> 16 != 0 {
            trace!("ignoring ptrace event {} on {}", status >> 16, tid);
            self.continue_as(tid, prev)?;
            return Ok(None);
        }

        let signal = libc::WSTOPSIG(status);
        let siginfo = match superpt::getsiginfo(tid) {
            Ok(v) => v,
            Err(libc::EINVAL) => return Ok(Some(StopEvent::GroupStop { tid, signal })),
            Err(e) => return Err(TraceError::process_control("getsiginfo", e)),
        };

        if signal == libc::SIGTRAP {
            let kind = arch::convert_si_code(siginfo.si_code);
            Ok(Some(StopEvent::Trap { tid, kind }))
        } else {
            Ok(Some(StopEvent::Signal { tid, signal }))
        }
    }

    fn wait_group(&mut self) -> Result<Option<(i32, i32)>> {
        match superpt::waitpid(-self.pgid, libc::__WALL) {
            Ok(v) => Ok(Some(v)),
            // nothing left in the group to wait on
            Err(libc::ECHILD) => Ok(None),
            Err(e) => Err(TraceError::process_control("waitpid", e)),
        }
    }

    fn thread_error(&self, tid: i32, op: &'static str, e: i32) -> Result<()> {
        if tid != self.pid && e == libc::ESRCH {
            // exiting, its exit status is still to be collected
            debug!("{} on thread {}: {}", op, tid, e);
            Ok(())
        } else {
            Err(TraceError::process_control(op, e))
        }
    }
}

impl Tracee for PtraceTracee {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn read_pc(&mut self, tid: i32) -> Result<u64> {
        arch::read_pc(tid).map_err(|e| TraceError::process_control("getregs", e))
    }

    fn write_pc(&mut self, tid: i32, pc: u64) -> Result<()> {
        arch::write_pc(tid, pc).map_err(|e| TraceError::process_control("setregs", e))
    }

    fn peek(&mut self, addr: u64, out_data: &mut [u8]) -> Result<()> {
        let mut cursor = addr;
        self.mem.read_bytes(&mut cursor, out_data)?;
        Ok(())
    }

    fn poke(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let mut cursor = addr;
        self.mem.write_bytes(&mut cursor, data)?;
        Ok(())
    }

    fn resume_all(&mut self, signals: &[(i32, i32)]) -> Result<()> {
        let stopped: Vec<i32> = self
            .threads
            .iter()
            .filter(|(_, state)| **state == LinuxThreadState::Stopped)
            .map(|(tid, _)| *tid)
            .collect();
        for tid in stopped {
            let signal = signals.iter().find(|(t, _)| *t == tid).map_or(0, |(_, s)| *s);
            match superpt::cont(tid, signal) {
                Ok(()) => (),
                Err(e) => self.thread_error(tid, "cont", e)?,
            }
            self.set_state(tid, LinuxThreadState::Running);
        }
        Ok(())
    }

    fn singlestep(&mut self, tid: i32) -> Result<()> {
        superpt::singlestep(tid).map_err(|e| TraceError::process_control("singlestep", e))?;
        self.set_state(tid, LinuxThreadState::Stepping);
        Ok(())
    }

    // runs in: dbg thread
    fn wait_for_stop(&mut self) -> Result<StopEvent> {
        loop {
            let Some((tid, status)) = self.wait_group()? else {
                self.threads.clear();
                return Ok(StopEvent::Exited { tid: self.pid, code: 0 });
            };
            if let Some(event) = self.process_status(tid, status)? {
                trace!("{}", event);
                return Ok(event);
            }
        }
    }

    // runs in: dbg thread
    fn stop_others(&mut self) -> Result<Vec<StopEvent>> {
        let mut asked = HashSet::new();
        for (&tid, &state) in &self.threads {
            if state != LinuxThreadState::Running {
                continue;
            }
            match superpt::tgkill(self.pid, tid, libc::SIGSTOP) {
                Ok(()) => {
                    asked.insert(tid);
                }
                Err(e) => debug!("couldn't stop thread {}: {}", tid, e),
            }
        }

        self.halting = true;
        let mut events = Vec::new();
        let result = loop {
            if !self.threads.values().any(|state| *state == LinuxThreadState::Running) {
                break Ok(());
            }
            let (tid, status) = match self.wait_group() {
                Ok(Some(v)) => v,
                Ok(None) => {
                    self.threads.clear();
                    events.push(StopEvent::Exited { tid: self.pid, code: 0 });
                    break Ok(());
                }
                Err(e) => break Err(e),
            };
            match self.process_status(tid, status) {
                Ok(Some(StopEvent::Signal { tid, signal: libc::SIGSTOP })) if asked.remove(&tid) => (),
                // our SIGSTOP stays pending and shows up after the next resume
                Ok(Some(event)) => events.push(event),
                Ok(None) => (),
                Err(e) => break Err(e),
            }
        };
        self.halting = false;
        result.map(|()| events)
    }

    fn requeue_signal(&mut self, tid: i32, signal: i32) -> Result<()> {
        superpt::tgkill(self.pid, tid, signal).map_err(|e| TraceError::process_control("tgkill", e))
    }

    fn detach(&mut self, signals: &[(i32, i32)]) -> Result<()> {
        let mut result = Ok(());
        for (tid, _) in self.threads.drain() {
            let signal = signals.iter().find(|(t, _)| *t == tid).map_or(0, |(_, s)| *s);
            if let Err(e) = superpt::detach(tid, signal) {
                if tid == self.pid {
                    result = Err(TraceError::process_control("detach", e));
                } else {
                    debug!("couldn't detach from thread {}: {}", tid, e);
                }
            }
        }
        result?;
        // throws away any SIGSTOP still pending from a checkpoint or a halt,
        // which would otherwise stop the untraced process for good
        if let Err(e) = superpt::kill(self.pid, libc::SIGCONT) {
            debug!("couldn't continue {} after detaching: {}", self.pid, e);
        }
        Ok(())
    }
}
