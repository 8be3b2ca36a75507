use libc;

const NULLPTR: usize = 0usize;

// thin wrappers over the handful of ptrace/wait/kill calls we need. every
// call reports failure as the errno it left behind. the libc crate covers
// more architectures than nix does, and there are few enough calls here
// that wrapping them ourselves is simple.

pub type OsResult<T> = Result<T, i32>;

fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

fn clear_errno() {
    unsafe {
        *libc::__errno_location() = 0;
    }
}

fn check(ret: libc::c_long) -> OsResult<()> {
    if ret == -1 {
        Err(errno())
    } else {
        Ok(())
    }
}

pub fn attach(pid: i32) -> OsResult<()> {
    check(unsafe { libc::ptrace(libc::PTRACE_ATTACH, libc::pid_t::from(pid), NULLPTR, NULLPTR) })
}

// `signal` is delivered as the thread leaves the tracer, 0 delivers nothing
pub fn detach(pid: i32, signal: i32) -> OsResult<()> {
    check(unsafe { libc::ptrace(libc::PTRACE_DETACH, libc::pid_t::from(pid), NULLPTR, signal as usize) })
}

pub fn setoptions(pid: i32, options: i32) -> OsResult<()> {
    check(unsafe { libc::ptrace(libc::PTRACE_SETOPTIONS, libc::pid_t::from(pid), NULLPTR, options as usize) })
}

// for a clone event stop, the id of the new thread
pub fn geteventmsg(pid: i32) -> OsResult<u64> {
    let mut msg: libc::c_ulong = 0;
    check(unsafe {
        libc::ptrace(
            libc::PTRACE_GETEVENTMSG,
            libc::pid_t::from(pid),
            NULLPTR,
            &mut msg as *mut libc::c_ulong,
        )
    })?;
    Ok(msg as u64)
}

pub fn singlestep(pid: i32) -> OsResult<()> {
    check(unsafe { libc::ptrace(libc::PTRACE_SINGLESTEP, libc::pid_t::from(pid), NULLPTR, NULLPTR) })
}

// `signal` is delivered to the target as it resumes, 0 delivers nothing
pub fn cont(pid: i32, signal: i32) -> OsResult<()> {
    check(unsafe { libc::ptrace(libc::PTRACE_CONT, libc::pid_t::from(pid), NULLPTR, signal as usize) })
}

pub fn getregs(pid: i32) -> OsResult<libc::user_regs_struct> {
    let mut regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
    check(unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGS,
            libc::pid_t::from(pid),
            NULLPTR,
            &mut regs as *mut libc::user_regs_struct,
        )
    })?;
    Ok(regs)
}

pub fn setregs(pid: i32, regs: &libc::user_regs_struct) -> OsResult<()> {
    check(unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGS,
            libc::pid_t::from(pid),
            NULLPTR,
            regs as *const libc::user_regs_struct,
        )
    })
}

// EINVAL here means the tracee is in a group stop rather than a signal stop
pub fn getsiginfo(pid: i32) -> OsResult<libc::siginfo_t> {
    let mut siginfo: libc::siginfo_t = unsafe { std::mem::zeroed() };
    check(unsafe {
        libc::ptrace(
            libc::PTRACE_GETSIGINFO,
            libc::pid_t::from(pid),
            NULLPTR,
            &mut siginfo as *mut libc::siginfo_t,
        )
    })?;
    Ok(siginfo)
}

// a peeked word can legitimately be -1, so errno has to be checked instead
pub fn peekdata(pid: i32, addr: u64) -> OsResult<libc::c_long> {
    unsafe {
        clear_errno();
        let ret_word = libc::ptrace(libc::PTRACE_PEEKDATA, libc::pid_t::from(pid), addr as usize, NULLPTR);
        let err = errno();
        if err != 0 {
            return Err(err);
        }
        Ok(ret_word)
    }
}

pub fn pokedata(pid: i32, addr: u64, value: libc::c_long) -> OsResult<()> {
    check(unsafe { libc::ptrace(libc::PTRACE_POKEDATA, libc::pid_t::from(pid), addr as usize, value) })
}

// returns (pid, status). retries when interrupted.
pub fn waitpid(pid: i32, options: i32) -> OsResult<(i32, i32)> {
    loop {
        let mut status = 0;
        let ret_pid = unsafe { libc::waitpid(pid, &mut status, options) };
        if ret_pid >= 0 {
            return Ok((ret_pid, status));
        }
        let err = errno();
        if err != libc::EINTR {
            return Err(err);
        }
    }
}

pub fn kill(pid: i32, signal: i32) -> OsResult<()> {
    let ret = unsafe { libc::kill(pid, signal) };
    if ret == -1 {
        Err(errno())
    } else {
        Ok(())
    }
}

// signals one thread of `tgid` rather than whichever thread the kernel picks
pub fn tgkill(tgid: i32, tid: i32, signal: i32) -> OsResult<()> {
    check(unsafe { libc::syscall(libc::SYS_tgkill, tgid, tid, signal) })
}

pub fn getpgid(pid: i32) -> OsResult<i32> {
    let ret = unsafe { libc::getpgid(pid) };
    if ret == -1 {
        Err(errno())
    } else {
        Ok(ret)
    }
}
