use super::debugger_linux_superpt::{self as superpt, OsResult};
use crate::debugger::debugger::TrapKind;

const SI_TKILL: i32 = -6;

pub fn convert_si_code(si_code: i32) -> TrapKind {
    match si_code {
        libc::SI_KERNEL => TrapKind::SoftwareBreakpoint,
        libc::TRAP_TRACE => TrapKind::StepComplete,
        libc::SI_USER | SI_TKILL => TrapKind::Sent,
        _ => TrapKind::Other(si_code),
    }
}

pub fn read_pc(pid: i32) -> OsResult<u64> {
    Ok(superpt::getregs(pid)?.rip)
}

pub fn write_pc(pid: i32, pc: u64) -> OsResult<()> {
    let mut regs = superpt::getregs(pid)?;
    regs.rip = pc;
    superpt::setregs(pid, &regs)
}
