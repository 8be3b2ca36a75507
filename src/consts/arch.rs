#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Endianness {
    LittleEndian,
    BigEndian,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Bitness {
    Bit32,
    Bit64,
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
        // int3
        pub const TRAP_BYTES: [u8; 1] = [0xcc];
        // after an int3 trap, rip points one past the trap instruction
        pub const TRAP_PC_ADJUST: u64 = 1;
    } else {
        compile_error!("livetrace only supports linux on x86_64");
    }
}

pub const TRAP_WIDTH: usize = TRAP_BYTES.len();
