pub mod debugger_linux;
pub mod debugger_linux_amd64;
pub mod debugger_linux_maps;
pub mod debugger_linux_memview;
pub mod debugger_linux_superpt;
