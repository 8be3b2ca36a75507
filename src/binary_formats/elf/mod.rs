pub mod debug_symbols;
pub mod file;
