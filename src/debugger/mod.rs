pub mod breakpoint;
pub(crate) mod control_loop;
pub mod debugger;
pub mod host_debuggers;
pub mod trace_session;
