//! pprof server: HTTP surface and configuration over `profiler-lib`

pub mod api;
pub mod config;
