pub mod build;
pub mod canon;
pub mod command_log;
mod densemap;
pub mod depfile;
pub mod deps_log;
pub mod disk;
pub mod eval;
pub mod graph;
pub mod hash;
pub mod load;
pub mod parse;
pub mod plan;
pub mod run;
pub mod scan;
mod scanner;
pub mod showincludes;
mod smallmap;
pub mod status;
pub mod task;
pub mod trace;

#[cfg(not(windows))]
use jemallocator::Jemalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
