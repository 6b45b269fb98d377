//! Watch mode: restart a development agent whenever its sources change

mod controller;
mod debounce;
mod filter;
mod fs;

pub use controller::{
    AgentWatcher, CommandFactory, DEFAULT_EXCLUDE_DIRS, PreRestartCheck, WatchConfig, WatchHandle,
    WatchState, WatchStatus, run_watch_session,
};
pub use debounce::Debouncer;
pub use filter::WatchFilter;
pub use fs::{FileWatcher, FsEvents};
