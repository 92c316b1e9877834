pub mod config;
pub mod daemon;
pub mod filters;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod reconcile;
pub mod remote;
pub mod retry;
pub mod store;
pub mod watcher;
pub mod worker;
