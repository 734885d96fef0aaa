// Suppress historical clippy lints that predate the -D warnings CI policy.
// These are style suggestions, not correctness issues. Fix incrementally.
#![allow(
    clippy::collapsible_if,
    clippy::collapsible_match,
    clippy::derivable_impls,
    clippy::field_reassign_with_default,
    clippy::large_enum_variant,
    clippy::len_without_is_empty,
    clippy::let_and_return,
    clippy::manual_range_contains,
    clippy::needless_range_loop,
    clippy::new_without_default,
    clippy::redundant_closure,
    clippy::too_many_arguments,
    clippy::type_complexity
)]

pub mod alg;
pub mod config;
pub mod conn;
pub mod control;
pub mod error;
pub mod expectation;
pub mod key;
pub mod nat;
pub mod orchestrator;
pub mod proto;
pub mod sweeper;
pub mod table;
pub mod zone;

pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::{CtMetadata, CtState, ExecuteRequest, Tracker};

/// Installs the crate's `tracing` subscriber from `RUST_LOG`, falling back
/// to `info`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
