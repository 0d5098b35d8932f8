//! Tracing setup for the pool daemon.
//!
//! The binary calls [`init_journald_or_stdout`] once at startup; running
//! under systemd routes events to journald, anything else gets a compact
//! stdout format. Modules pull the level macros in through
//! `use crate::tracing::prelude::*`.

use std::env;
use time::OffsetDateTime;
use tracing_journald;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{trace, debug, info, warn, error};
}

use prelude::*;

/// Install the global subscriber: journald under systemd, stdout otherwise.
pub fn init_journald_or_stdout() {
    if env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(layer) = tracing_journald::layer() {
            tracing_subscriber::registry().with(layer).init();
        } else {
            use_stdout();
            error!("Failed to initialize journald logging, using stdout.");
        }
    } else {
        use_stdout();
    }
}

// Stdout logging filtered by RUST_LOG, defaulting to INFO rather than the
// subscriber's usual ERROR.
fn use_stdout() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(PoolTimer),
        )
        .init();
}

// Local-time timestamps with a date component; a pool runs for weeks and
// bare clock times stop being useful after the first midnight.
struct PoolTimer;

impl FormatTime for PoolTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now =
            OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        write!(
            w,
            "{}",
            now.format(time::macros::format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second]"
            ))
            .unwrap(),
        )
    }
}
