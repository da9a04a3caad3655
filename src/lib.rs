pub mod aggregator;
pub mod cache;
pub mod client;
pub mod clock;
pub mod errors;
pub mod models;
pub mod notify;
pub mod order;
pub mod presence;
pub mod reconciler;
pub mod settings;
pub mod store;
pub mod timer;
pub mod view;

pub use crate::cache::{CacheSnapshot, LocalCache};
pub use crate::client::DemandClient;
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::errors::{AppError, AppResult};
pub use crate::models::{
    Collection, DemandDraft, DemandRecord, DemandStatus, Difficulty, PresenceMember, Priority, RealtimeStatus,
    SubActivity, TagCategory, TimeEntry,
};
pub use crate::notify::{Notice, NoticeLevel, Notifier, SyncFault};
pub use crate::presence::{PresenceHub, PresenceSession};
pub use crate::reconciler::{ReconcileOutcome, Reconciler};
pub use crate::settings::{ReconcileStrategy, SyncSettings};
pub use crate::store::{MemoryStore, RemoteStore, SqliteStore};
pub use crate::timer::{AccountingEvent, DisplayTicker, SessionClose, TimerManager, TimerPolicy};
pub use crate::view::{StatusTab, TagOptions, ViewFilter};

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs JSON logging into `log_dir/sync.log`, rotated daily.
///
/// The level comes from `RUST_LOG` and defaults to `info`. Calling it again
/// after a subscriber is installed returns an error and changes nothing.
pub fn init_tracing(log_dir: &Path) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "sync.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}
