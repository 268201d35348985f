//! Thumbgrid Core Library
//!
//! Viewport-aware thumbnail loader for large image grids.
//!
//! The [`ThumbnailManager`] binds grid cells to thumbnail keys, ranks them by
//! how visible they are, fetches them with bounded concurrency and keeps the
//! results in a bounded cache. Replacing the displayed collection cancels
//! everything queued for the old one in a single call.

pub mod config;
pub mod error;
mod manager;
pub mod source;
mod state;
mod worker;

pub use config::LoaderConfig;
pub use error::{ConfigError, LoadError, LoaderError};
pub use manager::{ThumbnailManager, Ticket};
pub use source::{HttpThumbnailSource, Thumbnail, ThumbnailHandle, ThumbnailSource};
pub use state::{LoaderStats, Resolution};

pub use thumbgrid_cache::{CacheStats, EntryState, ThumbnailKey};
pub use thumbgrid_scheduler::{
    CancellationToken, CellId, FillStep, Generation, LayoutOracle, Rect, Tier, Viewport,
    VisibilityEvent, VisibilityOracle,
};
