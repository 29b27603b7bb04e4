//! Stream objects and their realtime bridges

pub mod context;
pub mod input;
pub mod output;

pub use context::{StreamContext, StreamStatsSnapshot};
pub use input::InputStream;
pub use output::OutputStream;
