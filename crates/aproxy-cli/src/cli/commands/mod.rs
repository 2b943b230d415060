//! CLI command handlers, one file per command.

mod checksum;
mod completions;
mod inspect;
mod serve;
mod url;

pub use checksum::run_checksum;
pub use completions::run_completions;
pub use inspect::run_inspect;
pub use serve::{run_serve, ServeOptions};
pub use url::run_url;
