pub mod config;
pub mod prompts;
pub mod sessions;

pub use config::*;
pub use prompts::*;
pub use sessions::*;
