pub mod cli;
pub mod file;
pub mod watcher;

pub use cli::Cli;
pub use file::load;
pub use file::Config;
pub use file::ConfigError;
pub use file::ResolvedConfig;
pub use file::ResourceUnitStrategy;
pub use watcher::ConfigChangeEvent;
pub use watcher::ConfigWatcher;
