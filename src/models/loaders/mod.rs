pub mod toml_loader;

pub use toml_loader::{load_all_batch_configs, load_batch_config};
