//! Runtime configuration: schema and file loading.

pub mod loader;
pub mod schema;

pub use loader::{
    ConfigError, default_home, load_available_models, load_config, save_available_models,
    save_config,
};
pub use schema::ChorusConfig;
