pub mod schema;

pub use schema::{
    default_data_dir, expand_path, Config, DatabaseConfig, DatabaseEngine, LogConfig,
    LookupConfig, TokensConfig,
};
