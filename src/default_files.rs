/// The default configuration written by `picts-init`.
pub static DEFAULT_CONFIG_TOML: &str = include_str!("etc/picts_config.toml");

/// File name `picts-init` uses for the configuration when none is given.
pub const DEFAULT_CONFIG_FILE_NAME: &str = "picts_config.toml";
