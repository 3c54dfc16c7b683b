pub(crate) mod config_holder;
pub(crate) mod toml;
