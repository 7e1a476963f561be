use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BastionError {
    #[error("Config file not found: {path}")]
    ConfigFileNotFound { path: PathBuf },

    #[error("Failed to read config file {path}: {message}")]
    ConfigRead { path: PathBuf, message: String },

    #[error("Failed to parse config file {path}: {message}")]
    ConfigParse { path: PathBuf, message: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Unknown platform variant '{value}' (expected linux, wsl2, vm-hosted or containerized)")]
    UnknownPlatform { value: String },

    #[error("Home directory could not be determined")]
    HomeDirUnavailable,
}
