use std::io;
use std::path::PathBuf;

use directories::ProjectDirs;

use crate::error::Result;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "keystash";
pub const APP_NAME: &str = "keystash";

/// Overrides the auth-state directory everywhere a default is used.
pub const AUTH_DIR_ENV: &str = "KEYSTASH_AUTH_DIR";

pub fn data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "cannot determine data directory")
    })?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn config_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("config.json"))
}

pub fn default_auth_dir() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(AUTH_DIR_ENV) {
        return Ok(PathBuf::from(override_path));
    }
    Ok(data_dir()?.join("auth_state"))
}
