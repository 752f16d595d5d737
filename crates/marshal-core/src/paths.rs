use std::env;
use std::path::PathBuf;

/// Return the user's home directory path.
///
/// Uses HOME on Unix-like systems and USERPROFILE on Windows.
pub fn get_home_dir() -> Result<String, String> {
    if let Ok(home) = env::var("HOME") {
        if !home.is_empty() {
            return Ok(home);
        }
    }

    if let Ok(profile) = env::var("USERPROFILE") {
        if !profile.is_empty() {
            return Ok(profile);
        }
    }

    Err("Home directory not set".to_string())
}

/// `~/.config/marshal`
pub fn config_dir() -> Result<PathBuf, String> {
    Ok(PathBuf::from(get_home_dir()?).join(".config").join("marshal"))
}

/// `~/.config/marshal/config.json`
pub fn default_config_path() -> Result<PathBuf, String> {
    Ok(config_dir()?.join("config.json"))
}
