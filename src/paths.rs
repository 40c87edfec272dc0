//! Path resolution for bosun
//!
//! # Environment Variables
//!
//! - `BOSUN_STATE_DIR` - Override the state directory (persisted runs, reports)
//!
//! # Path Resolution Priority
//!
//! For state_dir():
//! 1. `BOSUN_STATE_DIR` environment variable
//! 2. `XDG_STATE_HOME/bosun` (if set)
//! 3. Platform default:
//!    - Windows: `%LOCALAPPDATA%\bosun`
//!    - macOS/Linux: `~/.local/state/bosun`

use anyhow::{Context, Result};
use std::borrow::Cow;
use std::path::{Path, PathBuf};

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "BOSUN_STATE_DIR";

/// Get the bosun state directory path
pub fn state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
        let path = expand(&dir);
        log::debug!("Using state dir from {}: {}", ENV_STATE_DIR, path.display());
        return Ok(path);
    }

    if let Ok(xdg_state) = std::env::var("XDG_STATE_HOME") {
        let path = PathBuf::from(xdg_state).join("bosun");
        log::debug!("Using XDG_STATE_HOME: {}", path.display());
        return Ok(path);
    }

    #[cfg(windows)]
    {
        if let Some(local_app_data) = dirs::data_local_dir() {
            let path = local_app_data.join("bosun");
            log::debug!("Using Windows state dir: {}", path.display());
            return Ok(path);
        }
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".local").join("state").join("bosun");
    log::debug!("Using default state dir: {}", path.display());
    Ok(path)
}

/// Expand ~ and environment variables in a path string
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

/// Expand ~, `${environment}`, `${namespace}` and process environment
/// variables, resolving a relative result against `base`
///
/// Unknown variables are left untouched.
pub fn expand_manifest(path: &str, base: &Path, vars: &[(&str, &str)]) -> PathBuf {
    let home = || dirs::home_dir().map(|p| p.to_string_lossy().into_owned());
    let expanded = shellexpand::full_with_context_no_errors(path, home, |name| {
        vars.iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| (*value).to_string())
            .or_else(|| std::env::var(name).ok())
    });
    let expanded = PathBuf::from(expanded.as_ref());
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

/// Substitute `${environment}` and `${namespace}` in a resource name
pub fn expand_name(name: &str, vars: &[(&str, &str)]) -> String {
    shellexpand::env_with_context_no_errors(name, |key| {
        vars.iter()
            .find(|(var, _)| *var == key)
            .map(|(_, value)| *value)
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_manifest_relative_to_base() {
        let path = expand_manifest(
            "overlays/${environment}/api.yaml",
            Path::new("/srv/deploy"),
            &[("environment", "staging")],
        );
        assert_eq!(path, PathBuf::from("/srv/deploy/overlays/staging/api.yaml"));
    }

    #[test]
    fn test_expand_manifest_absolute_kept() {
        let path = expand_manifest("/etc/manifests/ns.yaml", Path::new("/srv"), &[]);
        assert_eq!(path, PathBuf::from("/etc/manifests/ns.yaml"));
    }

    #[test]
    fn test_expand_manifest_tilde() {
        let home = dirs::home_dir().unwrap();
        let path = expand_manifest("~/manifests/ns.yaml", Path::new("/srv"), &[]);
        assert_eq!(path, home.join("manifests").join("ns.yaml"));
    }

    #[test]
    fn test_expand_name() {
        let vars = [("namespace", "platform-prod"), ("environment", "production")];
        assert_eq!(expand_name("${namespace}", &vars), "platform-prod");
        assert_eq!(expand_name("api-${environment}", &vars), "api-production");
        assert_eq!(expand_name("${unknown}-x", &vars), "${unknown}-x");
    }

    #[test]
    fn test_expand_plain_path() {
        assert_eq!(expand("/tmp/bosun"), PathBuf::from("/tmp/bosun"));
    }
}
