//! Generic JSON config file helpers: load-if-present, atomic save. Reused
//! by every application-specific config struct rather than hand-rolled per
//! caller.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::xdg::xdg_config_home;

/// `$XDG_CONFIG_HOME/<app>/<file>`.
pub fn config_path(app: &str, file: &str) -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join(app).join(file))
}

/// Returns `None` if the file does not exist.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

/// Writes `value` to `path` via a temp-file-then-rename, creating parent
/// directories as needed.
pub fn save_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid config path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Example {
        name: String,
        count: u32,
    }

    #[test]
    fn round_trips_through_atomic_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.json");
        let value = Example {
            name: "widget".to_string(),
            count: 3,
        };

        save_json_atomic(&path, &value).unwrap();
        let loaded: Option<Example> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(value));
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let loaded: Option<Example> = load_json(&path).unwrap();
        assert_eq!(loaded, None);
    }
}
