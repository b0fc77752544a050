use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::camera::CameraSettings;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "TAGSIGHT_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub camera: CameraConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Registry overlay merged over the built-in stage descriptors.
    pub stage_defs: PathBuf,
    /// User-defined stage descriptors, written by explicit save.
    pub custom_stages: PathBuf,
    pub algorithms_dir: PathBuf,
    pub save_dir: PathBuf,
    /// Directories searched, in order, when a start target names a file.
    pub media_dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraConfig {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub format: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            stage_defs: PathBuf::from("pipeline_stages.json"),
            custom_stages: PathBuf::from("custom_stages.json"),
            algorithms_dir: PathBuf::from("algorithms"),
            save_dir: PathBuf::from("captures"),
            media_dirs: vec![PathBuf::from("media")],
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        let defaults = CameraSettings::default();
        Self {
            width: defaults.width,
            height: defaults.height,
            fps: defaults.fps,
            format: defaults.format,
        }
    }
}

impl CameraConfig {
    pub fn settings(&self) -> CameraSettings {
        CameraSettings {
            width: self.width,
            height: self.height,
            fps: self.fps,
            format: self.format.clone(),
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn stage_defs_path(&self, data_dir: &Path) -> PathBuf {
        resolve_relative_to(data_dir, &self.paths.stage_defs)
    }

    pub fn custom_stages_path(&self, data_dir: &Path) -> PathBuf {
        resolve_relative_to(data_dir, &self.paths.custom_stages)
    }

    pub fn algorithms_dir(&self, data_dir: &Path) -> PathBuf {
        resolve_relative_to(data_dir, &self.paths.algorithms_dir)
    }

    pub fn save_dir(&self, data_dir: &Path) -> PathBuf {
        resolve_relative_to(data_dir, &self.paths.save_dir)
    }

    pub fn media_dirs(&self, data_dir: &Path) -> Vec<PathBuf> {
        self.paths
            .media_dirs
            .iter()
            .map(|dir| resolve_relative_to(data_dir, dir))
            .collect()
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. TAGSIGHT_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Initialize the data directory structure on first run:
/// - Creates data_dir, the algorithms dir, and the save dir if missing
/// - Writes default config.toml only if the file doesn't exist
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    let config = if cfg_path.exists() {
        AppConfig::load_from_path(&cfg_path)?
    } else {
        let default_cfg = AppConfig::default();
        default_cfg.save_to_path(&cfg_path)?;
        default_cfg
    };

    for dir in [config.algorithms_dir(data_dir), config.save_dir(data_dir)] {
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create directory: {}", dir.display()))?;
    }

    Ok(())
}

/// Resolve a path relative to a base directory.
/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.stage_defs, PathBuf::from("pipeline_stages.json"));
        assert_eq!(cfg.paths.custom_stages, PathBuf::from("custom_stages.json"));
        assert_eq!(cfg.paths.algorithms_dir, PathBuf::from("algorithms"));
        assert_eq!(cfg.paths.save_dir, PathBuf::from("captures"));
        assert_eq!(cfg.paths.media_dirs, vec![PathBuf::from("media")]);

        assert_eq!(cfg.camera.width, 640);
        assert_eq!(cfg.camera.height, 480);
        assert_eq!(cfg.camera.fps, 30.0);
        assert_eq!(cfg.camera.format, "YUYV");
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let original = AppConfig::default();
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let temp = tempfile::tempdir().expect("temp dir");
        let loaded = AppConfig::load_from_path(&temp.path().join("missing.toml"))
            .expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let decoded: AppConfig =
            toml::from_str("[camera]\nfps = 60.0\n").expect("parse partial config");
        assert_eq!(decoded.camera.fps, 60.0);
        assert_eq!(decoded.camera.width, 640);
        assert_eq!(decoded.paths.save_dir, PathBuf::from("captures"));
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let cli_path = Path::new("/custom");
        let result = data_dir(Some(cli_path));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_uses_env_var_when_no_cli() {
        env::set_var(ENV_DATA_DIR, "/env/path");
        let result = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        assert_eq!(result, PathBuf::from("/env/path"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = tempfile::tempdir().expect("temp dir");
        let data = temp.path().join("data");
        initialize_data_dir(&data).expect("initialize data dir");

        assert!(data.exists());
        assert!(data.join("config.toml").exists());
        assert!(data.join("algorithms").exists());
        assert!(data.join("captures").exists());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().expect("temp dir");
        let data = temp.path().to_path_buf();

        let cfg_path = data.join("config.toml");
        let custom_content = "[camera]\nfps = 15.0\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(&data).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn resolve_relative_to_absolute_path_unchanged() {
        let result = resolve_relative_to(Path::new("/base"), Path::new("/abs/path"));
        assert_eq!(result, PathBuf::from("/abs/path"));
    }

    #[test]
    fn resolve_relative_to_joins_relative_path() {
        let result = resolve_relative_to(Path::new("/base"), Path::new("sub"));
        assert_eq!(result, PathBuf::from("/base/sub"));
    }

    #[test]
    fn camera_config_converts_to_settings() {
        let cfg = CameraConfig {
            width: 1280,
            height: 720,
            fps: 60.0,
            format: "MJPG".to_string(),
        };
        let settings = cfg.settings();
        assert_eq!(settings.width, 1280);
        assert_eq!(settings.height, 720);
        assert_eq!(settings.fps, 60.0);
        assert_eq!(settings.format, "MJPG");
    }
}
