use crate::{presets::PresetId, rules::ReplacementRule};
use anyhow::{bail, Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Overrides the data directory (config, log) when set.
pub const DATA_DIR_ENV: &str = "CERTSMITH_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default = "default_template")]
    pub template: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_merge_file")]
    pub merge_file: PathBuf,
    #[serde(default)]
    pub active_preset: String,
    #[serde(default)]
    pub custom_rules: Vec<ReplacementRule>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            template: default_template(),
            output_dir: default_output_dir(),
            merge_file: default_merge_file(),
            active_preset: PresetId::default().id().to_string(),
            custom_rules: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn load_or_create() -> Result<Self> {
        let base_dir = base_data_dir()?;
        fs::create_dir_all(&base_dir).context("create app data dir")?;
        Self::load_or_create_at(&base_dir.join("config.json"))
    }

    pub fn load_or_create_at(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path).context("read app config")?;
            let mut config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            if PresetId::parse(&config.active_preset).is_none() {
                config.active_preset = PresetId::default().id().to_string();
                config.save_to(path)?;
            }
            return Ok(config);
        }

        let config = AppConfig::default();
        config.save_to(path)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let base_dir = base_data_dir()?;
        fs::create_dir_all(&base_dir).context("create app data dir")?;
        self.save_to(&base_dir.join("config.json"))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(path, raw).context("write app config")?;
        Ok(())
    }

    pub fn active_preset(&self) -> PresetId {
        PresetId::parse(&self.active_preset).unwrap_or_default()
    }

    /// Updates one setting by its `config set` key.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "database" => self.database = PathBuf::from(value),
            "template" => self.template = PathBuf::from(value),
            "output_dir" | "output-dir" => self.output_dir = PathBuf::from(value),
            "merge_file" | "merge-file" => self.merge_file = PathBuf::from(value),
            "preset" | "active_preset" => {
                let Some(preset) = PresetId::parse(value) else {
                    bail!("Unknown preset: {value}");
                };
                self.active_preset = preset.id().to_string();
            }
            _ => bail!(
                "Unknown config key: {key} (use database, template, output_dir, merge_file, or preset)"
            ),
        }
        Ok(())
    }
}

pub fn base_data_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|dir| !dir.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("certsmith"))
}

fn default_database() -> PathBuf {
    PathBuf::from("./数据库.xlsx")
}

fn default_template() -> PathBuf {
    PathBuf::from("./模板.docx")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./生成的证书（未合并）")
}

fn default_merge_file() -> PathBuf {
    PathBuf::from("./生成的证书.docx")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_default_config_on_first_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = AppConfig::load_or_create_at(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.active_preset(), PresetId::Training);
    }

    #[test]
    fn unknown_preset_falls_back_and_is_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"active_preset": "gone", "database": "db.xlsx"}"#).unwrap();
        let config = AppConfig::load_or_create_at(&path).unwrap();
        assert_eq!(config.active_preset, "training");
        assert_eq!(config.database, PathBuf::from("db.xlsx"));
        assert_eq!(config.template, default_template());

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"training\""));
    }

    #[test]
    fn set_accepts_known_keys_only() {
        let mut config = AppConfig::default();
        config.set("merge-file", "all.docx").unwrap();
        config.set("preset", "金种子").unwrap();
        assert_eq!(config.merge_file, PathBuf::from("all.docx"));
        assert_eq!(config.active_preset(), PresetId::GoldenSeed);
        assert!(config.set("preset", "nope").is_err());
        assert!(config.set("colour", "red").is_err());
    }
}
