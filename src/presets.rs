use crate::{config::AppConfig, rules::ReplacementRule};
use anyhow::{bail, Result};

pub const CUSTOM_ID: &str = "custom";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PresetId {
    #[default]
    Training,
    Career,
    GoldenSeed,
    Custom,
}

impl PresetId {
    pub fn all() -> [PresetId; 4] {
        [
            PresetId::Training,
            PresetId::Career,
            PresetId::GoldenSeed,
            PresetId::Custom,
        ]
    }

    pub fn id(self) -> &'static str {
        match self {
            PresetId::Training => "training",
            PresetId::Career => "career",
            PresetId::GoldenSeed => "golden-seed",
            PresetId::Custom => CUSTOM_ID,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            PresetId::Training => "就业创业培训",
            PresetId::Career => "职业规划大赛",
            PresetId::GoldenSeed => "金种子",
            PresetId::Custom => "自定义",
        }
    }

    /// Accepts the short id or the display name.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        PresetId::all()
            .into_iter()
            .find(|preset| preset.id().eq_ignore_ascii_case(value) || preset.display_name() == value)
    }

    /// Rules shipped with the tool. The custom preset has none of its own.
    pub fn builtin_rules(self) -> Vec<ReplacementRule> {
        match self {
            PresetId::Training => vec![
                ReplacementRule::new("姓名", "湖小招").required().in_filename(),
                ReplacementRule::new("学号", "14242300000")
                    .required()
                    .in_filename(),
                ReplacementRule::new("项目", "XXXX").required(),
                ReplacementRule::new("学时", "（学时）")
                    .with_format("（{0}学时）")
                    .required(),
            ],
            PresetId::Career => vec![
                ReplacementRule::new("姓名", "湖小招").required().in_filename(),
                ReplacementRule::new("赛道", "XXXX").required(),
                ReplacementRule::new("奖项", "特等奖").required(),
                ReplacementRule::new("指导老师", "指导老师：").with_format("指导老师：{0}"),
                ReplacementRule::new("团队成员", "团队成员：").with_format("团队成员：{0}"),
            ],
            PresetId::GoldenSeed => vec![
                ReplacementRule::new("项目名称", "AAA").required().in_filename(),
                ReplacementRule::new("赛道", "XXXX").required(),
                ReplacementRule::new("奖项", "特等奖").required(),
                ReplacementRule::new("团队成员", "团队成员：")
                    .with_format("团队成员：{0}")
                    .required(),
                ReplacementRule::new("指导老师", "指导老师：").with_format("指导老师：{0}"),
            ],
            PresetId::Custom => Vec::new(),
        }
    }
}

/// Rules for `preset`, reading the custom preset from the config.
pub fn rules_for(config: &AppConfig, preset: PresetId) -> Result<Vec<ReplacementRule>> {
    let rules = match preset {
        PresetId::Custom => config.custom_rules.clone(),
        other => other.builtin_rules(),
    };
    if rules.is_empty() {
        bail!(
            "Preset '{}' has no rules (import some with `certsmith rules import <file>`)",
            preset.id()
        );
    }
    Ok(rules)
}

pub fn resolve(config: &AppConfig, name: Option<&str>) -> Result<(PresetId, Vec<ReplacementRule>)> {
    let preset = match name {
        Some(name) => match PresetId::parse(name) {
            Some(preset) => preset,
            None => bail!("Unknown preset: {name}"),
        },
        None => config.active_preset(),
    };
    Ok((preset, rules_for(config, preset)?))
}
