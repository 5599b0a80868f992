use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::Path};
use thiserror::Error;

/// One column of the workbook mapped onto one piece of template text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementRule {
    pub excel_header: String,
    pub placeholder: String,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub use_in_filename: bool,
}

impl ReplacementRule {
    pub fn new(excel_header: &str, placeholder: &str) -> Self {
        Self {
            excel_header: excel_header.to_string(),
            placeholder: placeholder.to_string(),
            format: default_format(),
            required: false,
            use_in_filename: false,
        }
    }

    pub fn with_format(mut self, format: &str) -> Self {
        self.format = format.to_string();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn in_filename(mut self) -> Self {
        self.use_in_filename = true;
        self
    }

    /// Text that replaces the placeholder for `value`. Empty values remove it.
    pub fn replacement(&self, value: &str) -> Result<String, RuleError> {
        if value.is_empty() {
            return Ok(String::new());
        }
        render_format(&self.format, value)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("no replacement rules configured")]
    Empty,
    #[error("rule {index}: excel header must not be empty")]
    EmptyHeader { index: usize },
    #[error("rule {index}: placeholder must not be empty")]
    EmptyPlaceholder { index: usize },
    #[error("invalid format {format:?}: {reason}")]
    BadFormat { format: String, reason: String },
}

/// A data row keyed by column header.
pub type Record = HashMap<String, String>;

pub fn default_format() -> String {
    "{0}".to_string()
}

/// Trims every field and rejects rules that cannot be applied.
pub fn validate(rules: &mut [ReplacementRule]) -> Result<(), RuleError> {
    if rules.is_empty() {
        return Err(RuleError::Empty);
    }
    for (idx, rule) in rules.iter_mut().enumerate() {
        rule.excel_header = rule.excel_header.trim().to_string();
        rule.placeholder = rule.placeholder.trim().to_string();
        rule.format = rule.format.trim().to_string();
        if rule.format.is_empty() {
            rule.format = default_format();
        }
        if rule.excel_header.is_empty() {
            return Err(RuleError::EmptyHeader { index: idx + 1 });
        }
        if rule.placeholder.is_empty() {
            return Err(RuleError::EmptyPlaceholder { index: idx + 1 });
        }
        render_format(&rule.format, "")?;
    }
    Ok(())
}

/// Expands `{0}` and `{}` to `value`; `{{` and `}}` are literal braces.
pub fn render_format(format: &str, value: &str) -> Result<String, RuleError> {
    let bad = |reason: &str| RuleError::BadFormat {
        format: format.to_string(),
        reason: reason.to_string(),
    };
    let mut out = String::with_capacity(format.len() + value.len());
    let mut chars = format.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' => {
                if chars.peek() == Some(&'{') {
                    chars.next();
                    out.push('{');
                    continue;
                }
                let mut field = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(next) => field.push(next),
                        None => return Err(bad("unclosed '{'")),
                    }
                }
                if !field.is_empty() && field != "0" {
                    return Err(bad(&format!(
                        "unknown field {{{field}}}, only {{}} or {{0}} is supported"
                    )));
                }
                out.push_str(value);
            }
            '}' => {
                if chars.peek() == Some(&'}') {
                    chars.next();
                    out.push('}');
                } else {
                    return Err(bad("single '}' must be written as '}}'"));
                }
            }
            _ => out.push(ch),
        }
    }
    Ok(out)
}

pub fn contains_placeholder(text: &str, rules: &[ReplacementRule]) -> bool {
    rules
        .iter()
        .any(|rule| !rule.placeholder.is_empty() && text.contains(&rule.placeholder))
}

/// Applies every rule in order. Later rules see the output of earlier ones.
pub fn substitute(
    text: &str,
    rules: &[ReplacementRule],
    record: &Record,
) -> Result<String, RuleError> {
    let mut out = text.to_string();
    for rule in rules {
        if rule.placeholder.is_empty() || !out.contains(&rule.placeholder) {
            continue;
        }
        let value = record
            .get(&rule.excel_header)
            .map(String::as_str)
            .unwrap_or("");
        let replacement = rule.replacement(value)?;
        out = out.replace(&rule.placeholder, &replacement);
    }
    Ok(out)
}

pub fn filename_fields(rules: &[ReplacementRule]) -> Vec<String> {
    let flagged: Vec<String> = rules
        .iter()
        .filter(|rule| rule.use_in_filename)
        .map(|rule| rule.excel_header.clone())
        .collect();
    if !flagged.is_empty() {
        return flagged;
    }
    rules
        .first()
        .map(|rule| vec![rule.excel_header.clone()])
        .unwrap_or_default()
}

pub fn load_rules(path: &Path) -> Result<Vec<ReplacementRule>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read rules {path:?}"))?;
    let mut rules: Vec<ReplacementRule> =
        serde_json::from_str(&raw).with_context(|| format!("parse rules {path:?}"))?;
    validate(&mut rules).with_context(|| format!("validate rules {path:?}"))?;
    Ok(rules)
}

pub fn save_rules(path: &Path, rules: &[ReplacementRule]) -> Result<()> {
    if rules.is_empty() {
        return Err(RuleError::Empty.into());
    }
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).context("create rules dir")?;
    }
    let raw = serde_json::to_string_pretty(rules).context("serialize rules")?;
    fs::write(path, raw).with_context(|| format!("write rules {path:?}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn format_expands_value_and_escapes() {
        assert_eq!(render_format("（{0}学时）", "32").unwrap(), "（32学时）");
        assert_eq!(render_format("{{{0}}}", "x").unwrap(), "{x}");
        assert_eq!(render_format("（{}学时）", "32").unwrap(), "（32学时）");
        assert_eq!(render_format("{}", "32").unwrap(), "32");
        assert!(render_format("{1}", "x").is_err());
        assert!(render_format("{0", "x").is_err());
        assert!(render_format("a}b", "x").is_err());
    }

    #[test]
    fn empty_value_removes_placeholder() {
        let rules = vec![
            ReplacementRule::new("指导老师", "指导老师：").with_format("指导老师：{0}"),
            ReplacementRule::new("姓名", "湖小招"),
        ];
        let row = record(&[("姓名", "张三"), ("指导老师", "")]);
        let out = substitute("湖小招 指导老师：", &rules, &row).unwrap();
        assert_eq!(out, "张三 ");
    }

    #[test]
    fn rules_apply_in_order() {
        let rules = vec![
            ReplacementRule::new("a", "AAA").with_format("[XXXX]"),
            ReplacementRule::new("b", "XXXX"),
        ];
        let row = record(&[("a", "1"), ("b", "two")]);
        assert_eq!(substitute("AAA", &rules, &row).unwrap(), "[two]");
    }

    #[test]
    fn filename_fields_fall_back_to_first_rule() {
        let rules = vec![ReplacementRule::new("姓名", "x"), ReplacementRule::new("学号", "y")];
        assert_eq!(filename_fields(&rules), vec!["姓名".to_string()]);

        let rules = vec![
            ReplacementRule::new("姓名", "x").in_filename(),
            ReplacementRule::new("项目", "z"),
            ReplacementRule::new("学号", "y").in_filename(),
        ];
        assert_eq!(filename_fields(&rules), vec!["姓名".to_string(), "学号".to_string()]);
    }

    #[test]
    fn validate_trims_and_reports_index() {
        let mut rules = vec![ReplacementRule::new(" 姓名 ", " 湖小招 ").with_format(" ")];
        validate(&mut rules).unwrap();
        assert_eq!(rules[0].excel_header, "姓名");
        assert_eq!(rules[0].placeholder, "湖小招");
        assert_eq!(rules[0].format, "{0}");

        let mut rules = vec![ReplacementRule::new("学时", "（学时）").with_format("（{}学时）")];
        assert_eq!(validate(&mut rules), Ok(()));

        let mut rules = vec![ReplacementRule::new("a", "b"), ReplacementRule::new("c", "  ")];
        assert_eq!(validate(&mut rules), Err(RuleError::EmptyPlaceholder { index: 2 }));
        assert_eq!(validate(&mut []), Err(RuleError::Empty));
    }

    #[test]
    fn rules_file_defaults_optional_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        fs::write(&path, r#"[{"excel_header": "姓名", "placeholder": "湖小招"}]"#).unwrap();
        let rules = load_rules(&path).unwrap();
        assert_eq!(rules, vec![ReplacementRule::new("姓名", "湖小招")]);

        let out = dir.path().join("nested").join("out.json");
        save_rules(&out, &rules).unwrap();
        let raw = fs::read_to_string(&out).unwrap();
        assert!(raw.contains("湖小招"));
        assert_eq!(load_rules(&out).unwrap(), rules);
    }

    #[test]
    fn rules_file_rejects_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        fs::write(&path, r#"[{"excel_header": "姓名"}]"#).unwrap();
        assert!(load_rules(&path).is_err());
    }
}
