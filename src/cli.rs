use crate::{
    config::AppConfig,
    generate::{self, GenerateReport, Generator, Job},
    log::{Log, LogLevel, Verbosity},
    merge::{self, MergeReport},
    presets::{self, PresetId},
    rules::{self, ReplacementRule},
};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct GlobalOptions {
    format: OutputFormat,
    verbosity: Verbosity,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct JobOptions {
    database: Option<PathBuf>,
    template: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    merge_file: Option<PathBuf>,
    preset: Option<String>,
    rules: Option<PathBuf>,
    sheet: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    Run(JobOptions),
    Generate(JobOptions),
    Merge(JobOptions),
    PresetsList,
    PresetsShow(String),
    RulesImport(PathBuf),
    RulesExport {
        path: PathBuf,
        preset: Option<String>,
    },
    ConfigShow,
    ConfigSet {
        key: String,
        value: String,
    },
    Help,
    Version,
}

pub fn run() -> Result<bool> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (global, tokens) = parse_global_options(&args)?;
    let command = parse_command(&tokens)?;
    match command {
        CliCommand::Help => {
            print_help();
            Ok(true)
        }
        CliCommand::Version => {
            println!("certsmith v{}", env!("CARGO_PKG_VERSION"));
            Ok(true)
        }
        command => {
            let mut config = AppConfig::load_or_create()?;
            let mut log = Log::for_cli(global.verbosity);
            if global.format == OutputFormat::Json {
                log = log.progress_to_stderr();
            }
            run_command(&mut config, &mut log, command, global.format)
        }
    }
}

fn parse_global_options(args: &[String]) -> Result<(GlobalOptions, Vec<String>)> {
    let mut format = OutputFormat::Text;
    let mut verbosity = Verbosity::Normal;
    let mut tokens = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(value) = arg.strip_prefix("--format=") {
            format = parse_format(value)?;
            continue;
        }
        match arg.as_str() {
            "--format" => {
                let Some(value) = iter.next() else {
                    bail!("--format requires a value");
                };
                format = parse_format(value)?;
            }
            "-q" | "--quiet" => verbosity = Verbosity::Quiet,
            "--verbose" => verbosity = Verbosity::Verbose,
            _ if arg.starts_with("-v") && !arg.starts_with("--") => {
                let count = arg.chars().filter(|ch| *ch == 'v').count();
                verbosity = if count >= 2 {
                    Verbosity::Debug
                } else {
                    Verbosity::Verbose
                };
            }
            _ => tokens.push(arg.to_string()),
        }
    }
    Ok((GlobalOptions { format, verbosity }, tokens))
}

fn parse_format(value: &str) -> Result<OutputFormat> {
    OutputFormat::parse(value)
        .ok_or_else(|| anyhow::anyhow!("Unknown format: {value} (use 'text' or 'json')"))
}

fn parse_command(tokens: &[String]) -> Result<CliCommand> {
    let Some(head) = tokens.first() else {
        return Ok(CliCommand::Run(JobOptions::default()));
    };
    let rest = tokens.get(1..).unwrap_or(&[]);
    match head.as_str() {
        "--help" | "-h" | "help" => Ok(CliCommand::Help),
        "--version" | "-V" | "version" => Ok(CliCommand::Version),
        "run" => Ok(CliCommand::Run(parse_job_options(rest)?)),
        "generate" => Ok(CliCommand::Generate(parse_job_options(rest)?)),
        "merge" => {
            let options = parse_job_options(rest)?;
            let JobOptions {
                database,
                template,
                preset,
                rules: rule_file,
                sheet,
                ..
            } = &options;
            if database.is_some()
                || template.is_some()
                || preset.is_some()
                || rule_file.is_some()
                || sheet.is_some()
            {
                bail!("merge only accepts --output-dir and --merge-file");
            }
            Ok(CliCommand::Merge(options))
        }
        "presets" => match rest.first().map(String::as_str).unwrap_or("list") {
            "list" => Ok(CliCommand::PresetsList),
            "show" => {
                let name = rest
                    .get(1)
                    .ok_or_else(|| anyhow::anyhow!("presets show requires a preset name"))?;
                Ok(CliCommand::PresetsShow(name.to_string()))
            }
            sub => bail!("Unknown presets command: {sub} (use 'list' or 'show')"),
        },
        "rules" => match rest.first().map(String::as_str) {
            Some("import") => {
                let path = rest
                    .get(1)
                    .ok_or_else(|| anyhow::anyhow!("rules import requires a file"))?;
                Ok(CliCommand::RulesImport(PathBuf::from(path)))
            }
            Some("export") => {
                let mut path = None;
                let mut preset = None;
                let mut iter = rest[1..].iter();
                while let Some(arg) = iter.next() {
                    if arg == "--preset" {
                        preset = Some(take_value(&mut iter, "--preset")?);
                    } else if let Some(value) = arg.strip_prefix("--preset=") {
                        preset = Some(value.to_string());
                    } else if path.is_none() {
                        path = Some(PathBuf::from(arg));
                    } else {
                        bail!("Unexpected argument: {arg}");
                    }
                }
                let path = path.ok_or_else(|| anyhow::anyhow!("rules export requires a file"))?;
                Ok(CliCommand::RulesExport { path, preset })
            }
            Some(sub) => bail!("Unknown rules command: {sub} (use 'import' or 'export')"),
            None => bail!("rules requires 'import' or 'export'"),
        },
        "config" => match rest.first().map(String::as_str).unwrap_or("show") {
            "show" => Ok(CliCommand::ConfigShow),
            "set" => {
                let (Some(key), Some(value)) = (rest.get(1), rest.get(2)) else {
                    bail!("config set requires a key and a value");
                };
                Ok(CliCommand::ConfigSet {
                    key: key.to_string(),
                    value: value.to_string(),
                })
            }
            sub => bail!("Unknown config command: {sub} (use 'show' or 'set')"),
        },
        value if value.starts_with('-') => Ok(CliCommand::Run(parse_job_options(tokens)?)),
        other => bail!("Unknown command: {other} (try 'certsmith help')"),
    }
}

fn take_value<'a>(iter: &mut impl Iterator<Item = &'a String>, flag: &str) -> Result<String> {
    iter.next()
        .map(|value| value.to_string())
        .ok_or_else(|| anyhow::anyhow!("{flag} requires a value"))
}

fn parse_job_options(args: &[String]) -> Result<JobOptions> {
    let mut options = JobOptions::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => (flag, Some(value.to_string())),
            _ => (arg.as_str(), None),
        };
        let mut value = || match &inline {
            Some(value) => Ok(value.clone()),
            None => take_value(&mut iter, flag),
        };
        match flag {
            "--database" | "-d" => options.database = Some(PathBuf::from(value()?)),
            "--template" | "-t" => options.template = Some(PathBuf::from(value()?)),
            "--output-dir" | "-o" => options.output_dir = Some(PathBuf::from(value()?)),
            "--merge-file" | "-m" => options.merge_file = Some(PathBuf::from(value()?)),
            "--preset" | "-p" => options.preset = Some(value()?),
            "--rules" | "-r" => options.rules = Some(PathBuf::from(value()?)),
            "--sheet" => options.sheet = Some(value()?),
            _ => bail!("Unknown option: {arg}"),
        }
    }
    Ok(options)
}

fn build_job(config: &AppConfig, options: JobOptions) -> Result<(Job, String)> {
    let (rules, source) = match (&options.rules, &options.preset) {
        (Some(_), Some(_)) => bail!("--rules and --preset cannot be combined"),
        (Some(path), None) => (rules::load_rules(path)?, path.display().to_string()),
        (None, preset) => {
            let (preset, rules) = presets::resolve(config, preset.as_deref())?;
            (rules, format!("preset {}", preset.display_name()))
        }
    };
    let job = Job {
        database: options.database.unwrap_or_else(|| config.database.clone()),
        template: options.template.unwrap_or_else(|| config.template.clone()),
        output_dir: options
            .output_dir
            .unwrap_or_else(|| config.output_dir.clone()),
        merge_output: options
            .merge_file
            .unwrap_or_else(|| config.merge_file.clone()),
        rules,
        sheet: options.sheet,
    };
    Ok((job, source))
}

#[derive(Serialize)]
struct RunSummary<'a> {
    ok: bool,
    generate: Option<&'a GenerateReport>,
    merge: Option<MergeSummary>,
    errors: Vec<&'a str>,
}

#[derive(Serialize)]
struct MergeSummary {
    merged: usize,
    failed: usize,
    output: PathBuf,
}

impl From<&MergeReport> for MergeSummary {
    fn from(report: &MergeReport) -> Self {
        Self {
            merged: report.merged,
            failed: report.failed,
            output: report.output.clone(),
        }
    }
}

fn run_command(
    config: &mut AppConfig,
    log: &mut Log,
    command: CliCommand,
    format: OutputFormat,
) -> Result<bool> {
    match command {
        CliCommand::Run(options) => {
            let (job, source) = build_job(config, options)?;
            generate::ensure_inputs(&job)?;
            log.info(format!("Generating and merging with {source}..."));
            let mut generator = Generator::new(job)?;
            let outcome = generator.run(log);
            finish_run(log, format, outcome)
        }
        CliCommand::Generate(options) => {
            let (job, source) = build_job(config, options)?;
            generate::ensure_inputs(&job)?;
            log.info(format!("Generating with {source}..."));
            let mut generator = Generator::new(job)?;
            let outcome = generator
                .clean_output_dir(log)
                .and_then(|_| generator.generate(log))
                .map(|report| (report, None));
            finish_run(log, format, outcome)
        }
        CliCommand::Merge(options) => {
            let output_dir = options
                .output_dir
                .unwrap_or_else(|| config.output_dir.clone());
            let merge_file = options
                .merge_file
                .unwrap_or_else(|| config.merge_file.clone());
            let outcome = merge::merge_generated(&output_dir, &[], &merge_file, log)
                .map(|report| (GenerateReport::default(), Some(report)));
            finish_run(log, format, outcome)
        }
        CliCommand::PresetsList => {
            list_presets(config, format)?;
            Ok(true)
        }
        CliCommand::PresetsShow(name) => {
            let Some(preset) = PresetId::parse(&name) else {
                bail!("Unknown preset: {name}");
            };
            let rules = match preset {
                PresetId::Custom => config.custom_rules.clone(),
                other => other.builtin_rules(),
            };
            print_rules(&rules, format)?;
            Ok(true)
        }
        CliCommand::RulesImport(path) => {
            let rules = rules::load_rules(&path)?;
            let count = rules.len();
            config.custom_rules = rules;
            config.active_preset = PresetId::Custom.id().to_string();
            config.save()?;
            log.info(format!(
                "Imported {count} rule(s) from {} as the custom preset",
                path.display()
            ));
            Ok(true)
        }
        CliCommand::RulesExport { path, preset } => {
            let (_, rules) = presets::resolve(config, preset.as_deref())?;
            rules::save_rules(&path, &rules)?;
            log.info(format!("Exported {} rule(s) to {}", rules.len(), path.display()));
            Ok(true)
        }
        CliCommand::ConfigShow => {
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
                OutputFormat::Text => {
                    println!("database:   {}", config.database.display());
                    println!("template:   {}", config.template.display());
                    println!("output_dir: {}", config.output_dir.display());
                    println!("merge_file: {}", config.merge_file.display());
                    println!("preset:     {}", config.active_preset().id());
                    println!("custom:     {} rule(s)", config.custom_rules.len());
                }
            }
            Ok(true)
        }
        CliCommand::ConfigSet { key, value } => {
            config.set(&key, &value)?;
            config.save().context("save config")?;
            log.info(format!("Set {key} = {value}"));
            Ok(true)
        }
        CliCommand::Help | CliCommand::Version => Ok(true),
    }
}

fn finish_run(
    log: &mut Log,
    format: OutputFormat,
    outcome: Result<(GenerateReport, Option<MergeReport>)>,
) -> Result<bool> {
    let (report, merged) = match outcome {
        Ok(result) => result,
        Err(err) => {
            log.error(format!("{err:#}"));
            if format == OutputFormat::Json {
                println!("{}", summary_json(false, None, None, log)?);
            }
            return Ok(false);
        }
    };
    let generated_ok = report.total == 0 || report.succeeded();
    let ok = generated_ok && merged.as_ref().map_or(report.total > 0, |_| true);
    if format == OutputFormat::Json {
        let generated = (report.total > 0).then_some(&report);
        println!("{}", summary_json(ok, generated, merged.as_ref(), log)?);
    }
    Ok(ok)
}

fn summary_json(
    ok: bool,
    generate: Option<&GenerateReport>,
    merge: Option<&MergeReport>,
    log: &Log,
) -> Result<String> {
    let summary = RunSummary {
        ok,
        generate,
        merge: merge.map(MergeSummary::from),
        errors: log.messages(LogLevel::Error),
    };
    Ok(serde_json::to_string_pretty(&summary)?)
}

#[derive(Serialize)]
struct PresetListItem {
    id: &'static str,
    name: &'static str,
    rules: usize,
    active: bool,
}

fn list_presets(config: &AppConfig, format: OutputFormat) -> Result<()> {
    let active = config.active_preset();
    let items: Vec<PresetListItem> = PresetId::all()
        .into_iter()
        .map(|preset| PresetListItem {
            id: preset.id(),
            name: preset.display_name(),
            rules: match preset {
                PresetId::Custom => config.custom_rules.len(),
                other => other.builtin_rules().len(),
            },
            active: preset == active,
        })
        .collect();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&items)?),
        OutputFormat::Text => {
            for item in items {
                let marker = if item.active { "*" } else { " " };
                println!(
                    "{marker} {id:<12} {rules:>2} rule(s)  {name}",
                    id = item.id,
                    rules = item.rules,
                    name = item.name
                );
            }
        }
    }
    Ok(())
}

fn print_rules(rules: &[ReplacementRule], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(rules)?),
        OutputFormat::Text => {
            if rules.is_empty() {
                println!("No rules.");
            }
            for rule in rules {
                let mut flags = Vec::new();
                if rule.required {
                    flags.push("required");
                }
                if rule.use_in_filename {
                    flags.push("filename");
                }
                println!(
                    "{} -> {} as {} [{}]",
                    rule.excel_header,
                    rule.placeholder,
                    rule.format,
                    flags.join(", ")
                );
            }
        }
    }
    Ok(())
}

fn print_help() {
    println!("certsmith v{}", env!("CARGO_PKG_VERSION"));
    println!("Fill a DOCX template from XLSX rows and merge the results.");
    println!();
    println!("Usage:");
    println!("  certsmith [run] [job options]      Generate documents, then merge them");
    println!("  certsmith generate [job options]   Generate documents only");
    println!("  certsmith merge [-o dir] [-m file] Merge the documents in the output directory");
    println!("  certsmith presets [list|show <name>]");
    println!("  certsmith rules import <file.json> Store rules as the custom preset");
    println!("  certsmith rules export <file.json> [--preset <name>]");
    println!("  certsmith config [show|set <key> <value>]");
    println!("  certsmith help | version");
    println!();
    println!("Job options:");
    println!("  -d, --database <xlsx>     Workbook with a header row");
    println!("  -t, --template <docx>     Document template");
    println!("  -o, --output-dir <dir>    Directory for generated documents");
    println!("  -m, --merge-file <docx>   Merged output document");
    println!("  -p, --preset <name>       Built-in or custom rule preset");
    println!("  -r, --rules <json>        Rule file instead of a preset");
    println!("      --sheet <name>        Worksheet to read (default: active)");
    println!();
    println!("Global options:");
    println!("  --format text|json   Output format for reports and listings");
    println!("  -q, --quiet          Only print errors");
    println!("  -v, --verbose        Print per-file details (-vv for everything)");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DATA_DIR_ENV;
    use std::fs;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn global_options_are_removed_anywhere() {
        let (global, tokens) =
            parse_global_options(&args(&["run", "--format=json", "-q", "-p", "career"])).unwrap();
        assert_eq!(global.format, OutputFormat::Json);
        assert_eq!(global.verbosity, Verbosity::Quiet);
        assert_eq!(tokens, args(&["run", "-p", "career"]));

        let (global, _) = parse_global_options(&args(&["-vv"])).unwrap();
        assert_eq!(global.verbosity, Verbosity::Debug);
        assert!(parse_global_options(&args(&["--format", "xml"])).is_err());
    }

    #[test]
    fn bare_options_mean_run() {
        let command = parse_command(&args(&["--database=a.xlsx", "-t", "b.docx"])).unwrap();
        assert_eq!(
            command,
            CliCommand::Run(JobOptions {
                database: Some(PathBuf::from("a.xlsx")),
                template: Some(PathBuf::from("b.docx")),
                ..JobOptions::default()
            })
        );
        assert_eq!(parse_command(&[]).unwrap(), CliCommand::Run(JobOptions::default()));
    }

    #[test]
    fn subcommands_parse() {
        assert_eq!(
            parse_command(&args(&["presets", "show", "金种子"])).unwrap(),
            CliCommand::PresetsShow("金种子".to_string())
        );
        assert_eq!(
            parse_command(&args(&["rules", "export", "out.json", "--preset", "career"])).unwrap(),
            CliCommand::RulesExport {
                path: PathBuf::from("out.json"),
                preset: Some("career".to_string())
            }
        );
        assert_eq!(
            parse_command(&args(&["config", "set", "template", "t.docx"])).unwrap(),
            CliCommand::ConfigSet {
                key: "template".to_string(),
                value: "t.docx".to_string()
            }
        );
        assert!(parse_command(&args(&["rules"])).is_err());
        assert!(parse_command(&args(&["generate", "--bogus"])).is_err());
        assert!(parse_command(&args(&["generate", "--sheet"])).is_err());
        assert!(parse_command(&args(&["frobnicate"])).is_err());
    }

    #[test]
    fn job_uses_config_defaults_and_rejects_mixed_rule_sources() {
        let config = AppConfig::default();
        let (job, source) = build_job(
            &config,
            JobOptions {
                output_dir: Some(PathBuf::from("out")),
                preset: Some("career".to_string()),
                ..JobOptions::default()
            },
        )
        .unwrap();
        assert_eq!(job.database, config.database);
        assert_eq!(job.output_dir, PathBuf::from("out"));
        assert_eq!(job.rules, PresetId::Career.builtin_rules());
        assert!(source.contains("职业规划大赛"));

        let mixed = JobOptions {
            preset: Some("career".to_string()),
            rules: Some(PathBuf::from("r.json")),
            ..JobOptions::default()
        };
        assert!(build_job(&config, mixed).is_err());
    }

    #[test]
    fn merge_rejects_generation_options() {
        assert!(parse_command(&args(&["merge", "-o", "out", "-m", "all.docx"])).is_ok());
        for extra in [
            vec!["--database", "d.xlsx"],
            vec!["-t", "t.docx"],
            vec!["--preset", "career"],
            vec!["--rules", "r.json"],
            vec!["--sheet", "Data"],
        ] {
            let mut tokens = args(&["merge"]);
            tokens.extend(args(&extra));
            assert!(parse_command(&tokens).is_err(), "{extra:?}");
        }
    }

    #[test]
    fn json_summary_carries_error_messages() {
        let mut log = Log::capture();
        log.info("progress");
        log.error("Failed to generate 张三: boom");
        let report = GenerateReport {
            total: 2,
            generated: 1,
            failed: 1,
            ..GenerateReport::default()
        };
        let raw = summary_json(true, Some(&report), None, &log).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(value["generate"]["failed"], 1);
        assert!(value["merge"].is_null());
        assert_eq!(value["errors"][0], "Failed to generate 张三: boom");
    }

    #[test]
    fn rule_and_config_commands_persist() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(DATA_DIR_ENV, dir.path().join("data"));
        let mut config = AppConfig::load_or_create().unwrap();
        let mut log = Log::capture();

        let rules_path = dir.path().join("rules.json");
        fs::write(
            &rules_path,
            r#"[{"excel_header": "姓名", "placeholder": "湖小招", "format": "{}"}]"#,
        )
        .unwrap();
        let imported = run_command(
            &mut config,
            &mut log,
            CliCommand::RulesImport(rules_path),
            OutputFormat::Text,
        )
        .unwrap();
        assert!(imported);
        assert_eq!(config.active_preset(), PresetId::Custom);
        let saved = AppConfig::load_or_create().unwrap();
        assert_eq!(saved.active_preset(), PresetId::Custom);
        assert_eq!(saved.custom_rules, vec![ReplacementRule::new("姓名", "湖小招").with_format("{}")]);

        let export_path = dir.path().join("out").join("career.json");
        run_command(
            &mut config,
            &mut log,
            CliCommand::RulesExport {
                path: export_path.clone(),
                preset: Some("career".to_string()),
            },
            OutputFormat::Text,
        )
        .unwrap();
        assert_eq!(rules::load_rules(&export_path).unwrap(), PresetId::Career.builtin_rules());

        run_command(
            &mut config,
            &mut log,
            CliCommand::ConfigSet {
                key: "template".to_string(),
                value: "证书.docx".to_string(),
            },
            OutputFormat::Text,
        )
        .unwrap();
        assert_eq!(AppConfig::load_or_create().unwrap().template, PathBuf::from("证书.docx"));

        let bad = CliCommand::ConfigSet {
            key: "colour".to_string(),
            value: "red".to_string(),
        };
        assert!(run_command(&mut config, &mut log, bad, OutputFormat::Text).is_err());
        std::env::remove_var(DATA_DIR_ENV);
    }
}
