use crate::{
    docx::DocxPackage,
    log::Log,
    merge::{self, absolute, MergeReport},
    render,
    rules::{self, Record, ReplacementRule},
    table,
};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    time::Instant,
};

const INVALID_FILENAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Everything one batch run needs.
#[derive(Debug, Clone)]
pub struct Job {
    pub database: PathBuf,
    pub template: PathBuf,
    pub output_dir: PathBuf,
    pub merge_output: PathBuf,
    pub rules: Vec<ReplacementRule>,
    pub sheet: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct GenerateReport {
    pub total: usize,
    pub generated: usize,
    pub failed: usize,
    pub skipped_rows: usize,
    pub elapsed_secs: f64,
    pub files: Vec<PathBuf>,
}

impl GenerateReport {
    pub fn succeeded(&self) -> bool {
        self.generated > 0
    }
}

pub struct Generator {
    job: Job,
    generated: Vec<PathBuf>,
}

impl Generator {
    pub fn new(mut job: Job) -> Result<Self> {
        rules::validate(&mut job.rules)?;
        fs::create_dir_all(&job.output_dir)
            .with_context(|| format!("create output dir {:?}", job.output_dir))?;
        Ok(Self {
            job,
            generated: Vec::new(),
        })
    }

    /// Files written by the last `generate`, in data order.
    pub fn generated(&self) -> &[PathBuf] {
        &self.generated
    }

    /// Removes earlier `.docx` output. Word lock files (`~$...`) are kept.
    pub fn clean_output_dir(&self, log: &mut Log) -> Result<usize> {
        log.info("Cleaning earlier documents from the output directory...");
        let mut removed = 0;
        for path in merge::list_documents(&self.job.output_dir)? {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            match fs::remove_file(&path) {
                Ok(()) => {
                    removed += 1;
                    log.debug(format!("Deleted {name}"));
                }
                Err(err) => log.warn(format!("Could not delete {name}: {err}")),
            }
        }
        Ok(removed)
    }

    pub fn generate(&mut self, log: &mut Log) -> Result<GenerateReport> {
        let started = Instant::now();
        self.generated.clear();

        let data = table::read_workbook(&self.job.database, self.job.sheet.as_deref(), &self.job.rules)?;
        log.info(format!(
            "Loaded {} (sheet {})",
            self.job.database.display(),
            data.sheet_name
        ));
        for skipped in &data.skipped {
            log.warn(format!(
                "Skipped incomplete row {}: required {} empty",
                skipped.row,
                skipped.empty_fields.join(", ")
            ));
        }
        log.info(format!(
            "Read {} record(s) in {:.2}s",
            data.records.len(),
            started.elapsed().as_secs_f64()
        ));
        if data.records.is_empty() {
            bail!("no usable records in {}", self.job.database.display());
        }

        let template = DocxPackage::open(&self.job.template)?;
        let fields = rules::filename_fields(&self.job.rules);
        let total = data.records.len();
        let mut report = GenerateReport {
            total,
            skipped_rows: data.skipped.len(),
            ..GenerateReport::default()
        };
        let mut used_names = HashSet::new();

        for (index, record) in data.records.iter().enumerate() {
            let name = unique_name(&document_file_name(record, &fields), &mut used_names);
            let path = self.job.output_dir.join(&name);
            let result = render::render_document(&template, &self.job.rules, record)
                .and_then(|(doc, changed)| {
                    doc.save(&path)?;
                    Ok(changed)
                });
            match result {
                Ok(changed) => {
                    if changed == 0 {
                        log.warn(format!("{name}: no placeholders found in template"));
                    }
                    report.generated += 1;
                    self.generated.push(path);
                    log.info(format!("Generated {name} ({}/{total})", index + 1));
                }
                Err(err) => {
                    report.failed += 1;
                    let label = fields
                        .first()
                        .and_then(|field| record.get(field))
                        .map(String::as_str)
                        .unwrap_or("");
                    log.error(format!("Failed to generate {label}: {err:#}"));
                }
            }
        }

        report.elapsed_secs = started.elapsed().as_secs_f64();
        report.files = self.generated.clone();
        log.info(format!(
            "Generation complete: {}/{}",
            report.generated,
            report.generated + report.failed
        ));
        log.info(format!(
            "Elapsed {:.2}s (average {:.2}s per document)",
            report.elapsed_secs,
            report.elapsed_secs / total as f64
        ));
        log.info(format!("Saved to {}", absolute(&self.job.output_dir).display()));
        Ok(report)
    }

    pub fn merge(&self, log: &mut Log) -> Result<MergeReport> {
        merge::merge_generated(
            &self.job.output_dir,
            &self.generated,
            &self.job.merge_output,
            log,
        )
    }

    /// Clean, generate, then merge when at least one document was written.
    pub fn run(&mut self, log: &mut Log) -> Result<(GenerateReport, Option<MergeReport>)> {
        self.clean_output_dir(log)?;
        let report = self.generate(log)?;
        if !report.succeeded() {
            return Ok((report, None));
        }
        log.info("Merging generated documents...");
        let merged = self.merge(log)?;
        Ok((report, Some(merged)))
    }
}

/// Non-empty filename field values joined with `_`, cleaned for the file system.
pub fn document_file_name(record: &Record, fields: &[String]) -> String {
    let parts: Vec<&str> = fields
        .iter()
        .filter_map(|field| record.get(field))
        .map(String::as_str)
        .filter(|value| !value.is_empty())
        .collect();
    if parts.is_empty() {
        return "document.docx".to_string();
    }
    clean_filename(&format!("{}.docx", parts.join("_")))
}

pub fn clean_filename(name: &str) -> String {
    name.replace(INVALID_FILENAME_CHARS, "_")
        .replace(['\r', '\n'], "")
        .trim()
        .to_string()
}

/// Appends `_2`, `_3`, ... before the extension for repeated names.
fn unique_name(name: &str, used: &mut HashSet<String>) -> String {
    let key = |value: &str| value.to_lowercase();
    if used.insert(key(name)) {
        return name.to_string();
    }
    let (stem, ext) = name.rsplit_once('.').unwrap_or((name, ""));
    let mut n = 2;
    loop {
        let candidate = if ext.is_empty() {
            format!("{stem}_{n}")
        } else {
            format!("{stem}_{n}.{ext}")
        };
        if used.insert(key(&candidate)) {
            return candidate;
        }
        n += 1;
    }
}

pub fn ensure_inputs(job: &Job) -> Result<()> {
    ensure_file(&job.database, "Workbook")?;
    ensure_file(&job.template, "Template")
}

fn ensure_file(path: &Path, label: &str) -> Result<()> {
    if !path.is_file() {
        bail!("{label} not found: {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docx::{fixtures, Relationship, DOCUMENT_PART, REL_TYPE_HEADER};
    use crate::log::LogLevel;

    fn record(pairs: &[(&str, &str)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn file_names_join_non_empty_fields() {
        let fields = vec!["姓名".to_string(), "学号".to_string()];
        let row = record(&[("姓名", "张三"), ("学号", "1424")]);
        assert_eq!(document_file_name(&row, &fields), "张三_1424.docx");
        let row = record(&[("姓名", "张三"), ("学号", "")]);
        assert_eq!(document_file_name(&row, &fields), "张三.docx");
        let row = record(&[("姓名", ""), ("学号", "")]);
        assert_eq!(document_file_name(&row, &fields), "document.docx");
    }

    #[test]
    fn file_names_replace_reserved_characters() {
        assert_eq!(clean_filename(" a/b\\c:d*e?f\"g<h>i|j.docx "), "a_b_c_d_e_f_g_h_i_j.docx");
    }

    #[test]
    fn repeated_names_get_suffixes() {
        let mut used = HashSet::new();
        assert_eq!(unique_name("张三.docx", &mut used), "张三.docx");
        assert_eq!(unique_name("张三.docx", &mut used), "张三_2.docx");
        assert_eq!(unique_name("张三.docx", &mut used), "张三_3.docx");
    }

    fn write_workbook(path: &Path, rows: &[&[&str]]) {
        let mut book = umya_spreadsheet::new_file();
        let sheet = book.get_sheet_by_name_mut("Sheet1").unwrap();
        for (r, row) in rows.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                if !value.is_empty() {
                    sheet
                        .get_cell_mut((c as u32 + 1, r as u32 + 1))
                        .set_value(*value);
                }
            }
        }
        umya_spreadsheet::writer::xlsx::write(&book, path).unwrap();
    }

    fn job(dir: &Path) -> Job {
        let template = dir.join("template.docx");
        let body = "<w:p><w:r><w:t>兹证明 湖小招 完成（学时）</w:t></w:r></w:p>";
        let document = fixtures::document_xml(body, (16838, 11906), 720);
        fixtures::write_package(&template, &fixtures::package(&document, &[]));
        Job {
            database: dir.join("data.xlsx"),
            template,
            output_dir: dir.join("out"),
            merge_output: dir.join("merged.docx"),
            rules: vec![
                ReplacementRule::new("姓名", "湖小招").required().in_filename(),
                ReplacementRule::new("学时", "（学时）").with_format("（{0}学时）"),
            ],
            sheet: None,
        }
    }

    #[test]
    fn run_generates_in_data_order_and_merges() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path());
        write_workbook(
            &job.database,
            &[
                &["姓名", "学时"],
                &["张三", "32"],
                &["", "16"],
                &["李四", ""],
                &["Ann/Lee", "8"],
            ],
        );
        fs::create_dir_all(&job.output_dir).unwrap();
        fs::write(job.output_dir.join("old.docx"), b"stale").unwrap();
        fs::write(job.output_dir.join("~$lock.docx"), b"lock").unwrap();

        let mut generator = Generator::new(job.clone()).unwrap();
        let mut log = Log::capture();
        let (report, merged) = generator.run(&mut log).unwrap();

        assert_eq!(report.generated, 3);
        assert_eq!(report.skipped_rows, 1);
        assert!(!job.output_dir.join("old.docx").exists());
        assert!(job.output_dir.join("~$lock.docx").exists());
        let names: Vec<String> = generator
            .generated()
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["张三.docx", "李四.docx", "Ann_Lee.docx"]);

        let first = DocxPackage::open(&generator.generated()[0]).unwrap();
        assert!(first
            .part_str(DOCUMENT_PART)
            .unwrap()
            .contains("兹证明 张三 完成（32学时）"));
        let second = DocxPackage::open(&generator.generated()[1]).unwrap();
        assert!(second
            .part_str(DOCUMENT_PART)
            .unwrap()
            .contains("兹证明 李四 完成</w:t>"));

        let merged = merged.unwrap();
        assert_eq!(merged.merged, 3);
        let xml = DocxPackage::open(&job.merge_output)
            .unwrap()
            .part_str(DOCUMENT_PART)
            .unwrap();
        let order: Vec<usize> = ["张三", "李四", "Ann/Lee"]
            .iter()
            .map(|name| xml.find(name).unwrap())
            .collect();
        assert!(order[0] < order[1] && order[1] < order[2]);
        assert_eq!(log.count(LogLevel::Warn), 1);
    }

    #[test]
    fn merged_document_keeps_each_record_header() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path());
        let document = format!(
            "<w:document xmlns:w=\"{}\" xmlns:r=\"{}\"><w:body>\
             <w:p><w:r><w:t>湖小招</w:t></w:r></w:p><w:sectPr>\
             <w:headerReference w:type=\"default\" r:id=\"rId9\"/>\
             <w:pgSz w:w=\"16838\" w:h=\"11906\"/></w:sectPr></w:body></w:document>",
            fixtures::W_NS,
            fixtures::R_NS
        );
        let header = format!(
            "<w:hdr xmlns:w=\"{}\"><w:p><w:r><w:t>湖小招</w:t></w:r></w:p></w:hdr>",
            fixtures::W_NS
        );
        let mut template = fixtures::package(&document, &[("word/header1.xml", header.into_bytes())]);
        template.set_relationships(&[Relationship {
            id: "rId9".to_string(),
            rel_type: REL_TYPE_HEADER.to_string(),
            target: "header1.xml".to_string(),
            external: false,
        }]);
        fixtures::write_package(&job.template, &template);
        write_workbook(&job.database, &[&["姓名", "学时"], &["张三", "1"], &["李四", "2"]]);

        let mut generator = Generator::new(job.clone()).unwrap();
        let mut log = Log::capture();
        let (_, merged) = generator.run(&mut log).unwrap();
        assert_eq!(merged.unwrap().merged, 2);

        let merged = DocxPackage::open(&job.merge_output).unwrap();
        let xml = merged.part_str(DOCUMENT_PART).unwrap();
        assert_eq!(xml.matches("<w:headerReference").count(), 2);
        let headers: Vec<String> = merged
            .header_footer_parts()
            .unwrap()
            .iter()
            .map(|part| merged.part_str(part).unwrap())
            .collect();
        assert_eq!(headers.len(), 2);
        assert!(headers[0].contains("张三"));
        assert!(headers[1].contains("李四"));
    }

    #[test]
    fn missing_headers_fail_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path());
        write_workbook(&job.database, &[&["姓名"], &["张三"]]);
        let mut generator = Generator::new(job).unwrap();
        let mut log = Log::capture();
        let err = generator.generate(&mut log).unwrap_err();
        assert!(format!("{err:#}").contains("学时"));
    }

    #[test]
    fn no_records_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path());
        write_workbook(&job.database, &[&["姓名", "学时"], &["", "3"]]);
        let mut generator = Generator::new(job).unwrap();
        let mut log = Log::capture();
        assert!(generator.generate(&mut log).is_err());
        assert!(generator.generated().is_empty());
    }

    #[test]
    fn missing_inputs_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path());
        assert!(ensure_inputs(&job).is_err());
        write_workbook(&job.database, &[&["姓名"]]);
        assert!(ensure_inputs(&job).is_ok());
        job.template = dir.path().join("nope.docx");
        assert!(ensure_inputs(&job).unwrap_err().to_string().contains("Template"));
    }
}
