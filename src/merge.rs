use crate::{
    docx::{
        attr_value, resolve_target, ContentTypes, DocxPackage, Relationship, DOCUMENT_PART,
        DOCUMENT_RELS, STYLES_PART,
    },
    log::Log,
};
use anyhow::{anyhow, bail, Context, Result};
use quick_xml::{
    events::{BytesStart, Event},
    Reader, Writer,
};
use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    time::Instant,
};
use walkdir::WalkDir;

const PAGE_BREAK: &str = "<w:p><w:r><w:br w:type=\"page\"/></w:r></w:p>";

/// Page size and margins of a section, in twentieths of a point as stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSetup {
    pub width: Option<String>,
    pub height: Option<String>,
    pub top: Option<String>,
    pub right: Option<String>,
    pub bottom: Option<String>,
    pub left: Option<String>,
}

impl PageSetup {
    /// Reads the first section of a document part.
    pub fn from_document(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        let mut setup = PageSetup::default();
        let mut in_sect = false;
        loop {
            match reader.read_event().context("parse document")? {
                Event::Start(e) if e.name().as_ref() == b"w:sectPr" => in_sect = true,
                Event::End(e) if e.name().as_ref() == b"w:sectPr" => break,
                Event::Start(e) | Event::Empty(e) if in_sect => match e.name().as_ref() {
                    b"w:pgSz" => {
                        setup.width = attr_value(&e, b"w:w");
                        setup.height = attr_value(&e, b"w:h");
                    }
                    b"w:pgMar" => {
                        setup.top = attr_value(&e, b"w:top");
                        setup.right = attr_value(&e, b"w:right");
                        setup.bottom = attr_value(&e, b"w:bottom");
                        setup.left = attr_value(&e, b"w:left");
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(setup)
    }

    fn overrides_for(&self, element: &[u8]) -> Vec<(&'static str, &str)> {
        let pairs: Vec<(&'static str, &Option<String>)> = match element {
            b"w:pgSz" => vec![("w:w", &self.width), ("w:h", &self.height)],
            b"w:pgMar" => vec![
                ("w:top", &self.top),
                ("w:right", &self.right),
                ("w:bottom", &self.bottom),
                ("w:left", &self.left),
            ],
            _ => Vec::new(),
        };
        pairs
            .into_iter()
            .filter_map(|(key, value)| value.as_deref().map(|value| (key, value)))
            .collect()
    }
}

/// `w:body` split into its top-level children.
#[derive(Debug)]
struct BodySplit {
    head: String,
    children: Vec<String>,
    sect_pr: Option<String>,
    tail: String,
}

fn split_body(xml: &str) -> Result<BodySplit> {
    let mut reader = Reader::from_str(xml);
    let mut depth = 0usize;
    let mut body_depth: Option<usize> = None;
    let mut head_end = None;
    let mut tail_start = None;
    let mut child: Option<(usize, bool)> = None;
    let mut children: Vec<(String, bool)> = Vec::new();
    let mut last = 0usize;

    loop {
        let event = reader.read_event().context("parse document body")?;
        let pos = reader.buffer_position();
        match event {
            Event::Start(e) => {
                depth += 1;
                if body_depth.is_none() && e.name().as_ref() == b"w:body" {
                    body_depth = Some(depth);
                    head_end = Some(pos);
                } else if tail_start.is_none() && body_depth == Some(depth - 1) {
                    child = Some((last, e.name().as_ref() == b"w:sectPr"));
                }
            }
            Event::Empty(e) => {
                if tail_start.is_none() && body_depth == Some(depth) {
                    children.push((xml[last..pos].to_string(), e.name().as_ref() == b"w:sectPr"));
                }
            }
            Event::End(_) => {
                if tail_start.is_none() && body_depth == Some(depth) {
                    tail_start = Some(last);
                } else if tail_start.is_none() && body_depth == Some(depth - 1) {
                    if let Some((start, is_sect)) = child.take() {
                        children.push((xml[start..pos].to_string(), is_sect));
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
        last = pos;
    }

    let (Some(head_end), Some(tail_start)) = (head_end, tail_start) else {
        bail!("document has no w:body");
    };
    let sect_pr = if matches!(children.last(), Some((_, true))) {
        children.pop().map(|(xml, _)| xml)
    } else {
        None
    };
    Ok(BodySplit {
        head: xml[..head_end].to_string(),
        children: children.into_iter().map(|(xml, _)| xml).collect(),
        sect_pr,
        tail: xml[tail_start..].to_string(),
    })
}

/// Paragraph that ends the current section with `sect_pr`.
fn section_break(sect_pr: &str) -> String {
    format!("<w:p><w:pPr>{sect_pr}</w:pPr></w:p>")
}

fn max_doc_pr_id(xml: &str) -> Result<u64> {
    let mut reader = Reader::from_str(xml);
    let mut max = 0;
    loop {
        match reader.read_event().context("parse document")? {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"wp:docPr" => {
                if let Some(id) = attr_value(&e, b"id").and_then(|id| id.parse::<u64>().ok()) {
                    max = max.max(id);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(max)
}

/// Top-level `w:style` elements of a styles part, keyed by style id.
fn style_elements(xml: &str) -> Result<Vec<(String, String)>> {
    let mut reader = Reader::from_str(xml);
    let mut depth = 0usize;
    let mut current: Option<(usize, String)> = None;
    let mut styles = Vec::new();
    let mut last = 0usize;
    loop {
        let event = reader.read_event().context("parse styles")?;
        let pos = reader.buffer_position();
        match event {
            Event::Start(e) => {
                depth += 1;
                if depth == 2 && e.name().as_ref() == b"w:style" {
                    if let Some(id) = attr_value(&e, b"w:styleId") {
                        current = Some((last, id));
                    }
                }
            }
            Event::Empty(e) => {
                if depth == 1 && e.name().as_ref() == b"w:style" {
                    if let Some(id) = attr_value(&e, b"w:styleId") {
                        styles.push((id, xml[last..pos].to_string()));
                    }
                }
            }
            Event::End(_) => {
                if depth == 2 {
                    if let Some((start, id)) = current.take() {
                        styles.push((id, xml[start..pos].to_string()));
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
        last = pos;
    }
    Ok(styles)
}

fn next_rel_number(rels: &[Relationship]) -> u32 {
    rels.iter()
        .filter_map(|rel| rel.id.strip_prefix("rId")?.parse::<u32>().ok())
        .max()
        .unwrap_or(0)
        + 1
}

fn relative_target(part: &str) -> String {
    match part.strip_prefix("word/") {
        Some(inner) => inner.to_string(),
        None => format!("/{part}"),
    }
}

/// Concatenates Word documents onto a base document.
pub struct Composer {
    package: DocxPackage,
    head: String,
    body: Vec<String>,
    sect_pr: Option<String>,
    tail: String,
    page: PageSetup,
    rels: Vec<Relationship>,
    content_types: ContentTypes,
    hashes: HashMap<String, blake3::Hash>,
    style_ids: HashSet<String>,
    extra_styles: Vec<String>,
    next_rel: u32,
    next_doc_pr: u64,
}

impl Composer {
    pub fn new(base: DocxPackage) -> Result<Self> {
        let xml = base.part_str(DOCUMENT_PART)?;
        let split = split_body(&xml)?;
        let page = PageSetup::from_document(&xml)?;
        let rels = base.relationships()?;
        let content_types = base.content_types()?;
        let mut hashes = HashMap::new();
        for rel in rels.iter().filter(|rel| !rel.external) {
            let part = resolve_target(&rel.target);
            if let Some(data) = base.part(&part) {
                hashes.insert(part, blake3::hash(data));
            }
        }
        let style_ids = match base.part(STYLES_PART) {
            Some(data) => style_elements(&String::from_utf8_lossy(data))?
                .into_iter()
                .map(|(id, _)| id)
                .collect(),
            None => HashSet::new(),
        };
        Ok(Self {
            next_rel: next_rel_number(&rels),
            next_doc_pr: max_doc_pr_id(&xml)? + 1,
            head: split.head,
            body: split.children,
            sect_pr: split.sect_pr,
            tail: split.tail,
            page,
            rels,
            content_types,
            hashes,
            style_ids,
            extra_styles: Vec::new(),
            package: base,
        })
    }

    /// Appends `sub` as a new section. The section so far is closed with a
    /// paragraph-level break so each document keeps its own headers and
    /// footers. Nothing changes when this fails.
    pub fn append(&mut self, sub: &DocxPackage) -> Result<()> {
        let xml = sub.part_str(DOCUMENT_PART)?;
        let split = split_body(&xml)?;
        let sub_types = sub.content_types().ok();
        let mut stage = Stage {
            sub,
            sub_rels: sub
                .relationships()?
                .into_iter()
                .map(|rel| (rel.id.clone(), rel))
                .collect(),
            sub_types: sub_types.as_ref(),
            base: &self.package,
            base_hashes: &self.hashes,
            rels: self.rels.clone(),
            content_types: self.content_types.clone(),
            new_parts: Vec::new(),
            new_hashes: HashMap::new(),
            id_map: HashMap::new(),
            next_rel: self.next_rel,
            next_doc_pr: self.next_doc_pr,
        };

        let mut fragments = Vec::with_capacity(split.children.len() + 1);
        match &self.sect_pr {
            Some(current) => fragments.push(section_break(current)),
            None => fragments.push(PAGE_BREAK.to_string()),
        }
        for child in &split.children {
            fragments.push(stage.rewrite(child, &self.page)?);
        }
        let sub_sect_pr = match &split.sect_pr {
            Some(sect_pr) => Some(stage.rewrite(sect_pr, &self.page)?),
            None => None,
        };

        let mut new_styles = Vec::new();
        let mut new_style_ids = Vec::new();
        if self.package.has_part(STYLES_PART) {
            if let Some(data) = sub.part(STYLES_PART) {
                for (id, element) in style_elements(&String::from_utf8_lossy(data))? {
                    if !self.style_ids.contains(&id) && !new_style_ids.contains(&id) {
                        new_style_ids.push(id);
                        new_styles.push(element);
                    }
                }
            }
        }

        let Stage {
            rels,
            content_types,
            new_parts,
            new_hashes,
            next_rel,
            next_doc_pr,
            ..
        } = stage;
        self.body.extend(fragments);
        if let Some(sect_pr) = sub_sect_pr {
            self.sect_pr = Some(sect_pr);
        }
        self.rels = rels;
        self.content_types = content_types;
        for (name, data) in new_parts {
            self.package.set_part(&name, data);
        }
        self.hashes.extend(new_hashes);
        self.next_rel = next_rel;
        self.next_doc_pr = next_doc_pr;
        self.style_ids.extend(new_style_ids);
        self.extra_styles.extend(new_styles);
        Ok(())
    }

    pub fn finish(mut self) -> Result<DocxPackage> {
        let mut xml = String::with_capacity(
            self.head.len() + self.tail.len() + self.body.iter().map(String::len).sum::<usize>(),
        );
        xml.push_str(&self.head);
        for fragment in &self.body {
            xml.push_str(fragment);
        }
        if let Some(sect_pr) = &self.sect_pr {
            xml.push_str(sect_pr);
        }
        xml.push_str(&self.tail);
        self.package.set_part(DOCUMENT_PART, xml.into_bytes());

        if !self.rels.is_empty() || self.package.has_part(DOCUMENT_RELS) {
            self.package.set_relationships(&self.rels);
        }
        self.package.set_content_types(&self.content_types);

        if !self.extra_styles.is_empty() {
            let mut styles = self.package.part_str(STYLES_PART)?;
            let Some(at) = styles.rfind("</w:styles>") else {
                bail!("styles part has no closing tag");
            };
            styles.insert_str(at, &self.extra_styles.concat());
            self.package.set_part(STYLES_PART, styles.into_bytes());
        }
        Ok(self.package)
    }

    pub fn save(self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("create merge output dir")?;
        }
        self.finish()?.save(path)
    }
}

/// Per-append working copy of the composer's mutable state.
struct Stage<'a> {
    sub: &'a DocxPackage,
    sub_rels: HashMap<String, Relationship>,
    sub_types: Option<&'a ContentTypes>,
    base: &'a DocxPackage,
    base_hashes: &'a HashMap<String, blake3::Hash>,
    rels: Vec<Relationship>,
    content_types: ContentTypes,
    new_parts: Vec<(String, Vec<u8>)>,
    new_hashes: HashMap<String, blake3::Hash>,
    id_map: HashMap<String, String>,
    next_rel: u32,
    next_doc_pr: u64,
}

impl Stage<'_> {
    fn rewrite(&mut self, fragment: &str, page: &PageSetup) -> Result<String> {
        let mut reader = Reader::from_str(fragment);
        let mut writer = Writer::new(Vec::with_capacity(fragment.len()));
        loop {
            let event = reader.read_event().context("parse appended content")?;
            match event {
                Event::Eof => break,
                Event::Start(e) => {
                    let event = match self.rewrite_start(&e, page)? {
                        Some(start) => Event::Start(start),
                        None => Event::Start(e),
                    };
                    writer.write_event(event).context("write appended content")?;
                }
                Event::Empty(e) => {
                    let event = match self.rewrite_start(&e, page)? {
                        Some(start) => Event::Empty(start),
                        None => Event::Empty(e),
                    };
                    writer.write_event(event).context("write appended content")?;
                }
                other => writer
                    .write_event(other)
                    .context("write appended content")?,
            }
        }
        String::from_utf8(writer.into_inner()).context("encode appended content")
    }

    /// New start tag when an attribute needs remapping.
    fn rewrite_start(
        &mut self,
        e: &BytesStart<'_>,
        page: &PageSetup,
    ) -> Result<Option<BytesStart<'static>>> {
        let name = e.name();
        let mut forced = page.overrides_for(name.as_ref());
        let is_doc_pr = name.as_ref() == b"wp:docPr";
        let mut attrs: Vec<(String, String)> = Vec::new();
        let mut changed = false;

        for attr in e.attributes() {
            let attr = attr.map_err(|err| anyhow!("bad attribute: {err}"))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|err| anyhow!("bad attribute value: {err}"))?
                .into_owned();
            let new_value = if let Some(index) = forced.iter().position(|(k, _)| *k == key) {
                Some(forced.remove(index).1.to_string())
            } else if is_doc_pr && key == "id" {
                let id = self.next_doc_pr;
                self.next_doc_pr += 1;
                Some(id.to_string())
            } else if key.starts_with("r:") {
                self.map_rel(&value)?
            } else {
                None
            };
            match new_value {
                Some(new_value) if new_value != value => {
                    changed = true;
                    attrs.push((key, new_value));
                }
                _ => attrs.push((key, value)),
            }
        }
        for (key, value) in forced {
            changed = true;
            attrs.push((key.to_string(), value.to_string()));
        }

        if !changed {
            return Ok(None);
        }
        let mut start = BytesStart::new(String::from_utf8_lossy(name.as_ref()).into_owned());
        for (key, value) in &attrs {
            start.push_attribute((key.as_str(), value.as_str()));
        }
        Ok(Some(start.into_owned()))
    }

    fn has_part(&self, name: &str) -> bool {
        self.base.has_part(name) || self.new_parts.iter().any(|(part, _)| part == name)
    }

    fn hash_of(&self, part: &str) -> Option<blake3::Hash> {
        self.base_hashes
            .get(part)
            .or_else(|| self.new_hashes.get(part))
            .copied()
    }

    fn alloc_rel_id(&mut self) -> String {
        loop {
            let id = format!("rId{}", self.next_rel);
            self.next_rel += 1;
            if !self.rels.iter().any(|rel| rel.id == id) {
                return id;
            }
        }
    }

    fn unique_part_name(&self, part: &str) -> String {
        if !self.has_part(part) {
            return part.to_string();
        }
        let (stem, ext) = match part.rsplit_once('.') {
            Some((stem, ext)) if !ext.contains('/') => (stem, Some(ext)),
            _ => (part, None),
        };
        let mut n = 2;
        loop {
            let candidate = match ext {
                Some(ext) => format!("{stem}_{n}.{ext}"),
                None => format!("{stem}_{n}"),
            };
            if !self.has_part(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Id of the base relationship equivalent to the sub document's `id`.
    fn map_rel(&mut self, id: &str) -> Result<Option<String>> {
        if let Some(mapped) = self.id_map.get(id) {
            return Ok(Some(mapped.clone()));
        }
        let Some(rel) = self.sub_rels.get(id).cloned() else {
            return Ok(None);
        };

        let new_id = if rel.external {
            let existing = self
                .rels
                .iter()
                .find(|candidate| {
                    candidate.external
                        && candidate.rel_type == rel.rel_type
                        && candidate.target == rel.target
                })
                .map(|candidate| candidate.id.clone());
            match existing {
                Some(existing) => existing,
                None => {
                    let new_id = self.alloc_rel_id();
                    self.rels.push(Relationship {
                        id: new_id.clone(),
                        ..rel.clone()
                    });
                    new_id
                }
            }
        } else {
            let part = resolve_target(&rel.target);
            let sub = self.sub;
            let data = sub
                .part(&part)
                .ok_or_else(|| anyhow!("relationship {id} points at missing part {part}"))?;
            let hash = blake3::hash(data);
            let existing = self
                .rels
                .iter()
                .find(|candidate| {
                    !candidate.external
                        && candidate.rel_type == rel.rel_type
                        && self.hash_of(&resolve_target(&candidate.target)) == Some(hash)
                })
                .map(|candidate| candidate.id.clone());
            match existing {
                Some(existing) => existing,
                None => {
                    let name = self.unique_part_name(&part);
                    self.register_content_type(&part, &name);
                    self.new_parts.push((name.clone(), data.to_vec()));
                    self.new_hashes.insert(name.clone(), hash);
                    let new_id = self.alloc_rel_id();
                    self.rels.push(Relationship {
                        id: new_id.clone(),
                        rel_type: rel.rel_type.clone(),
                        target: relative_target(&name),
                        external: false,
                    });
                    new_id
                }
            }
        };
        self.id_map.insert(id.to_string(), new_id.clone());
        Ok(Some(new_id))
    }

    fn register_content_type(&mut self, source: &str, name: &str) {
        let Some(types) = self.sub_types else {
            return;
        };
        let source_name = format!("/{source}");
        if let Some((_, ct)) = types
            .overrides
            .iter()
            .find(|(part, _)| part.eq_ignore_ascii_case(&source_name))
        {
            self.content_types.ensure_override(name, ct);
            return;
        }
        if let (Some(ct), Some((_, ext))) = (types.lookup(source), name.rsplit_once('.')) {
            self.content_types.ensure_default(ext, ct);
        }
    }
}

#[derive(Debug, Default)]
pub struct MergeReport {
    pub merged: usize,
    pub failed: usize,
    pub output: PathBuf,
}

/// Merges `paths` into `output`, the first one supplying page setup.
pub fn merge_files(paths: &[PathBuf], output: &Path, log: &mut Log) -> Result<MergeReport> {
    let Some((first, rest)) = paths.split_first() else {
        bail!("no documents to merge");
    };
    let started = Instant::now();
    let total = paths.len();
    let base = DocxPackage::open(first)?;
    let mut composer = Composer::new(base).with_context(|| format!("prepare {first:?}"))?;
    log.info(format!("Merging {total} document(s)..."));

    let mut report = MergeReport {
        merged: 1,
        ..MergeReport::default()
    };
    for (index, path) in rest.iter().enumerate() {
        let result = DocxPackage::open(path).and_then(|sub| composer.append(&sub));
        match result {
            Ok(()) => {
                report.merged += 1;
                log.debug(format!("Merged {}/{total}", index + 2));
            }
            Err(err) => {
                report.failed += 1;
                log.error(format!("Merge of {} failed: {err:#}", display_name(path)));
            }
        }
    }

    composer.save(output)?;
    report.output = output.to_path_buf();
    log.info(format!(
        "Merge complete: {}/{total} in {:.2}s",
        report.merged,
        started.elapsed().as_secs_f64()
    ));
    log.info(format!("Saved to {}", absolute(output).display()));
    Ok(report)
}

/// Merges generated files in generation order, or the directory's documents
/// sorted by path when no generation record exists.
pub fn merge_generated(
    output_dir: &Path,
    generated: &[PathBuf],
    output: &Path,
    log: &mut Log,
) -> Result<MergeReport> {
    let mut paths = generated.to_vec();
    if paths.is_empty() {
        log.warn("No generation record; merging documents in file name order");
        paths = list_documents(output_dir)?;
        let merged_output = absolute(output);
        paths.retain(|path| absolute(path) != merged_output);
    }
    if paths.is_empty() {
        bail!("no .docx files found in {}", output_dir.display());
    }
    merge_files(&paths, output, log)
}

/// `.docx` files directly inside `dir`, excluding Word lock files, sorted.
pub fn list_documents(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("scan {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if is_document_name(&name) {
            paths.push(entry.path().to_path_buf());
        }
    }
    paths.sort();
    Ok(paths)
}

pub fn is_document_name(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".docx") && !name.starts_with("~$")
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

pub(crate) fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
