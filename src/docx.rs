use anyhow::{anyhow, Context, Result};
use quick_xml::{
    events::{BytesStart, Event},
    Reader,
};
use std::{
    fs,
    io::{Cursor, Read, Write},
    path::Path,
};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

pub const DOCUMENT_PART: &str = "word/document.xml";
pub const DOCUMENT_RELS: &str = "word/_rels/document.xml.rels";
pub const STYLES_PART: &str = "word/styles.xml";
pub const CONTENT_TYPES: &str = "[Content_Types].xml";

pub const REL_NS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";
pub const REL_TYPE_HEADER: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/header";
pub const REL_TYPE_FOOTER: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/footer";

/// A DOCX zip package held in memory, entries kept in their original order.
#[derive(Debug, Clone, Default)]
pub struct DocxPackage {
    entries: Vec<(String, Vec<u8>)>,
}

impl DocxPackage {
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("read docx {path:?}"))?;
        Self::from_bytes(&bytes).with_context(|| format!("parse docx {path:?}"))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).context("read zip")?;
        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut file = archive.by_index(i).context("zip entry")?;
            if file.is_dir() {
                continue;
            }
            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data)
                .with_context(|| format!("read zip entry {}", file.name()))?;
            entries.push((file.name().to_string(), data));
        }
        let package = Self { entries };
        if package.part(DOCUMENT_PART).is_none() {
            return Err(anyhow!("not a Word document: {DOCUMENT_PART} missing"));
        }
        Ok(package)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for (name, data) in &self.entries {
            writer
                .start_file(name.as_str(), options)
                .with_context(|| format!("start zip entry {name}"))?;
            writer
                .write_all(data)
                .with_context(|| format!("write zip entry {name}"))?;
        }
        let cursor = writer.finish().context("finish zip")?;
        Ok(cursor.into_inner())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        fs::write(path, bytes).with_context(|| format!("write docx {path:?}"))?;
        Ok(())
    }

    pub fn part(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, data)| data.as_slice())
    }

    pub fn part_str(&self, name: &str) -> Result<String> {
        let data = self
            .part(name)
            .ok_or_else(|| anyhow!("missing part {name}"))?;
        String::from_utf8(data.to_vec()).with_context(|| format!("decode {name}"))
    }

    pub fn has_part(&self, name: &str) -> bool {
        self.part(name).is_some()
    }

    /// Replaces an existing part in place or appends a new one.
    pub fn set_part(&mut self, name: &str, data: Vec<u8>) {
        if let Some(entry) = self.entries.iter_mut().find(|(entry, _)| entry == name) {
            entry.1 = data;
        } else {
            self.entries.push((name.to_string(), data));
        }
    }

    pub fn part_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn relationships(&self) -> Result<Vec<Relationship>> {
        match self.part(DOCUMENT_RELS) {
            Some(data) => parse_relationships(data),
            None => Ok(Vec::new()),
        }
    }

    pub fn set_relationships(&mut self, rels: &[Relationship]) {
        self.set_part(DOCUMENT_RELS, write_relationships(rels).into_bytes());
    }

    /// Header and footer parts referenced by the main document.
    pub fn header_footer_parts(&self) -> Result<Vec<String>> {
        Ok(self
            .relationships()?
            .into_iter()
            .filter(|rel| !rel.external)
            .filter(|rel| rel.rel_type == REL_TYPE_HEADER || rel.rel_type == REL_TYPE_FOOTER)
            .map(|rel| resolve_target(&rel.target))
            .collect())
    }

    pub fn content_types(&self) -> Result<ContentTypes> {
        let data = self
            .part(CONTENT_TYPES)
            .ok_or_else(|| anyhow!("missing part {CONTENT_TYPES}"))?;
        ContentTypes::parse(data)
    }

    pub fn set_content_types(&mut self, types: &ContentTypes) {
        self.set_part(CONTENT_TYPES, types.to_xml().into_bytes());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub id: String,
    pub rel_type: String,
    pub target: String,
    pub external: bool,
}

pub fn parse_relationships(data: &[u8]) -> Result<Vec<Relationship>> {
    let mut reader = Reader::from_reader(data);
    let mut buf = Vec::new();
    let mut rels = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"Relationship" {
                    if let (Some(id), Some(rel_type), Some(target)) = (
                        attr_value(&e, b"Id"),
                        attr_value(&e, b"Type"),
                        attr_value(&e, b"Target"),
                    ) {
                        let external = attr_value(&e, b"TargetMode")
                            .map(|mode| mode.eq_ignore_ascii_case("External"))
                            .unwrap_or(false);
                        rels.push(Relationship {
                            id,
                            rel_type,
                            target,
                            external,
                        });
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(anyhow!("parse relationships: {err}")),
            _ => {}
        }
        buf.clear();
    }
    Ok(rels)
}

pub fn write_relationships(rels: &[Relationship]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n");
    xml.push_str(&format!("<Relationships xmlns=\"{REL_NS}\">"));
    for rel in rels {
        xml.push_str(&format!(
            "<Relationship Id=\"{}\" Type=\"{}\" Target=\"{}\"",
            escape_attr(&rel.id),
            escape_attr(&rel.rel_type),
            escape_attr(&rel.target)
        ));
        if rel.external {
            xml.push_str(" TargetMode=\"External\"");
        }
        xml.push_str("/>");
    }
    xml.push_str("</Relationships>");
    xml
}

/// Part name for a relationship target relative to `word/`.
pub fn resolve_target(target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }
    let mut parts: Vec<&str> = vec!["word"];
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentTypes {
    pub defaults: Vec<(String, String)>,
    pub overrides: Vec<(String, String)>,
}

impl ContentTypes {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::from_reader(data);
        let mut buf = Vec::new();
        let mut types = ContentTypes::default();
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                    b"Default" => {
                        if let (Some(ext), Some(ct)) =
                            (attr_value(&e, b"Extension"), attr_value(&e, b"ContentType"))
                        {
                            types.defaults.push((ext, ct));
                        }
                    }
                    b"Override" => {
                        if let (Some(part), Some(ct)) =
                            (attr_value(&e, b"PartName"), attr_value(&e, b"ContentType"))
                        {
                            types.overrides.push((part, ct));
                        }
                    }
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Err(err) => return Err(anyhow!("parse content types: {err}")),
                _ => {}
            }
            buf.clear();
        }
        Ok(types)
    }

    pub fn lookup(&self, part: &str) -> Option<&str> {
        let part_name = format!("/{}", part.trim_start_matches('/'));
        if let Some((_, ct)) = self
            .overrides
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&part_name))
        {
            return Some(ct);
        }
        let ext = part.rsplit_once('.').map(|(_, ext)| ext)?;
        self.defaults
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(ext))
            .map(|(_, ct)| ct.as_str())
    }

    pub fn ensure_default(&mut self, ext: &str, content_type: &str) {
        if !self
            .defaults
            .iter()
            .any(|(candidate, _)| candidate.eq_ignore_ascii_case(ext))
        {
            self.defaults
                .push((ext.to_string(), content_type.to_string()));
        }
    }

    pub fn ensure_override(&mut self, part: &str, content_type: &str) {
        let part_name = format!("/{}", part.trim_start_matches('/'));
        if !self
            .overrides
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case(&part_name))
        {
            self.overrides.push((part_name, content_type.to_string()));
        }
    }

    pub fn to_xml(&self) -> String {
        let mut xml =
            String::from("<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n");
        xml.push_str(
            "<Types xmlns=\"http://schemas.openxmlformats.org/package/2006/content-types\">",
        );
        for (ext, ct) in &self.defaults {
            xml.push_str(&format!(
                "<Default Extension=\"{}\" ContentType=\"{}\"/>",
                escape_attr(ext),
                escape_attr(ct)
            ));
        }
        for (part, ct) in &self.overrides {
            xml.push_str(&format!(
                "<Override PartName=\"{}\" ContentType=\"{}\"/>",
                escape_attr(part),
                escape_attr(ct)
            ));
        }
        xml.push_str("</Types>");
        xml
    }
}

pub fn attr_value(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == key {
            if let Ok(value) = attr.unescape_value() {
                return Some(value.to_string());
            }
        }
    }
    None
}

pub fn escape_attr(value: &str) -> String {
    quick_xml::escape::escape(value).into_owned()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub const W_NS: &str = "http://schemas.openxmlformats.org/wordprocessingml/2006/main";
    pub const R_NS: &str =
        "http://schemas.openxmlformats.org/officeDocument/2006/relationships";

    /// Minimal Word document with `body` inside `w:body` before the section.
    pub fn document_xml(body: &str, page: (u32, u32), margin: u32) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
             <w:document xmlns:w=\"{W_NS}\" xmlns:r=\"{R_NS}\" \
             xmlns:wp=\"http://schemas.openxmlformats.org/drawingml/2006/wordprocessingDrawing\">\
             <w:body>{body}<w:sectPr><w:pgSz w:w=\"{}\" w:h=\"{}\"/>\
             <w:pgMar w:top=\"{margin}\" w:right=\"{margin}\" w:bottom=\"{margin}\" \
             w:left=\"{margin}\" w:header=\"851\" w:footer=\"992\" w:gutter=\"0\"/>\
             </w:sectPr></w:body></w:document>",
            page.0, page.1
        )
    }

    pub fn content_types_xml() -> String {
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
         <Types xmlns=\"http://schemas.openxmlformats.org/package/2006/content-types\">\
         <Default Extension=\"rels\" ContentType=\"application/vnd.openxmlformats-package.relationships+xml\"/>\
         <Default Extension=\"xml\" ContentType=\"application/xml\"/>\
         <Override PartName=\"/word/document.xml\" ContentType=\"application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml\"/>\
         </Types>"
            .to_string()
    }

    pub fn package(document: &str, extra: &[(&str, Vec<u8>)]) -> DocxPackage {
        let mut package = DocxPackage::default();
        package.set_part(CONTENT_TYPES, content_types_xml().into_bytes());
        package.set_part(
            "_rels/.rels",
            format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
                 <Relationships xmlns=\"{REL_NS}\"><Relationship Id=\"rId1\" \
                 Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument\" \
                 Target=\"word/document.xml\"/></Relationships>"
            )
            .into_bytes(),
        );
        package.set_part(DOCUMENT_PART, document.as_bytes().to_vec());
        for (name, data) in extra {
            package.set_part(name, data.clone());
        }
        package
    }

    pub fn write_package(path: &Path, package: &DocxPackage) {
        package.save(path).unwrap();
    }
}
