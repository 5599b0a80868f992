use crate::{
    docx::{DocxPackage, DOCUMENT_PART},
    rules::{self, Record, ReplacementRule},
};
use anyhow::{anyhow, Context, Result};
use quick_xml::{
    events::{BytesStart, BytesText, Event},
    Reader, Writer,
};

/// Fills a copy of `template` with one record. Returns the new package and the
/// number of runs that changed.
pub fn render_document(
    template: &DocxPackage,
    rules: &[ReplacementRule],
    record: &Record,
) -> Result<(DocxPackage, usize)> {
    let mut doc = template.clone();
    let mut parts = vec![DOCUMENT_PART.to_string()];
    parts.extend(template.header_footer_parts()?);

    let mut changed = 0;
    for part in parts {
        let Some(xml) = template.part(&part) else {
            continue;
        };
        let (out, count) =
            substitute_part(xml, rules, record).with_context(|| format!("fill {part}"))?;
        if count > 0 {
            doc.set_part(&part, out);
            changed += count;
        }
    }
    Ok((doc, changed))
}

enum Item {
    Event(Event<'static>),
    // A run nested inside this one (text box content), already processed.
    Nested(Vec<Event<'static>>),
}

/// Streams a WordprocessingML part, substituting placeholders run by run.
pub fn substitute_part(
    xml: &[u8],
    rules: &[ReplacementRule],
    record: &Record,
) -> Result<(Vec<u8>, usize)> {
    let mut reader = Reader::from_reader(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len()));
    let mut buf = Vec::new();
    let mut runs: Vec<Vec<Item>> = Vec::new();
    let mut changed = 0;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|err| anyhow!("xml error at {}: {err}", reader.buffer_position()))?;
        let is_run_start = matches!(&event, Event::Start(e) if e.name().as_ref() == b"w:r");
        let is_run_end = matches!(&event, Event::End(e) if e.name().as_ref() == b"w:r");

        if let Event::Eof = event {
            break;
        }

        if is_run_start {
            runs.push(vec![Item::Event(event.into_owned())]);
        } else if let Some(items) = runs.last_mut() {
            items.push(Item::Event(event.into_owned()));
            if is_run_end {
                if let Some(items) = runs.pop() {
                    let (events, did_change) = finish_run(items, rules, record)?;
                    if did_change {
                        changed += 1;
                    }
                    match runs.last_mut() {
                        Some(parent) => parent.push(Item::Nested(events)),
                        None => {
                            for event in events {
                                writer.write_event(event).context("write xml")?;
                            }
                        }
                    }
                }
            }
        } else {
            writer.write_event(event).context("write xml")?;
        }
        buf.clear();
    }

    if !runs.is_empty() {
        return Err(anyhow!("unclosed w:r element"));
    }
    Ok((writer.into_inner(), changed))
}

fn is_text_element(e: &BytesStart<'_>) -> bool {
    e.name().as_ref() == b"w:t"
}

fn run_text(items: &[Item]) -> Result<String> {
    let mut text = String::new();
    let mut in_text = false;
    for item in items {
        let Item::Event(event) = item else {
            continue;
        };
        match event {
            Event::Start(e) if is_text_element(e) => in_text = true,
            Event::End(e) if e.name().as_ref() == b"w:t" => in_text = false,
            Event::Text(t) if in_text => {
                text.push_str(&t.unescape().context("unescape run text")?);
            }
            Event::CData(t) if in_text => {
                text.push_str(&String::from_utf8_lossy(t));
            }
            _ => {}
        }
    }
    Ok(text)
}

fn preserved_start(e: &BytesStart<'_>) -> BytesStart<'static> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut start = BytesStart::new(name);
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() != b"xml:space" {
            start.push_attribute(attr);
        }
    }
    start.push_attribute(("xml:space", "preserve"));
    start.into_owned()
}

/// Flattens a run back to events. When its text holds a placeholder the
/// replaced text goes into the first `w:t` and later ones are emptied.
fn finish_run(
    items: Vec<Item>,
    rules: &[ReplacementRule],
    record: &Record,
) -> Result<(Vec<Event<'static>>, bool)> {
    let text = run_text(&items)?;
    let replacement = if rules::contains_placeholder(&text, rules) {
        let replaced = rules::substitute(&text, rules, record)?;
        (replaced != text).then_some(replaced)
    } else {
        None
    };

    let mut out = Vec::with_capacity(items.len());
    let Some(replacement) = replacement else {
        for item in items {
            match item {
                Item::Event(event) => out.push(event),
                Item::Nested(events) => out.extend(events),
            }
        }
        return Ok((out, false));
    };

    let mut emitted = false;
    let mut in_text = false;
    for item in items {
        let event = match item {
            Item::Nested(events) => {
                out.extend(events);
                continue;
            }
            Item::Event(event) => event,
        };
        match event {
            Event::Start(e) if is_text_element(&e) => {
                in_text = true;
                out.push(Event::Start(if emitted { e } else { preserved_start(&e) }));
            }
            Event::End(e) if e.name().as_ref() == b"w:t" => {
                if !emitted {
                    out.push(Event::Text(BytesText::new(&replacement).into_owned()));
                    emitted = true;
                }
                in_text = false;
                out.push(Event::End(e));
            }
            Event::Empty(e) if is_text_element(&e) && !emitted => {
                let start = preserved_start(&e);
                let end = start.to_end().into_owned();
                out.push(Event::Start(start));
                out.push(Event::Text(BytesText::new(&replacement).into_owned()));
                out.push(Event::End(end));
                emitted = true;
            }
            Event::Text(_) | Event::CData(_) if in_text => {
                if !emitted {
                    out.push(Event::Text(BytesText::new(&replacement).into_owned()));
                    emitted = true;
                }
            }
            other => out.push(other),
        }
    }
    Ok((out, true))
}
