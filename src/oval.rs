use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::Context;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::Serialize;

/// One `<reference>` from a definition's metadata.
#[derive(Debug)]
pub struct Reference {
    pub source: String,
    pub ref_id: String,
    pub ref_url: String,
}

/// Metadata of one oval definition, as needed for the facts.
#[derive(Debug, Default)]
pub struct Definition {
    pub title: String,
    pub severity: String,
    pub references: Vec<Reference>,
}

/// The parts of an oval results document we care about: the embedded
/// definitions keyed by id, and the ids of definitions that evaluated true.
#[derive(Debug, Default)]
pub struct ScanResults {
    pub definitions: HashMap<String, Definition>,
    pub matched: Vec<String>,
}

#[derive(Debug, Default, PartialEq, Serialize)]
pub struct SeverityBucket {
    pub count: u64,
    pub titles: Vec<String>,
}

/// The aggregate that ends up under `openscap.oval` in the fact file.
#[derive(Debug, Default, Serialize)]
pub struct OvalSummary {
    #[serde(flatten)]
    pub sources: BTreeMap<String, BTreeMap<String, String>>,
    pub severity: BTreeMap<String, SeverityBucket>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub needs_reboot: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reboot_pkgs: Option<Vec<String>>,
}

fn attr(e: &BytesStart, name: &str) -> anyhow::Result<Option<String>> {
    let value = match e.try_get_attribute(name)? {
        Some(a) => Some(a.unescape_value()?.into_owned()),
        None => None,
    };
    Ok(value)
}

fn local_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn in_section(stack: &[String], name: &str) -> bool {
    stack.iter().any(|s| s == name)
}

fn last_is(stack: &[String], name: &str) -> bool {
    stack.last().is_some_and(|s| s == name)
}

fn record_result(e: &BytesStart, matched: &mut Vec<String>) -> anyhow::Result<()> {
    if attr(e, "result")?.as_deref() == Some("true") {
        let id = attr(e, "definition_id")?
            .ok_or_else(|| anyhow::anyhow!("result definition without definition_id"))?;
        matched.push(id);
    }
    Ok(())
}

fn push_reference(
    e: &BytesStart,
    current: &mut Option<(String, Definition)>,
) -> anyhow::Result<()> {
    let Some((id, def)) = current.as_mut() else {
        return Ok(());
    };
    let source = attr(e, "source")?
        .ok_or_else(|| anyhow::anyhow!("reference without source in {id}"))?;
    let ref_id = attr(e, "ref_id")?
        .ok_or_else(|| anyhow::anyhow!("reference without ref_id in {id}"))?;
    let ref_url = attr(e, "ref_url")?.unwrap_or_default();
    def.references.push(Reference {
        source,
        ref_id,
        ref_url,
    });
    Ok(())
}

#[derive(Clone, Copy)]
enum Field {
    Title,
    Severity,
}

/// Parses an oval results document. oscap writes the evaluated definitions
/// into the results file, so a single pass collects both the definition
/// metadata and the per-definition verdicts. Element names are matched by
/// local name, which sidesteps the namespace prefixes.
pub fn parse_results(xml: &str) -> anyhow::Result<ScanResults> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut out = ScanResults::default();
    let mut stack: Vec<String> = Vec::new();
    let mut current: Option<(String, Definition)> = None;
    let mut capture: Option<Field> = None;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let name = local_name(&e);
                match name.as_str() {
                    "definition" if in_section(&stack, "oval_definitions") => {
                        let id = attr(&e, "id")?
                            .ok_or_else(|| anyhow::anyhow!("definition without id"))?;
                        current = Some((id, Definition::default()));
                    }
                    "definition" if in_section(&stack, "results") => {
                        record_result(&e, &mut out.matched)?;
                    }
                    "title" if current.is_some() && last_is(&stack, "metadata") => {
                        capture = Some(Field::Title);
                    }
                    "severity" if current.is_some() && last_is(&stack, "advisory") => {
                        capture = Some(Field::Severity);
                    }
                    "reference" if last_is(&stack, "metadata") => {
                        push_reference(&e, &mut current)?;
                    }
                    _ => {}
                }
                stack.push(name);
            }
            Event::Empty(e) => {
                let name = local_name(&e);
                match name.as_str() {
                    "definition" if in_section(&stack, "results") => {
                        record_result(&e, &mut out.matched)?;
                    }
                    "reference" if last_is(&stack, "metadata") => {
                        push_reference(&e, &mut current)?;
                    }
                    _ => {}
                }
            }
            Event::Text(t) => {
                if let (Some(field), Some((_, def))) = (capture, current.as_mut()) {
                    let text = t.unescape()?.into_owned();
                    match field {
                        Field::Title if def.title.is_empty() => def.title = text,
                        Field::Severity if def.severity.is_empty() => def.severity = text,
                        _ => {}
                    }
                }
            }
            Event::End(_) => {
                capture = None;
                if stack.pop().as_deref() == Some("definition") {
                    if let Some((id, def)) = current.take() {
                        out.definitions.insert(id, def);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

/// Builds the fact aggregate from the parsed results.
///
/// Severity changes remap by ref_id prefix and stick for the rest of the
/// definition's references. References are always recorded, keyed by
/// lowercased source, first write wins per ref_id. Definitions whose final
/// severity is `ignore` or `none` stay out of the severity tally.
pub fn summarize(
    results: &ScanResults,
    severity_changes: &BTreeMap<String, String>,
) -> anyhow::Result<OvalSummary> {
    let mut sources: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    // the fact consumers expect these two maps even when empty
    sources.insert("rhsa".to_string(), BTreeMap::new());
    sources.insert("cve".to_string(), BTreeMap::new());
    let mut summary = OvalSummary {
        sources,
        ..Default::default()
    };

    for defid in &results.matched {
        let def = results
            .definitions
            .get(defid)
            .with_context(|| format!("no definition matching {defid}"))?;
        anyhow::ensure!(!def.severity.is_empty(), "definition {defid} has no severity");
        let mut severity = def.severity.to_lowercase();

        for reference in &def.references {
            for (prefix, new_severity) in severity_changes {
                if reference.ref_id.starts_with(prefix.as_str()) {
                    log::info!(
                        "changed severity on {}: {} => {}",
                        reference.ref_id,
                        severity,
                        new_severity
                    );
                    severity = new_severity.to_lowercase();
                    break;
                }
            }
            summary
                .sources
                .entry(reference.source.to_lowercase())
                .or_default()
                .entry(reference.ref_id.clone())
                .or_insert_with(|| reference.ref_url.clone());
        }

        if severity == "ignore" || severity == "none" {
            log::info!("ignoring: {}", def.title);
        } else {
            log::info!("found: {}", def.title);
            let bucket = summary.severity.entry(severity).or_default();
            bucket.count += 1;
            bucket.titles.push(def.title.clone());
        }
    }
    Ok(summary)
}

/// Replaces the text of the first child element of every element whose `id`
/// attribute appears in `fixes`, keeping the child's sub-elements and their
/// tail text. An id that matches nothing, or a target without a child
/// element, is an error: a report built from half-patched definitions would
/// hide the very problems the fixes exist for.
///
/// Ids are not scanned inside a child that is already being patched, so a
/// fix target nested inside another target's first child counts as missing.
/// Oval definition ids do not nest that way.
pub fn apply_fixes(xml: &str, fixes: &BTreeMap<String, String>) -> anyhow::Result<String> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());
    let mut remaining: BTreeMap<&str, &str> =
        fixes.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();

    // After a target element opens we wait for its first child, write the
    // replacement right after the child's start tag, and drop the child's
    // original leading text.
    let mut pending: Option<(String, &str)> = None;
    let mut in_child: Option<usize> = None;
    let mut leading = false;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                if let Some(depth) = in_child {
                    in_child = Some(depth + 1);
                    leading = false;
                    writer.write_event(Event::Start(e))?;
                } else if let Some((id, fix)) = pending.take() {
                    writer.write_event(Event::Start(e))?;
                    writer.write_event(Event::Text(BytesText::new(fix)))?;
                    log::info!("fixed definition {id}={fix}");
                    in_child = Some(0);
                    leading = true;
                } else {
                    if let Some(id) = attr(&e, "id")? {
                        if let Some(fix) = remaining.remove(id.as_str()) {
                            pending = Some((id, fix));
                        }
                    }
                    writer.write_event(Event::Start(e))?;
                }
            }
            Event::Empty(e) => {
                if in_child.is_some() {
                    leading = false;
                    writer.write_event(Event::Empty(e))?;
                } else if let Some((id, fix)) = pending.take() {
                    // an empty first child gains the replacement as its text
                    writer.write_event(Event::Start(e.clone()))?;
                    writer.write_event(Event::Text(BytesText::new(fix)))?;
                    writer.write_event(Event::End(e.to_end()))?;
                    log::info!("fixed definition {id}={fix}");
                } else {
                    if let Some(id) = attr(&e, "id")? {
                        if remaining.contains_key(id.as_str()) {
                            anyhow::bail!("definition {id} has no child element");
                        }
                    }
                    writer.write_event(Event::Empty(e))?;
                }
            }
            Event::Text(t) => {
                if !(in_child == Some(0) && leading) {
                    writer.write_event(Event::Text(t))?;
                }
            }
            Event::CData(t) => {
                if !(in_child == Some(0) && leading) {
                    writer.write_event(Event::CData(t))?;
                }
            }
            Event::End(e) => {
                if let Some(depth) = in_child {
                    if depth == 0 {
                        in_child = None;
                        leading = false;
                    } else {
                        in_child = Some(depth - 1);
                    }
                    writer.write_event(Event::End(e))?;
                } else if let Some((id, _)) = pending.take() {
                    anyhow::bail!("definition {id} has no child element");
                } else {
                    writer.write_event(Event::End(e))?;
                }
            }
            Event::Eof => break,
            other => writer.write_event(other)?,
        }
        buf.clear();
    }

    if let Some(id) = remaining.keys().next() {
        anyhow::bail!("did not find anything matching {id}");
    }
    String::from_utf8(writer.into_inner()).context("patched document is not valid utf-8")
}

/// Applies the tweaks' definition fixes to the downloaded definitions file
/// in place.
pub fn patch_definitions_file(
    path: &Path,
    fixes: &BTreeMap<String, String>,
) -> anyhow::Result<()> {
    let xml = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let patched = apply_fixes(&xml, fixes)?;
    fs::write(path, patched)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
