use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use roxmltree::{Document, Node, ParsingOptions};
use serde_json::Value;
use walkdir::WalkDir;

use crate::config::MappingSection;
use crate::mapper::LegacyRecord;

pub const DEFAULT_ID_COLUMNS: &[&str] = &[
    "id",
    "original_id",
    "article_id",
    "wp:post_id",
    "post_id",
    "guid",
    "nid",
];

/// WXR item types that are not articles.
const SKIPPED_WXR_TYPES: &[&str] = &["attachment", "nav_menu_item", "revision"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Csv,
    Json,
    Xml,
}

impl SourceFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Xml => "xml",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("csv") {
            return Ok(Self::Csv);
        }
        if value.eq_ignore_ascii_case("json") {
            return Ok(Self::Json);
        }
        if value.eq_ignore_ascii_case("xml") || value.eq_ignore_ascii_case("wxr") {
            return Ok(Self::Xml);
        }
        bail!("unsupported source format: {value} (expected csv, json, or xml)")
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(Self::Csv),
            "json" => Some(Self::Json),
            "xml" | "wxr" => Some(Self::Xml),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub format: Option<SourceFormat>,
    /// Candidate original-id columns, tried in order before the row number.
    pub id_columns: Vec<String>,
    /// Repeated element holding one record; `item` (WXR) when unset.
    pub item_element: Option<String>,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            format: None,
            id_columns: DEFAULT_ID_COLUMNS.iter().map(|value| value.to_string()).collect(),
            item_element: None,
        }
    }
}

impl SourceOptions {
    /// `--id-column` wins, then `[mapping] id`, then the defaults.
    pub fn with_id_column(mut self, explicit: Option<&str>, mapping: &MappingSection) -> Self {
        if let Some(column) = explicit.map(str::trim).filter(|value| !value.is_empty()) {
            self.id_columns = vec![column.to_string()];
        } else if let Some(configured) = mapping.id.as_ref().filter(|list| !list.is_empty()) {
            self.id_columns = configured.clone();
        }
        self
    }
}

/// Reads every record from a file, or from each matching file under a directory.
pub fn read_records(path: &Path, options: &SourceOptions) -> Result<Vec<LegacyRecord>> {
    if !path.exists() {
        bail!("source not found: {}", path.display());
    }
    if path.is_file() {
        let format = resolve_format(path, options.format)?;
        return read_file(path, format, options, None);
    }

    let files = collect_source_files(path, options.format)?;
    if files.is_empty() {
        bail!("no importable files under {}", path.display());
    }
    let mut records = Vec::new();
    for file in files {
        let format = resolve_format(&file, options.format)?;
        let prefix = file
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(ToString::to_string);
        records.extend(read_file(&file, format, options, prefix.as_deref())?);
    }
    Ok(records)
}

fn resolve_format(path: &Path, explicit: Option<SourceFormat>) -> Result<SourceFormat> {
    if let Some(format) = explicit {
        return Ok(format);
    }
    SourceFormat::from_path(path).with_context(|| {
        format!(
            "cannot infer format of {}; pass --format csv|json|xml",
            path.display()
        )
    })
}

fn collect_source_files(root: &Path, format: Option<SourceFormat>) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(detected) = SourceFormat::from_path(entry.path()) else {
            continue;
        };
        if format.is_some_and(|wanted| wanted != detected) {
            continue;
        }
        files.push(entry.into_path());
    }
    Ok(files)
}

fn read_file(
    path: &Path,
    format: SourceFormat,
    options: &SourceOptions,
    prefix: Option<&str>,
) -> Result<Vec<LegacyRecord>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let records = match format {
        SourceFormat::Csv => parse_csv(&content, &options.id_columns),
        SourceFormat::Json => parse_json(&content, &options.id_columns),
        SourceFormat::Xml => parse_xml(
            &content,
            &options.id_columns,
            options.item_element.as_deref(),
        ),
    }
    .with_context(|| format!("failed to parse {} as {}", path.display(), format.as_str()))?;

    // Row-number ids are only unique within one file.
    Ok(match prefix {
        Some(prefix) => records
            .into_iter()
            .map(|mut record| {
                if record.first_of(&options.id_columns).is_none() {
                    record.source_id = format!("{prefix}-{}", record.source_id);
                }
                record
            })
            .collect(),
        None => records,
    })
}

pub fn parse_csv(content: &str, id_columns: &[String]) -> Result<Vec<LegacyRecord>> {
    let rows = parse_csv_rows(strip_bom(content), ',');
    let Some((header_row, data)) = rows.split_first() else {
        return Ok(Vec::new());
    };

    let headers = header_row
        .iter()
        .map(|value| value.trim().to_string())
        .collect::<Vec<_>>();
    if headers.iter().all(String::is_empty) {
        bail!("CSV header row is empty");
    }

    let mut output = Vec::new();
    for (index, row) in data.iter().enumerate() {
        if row.iter().all(|value| value.trim().is_empty()) {
            continue;
        }
        let mut fields = Vec::with_capacity(headers.len());
        for (column, header) in headers.iter().enumerate() {
            if header.is_empty() {
                continue;
            }
            fields.push((header.clone(), row.get(column).cloned().unwrap_or_default()));
        }
        output.push(with_source_id(fields, id_columns, index + 1));
    }
    Ok(output)
}

pub fn parse_json(content: &str, id_columns: &[String]) -> Result<Vec<LegacyRecord>> {
    let trimmed = strip_bom(content).trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let parsed: Value = serde_json::from_str(trimmed).context("failed to parse JSON source")?;
    let items = match parsed {
        Value::Array(items) => items,
        Value::Object(_) => vec![parsed],
        _ => bail!("JSON source must be an object or an array of objects"),
    };

    let mut output = Vec::new();
    for (index, item) in items.iter().enumerate() {
        let Some(object) = item.as_object() else {
            continue;
        };
        let fields = object
            .iter()
            .map(|(key, value)| (key.clone(), json_field_text(value)))
            .collect::<Vec<_>>();
        output.push(with_source_id(fields, id_columns, index + 1));
    }
    Ok(output)
}

fn json_field_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Parses WXR (`rss/channel/item`) or any export with a repeated record element.
///
/// Child elements become fields keyed by their prefixed name (`content:encoded`,
/// `wp:post_id`). `category` children are keyed by their `domain` attribute, and
/// `wp:postmeta` pairs become fields named after the meta key. Repeated keys are
/// joined with `|`.
pub fn parse_xml(
    content: &str,
    id_columns: &[String],
    item_element: Option<&str>,
) -> Result<Vec<LegacyRecord>> {
    let options = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    let document =
        Document::parse_with_options(strip_bom(content), options).context("failed to parse XML")?;
    let item_name = item_element
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("item");

    let mut output = Vec::new();
    let items = document
        .descendants()
        .filter(|node| node.is_element() && element_matches(node, item_name));
    for (index, item) in items.enumerate() {
        let mut fields: Vec<(String, String)> = Vec::new();
        for attribute in item.attributes() {
            push_field(&mut fields, attribute.name(), attribute.value().to_string());
        }
        for child in item.children().filter(Node::is_element) {
            collect_element(&mut fields, &child);
        }

        let post_type = fields
            .iter()
            .find(|(key, _)| key == "wp:post_type")
            .map(|(_, value)| value.trim().to_ascii_lowercase());
        if post_type.is_some_and(|kind| SKIPPED_WXR_TYPES.contains(&kind.as_str())) {
            continue;
        }
        output.push(with_source_id(fields, id_columns, index + 1));
    }
    Ok(output)
}

fn collect_element(fields: &mut Vec<(String, String)>, element: &Node<'_, '_>) {
    let key = qualified_name(element);
    let local = element.tag_name().name();

    if local == "postmeta" {
        let meta_key = child_text(element, "meta_key");
        let meta_value = child_text(element, "meta_value");
        if let Some(meta_key) = meta_key.filter(|value| !value.trim().is_empty()) {
            push_field(fields, meta_key.trim(), meta_value.unwrap_or_default());
        }
        return;
    }
    if local == "comment" {
        return;
    }
    if local == "category"
        && let Some(domain) = element.attribute("domain")
    {
        push_field(fields, domain, element_text(element));
        return;
    }

    let nested = element.children().filter(Node::is_element).collect::<Vec<_>>();
    if nested.is_empty() {
        push_field(fields, &key, element_text(element));
        return;
    }
    for child in nested {
        let child_key = format!("{key}.{}", qualified_name(&child));
        push_field(fields, &child_key, element_text(&child));
    }
}

fn push_field(fields: &mut Vec<(String, String)>, key: &str, value: String) {
    if let Some((_, existing)) = fields.iter_mut().find(|(name, _)| name == key) {
        if value.trim().is_empty() {
            return;
        }
        if existing.trim().is_empty() {
            *existing = value;
        } else {
            existing.push('|');
            existing.push_str(&value);
        }
        return;
    }
    fields.push((key.to_string(), value));
}

fn element_matches(node: &Node<'_, '_>, wanted: &str) -> bool {
    if wanted.contains(':') {
        qualified_name(node) == wanted
    } else {
        node.tag_name().name() == wanted
    }
}

fn qualified_name(node: &Node<'_, '_>) -> String {
    let local = node.tag_name().name();
    match node
        .tag_name()
        .namespace()
        .and_then(|uri| node.lookup_prefix(uri))
    {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}:{local}"),
        _ => local.to_string(),
    }
}

fn element_text(node: &Node<'_, '_>) -> String {
    node.descendants()
        .filter(Node::is_text)
        .filter_map(|text| text.text())
        .collect::<String>()
}

fn child_text(node: &Node<'_, '_>, local: &str) -> Option<String> {
    node.children()
        .find(|child| child.is_element() && child.tag_name().name() == local)
        .map(|child| element_text(&child))
}

fn with_source_id(
    fields: Vec<(String, String)>,
    id_columns: &[String],
    row_number: usize,
) -> LegacyRecord {
    let mut record = LegacyRecord::new(row_number.to_string(), fields);
    if let Some(id) = record.first_of(id_columns).map(|value| value.trim().to_string()) {
        record.source_id = id;
    }
    record
}

fn parse_csv_rows(content: &str, delimiter: char) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = content.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            if ch == '"' {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
                continue;
            }
            field.push(ch);
            continue;
        }

        match ch {
            '"' => in_quotes = true,
            '\n' | '\r' => {
                if ch == '\r' && chars.peek() == Some(&'\n') {
                    chars.next();
                }
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ if ch == delimiter => row.push(std::mem::take(&mut field)),
            _ => field.push(ch),
        }
    }

    row.push(field);
    if row.len() > 1 || row.first().is_some_and(|value| !value.trim().is_empty()) {
        rows.push(row);
    }
    rows
}

fn strip_bom(content: &str) -> &str {
    content.strip_prefix('\u{feff}').unwrap_or(content)
}
