use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone};
use regex::Regex;
use serde::Serialize;

use crate::authors::{normalize_name, split_byline};
use crate::config::MappingSection;
use crate::text::{normalize_spaces, slugify};

/// An opaque row from a legacy export, fields kept in source order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct LegacyRecord {
    pub source_id: String,
    pub fields: Vec<(String, String)>,
}

impl LegacyRecord {
    pub fn new(source_id: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        Self {
            source_id: source_id.into(),
            fields,
        }
    }

    /// First field whose key matches `key` case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    /// First non-blank value among `keys`, in alias order.
    pub fn first_of(&self, keys: &[String]) -> Option<&str> {
        keys.iter()
            .filter_map(|key| self.get(key))
            .find(|value| !value.trim().is_empty())
    }
}

/// A per-record problem that is logged instead of raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Anomaly {
    pub record_id: String,
    pub reason: String,
}

impl Anomaly {
    pub fn new(record_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedRecord {
    pub original_id: String,
    pub title: String,
    pub slug: String,
    pub date: Option<DateTime<FixedOffset>>,
    pub authors: Vec<String>,
    pub body: String,
    pub excerpt: String,
    /// Absolute image URLs to sideload: the featured image first, then inline `<img>` sources.
    pub media_urls: Vec<String>,
    pub featured_image: Option<String>,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub post_type: String,
    pub status: String,
}

impl NormalizedRecord {
    /// `post_date`-style local timestamp, as the site stores it.
    pub fn published_at(&self) -> Option<String> {
        self.date
            .map(|date| date.format("%Y-%m-%d %H:%M:%S").to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapOutcome {
    Mapped {
        record: NormalizedRecord,
        anomalies: Vec<Anomaly>,
    },
    Skip(Anomaly),
}

pub trait FieldMapper {
    fn map(&self, record: &LegacyRecord) -> MapOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Title,
    Slug,
    Date,
    Author,
    Body,
    Excerpt,
    FeaturedImage,
    Categories,
    Tags,
}

impl Field {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Slug => "slug",
            Self::Date => "date",
            Self::Author => "author",
            Self::Body => "body",
            Self::Excerpt => "excerpt",
            Self::FeaturedImage => "featured_image",
            Self::Categories => "categories",
            Self::Tags => "tags",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "title" => Some(Self::Title),
            "slug" => Some(Self::Slug),
            "date" => Some(Self::Date),
            "author" | "authors" => Some(Self::Author),
            "body" | "content" => Some(Self::Body),
            "excerpt" => Some(Self::Excerpt),
            "featured_image" => Some(Self::FeaturedImage),
            "categories" => Some(Self::Categories),
            "tags" => Some(Self::Tags),
            _ => None,
        }
    }
}

/// Column alias lists for each normalized field.
#[derive(Debug, Clone)]
pub struct FieldAliases {
    pub title: Vec<String>,
    pub slug: Vec<String>,
    pub date: Vec<String>,
    pub author: Vec<String>,
    pub body: Vec<String>,
    pub excerpt: Vec<String>,
    pub featured_image: Vec<String>,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub status: Vec<String>,
}

impl Default for FieldAliases {
    fn default() -> Self {
        Self {
            title: strings(&["title", "headline", "post_title", "name"]),
            slug: strings(&["slug", "post_name", "url_slug", "wp:post_name"]),
            date: strings(&[
                "date",
                "published",
                "publish_date",
                "post_date",
                "wp:post_date",
                "pubDate",
                "created",
            ]),
            author: strings(&["author", "authors", "byline", "dc:creator", "creator"]),
            body: strings(&["body", "content", "post_content", "content:encoded", "text", "html"]),
            excerpt: strings(&["excerpt", "summary", "dek", "subtitle", "excerpt:encoded"]),
            featured_image: strings(&[
                "featured_image",
                "image",
                "image_url",
                "thumbnail",
                "lead_image",
            ]),
            categories: strings(&["categories", "category", "section", "sections"]),
            tags: strings(&["tags", "tag", "keywords", "post_tag"]),
            status: strings(&["status", "post_status", "wp:status"]),
        }
    }
}

impl FieldAliases {
    /// Defaults with any configured alias lists taking their place.
    pub fn from_config(section: &MappingSection) -> Self {
        let mut aliases = Self::default();
        let overrides: [(&Option<Vec<String>>, &mut Vec<String>); 9] = [
            (&section.title, &mut aliases.title),
            (&section.slug, &mut aliases.slug),
            (&section.date, &mut aliases.date),
            (&section.author, &mut aliases.author),
            (&section.body, &mut aliases.body),
            (&section.excerpt, &mut aliases.excerpt),
            (&section.featured_image, &mut aliases.featured_image),
            (&section.categories, &mut aliases.categories),
            (&section.tags, &mut aliases.tags),
        ];
        for (configured, target) in overrides {
            if let Some(list) = configured
                && !list.is_empty()
            {
                *target = list.clone();
            }
        }
        aliases
    }
}

const PUBLISHABLE_STATUSES: &[&str] = &["publish", "draft", "pending", "private", "future"];

/// Maps flat column-style records (CSV rows, JSON objects, XML items).
pub struct ColumnMapper {
    aliases: FieldAliases,
    required: Vec<Field>,
    offset: FixedOffset,
    author_aliases: BTreeMap<String, String>,
    post_type: String,
    default_status: String,
    image_src: Regex,
}

impl ColumnMapper {
    pub fn new(
        aliases: FieldAliases,
        required: Vec<Field>,
        offset: FixedOffset,
        post_type: &str,
        default_status: &str,
    ) -> Result<Self> {
        let image_src = Regex::new(r#"(?i)<img\b[^>]*?\bsrc\s*=\s*["']([^"']+)["']"#)
            .context("failed to compile image source pattern")?;
        Ok(Self {
            aliases,
            required,
            offset,
            author_aliases: BTreeMap::new(),
            post_type: post_type.to_string(),
            default_status: default_status.to_string(),
            image_src,
        })
    }

    pub fn from_config(
        section: &MappingSection,
        offset: FixedOffset,
        post_type: &str,
        default_status: &str,
    ) -> Result<Self> {
        let required = match &section.required {
            Some(names) => {
                let mut fields = Vec::with_capacity(names.len());
                for name in names {
                    let Some(field) = Field::parse(name) else {
                        bail!("unknown field in [mapping] required: {name}");
                    };
                    fields.push(field);
                }
                fields
            }
            None => vec![Field::Title, Field::Body],
        };
        let mut mapper = Self::new(
            FieldAliases::from_config(section),
            required,
            offset,
            post_type,
            default_status,
        )?;
        mapper = mapper.with_author_aliases(&section.author_aliases);
        Ok(mapper)
    }

    /// Variant spellings mapped onto one canonical author name.
    pub fn with_author_aliases(mut self, aliases: &BTreeMap<String, String>) -> Self {
        self.author_aliases = aliases
            .iter()
            .map(|(variant, canonical)| (variant.trim().to_lowercase(), normalize_name(canonical)))
            .collect();
        self
    }

    pub fn with_required(mut self, required: Vec<Field>) -> Self {
        self.required = required;
        self
    }

    fn is_required(&self, field: Field) -> bool {
        self.required.contains(&field)
    }

    fn canonical_author(&self, name: &str) -> String {
        self.author_aliases
            .get(&name.trim().to_lowercase())
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }
}

impl FieldMapper for ColumnMapper {
    fn map(&self, record: &LegacyRecord) -> MapOutcome {
        let id = record.source_id.clone();
        let mut anomalies = Vec::new();

        let title = record
            .first_of(&self.aliases.title)
            .map(|value| normalize_spaces(&repair_mojibake(value)))
            .unwrap_or_default();
        let body = record
            .first_of(&self.aliases.body)
            .map(|value| repair_mojibake(value).trim().to_string())
            .unwrap_or_default();

        for (field, value) in [(Field::Title, &title), (Field::Body, &body)] {
            if value.is_empty() && self.is_required(field) {
                return MapOutcome::Skip(Anomaly::new(
                    &id,
                    format!("missing required field {}", field.as_str()),
                ));
            }
        }

        let date = match record.first_of(&self.aliases.date) {
            Some(raw) => match parse_date(raw, self.offset) {
                Some(date) => Some(date),
                None if self.is_required(Field::Date) => {
                    return MapOutcome::Skip(Anomaly::new(&id, format!("unparseable date {raw:?}")));
                }
                None => {
                    anomalies.push(Anomaly::new(&id, format!("unparseable date {raw:?}")));
                    None
                }
            },
            None if self.is_required(Field::Date) => {
                return MapOutcome::Skip(Anomaly::new(&id, "missing required field date"));
            }
            None => None,
        };

        let authors = record
            .first_of(&self.aliases.author)
            .map(|raw| {
                let mut names: Vec<String> = Vec::new();
                for name in split_byline(&repair_mojibake(raw)) {
                    let canonical = self.canonical_author(&name);
                    if !names.iter().any(|seen| seen.eq_ignore_ascii_case(&canonical)) {
                        names.push(canonical);
                    }
                }
                names
            })
            .unwrap_or_default();
        if authors.is_empty() && self.is_required(Field::Author) {
            return MapOutcome::Skip(Anomaly::new(&id, "missing required field author"));
        }

        let slug = match record.first_of(&self.aliases.slug) {
            Some(raw) => slugify(raw),
            None => slugify(&title),
        };
        if slug.is_empty() {
            anomalies.push(Anomaly::new(&id, "record yields an empty slug"));
        }

        let excerpt = record
            .first_of(&self.aliases.excerpt)
            .map(|value| repair_mojibake(value).trim().to_string())
            .unwrap_or_default();

        let featured_image = record
            .first_of(&self.aliases.featured_image)
            .map(|value| value.trim().to_string());
        if let Some(url) = &featured_image
            && !is_fetchable_url(url)
        {
            anomalies.push(Anomaly::new(&id, format!("featured image is not a URL: {url}")));
        }

        let mut media_urls = Vec::new();
        if let Some(url) = &featured_image
            && is_fetchable_url(url)
        {
            media_urls.push(url.clone());
        }
        for capture in self.image_src.captures_iter(&body) {
            if let Some(url) = capture.get(1).map(|found| found.as_str().trim().to_string())
                && is_fetchable_url(&url)
                && !media_urls.contains(&url)
            {
                media_urls.push(url);
            }
        }

        let categories = record
            .first_of(&self.aliases.categories)
            .map(split_list)
            .unwrap_or_default();
        let tags = record
            .first_of(&self.aliases.tags)
            .map(split_list)
            .unwrap_or_default();
        for (field, values) in [(Field::Categories, &categories), (Field::Tags, &tags)] {
            if values.is_empty() && self.is_required(field) {
                return MapOutcome::Skip(Anomaly::new(
                    &id,
                    format!("missing required field {}", field.as_str()),
                ));
            }
        }

        let status = match record.first_of(&self.aliases.status) {
            Some(raw) if PUBLISHABLE_STATUSES.contains(&raw.trim().to_ascii_lowercase().as_str()) => {
                raw.trim().to_ascii_lowercase()
            }
            Some(raw) => {
                anomalies.push(Anomaly::new(&id, format!("unknown status {raw:?}, using default")));
                self.default_status.clone()
            }
            None => self.default_status.clone(),
        };

        MapOutcome::Mapped {
            record: NormalizedRecord {
                original_id: id,
                title,
                slug,
                date,
                authors,
                body,
                excerpt,
                media_urls,
                featured_image,
                categories,
                tags,
                post_type: self.post_type.clone(),
                status,
            },
            anomalies,
        }
    }
}

const MOJIBAKE: &[(&str, &str)] = &[
    ("â€™", "\u{2019}"),
    ("â€˜", "\u{2018}"),
    ("â€œ", "\u{201c}"),
    ("â€\u{9d}", "\u{201d}"),
    ("â€”", "\u{2014}"),
    ("â€“", "\u{2013}"),
    ("â€¦", "\u{2026}"),
    ("â€¢", "\u{2022}"),
    ("Â\u{a0}", " "),
    ("Ã©", "é"),
    ("Ã¨", "è"),
    ("Ãª", "ê"),
    ("Ã¡", "á"),
    ("Ã\u{a0}", "à"),
    ("Ã­", "í"),
    ("Ã³", "ó"),
    ("Ãº", "ú"),
    ("Ã±", "ñ"),
    ("Ã¼", "ü"),
    ("Ã¶", "ö"),
    ("Ã¤", "ä"),
    ("Ã§", "ç"),
];

/// Undo the common UTF-8-read-as-Windows-1252 sequences.
pub fn repair_mojibake(value: &str) -> String {
    if !value.contains('â') && !value.contains('Ã') && !value.contains('Â') {
        return value.to_string();
    }
    let mut repaired = value.to_string();
    for (broken, fixed) in MOJIBAKE {
        if repaired.contains(broken) {
            repaired = repaired.replace(broken, fixed);
        }
    }
    repaired
}

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %I:%M %p",
];
const NAIVE_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%B %d, %Y", "%b %d, %Y", "%d %B %Y"];

/// Parse the date shapes legacy exports use. Naive values are read in `offset`.
pub fn parse_date(raw: &str, offset: FixedOffset) -> Option<DateTime<FixedOffset>> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&offset));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.with_timezone(&offset));
    }
    if value.len() >= 9 && value.chars().all(|ch| ch.is_ascii_digit()) {
        let seconds = value.parse::<i64>().ok()?;
        return DateTime::from_timestamp(seconds, 0).map(|utc| utc.with_timezone(&offset));
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return offset.from_local_datetime(&naive).single();
        }
    }
    for format in NAIVE_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            let naive = date.and_hms_opt(0, 0, 0)?;
            return offset.from_local_datetime(&naive).single();
        }
    }
    None
}

/// Split a taxonomy cell on `,`, `;` or `|`, trimming and dropping blanks.
pub fn split_list(raw: &str) -> Vec<String> {
    let mut values: Vec<String> = Vec::new();
    for part in raw.split([',', ';', '|']) {
        let value = normalize_spaces(&repair_mojibake(part));
        if !value.is_empty() && !values.iter().any(|seen| seen.eq_ignore_ascii_case(&value)) {
            values.push(value);
        }
    }
    values
}

pub fn is_fetchable_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://") || value.starts_with("//")
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, Timelike};

    use super::*;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).expect("utc")
    }

    fn mapper() -> ColumnMapper {
        ColumnMapper::new(
            FieldAliases::default(),
            vec![Field::Title, Field::Body],
            utc(),
            "post",
            "publish",
        )
        .expect("mapper")
    }

    fn row(pairs: &[(&str, &str)]) -> LegacyRecord {
        LegacyRecord::new(
            "row-1",
            pairs
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        )
    }

    fn mapped(outcome: MapOutcome) -> (NormalizedRecord, Vec<Anomaly>) {
        match outcome {
            MapOutcome::Mapped { record, anomalies } => (record, anomalies),
            MapOutcome::Skip(anomaly) => panic!("unexpected skip: {}", anomaly.reason),
        }
    }

    #[test]
    fn maps_the_example_row() {
        let (record, anomalies) = mapped(mapper().map(&row(&[
            ("slug", "city-hall-vote"),
            ("title", "City Hall Vote"),
            ("body", "[gallery ids=1,2,3]"),
        ])));
        assert!(anomalies.is_empty());
        assert_eq!(record.slug, "city-hall-vote");
        assert_eq!(record.title, "City Hall Vote");
        assert_eq!(record.body, "[gallery ids=1,2,3]");
        assert_eq!(record.original_id, "row-1");
        assert_eq!(record.status, "publish");
    }

    #[test]
    fn missing_required_field_skips() {
        match mapper().map(&row(&[("title", "No body")])) {
            MapOutcome::Skip(anomaly) => {
                assert_eq!(anomaly.record_id, "row-1");
                assert!(anomaly.reason.contains("body"));
            }
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[test]
    fn alternate_column_names_and_mojibake() {
        let (record, _) = mapped(mapper().map(&row(&[
            ("Headline", "Mayorâ€™s  plan"),
            ("post_content", "<p>Text <img src='https://legacy.example/a.jpg'></p>"),
            ("Byline", "By Jane Doe and John Smith"),
            ("section", "News; Local News | news"),
        ])));
        assert_eq!(record.title, "Mayor\u{2019}s plan");
        assert_eq!(record.slug, "mayor-s-plan");
        assert_eq!(record.authors, vec!["Jane Doe", "John Smith"]);
        assert_eq!(record.categories, vec!["News", "Local News"]);
        assert_eq!(record.media_urls, vec!["https://legacy.example/a.jpg"]);
    }

    #[test]
    fn bad_optional_date_degrades_with_anomaly() {
        let (record, anomalies) = mapped(mapper().map(&row(&[
            ("title", "T"),
            ("body", "B"),
            ("date", "sometime last week"),
        ])));
        assert_eq!(record.date, None);
        assert_eq!(anomalies.len(), 1);
        assert!(anomalies[0].reason.contains("unparseable date"));
    }

    #[test]
    fn required_date_skips_when_unparseable() {
        let strict = ColumnMapper::new(
            FieldAliases::default(),
            vec![Field::Title, Field::Date],
            utc(),
            "post",
            "draft",
        )
        .expect("mapper");
        assert!(matches!(
            strict.map(&row(&[("title", "T"), ("date", "n/a")])),
            MapOutcome::Skip(_)
        ));
    }

    #[test]
    fn author_aliases_collapse_variants() {
        let aliases = BTreeMap::from([("J. Doe".to_string(), "Jane Doe".to_string())]);
        let (record, _) = mapped(mapper().with_author_aliases(&aliases).map(&row(&[
            ("title", "T"),
            ("body", "B"),
            ("author", "J. Doe & Jane Doe"),
        ])));
        assert_eq!(record.authors, vec!["Jane Doe"]);
    }

    #[test]
    fn parse_date_handles_common_shapes() {
        let offset = FixedOffset::west_opt(5 * 3600).expect("offset");
        let naive = parse_date("2021-03-04 10:30:00", offset).expect("naive");
        assert_eq!((naive.year(), naive.month(), naive.day(), naive.hour()), (2021, 3, 4, 10));
        assert_eq!(naive.offset().local_minus_utc(), -5 * 3600);

        let rfc = parse_date("2021-03-04T15:30:00Z", offset).expect("rfc3339");
        assert_eq!(rfc.hour(), 10);
        assert!(parse_date("Thu, 04 Mar 2021 15:30:00 +0000", offset).is_some());
        assert!(parse_date("03/04/2021", offset).is_some());
        assert!(parse_date("March 4, 2021", offset).is_some());
        assert_eq!(parse_date("1614871800", utc()).expect("unix").year(), 2021);
        assert!(parse_date("0000-00-00 00:00:00", offset).is_none());
    }

    #[test]
    fn published_at_is_local_wall_time() {
        let offset = FixedOffset::east_opt(2 * 3600).expect("offset");
        let (mut record, _) = mapped(mapper().map(&row(&[("title", "T"), ("body", "B")])));
        record.date = parse_date("2020-01-01T00:00:00Z", offset);
        assert_eq!(record.published_at().as_deref(), Some("2020-01-01 02:00:00"));
    }

    #[test]
    fn unknown_required_field_is_rejected() {
        let section = MappingSection {
            required: Some(vec!["headline_text".to_string()]),
            ..MappingSection::default()
        };
        let error = ColumnMapper::from_config(&section, utc(), "post", "publish")
            .err()
            .expect("must fail");
        assert!(error.to_string().contains("unknown field"));
    }
}
