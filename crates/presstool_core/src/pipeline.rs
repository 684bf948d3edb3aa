//! Migration commands: select candidates, map, transform, write, mark, report.
//!
//! Every command treats a record as the unit of failure. Errors inside one
//! record become a `failed` report line and the run moves on; only setup
//! problems and failed page fetches end a command early.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::{info, warn};

use crate::authors::{lookup_author, normalize_name, resolve_authors, split_byline};
use crate::block;
use crate::cursor::BatchCursor;
use crate::mapper::{Anomaly, FieldMapper, LegacyRecord, MapOutcome, NormalizedRecord};
use crate::media::{MediaFetcher, MediaImporter, MediaSettings};
use crate::report::{RecordState, ReportEntry, ReportSummary, Reporter, change_summary};
use crate::store::{PostFilter, Redirect, SiteStore};
use crate::transform::{ConverterRegistry, LegacyFragment, TransformContext};
use crate::writer::{MARKER_IMPORTED, PostWriter, WriteRequest, set_marker};

pub const MARKER_GALLERY: &str = "_newspack_migration_gallery_migrated";
pub const MARKER_COMPONENTS: &str = "_presstool_components_migrated";
pub const MARKER_BYLINES: &str = "_presstool_bylines_migrated";
pub const DEFAULT_BYLINE_META_KEY: &str = "byline";
pub const DEFAULT_REDIRECT_STATUS: u16 = 301;

const COMPONENT_FIELDS: &[&str] = &["components", "blocks", "content_components"];
const LAYOUT_FIELDS: &[&str] = &["layout", "flexible_content", "acf_layout"];
const REDIRECT_SOURCE_FIELDS: &[&str] = &["source", "from", "old_url", "redirect_from"];
const REDIRECT_TARGET_FIELDS: &[&str] = &["target", "to", "new_url", "redirect_to"];
const REDIRECT_STATUS_FIELDS: &[&str] = &["status", "status_code", "code"];
const REDIRECT_STATUSES: &[u16] = &[301, 302, 307, 308];

/// Marker for a shortcode set. The gallery-only set keeps its historical key.
pub fn shortcode_marker(names: &[String]) -> String {
    let mut names = names
        .iter()
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect::<Vec<_>>();
    names.sort();
    names.dedup();
    match names.as_slice() {
        [] => "_presstool_shortcodes_migrated".to_string(),
        [only] if only == "gallery" => MARKER_GALLERY.to_string(),
        _ => format!("_presstool_shortcodes_{}_migrated", names.join("_")),
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub limit: Option<usize>,
    /// Rewrite records whose post already carries the import marker.
    pub force: bool,
}

/// Candidate selection shared by the commands that walk existing posts.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub post_types: Vec<String>,
    pub batch_size: usize,
    pub post_id: Option<i64>,
    pub min_post_id: Option<i64>,
    pub limit: Option<usize>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            post_types: vec!["post".to_string()],
            batch_size: 100,
            post_id: None,
            min_post_id: None,
            limit: None,
        }
    }
}

impl BatchOptions {
    fn cursor(&self, filter: PostFilter) -> Result<BatchCursor> {
        let filter = PostFilter {
            post_types: self.post_types.clone(),
            post_id: self.post_id,
            min_post_id: self.min_post_id,
            ..filter
        };
        Ok(BatchCursor::new(filter, self.batch_size)?.with_limit(self.limit))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShortcodeOptions {
    pub batch: BatchOptions,
    /// Shortcodes to convert; empty means every registered one.
    pub shortcodes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BylineOptions {
    pub batch: BatchOptions,
    pub meta_key: String,
    /// Lowercased variant spelling to canonical name.
    pub author_aliases: BTreeMap<String, String>,
}

impl BylineOptions {
    /// Variant spellings mapped onto one canonical author name.
    pub fn with_author_aliases(mut self, aliases: &BTreeMap<String, String>) -> Self {
        self.author_aliases = aliases
            .iter()
            .map(|(variant, canonical)| (variant.trim().to_lowercase(), canonical.clone()))
            .collect();
        self
    }
}

impl Default for BylineOptions {
    fn default() -> Self {
        Self {
            batch: BatchOptions::default(),
            meta_key: DEFAULT_BYLINE_META_KEY.to_string(),
            author_aliases: BTreeMap::new(),
        }
    }
}

/// One migration run with its collaborators passed in.
pub struct Migration<'a, S: ?Sized, F: ?Sized> {
    site: &'a mut S,
    fetcher: &'a mut F,
    media: &'a MediaSettings,
    registry: &'a ConverterRegistry,
    reporter: Reporter,
    dry_run: bool,
    planned: DryRunPlan,
}

/// Writes a dry run would have made, so later rows in the same input see them.
#[derive(Debug, Default)]
struct DryRunPlan {
    /// (marker, original id) of posts that would have been written.
    posts: HashSet<(String, String)>,
    /// Redirect source to target.
    redirects: HashMap<String, String>,
}

impl<'a, S, F> Migration<'a, S, F>
where
    S: SiteStore + ?Sized,
    F: MediaFetcher + ?Sized,
{
    /// Dry-run mode follows the reporter.
    pub fn new(
        site: &'a mut S,
        fetcher: &'a mut F,
        media: &'a MediaSettings,
        registry: &'a ConverterRegistry,
        reporter: Reporter,
    ) -> Self {
        let dry_run = reporter.is_dry_run();
        Self {
            site,
            fetcher,
            media,
            registry,
            reporter,
            dry_run,
            planned: DryRunPlan::default(),
        }
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn finish(self) -> ReportSummary {
        let summary = self.reporter.finish();
        info!(
            command = %summary.command,
            dry_run = summary.dry_run,
            marked = summary.tally.marked,
            written = summary.tally.written,
            skipped = summary.tally.skipped,
            failed = summary.tally.failed,
            "run finished"
        );
        summary
    }

    /// Creates or updates one post per legacy record.
    pub fn import_posts(
        &mut self,
        mapper: &dyn FieldMapper,
        records: &[LegacyRecord],
        options: &ImportOptions,
    ) -> Result<()> {
        let writer = PostWriter::new(MARKER_IMPORTED, self.dry_run);
        let limit = options.limit.unwrap_or(usize::MAX);
        for record in records.iter().take(limit) {
            let entry = match mapper.map(record) {
                MapOutcome::Skip(anomaly) => self.skip(anomaly),
                MapOutcome::Mapped { record, anomalies } => {
                    self.anomalies(&anomalies);
                    self.import_one(&writer, &record, None, options.force)
                        .unwrap_or_else(|error| failed(&record.original_id, &record.title, &error))
                }
            };
            self.reporter.record(&entry);
        }
        Ok(())
    }

    /// Builds posts from component or flexible-layout JSON carried by each record.
    pub fn convert_components(
        &mut self,
        mapper: &dyn FieldMapper,
        records: &[LegacyRecord],
        options: &ImportOptions,
    ) -> Result<()> {
        let writer = PostWriter::new(MARKER_COMPONENTS, self.dry_run);
        let limit = options.limit.unwrap_or(usize::MAX);
        for record in records.iter().take(limit) {
            let items = match component_items(record) {
                Ok(items) => items,
                Err(error) => {
                    let entry = self.skip(Anomaly::new(&record.source_id, format!("{error:#}")));
                    self.reporter.record(&entry);
                    continue;
                }
            };
            let entry = match mapper.map(record) {
                MapOutcome::Skip(anomaly) => self.skip(anomaly),
                MapOutcome::Mapped { record, anomalies } => {
                    self.anomalies(&anomalies);
                    self.import_one(&writer, &record, Some(&items), options.force)
                        .unwrap_or_else(|error| failed(&record.original_id, &record.title, &error))
                }
            };
            self.reporter.record(&entry);
        }
        Ok(())
    }

    /// Rewrites registered shortcodes inside existing posts.
    pub fn convert_shortcodes(&mut self, options: &ShortcodeOptions) -> Result<()> {
        for name in &options.shortcodes {
            if !self.registry.has_shortcode(name) {
                bail!("no converter registered for shortcode [{name}]");
            }
        }
        let names = if options.shortcodes.is_empty() {
            self.registry
                .shortcode_names()
                .into_iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        } else {
            options
                .shortcodes
                .iter()
                .map(|name| name.trim().to_ascii_lowercase())
                .collect()
        };
        let marker = shortcode_marker(&options.shortcodes);
        let only = (!options.shortcodes.is_empty()).then_some(names.as_slice());

        let mut cursor = options.batch.cursor(PostFilter {
            missing_meta_key: Some(marker.clone()),
            content_contains: names.iter().map(|name| format!("[{name}")).collect(),
            ..PostFilter::default()
        })?;
        while let Some(page) = cursor.next_page(&*self.site) {
            let ids = self.page_or_stop(page)?;
            for post_id in ids {
                let entry = self
                    .convert_post_shortcodes(post_id, only, &marker)
                    .unwrap_or_else(|error| failed(&post_id.to_string(), "", &error).post(Some(post_id)));
                self.reporter.record(&entry);
            }
        }
        Ok(())
    }

    /// Turns a free-text byline meta value into ordered co-author assignments.
    pub fn split_bylines(&mut self, options: &BylineOptions) -> Result<()> {
        if options.meta_key.trim().is_empty() {
            bail!("byline meta key must not be empty");
        }
        let mut cursor = options.batch.cursor(PostFilter {
            missing_meta_key: Some(MARKER_BYLINES.to_string()),
            present_meta_key: Some(options.meta_key.clone()),
            ..PostFilter::default()
        })?;
        while let Some(page) = cursor.next_page(&*self.site) {
            let ids = self.page_or_stop(page)?;
            for post_id in ids {
                let entry = self
                    .split_post_byline(post_id, options)
                    .unwrap_or_else(|error| failed(&post_id.to_string(), "", &error).post(Some(post_id)));
                self.reporter.record(&entry);
            }
        }
        Ok(())
    }

    /// Creates redirect rules from `source,target[,status]` rows, skipping known sources.
    pub fn import_redirects(&mut self, records: &[LegacyRecord]) -> Result<()> {
        for record in records {
            let entry = self
                .import_redirect(record)
                .unwrap_or_else(|error| failed(&record.source_id, "", &error));
            self.reporter.record(&entry);
        }
        Ok(())
    }

    fn import_one(
        &mut self,
        writer: &PostWriter,
        record: &NormalizedRecord,
        components: Option<&ComponentItems>,
        force: bool,
    ) -> Result<ReportEntry> {
        let existing = writer.existing_post(&*self.site, &record.original_id)?;
        if let Some(post_id) = existing
            && !force
            && self.site.get_meta(post_id, writer.marker())?.is_some()
        {
            return Ok(ReportEntry::new(&record.original_id, RecordState::Skipped)
                .post(Some(post_id))
                .title(&record.title)
                .detail("already migrated"));
        }
        let plan_key = (writer.marker().to_string(), record.original_id.clone());
        let planned_earlier =
            self.dry_run && existing.is_none() && self.planned.posts.contains(&plan_key);
        if planned_earlier && !force {
            return Ok(ReportEntry::new(&record.original_id, RecordState::Skipped)
                .title(&record.title)
                .detail("already migrated"));
        }

        let (content, featured_image_id, anomalies) = {
            let mut importer =
                MediaImporter::new(&mut *self.site, &mut *self.fetcher, self.media, self.dry_run);
            let mut context = TransformContext::new(&record.original_id, existing, self.dry_run)
                .with_media(&mut importer);
            let fragment = match components {
                Some(ComponentItems::Components(items)) => LegacyFragment::Components(items),
                Some(ComponentItems::Layout(rows)) => LegacyFragment::Layout(rows),
                None => LegacyFragment::Shortcodes(&record.body),
            };
            let blocks = self.registry.transform(fragment, &mut context);
            let mut content = block::serialize_blocks(&blocks);
            let mut featured = None;
            for url in &record.media_urls {
                let imported = context.import_media(url);
                if record.featured_image.as_deref() == Some(url.as_str()) {
                    featured = imported.attachment_id;
                }
                if imported.url != *url {
                    content = content.replace(url.as_str(), &imported.url);
                }
            }
            (content, featured, context.take_anomalies())
        };
        self.anomalies(&anomalies);

        let outcome = writer.write(
            &mut *self.site,
            &WriteRequest {
                record,
                content: &content,
                featured_image_id,
                extra_meta: &[],
            },
        )?;
        if self.dry_run {
            self.planned.posts.insert(plan_key);
        }
        let created = outcome.created && !planned_earlier;
        let mut detail = if created { "created" } else { "updated" }.to_string();
        if !outcome.authors.is_empty() {
            detail.push_str(&format!("; authors: {}", outcome.authors.join(", ")));
        }
        Ok(ReportEntry::new(&record.original_id, RecordState::Marked)
            .post(outcome.post_id)
            .title(&record.title)
            .change(&record.body, &content)
            .detail(detail))
    }

    fn convert_post_shortcodes(
        &mut self,
        post_id: i64,
        only: Option<&[String]>,
        marker: &str,
    ) -> Result<ReportEntry> {
        let Some(post) = self.site.get_post(post_id)? else {
            bail!("post {post_id} disappeared during the run");
        };
        let record_id = post_id.to_string();

        let (conversion, anomalies) = {
            let mut importer =
                MediaImporter::new(&mut *self.site, &mut *self.fetcher, self.media, self.dry_run);
            let mut context =
                TransformContext::new(&record_id, Some(post_id), self.dry_run).with_media(&mut importer);
            let conversion = self
                .registry
                .convert_shortcodes_in_text(&post.content, only, &mut context);
            (conversion, context.take_anomalies())
        };
        self.anomalies(&anomalies);

        let entry = ReportEntry::new(&record_id, RecordState::Marked)
            .post(Some(post_id))
            .title(&post.title)
            .change(&post.content, &conversion.content);
        if !self.dry_run && conversion.content != post.content {
            self.site
                .update_post_content(post_id, &conversion.content)
                .with_context(|| format!("failed to update content of post {post_id}"))?;
        }
        if conversion.failed > 0 {
            return Ok(entry
                .detail(format!(
                    "{} converted, {} left unconverted; not marked",
                    conversion.converted, conversion.failed
                ))
                .with_state(RecordState::Failed));
        }
        if !self.dry_run {
            set_marker(&mut *self.site, post_id, marker)?;
        }
        Ok(entry.detail(format!(
            "{} converted ({})",
            conversion.converted,
            change_summary(&post.content, &conversion.content)
        )))
    }

    fn split_post_byline(&mut self, post_id: i64, options: &BylineOptions) -> Result<ReportEntry> {
        let record_id = post_id.to_string();
        let byline = self
            .site
            .get_meta(post_id, &options.meta_key)?
            .unwrap_or_default();
        let names = canonical_names(&split_byline(&byline), &options.author_aliases);
        let entry = ReportEntry::new(&record_id, RecordState::Marked)
            .post(Some(post_id))
            .change(&byline, &names.join("; "));

        if names.is_empty() {
            self.anomaly(Anomaly::new(&record_id, format!("byline {byline:?} has no names")));
            if !self.dry_run {
                set_marker(&mut *self.site, post_id, MARKER_BYLINES)?;
            }
            return Ok(entry.detail("empty byline").with_state(RecordState::Skipped));
        }

        if self.dry_run {
            let mut planned = Vec::with_capacity(names.len());
            for name in &names {
                let known = lookup_author(&*self.site, name)?;
                planned.push(known.map_or_else(|| name.clone(), |author| author.display_name));
            }
            return Ok(entry.detail(format!("authors: {}", planned.join(", "))));
        }

        let authors = resolve_authors(&mut *self.site, &names)?;
        self.site
            .assign_coauthors(post_id, &authors)
            .with_context(|| format!("failed to assign authors to post {post_id}"))?;
        set_marker(&mut *self.site, post_id, MARKER_BYLINES)?;
        let assigned = authors
            .iter()
            .map(|author| author.display_name.as_str())
            .collect::<Vec<_>>();
        Ok(entry.detail(format!("authors: {}", assigned.join(", "))))
    }

    fn import_redirect(&mut self, record: &LegacyRecord) -> Result<ReportEntry> {
        let id = &record.source_id;
        let source = first_field(record, REDIRECT_SOURCE_FIELDS)
            .map(redirect_path)
            .unwrap_or_default();
        let target = first_field(record, REDIRECT_TARGET_FIELDS)
            .map(|value| value.trim().to_string())
            .unwrap_or_default();
        if source.is_empty() || target.is_empty() {
            return Ok(self.skip(Anomaly::new(id, "redirect row needs both source and target")));
        }
        let status_code = match first_field(record, REDIRECT_STATUS_FIELDS) {
            Some(raw) => match raw.trim().parse::<u16>() {
                Ok(code) if REDIRECT_STATUSES.contains(&code) => code,
                _ => {
                    return Ok(self.skip(Anomaly::new(id, format!("unsupported redirect status {raw:?}"))));
                }
            },
            None => DEFAULT_REDIRECT_STATUS,
        };
        if source == redirect_path(&target) {
            return Ok(self.skip(Anomaly::new(id, format!("redirect {source} points at itself"))));
        }

        let entry = ReportEntry::new(id, RecordState::Written)
            .title(&source)
            .change(&source, &target);
        let existing_target = match self.site.find_redirect(&source)? {
            Some(existing) => Some(existing.target),
            None => self.planned.redirects.get(&source).cloned(),
        };
        if let Some(existing_target) = existing_target {
            return Ok(entry
                .detail(format!("source already redirects to {existing_target}"))
                .with_state(RecordState::Skipped));
        }
        if self.dry_run {
            self.planned.redirects.insert(source.clone(), target.clone());
        } else {
            self.site.insert_redirect(&Redirect {
                source: source.clone(),
                target: target.clone(),
                status_code,
            })?;
        }
        Ok(entry.detail(format!("{status_code} -> {target}")))
    }

    fn page_or_stop(&mut self, page: Result<Vec<i64>>) -> Result<Vec<i64>> {
        match page {
            Ok(ids) => Ok(ids),
            Err(error) => {
                self.reporter
                    .note("-", &format!("batch aborted: {error:#}"));
                Err(error)
            }
        }
    }

    fn skip(&mut self, anomaly: Anomaly) -> ReportEntry {
        let entry = ReportEntry::new(&anomaly.record_id, RecordState::Skipped).detail(&anomaly.reason);
        self.anomaly(anomaly);
        entry
    }

    fn anomaly(&mut self, anomaly: Anomaly) {
        warn!(record_id = %anomaly.record_id, reason = %anomaly.reason, "record anomaly");
        self.reporter.anomaly(&anomaly);
    }

    fn anomalies(&mut self, anomalies: &[Anomaly]) {
        for anomaly in anomalies {
            self.reporter.anomaly(anomaly);
        }
    }
}

enum ComponentItems {
    Components(Vec<Value>),
    Layout(Vec<Value>),
}

fn component_items(record: &LegacyRecord) -> Result<ComponentItems> {
    for (fields, layout) in [(COMPONENT_FIELDS, false), (LAYOUT_FIELDS, true)] {
        let Some(raw) = first_field(record, fields) else {
            continue;
        };
        let parsed: Value = serde_json::from_str(raw)
            .with_context(|| format!("component data of record {} is not JSON", record.source_id))?;
        let Value::Array(items) = parsed else {
            bail!("component data of record {} is not a list", record.source_id);
        };
        return Ok(if layout {
            ComponentItems::Layout(items)
        } else {
            ComponentItems::Components(items)
        });
    }
    bail!("record {} has no component data", record.source_id)
}

fn first_field<'r>(record: &'r LegacyRecord, keys: &[&str]) -> Option<&'r str> {
    keys.iter()
        .filter_map(|key| record.get(key))
        .find(|value| !value.trim().is_empty())
}

fn canonical_names(names: &[String], aliases: &BTreeMap<String, String>) -> Vec<String> {
    let mut output: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let canonical = aliases
            .get(&name.trim().to_lowercase())
            .map(|value| normalize_name(value))
            .unwrap_or_else(|| name.clone());
        if !output.iter().any(|seen| seen.eq_ignore_ascii_case(&canonical)) {
            output.push(canonical);
        }
    }
    output
}

/// Path and query of an absolute URL, or the value itself with a leading slash.
fn redirect_path(value: &str) -> String {
    let trimmed = value.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .or_else(|| trimmed.strip_prefix("//"));
    let path = match without_scheme {
        Some(rest) => rest.find('/').map_or("/", |index| &rest[index..]),
        None => trimmed,
    };
    if path.is_empty() {
        return String::new();
    }
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn failed(record_id: &str, title: &str, error: &anyhow::Error) -> ReportEntry {
    warn!(record_id, "record failed: {error:#}");
    ReportEntry::new(record_id, RecordState::Failed)
        .title(title)
        .detail(format!("{error:#}"))
}
