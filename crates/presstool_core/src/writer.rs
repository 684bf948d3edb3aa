use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::authors::{lookup_author, resolve_authors};
use crate::mapper::NormalizedRecord;
use crate::store::{META_THUMBNAIL_ID, NewPost, SiteStore};

pub const META_ORIGINAL_ID: &str = "original_article_id";
pub const MARKER_IMPORTED: &str = "_presstool_imported";
pub const TAXONOMY_CATEGORY: &str = "category";
pub const TAXONOMY_TAG: &str = "post_tag";

/// One post's worth of writes.
#[derive(Debug, Clone)]
pub struct WriteRequest<'a> {
    pub record: &'a NormalizedRecord,
    /// Serialized block markup.
    pub content: &'a str,
    pub featured_image_id: Option<i64>,
    pub extra_meta: &'a [(String, String)],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    /// Post written, or in dry-run the post that would be updated.
    pub post_id: Option<i64>,
    pub created: bool,
    pub dry_run: bool,
    pub authors: Vec<String>,
}

/// Upserts posts keyed by their original id and sets the migration marker last.
#[derive(Debug, Clone)]
pub struct PostWriter {
    marker: String,
    dry_run: bool,
}

impl PostWriter {
    pub fn new(marker: impl Into<String>, dry_run: bool) -> Self {
        Self {
            marker: marker.into(),
            dry_run,
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Existing post imported from `original_id`, if any.
    pub fn existing_post<S>(&self, site: &S, original_id: &str) -> Result<Option<i64>>
    where
        S: SiteStore + ?Sized,
    {
        site.find_post_by_meta(META_ORIGINAL_ID, original_id)
            .with_context(|| format!("failed to look up original id {original_id}"))
    }

    /// Writes post row, meta, taxonomy, authors, featured image, then the marker.
    ///
    /// Any failure returns before the marker is set, so the record stays a
    /// candidate for the next run.
    pub fn write<S>(&self, site: &mut S, request: &WriteRequest<'_>) -> Result<WriteOutcome>
    where
        S: SiteStore + ?Sized,
    {
        let record = request.record;
        let existing = self.existing_post(&*site, &record.original_id)?;

        if self.dry_run {
            let mut authors = Vec::with_capacity(record.authors.len());
            for name in &record.authors {
                let known = lookup_author(&*site, name)?;
                authors.push(known.map_or_else(|| name.clone(), |author| author.display_name));
            }
            return Ok(WriteOutcome {
                post_id: existing,
                created: existing.is_none(),
                dry_run: true,
                authors,
            });
        }

        let post = NewPost {
            post_type: record.post_type.clone(),
            status: record.status.clone(),
            title: record.title.clone(),
            slug: record.slug.clone(),
            content: request.content.to_string(),
            excerpt: record.excerpt.clone(),
            published_at: record.published_at(),
        };
        let (post_id, created) = match existing {
            Some(id) => {
                site.update_post(id, &post)
                    .with_context(|| format!("failed to update post {id}"))?;
                (id, false)
            }
            None => {
                let id = site.insert_post(&post).with_context(|| {
                    format!("failed to insert post for original id {}", record.original_id)
                })?;
                (id, true)
            }
        };
        debug!(record_id = %record.original_id, post_id, created, "post row written");

        site.set_meta(post_id, META_ORIGINAL_ID, &record.original_id)
            .with_context(|| format!("failed to set original id on post {post_id}"))?;
        for (key, value) in request.extra_meta {
            site.set_meta(post_id, key, value)
                .with_context(|| format!("failed to set {key} on post {post_id}"))?;
        }

        assign_terms(&mut *site, post_id, TAXONOMY_CATEGORY, &record.categories)?;
        assign_terms(&mut *site, post_id, TAXONOMY_TAG, &record.tags)?;

        let mut authors = Vec::new();
        if !record.authors.is_empty() {
            let resolved = resolve_authors(&mut *site, &record.authors)
                .with_context(|| format!("failed to resolve authors for post {post_id}"))?;
            site.assign_coauthors(post_id, &resolved)
                .with_context(|| format!("failed to assign authors to post {post_id}"))?;
            authors = resolved.into_iter().map(|author| author.display_name).collect();
        }

        if let Some(attachment_id) = request.featured_image_id {
            site.set_meta(post_id, META_THUMBNAIL_ID, &attachment_id.to_string())
                .with_context(|| format!("failed to set featured image on post {post_id}"))?;
        }

        set_marker(site, post_id, &self.marker)?;
        Ok(WriteOutcome {
            post_id: Some(post_id),
            created,
            dry_run: false,
            authors,
        })
    }
}

/// Sets `marker` on `post_id` with the current UTC time as its value.
pub fn set_marker<S>(site: &mut S, post_id: i64, marker: &str) -> Result<()>
where
    S: SiteStore + ?Sized,
{
    let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    site.set_meta(post_id, marker, &stamp)
        .with_context(|| format!("failed to set marker {marker} on post {post_id}"))
}

fn assign_terms<S>(site: &mut S, post_id: i64, taxonomy: &str, names: &[String]) -> Result<()>
where
    S: SiteStore + ?Sized,
{
    if names.is_empty() {
        return Ok(());
    }
    let mut term_ids = Vec::with_capacity(names.len());
    for name in names {
        let id = site
            .ensure_term(taxonomy, name)
            .with_context(|| format!("failed to create {taxonomy} term {name:?}"))?;
        if !term_ids.contains(&id) {
            term_ids.push(id);
        }
    }
    site.set_post_terms(post_id, taxonomy, &term_ids)
        .with_context(|| format!("failed to set {taxonomy} terms on post {post_id}"))
}

#[cfg(test)]
pub(crate) mod tests {
    use anyhow::bail;

    use super::*;
    use crate::store::{
        AttachmentRepository, AuthorRef, AuthorRepository, NewAttachment, PostFilter,
        PostRecord, PostRepository, Redirect, RedirectRepository, SqliteSite, TermRepository,
    };

    /// SQLite-backed site that records every write call and can fail one of them.
    pub(crate) struct RecordingSite {
        pub inner: SqliteSite,
        pub writes: Vec<String>,
        pub fail_on: Option<&'static str>,
    }

    impl RecordingSite {
        pub fn new() -> Self {
            Self {
                inner: SqliteSite::open_in_memory().expect("site"),
                writes: Vec::new(),
                fail_on: None,
            }
        }

        fn record(&mut self, call: &'static str, detail: String) -> Result<()> {
            if self.fail_on == Some(call) {
                bail!("injected failure in {call}");
            }
            self.writes.push(format!("{call}:{detail}"));
            Ok(())
        }
    }

    impl PostRepository for RecordingSite {
        fn find_post_ids(&self, filter: &PostFilter, after_id: i64, limit: usize) -> Result<Vec<i64>> {
            self.inner.find_post_ids(filter, after_id, limit)
        }
        fn get_post(&self, id: i64) -> Result<Option<PostRecord>> {
            self.inner.get_post(id)
        }
        fn insert_post(&mut self, post: &NewPost) -> Result<i64> {
            self.record("insert_post", post.title.clone())?;
            self.inner.insert_post(post)
        }
        fn update_post(&mut self, id: i64, post: &NewPost) -> Result<()> {
            self.record("update_post", id.to_string())?;
            self.inner.update_post(id, post)
        }
        fn update_post_content(&mut self, id: i64, content: &str) -> Result<()> {
            self.record("update_post_content", id.to_string())?;
            self.inner.update_post_content(id, content)
        }
        fn get_meta(&self, post_id: i64, key: &str) -> Result<Option<String>> {
            self.inner.get_meta(post_id, key)
        }
        fn set_meta(&mut self, post_id: i64, key: &str, value: &str) -> Result<()> {
            self.record("set_meta", key.to_string())?;
            self.inner.set_meta(post_id, key, value)
        }
        fn find_post_by_meta(&self, key: &str, value: &str) -> Result<Option<i64>> {
            self.inner.find_post_by_meta(key, value)
        }
    }

    impl TermRepository for RecordingSite {
        fn ensure_term(&mut self, taxonomy: &str, name: &str) -> Result<i64> {
            self.record("ensure_term", format!("{taxonomy}/{name}"))?;
            self.inner.ensure_term(taxonomy, name)
        }
        fn set_post_terms(&mut self, post_id: i64, taxonomy: &str, term_ids: &[i64]) -> Result<()> {
            self.record("set_post_terms", taxonomy.to_string())?;
            self.inner.set_post_terms(post_id, taxonomy, term_ids)
        }
        fn get_post_terms(&self, post_id: i64, taxonomy: &str) -> Result<Vec<String>> {
            self.inner.get_post_terms(post_id, taxonomy)
        }
    }

    impl AuthorRepository for RecordingSite {
        fn find_user(&self, login_or_name: &str) -> Result<Option<AuthorRef>> {
            self.inner.find_user(login_or_name)
        }
        fn find_guest_author(&self, login_or_name: &str) -> Result<Option<AuthorRef>> {
            self.inner.find_guest_author(login_or_name)
        }
        fn create_guest_author(&mut self, display_name: &str, login: &str) -> Result<AuthorRef> {
            self.record("create_guest_author", login.to_string())?;
            self.inner.create_guest_author(display_name, login)
        }
        fn assign_coauthors(&mut self, post_id: i64, authors: &[AuthorRef]) -> Result<()> {
            self.record("assign_coauthors", authors.len().to_string())?;
            self.inner.assign_coauthors(post_id, authors)
        }
        fn get_coauthors(&self, post_id: i64) -> Result<Vec<AuthorRef>> {
            self.inner.get_coauthors(post_id)
        }
    }

    impl AttachmentRepository for RecordingSite {
        fn find_attachment_by_source(&self, source_url: &str) -> Result<Option<i64>> {
            self.inner.find_attachment_by_source(source_url)
        }
        fn find_attachment_by_hash(&self, file_hash: &str) -> Result<Option<i64>> {
            self.inner.find_attachment_by_hash(file_hash)
        }
        fn insert_attachment(&mut self, attachment: &NewAttachment) -> Result<i64> {
            self.record("insert_attachment", attachment.source_url.clone())?;
            self.inner.insert_attachment(attachment)
        }
    }

    impl RedirectRepository for RecordingSite {
        fn find_redirect(&self, source: &str) -> Result<Option<Redirect>> {
            self.inner.find_redirect(source)
        }
        fn insert_redirect(&mut self, redirect: &Redirect) -> Result<i64> {
            self.record("insert_redirect", redirect.source.clone())?;
            self.inner.insert_redirect(redirect)
        }
    }

    fn record() -> NormalizedRecord {
        NormalizedRecord {
            original_id: "legacy-7".to_string(),
            title: "Council votes".to_string(),
            slug: "council-votes".to_string(),
            date: None,
            authors: vec!["Jane Doe".to_string(), "John Smith".to_string()],
            body: "<p>Body</p>".to_string(),
            excerpt: String::new(),
            media_urls: Vec::new(),
            featured_image: None,
            categories: vec!["News".to_string(), "news".to_string()],
            tags: vec!["Council".to_string()],
            post_type: "post".to_string(),
            status: "publish".to_string(),
        }
    }

    fn request<'a>(record: &'a NormalizedRecord) -> WriteRequest<'a> {
        WriteRequest {
            record,
            content: "<!-- wp:paragraph -->\n<p>Body</p>\n<!-- /wp:paragraph -->",
            featured_image_id: Some(55),
            extra_meta: &[],
        }
    }

    #[test]
    fn writes_in_order_with_marker_last() {
        let mut site = RecordingSite::new();
        let record = record();
        let outcome = PostWriter::new(MARKER_IMPORTED, false)
            .write(&mut site, &request(&record))
            .expect("write");

        assert!(outcome.created);
        assert_eq!(outcome.authors, vec!["Jane Doe", "John Smith"]);
        let post_id = outcome.post_id.expect("post id");
        assert_eq!(site.writes.first().map(String::as_str), Some("insert_post:Council votes"));
        assert_eq!(
            site.writes.last().map(String::as_str),
            Some("set_meta:_presstool_imported")
        );
        let order = |needle: &str| {
            site.writes
                .iter()
                .position(|call| call.starts_with(needle))
                .expect("call present")
        };
        assert!(order("set_meta:original_article_id") < order("ensure_term"));
        assert!(order("set_post_terms:post_tag") < order("assign_coauthors"));
        assert!(order("assign_coauthors") < order("set_meta:_thumbnail_id"));
        assert_eq!(
            site.inner.get_post_terms(post_id, TAXONOMY_CATEGORY).expect("terms"),
            vec!["News"]
        );
        assert_eq!(
            site.inner.get_meta(post_id, META_THUMBNAIL_ID).expect("meta"),
            Some("55".to_string())
        );
    }

    #[test]
    fn second_write_updates_same_post() {
        let mut site = RecordingSite::new();
        let mut record = record();
        let writer = PostWriter::new(MARKER_IMPORTED, false);
        let first = writer.write(&mut site, &request(&record)).expect("first");
        record.title = "Council votes again".to_string();
        let second = writer.write(&mut site, &request(&record)).expect("second");

        assert_eq!(first.post_id, second.post_id);
        assert!(!second.created);
        assert_eq!(site.inner.stats().expect("stats").posts, 1);
        assert_eq!(site.inner.stats().expect("stats").guest_authors, 2);
        let post = site
            .inner
            .get_post(second.post_id.expect("id"))
            .expect("get")
            .expect("post");
        assert_eq!(post.title, "Council votes again");
    }

    #[test]
    fn failure_before_marker_leaves_post_unmarked() {
        let mut site = RecordingSite::new();
        site.fail_on = Some("assign_coauthors");
        let record = record();
        let error = PostWriter::new(MARKER_IMPORTED, false)
            .write(&mut site, &request(&record))
            .expect_err("fails");
        assert!(format!("{error:#}").contains("injected failure"));
        assert!(!site.writes.iter().any(|call| call.contains(MARKER_IMPORTED)));
        assert!(!site.writes.iter().any(|call| call.contains(META_THUMBNAIL_ID)));
    }

    #[test]
    fn dry_run_calls_no_write_methods() {
        let mut site = RecordingSite::new();
        let record = record();
        let outcome = PostWriter::new(MARKER_IMPORTED, true)
            .write(&mut site, &request(&record))
            .expect("dry run");
        assert!(outcome.dry_run);
        assert_eq!(outcome.post_id, None);
        assert!(outcome.created);
        assert!(site.writes.is_empty());
    }

    #[test]
    fn dry_run_reports_post_that_would_be_updated() {
        let mut site = RecordingSite::new();
        let record = record();
        let written = PostWriter::new(MARKER_IMPORTED, false)
            .write(&mut site, &request(&record))
            .expect("write");
        site.writes.clear();
        let planned = PostWriter::new(MARKER_IMPORTED, true)
            .write(&mut site, &request(&record))
            .expect("dry run");
        assert_eq!(planned.post_id, written.post_id);
        assert!(!planned.created);
        assert!(site.writes.is_empty());
    }
}
