use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::Serialize;

use crate::migrate::{ensure_schema_current, open_site_connection, run_migrations_on};
use crate::runtime::ResolvedPaths;
use crate::text::slugify;

pub const ATTACHMENT_POST_TYPE: &str = "attachment";
pub const META_SOURCE_URL: &str = "_presstool_source_url";
pub const META_FILE_HASH: &str = "_presstool_file_hash";
pub const META_ATTACHED_FILE: &str = "_wp_attached_file";
pub const META_MIME_TYPE: &str = "_presstool_mime_type";
pub const META_THUMBNAIL_ID: &str = "_thumbnail_id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostRecord {
    pub id: i64,
    pub post_type: String,
    pub status: String,
    pub title: String,
    pub slug: String,
    pub content: String,
    pub excerpt: String,
    pub published_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewPost {
    pub post_type: String,
    pub status: String,
    pub title: String,
    pub slug: String,
    pub content: String,
    pub excerpt: String,
    pub published_at: Option<String>,
}

/// Candidate selection for batch iteration. Empty lists mean "any".
#[derive(Debug, Clone, Default)]
pub struct PostFilter {
    pub post_types: Vec<String>,
    pub statuses: Vec<String>,
    pub missing_meta_key: Option<String>,
    pub present_meta_key: Option<String>,
    pub content_contains: Vec<String>,
    pub post_id: Option<i64>,
    pub min_post_id: Option<i64>,
    pub max_post_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorKind {
    User,
    Guest,
}

impl AuthorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Guest => "guest",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "guest" => Some(Self::Guest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorRef {
    pub kind: AuthorKind,
    pub id: i64,
    pub login: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttachment {
    pub title: String,
    pub source_url: String,
    pub relative_file: String,
    pub mime_type: String,
    pub file_hash: String,
    pub parent_post_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Redirect {
    pub source: String,
    pub target: String,
    pub status_code: u16,
}

pub trait PostRepository {
    /// Ids matching `filter` with `id > after_id`, ascending, at most `limit`.
    fn find_post_ids(&self, filter: &PostFilter, after_id: i64, limit: usize) -> Result<Vec<i64>>;
    fn get_post(&self, id: i64) -> Result<Option<PostRecord>>;
    fn insert_post(&mut self, post: &NewPost) -> Result<i64>;
    fn update_post(&mut self, id: i64, post: &NewPost) -> Result<()>;
    fn update_post_content(&mut self, id: i64, content: &str) -> Result<()>;
    fn get_meta(&self, post_id: i64, key: &str) -> Result<Option<String>>;
    fn set_meta(&mut self, post_id: i64, key: &str, value: &str) -> Result<()>;
    fn find_post_by_meta(&self, key: &str, value: &str) -> Result<Option<i64>>;
}

pub trait TermRepository {
    fn ensure_term(&mut self, taxonomy: &str, name: &str) -> Result<i64>;
    fn set_post_terms(&mut self, post_id: i64, taxonomy: &str, term_ids: &[i64]) -> Result<()>;
    fn get_post_terms(&self, post_id: i64, taxonomy: &str) -> Result<Vec<String>>;
}

pub trait AuthorRepository {
    /// Match by exact login or case-insensitive display name.
    fn find_user(&self, login_or_name: &str) -> Result<Option<AuthorRef>>;
    fn find_guest_author(&self, login_or_name: &str) -> Result<Option<AuthorRef>>;
    fn create_guest_author(&mut self, display_name: &str, login: &str) -> Result<AuthorRef>;
    fn assign_coauthors(&mut self, post_id: i64, authors: &[AuthorRef]) -> Result<()>;
    fn get_coauthors(&self, post_id: i64) -> Result<Vec<AuthorRef>>;
}

pub trait AttachmentRepository {
    fn find_attachment_by_source(&self, source_url: &str) -> Result<Option<i64>>;
    fn find_attachment_by_hash(&self, file_hash: &str) -> Result<Option<i64>>;
    fn insert_attachment(&mut self, attachment: &NewAttachment) -> Result<i64>;
}

pub trait RedirectRepository {
    fn find_redirect(&self, source: &str) -> Result<Option<Redirect>>;
    fn insert_redirect(&mut self, redirect: &Redirect) -> Result<i64>;
}

/// Everything a migration command writes through.
pub trait SiteStore:
    PostRepository + TermRepository + AuthorRepository + AttachmentRepository + RedirectRepository
{
}

impl<T> SiteStore for T where
    T: PostRepository + TermRepository + AuthorRepository + AttachmentRepository + RedirectRepository
{
}

/// WordPress-shaped site database kept in SQLite.
pub struct SqliteSite {
    connection: Connection,
}

impl SqliteSite {
    /// Open the project's site database; fails when schema migrations are pending.
    pub fn open(paths: &ResolvedPaths) -> Result<Self> {
        ensure_schema_current(paths)?;
        let connection = open_site_connection(&paths.db_path)?;
        Ok(Self { connection })
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory().context("failed to open in-memory db")?;
        connection
            .pragma_update(None, "foreign_keys", "ON")
            .context("failed to enable foreign_keys pragma")?;
        run_migrations_on(&connection)?;
        Ok(Self { connection })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn stats(&self) -> Result<SiteStats> {
        Ok(SiteStats {
            posts: count_query(
                &self.connection,
                "SELECT COUNT(*) FROM posts WHERE post_type <> 'attachment'",
            )?,
            attachments: count_query(
                &self.connection,
                "SELECT COUNT(*) FROM posts WHERE post_type = 'attachment'",
            )?,
            terms: count_query(&self.connection, "SELECT COUNT(*) FROM terms")?,
            users: count_query(&self.connection, "SELECT COUNT(*) FROM users")?,
            guest_authors: count_query(&self.connection, "SELECT COUNT(*) FROM guest_authors")?,
            redirects: count_query(&self.connection, "SELECT COUNT(*) FROM redirects")?,
        })
    }

    /// Registers a login-capable user. Migrations never create users; this seeds lookups.
    pub fn insert_user(&mut self, login: &str, display_name: &str) -> Result<i64> {
        self.connection
            .execute(
                "INSERT INTO users (login, display_name) VALUES (?1, ?2)",
                params![login, display_name],
            )
            .with_context(|| format!("failed to insert user {login}"))?;
        Ok(self.connection.last_insert_rowid())
    }

    fn find_author_in(&self, table: &str, kind: AuthorKind, needle: &str) -> Result<Option<AuthorRef>> {
        let sql = format!(
            "SELECT id, login, display_name FROM {table}
             WHERE login = ?1 OR display_name = ?2 COLLATE NOCASE
             ORDER BY id LIMIT 1"
        );
        let needle = needle.trim();
        self.connection
            .query_row(&sql, params![needle, needle], |row| {
                Ok(AuthorRef {
                    kind,
                    id: row.get(0)?,
                    login: row.get(1)?,
                    display_name: row.get(2)?,
                })
            })
            .optional()
            .with_context(|| format!("failed to look up author {needle} in {table}"))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SiteStats {
    pub posts: usize,
    pub attachments: usize,
    pub terms: usize,
    pub users: usize,
    pub guest_authors: usize,
    pub redirects: usize,
}

impl PostRepository for SqliteSite {
    fn find_post_ids(&self, filter: &PostFilter, after_id: i64, limit: usize) -> Result<Vec<i64>> {
        let mut clauses = vec!["p.id > ?".to_string()];
        let mut values = vec![SqlValue::Integer(after_id)];

        if !filter.post_types.is_empty() {
            clauses.push(format!("p.post_type IN ({})", placeholders(filter.post_types.len())));
            values.extend(filter.post_types.iter().cloned().map(SqlValue::Text));
        } else {
            clauses.push("p.post_type <> 'attachment'".to_string());
        }
        if !filter.statuses.is_empty() {
            clauses.push(format!("p.status IN ({})", placeholders(filter.statuses.len())));
            values.extend(filter.statuses.iter().cloned().map(SqlValue::Text));
        }
        if let Some(key) = &filter.missing_meta_key {
            clauses.push(
                "NOT EXISTS (SELECT 1 FROM postmeta m WHERE m.post_id = p.id AND m.meta_key = ?)"
                    .to_string(),
            );
            values.push(SqlValue::Text(key.clone()));
        }
        if let Some(key) = &filter.present_meta_key {
            clauses.push(
                "EXISTS (SELECT 1 FROM postmeta m WHERE m.post_id = p.id AND m.meta_key = ?)"
                    .to_string(),
            );
            values.push(SqlValue::Text(key.clone()));
        }
        if !filter.content_contains.is_empty() {
            let any = filter
                .content_contains
                .iter()
                .map(|_| "instr(p.content, ?) > 0")
                .collect::<Vec<_>>()
                .join(" OR ");
            clauses.push(format!("({any})"));
            values.extend(filter.content_contains.iter().cloned().map(SqlValue::Text));
        }
        if let Some(id) = filter.post_id {
            clauses.push("p.id = ?".to_string());
            values.push(SqlValue::Integer(id));
        }
        if let Some(id) = filter.min_post_id {
            clauses.push("p.id >= ?".to_string());
            values.push(SqlValue::Integer(id));
        }
        if let Some(id) = filter.max_post_id {
            clauses.push("p.id <= ?".to_string());
            values.push(SqlValue::Integer(id));
        }
        values.push(SqlValue::Integer(
            i64::try_from(limit).context("page size does not fit into i64")?,
        ));

        let sql = format!(
            "SELECT p.id FROM posts p WHERE {} ORDER BY p.id ASC LIMIT ?",
            clauses.join(" AND ")
        );
        let mut statement = self
            .connection
            .prepare(&sql)
            .context("failed to prepare post id query")?;
        let rows = statement
            .query_map(params_from_iter(values.iter()), |row| row.get::<_, i64>(0))
            .context("failed to run post id query")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("failed to decode post id")?);
        }
        Ok(ids)
    }

    fn get_post(&self, id: i64) -> Result<Option<PostRecord>> {
        self.connection
            .query_row(
                "SELECT id, post_type, status, title, slug, content, excerpt, published_at
                 FROM posts WHERE id = ?1",
                [id],
                |row| {
                    Ok(PostRecord {
                        id: row.get(0)?,
                        post_type: row.get(1)?,
                        status: row.get(2)?,
                        title: row.get(3)?,
                        slug: row.get(4)?,
                        content: row.get(5)?,
                        excerpt: row.get(6)?,
                        published_at: row.get(7)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to load post {id}"))
    }

    fn insert_post(&mut self, post: &NewPost) -> Result<i64> {
        let now = unix_timestamp()?;
        self.connection
            .execute(
                "INSERT INTO posts (
                    post_type, status, title, slug, content, excerpt, published_at, modified_at_unix
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    post.post_type,
                    post.status,
                    post.title,
                    post.slug,
                    post.content,
                    post.excerpt,
                    post.published_at,
                    now
                ],
            )
            .with_context(|| format!("failed to insert post {}", post.title))?;
        Ok(self.connection.last_insert_rowid())
    }

    fn update_post(&mut self, id: i64, post: &NewPost) -> Result<()> {
        let now = unix_timestamp()?;
        let affected = self
            .connection
            .execute(
                "UPDATE posts SET post_type = ?1, status = ?2, title = ?3, slug = ?4,
                    content = ?5, excerpt = ?6, published_at = ?7, modified_at_unix = ?8
                 WHERE id = ?9",
                params![
                    post.post_type,
                    post.status,
                    post.title,
                    post.slug,
                    post.content,
                    post.excerpt,
                    post.published_at,
                    now,
                    id
                ],
            )
            .with_context(|| format!("failed to update post {id}"))?;
        if affected == 0 {
            bail!("post {id} not found for update");
        }
        Ok(())
    }

    fn update_post_content(&mut self, id: i64, content: &str) -> Result<()> {
        let now = unix_timestamp()?;
        let affected = self
            .connection
            .execute(
                "UPDATE posts SET content = ?1, modified_at_unix = ?2 WHERE id = ?3",
                params![content, now, id],
            )
            .with_context(|| format!("failed to update content of post {id}"))?;
        if affected == 0 {
            bail!("post {id} not found for content update");
        }
        Ok(())
    }

    fn get_meta(&self, post_id: i64, key: &str) -> Result<Option<String>> {
        self.connection
            .query_row(
                "SELECT meta_value FROM postmeta WHERE post_id = ?1 AND meta_key = ?2",
                params![post_id, key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read meta {key} of post {post_id}"))
    }

    fn set_meta(&mut self, post_id: i64, key: &str, value: &str) -> Result<()> {
        self.connection
            .execute(
                "INSERT INTO postmeta (post_id, meta_key, meta_value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(post_id, meta_key) DO UPDATE SET meta_value = excluded.meta_value",
                params![post_id, key, value],
            )
            .with_context(|| format!("failed to set meta {key} on post {post_id}"))?;
        Ok(())
    }

    fn find_post_by_meta(&self, key: &str, value: &str) -> Result<Option<i64>> {
        self.connection
            .query_row(
                "SELECT post_id FROM postmeta WHERE meta_key = ?1 AND meta_value = ?2
                 ORDER BY post_id LIMIT 1",
                params![key, value],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to look up post by meta {key}"))
    }
}

impl TermRepository for SqliteSite {
    fn ensure_term(&mut self, taxonomy: &str, name: &str) -> Result<i64> {
        let name = name.trim();
        let slug = slugify(name);
        if slug.is_empty() {
            bail!("term name produces an empty slug: {name:?}");
        }
        let existing = self
            .connection
            .query_row(
                "SELECT id FROM terms WHERE taxonomy = ?1 AND slug = ?2",
                params![taxonomy, slug],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .with_context(|| format!("failed to look up term {taxonomy}/{slug}"))?;
        if let Some(id) = existing {
            return Ok(id);
        }
        self.connection
            .execute(
                "INSERT INTO terms (taxonomy, name, slug) VALUES (?1, ?2, ?3)",
                params![taxonomy, name, slug],
            )
            .with_context(|| format!("failed to insert term {taxonomy}/{slug}"))?;
        Ok(self.connection.last_insert_rowid())
    }

    fn set_post_terms(&mut self, post_id: i64, taxonomy: &str, term_ids: &[i64]) -> Result<()> {
        self.connection
            .execute(
                "DELETE FROM term_relationships WHERE post_id = ?1
                 AND term_id IN (SELECT id FROM terms WHERE taxonomy = ?2)",
                params![post_id, taxonomy],
            )
            .with_context(|| format!("failed to clear {taxonomy} terms of post {post_id}"))?;
        for term_id in term_ids {
            self.connection
                .execute(
                    "INSERT OR IGNORE INTO term_relationships (post_id, term_id) VALUES (?1, ?2)",
                    params![post_id, term_id],
                )
                .with_context(|| format!("failed to attach term {term_id} to post {post_id}"))?;
        }
        Ok(())
    }

    fn get_post_terms(&self, post_id: i64, taxonomy: &str) -> Result<Vec<String>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT t.name FROM terms t
                 JOIN term_relationships r ON r.term_id = t.id
                 WHERE r.post_id = ?1 AND t.taxonomy = ?2
                 ORDER BY t.id",
            )
            .context("failed to prepare post terms query")?;
        let rows = statement
            .query_map(params![post_id, taxonomy], |row| row.get::<_, String>(0))
            .context("failed to run post terms query")?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row.context("failed to decode term name")?);
        }
        Ok(names)
    }
}

impl AuthorRepository for SqliteSite {
    fn find_user(&self, login_or_name: &str) -> Result<Option<AuthorRef>> {
        self.find_author_in("users", AuthorKind::User, login_or_name)
    }

    fn find_guest_author(&self, login_or_name: &str) -> Result<Option<AuthorRef>> {
        self.find_author_in("guest_authors", AuthorKind::Guest, login_or_name)
    }

    fn create_guest_author(&mut self, display_name: &str, login: &str) -> Result<AuthorRef> {
        self.connection
            .execute(
                "INSERT INTO guest_authors (login, display_name) VALUES (?1, ?2)",
                params![login, display_name],
            )
            .with_context(|| format!("failed to create guest author {display_name}"))?;
        Ok(AuthorRef {
            kind: AuthorKind::Guest,
            id: self.connection.last_insert_rowid(),
            login: login.to_string(),
            display_name: display_name.to_string(),
        })
    }

    fn assign_coauthors(&mut self, post_id: i64, authors: &[AuthorRef]) -> Result<()> {
        self.connection
            .execute("DELETE FROM post_authors WHERE post_id = ?1", [post_id])
            .with_context(|| format!("failed to clear authors of post {post_id}"))?;
        for (position, author) in authors.iter().enumerate() {
            self.connection
                .execute(
                    "INSERT INTO post_authors (post_id, position, author_kind, author_id)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        post_id,
                        i64::try_from(position).context("author position does not fit into i64")?,
                        author.kind.as_str(),
                        author.id
                    ],
                )
                .with_context(|| format!("failed to assign author to post {post_id}"))?;
        }
        Ok(())
    }

    fn get_coauthors(&self, post_id: i64) -> Result<Vec<AuthorRef>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT a.author_kind, a.author_id,
                        COALESCE(u.login, g.login), COALESCE(u.display_name, g.display_name)
                 FROM post_authors a
                 LEFT JOIN users u ON a.author_kind = 'user' AND u.id = a.author_id
                 LEFT JOIN guest_authors g ON a.author_kind = 'guest' AND g.id = a.author_id
                 WHERE a.post_id = ?1
                 ORDER BY a.position",
            )
            .context("failed to prepare coauthor query")?;
        let rows = statement
            .query_map([post_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })
            .context("failed to run coauthor query")?;
        let mut authors = Vec::new();
        for row in rows {
            let (kind, id, login, display_name) = row.context("failed to decode coauthor row")?;
            let kind = AuthorKind::parse(&kind)
                .ok_or_else(|| anyhow::anyhow!("unknown author kind {kind} on post {post_id}"))?;
            authors.push(AuthorRef {
                kind,
                id,
                login: login.unwrap_or_default(),
                display_name: display_name.unwrap_or_default(),
            });
        }
        Ok(authors)
    }
}

impl AttachmentRepository for SqliteSite {
    fn find_attachment_by_source(&self, source_url: &str) -> Result<Option<i64>> {
        self.find_post_by_meta(META_SOURCE_URL, source_url)
    }

    fn find_attachment_by_hash(&self, file_hash: &str) -> Result<Option<i64>> {
        self.find_post_by_meta(META_FILE_HASH, file_hash)
    }

    fn insert_attachment(&mut self, attachment: &NewAttachment) -> Result<i64> {
        let id = self.insert_post(&NewPost {
            post_type: ATTACHMENT_POST_TYPE.to_string(),
            status: "inherit".to_string(),
            title: attachment.title.clone(),
            slug: slugify(&attachment.title),
            ..NewPost::default()
        })?;
        self.set_meta(id, META_SOURCE_URL, &attachment.source_url)?;
        self.set_meta(id, META_FILE_HASH, &attachment.file_hash)?;
        self.set_meta(id, META_ATTACHED_FILE, &attachment.relative_file)?;
        self.set_meta(id, META_MIME_TYPE, &attachment.mime_type)?;
        if let Some(parent) = attachment.parent_post_id {
            self.set_meta(id, "_presstool_parent_post", &parent.to_string())?;
        }
        Ok(id)
    }
}

impl RedirectRepository for SqliteSite {
    fn find_redirect(&self, source: &str) -> Result<Option<Redirect>> {
        self.connection
            .query_row(
                "SELECT source, target, status_code FROM redirects WHERE source = ?1",
                [source],
                |row| {
                    Ok(Redirect {
                        source: row.get(0)?,
                        target: row.get(1)?,
                        status_code: row.get(2)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to look up redirect {source}"))
    }

    fn insert_redirect(&mut self, redirect: &Redirect) -> Result<i64> {
        let now = unix_timestamp()?;
        self.connection
            .execute(
                "INSERT INTO redirects (source, target, status_code, created_at_unix)
                 VALUES (?1, ?2, ?3, ?4)",
                params![redirect.source, redirect.target, redirect.status_code, now],
            )
            .with_context(|| format!("failed to insert redirect {}", redirect.source))?;
        Ok(self.connection.last_insert_rowid())
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn count_query(connection: &Connection, sql: &str) -> Result<usize> {
    let count: i64 = connection
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed to run count query: {sql}"))?;
    usize::try_from(count).context("count does not fit into usize")
}

fn unix_timestamp() -> Result<i64> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock error")?
        .as_secs();
    i64::try_from(seconds).context("timestamp does not fit into i64")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(title: &str, content: &str) -> NewPost {
        NewPost {
            post_type: "post".to_string(),
            status: "publish".to_string(),
            title: title.to_string(),
            slug: slugify(title),
            content: content.to_string(),
            ..NewPost::default()
        }
    }

    #[test]
    fn find_post_ids_is_keyset_ordered_and_filters_markers() {
        let mut site = SqliteSite::open_in_memory().expect("site");
        let mut ids = Vec::new();
        for index in 0..5 {
            ids.push(
                site.insert_post(&post(&format!("Story {index}"), "[gallery ids=1]"))
                    .expect("insert"),
            );
        }
        site.set_meta(ids[1], "_done", "1").expect("meta");

        let filter = PostFilter {
            missing_meta_key: Some("_done".to_string()),
            ..PostFilter::default()
        };
        let first = site.find_post_ids(&filter, 0, 2).expect("page 1");
        assert_eq!(first, vec![ids[0], ids[2]]);
        let second = site.find_post_ids(&filter, ids[2], 2).expect("page 2");
        assert_eq!(second, vec![ids[3], ids[4]]);
        assert!(site.find_post_ids(&filter, ids[4], 2).expect("page 3").is_empty());
    }

    #[test]
    fn find_post_ids_respects_content_and_bounds() {
        let mut site = SqliteSite::open_in_memory().expect("site");
        let a = site.insert_post(&post("A", "plain")).expect("a");
        let b = site.insert_post(&post("B", "has [gallery ids=2]")).expect("b");
        let c = site.insert_post(&post("C", "has [caption]x[/caption]")).expect("c");

        let filter = PostFilter {
            content_contains: vec!["[gallery".to_string(), "[caption".to_string()],
            min_post_id: Some(a),
            ..PostFilter::default()
        };
        assert_eq!(site.find_post_ids(&filter, 0, 10).expect("ids"), vec![b, c]);

        let single = PostFilter {
            post_id: Some(c),
            ..PostFilter::default()
        };
        assert_eq!(site.find_post_ids(&single, 0, 10).expect("ids"), vec![c]);
    }

    #[test]
    fn meta_upserts_and_lookups() {
        let mut site = SqliteSite::open_in_memory().expect("site");
        let id = site.insert_post(&post("A", "")).expect("insert");
        site.set_meta(id, "original_article_id", "legacy-1").expect("meta");
        site.set_meta(id, "original_article_id", "legacy-2").expect("meta again");
        assert_eq!(
            site.get_meta(id, "original_article_id").expect("get").as_deref(),
            Some("legacy-2")
        );
        assert_eq!(
            site.find_post_by_meta("original_article_id", "legacy-2").expect("find"),
            Some(id)
        );
        assert_eq!(
            site.find_post_by_meta("original_article_id", "legacy-1").expect("find"),
            None
        );
    }

    #[test]
    fn non_latin_term_names_get_unicode_slugs() {
        let mut site = SqliteSite::open_in_memory().expect("site");
        let news = site.ensure_term("category", "Новости").expect("cyrillic term");
        let again = site.ensure_term("category", " новости ").expect("same slug");
        assert_eq!(news, again);
        let tag = site.ensure_term("post_tag", "北京").expect("cjk term");
        assert_ne!(tag, news);
        assert!(site.ensure_term("category", "!!!").is_err());
    }

    #[test]
    fn terms_are_deduplicated_by_slug() {
        let mut site = SqliteSite::open_in_memory().expect("site");
        let id = site.insert_post(&post("A", "")).expect("insert");
        let local = site.ensure_term("category", "Local News").expect("term");
        let again = site.ensure_term("category", "local news").expect("term");
        assert_eq!(local, again);
        let politics = site.ensure_term("category", "Politics").expect("term");
        site.set_post_terms(id, "category", &[local, politics]).expect("set");
        assert_eq!(
            site.get_post_terms(id, "category").expect("terms"),
            vec!["Local News".to_string(), "Politics".to_string()]
        );
        site.set_post_terms(id, "category", &[politics]).expect("replace");
        assert_eq!(
            site.get_post_terms(id, "category").expect("terms"),
            vec!["Politics".to_string()]
        );
    }

    #[test]
    fn coauthors_keep_assignment_order() {
        let mut site = SqliteSite::open_in_memory().expect("site");
        let id = site.insert_post(&post("A", "")).expect("insert");
        let user_id = site.insert_user("jsmith", "John Smith").expect("user");
        let user = site.find_user("john smith").expect("find").expect("present");
        assert_eq!(user.id, user_id);
        let guest = site.create_guest_author("Jane Doe", "jane-doe").expect("guest");
        site.assign_coauthors(id, &[guest.clone(), user.clone()])
            .expect("assign");
        let authors = site.get_coauthors(id).expect("authors");
        assert_eq!(authors, vec![guest, user]);
    }

    #[test]
    fn attachments_are_found_by_source_and_hash() {
        let mut site = SqliteSite::open_in_memory().expect("site");
        let id = site
            .insert_attachment(&NewAttachment {
                title: "photo.jpg".to_string(),
                source_url: "https://legacy.example/photo.jpg".to_string(),
                relative_file: "2024/05/abcd-photo.jpg".to_string(),
                mime_type: "image/jpeg".to_string(),
                file_hash: "abcd".to_string(),
                parent_post_id: None,
            })
            .expect("insert attachment");
        assert_eq!(
            site.find_attachment_by_source("https://legacy.example/photo.jpg")
                .expect("by source"),
            Some(id)
        );
        assert_eq!(site.find_attachment_by_hash("abcd").expect("by hash"), Some(id));
        assert_eq!(site.stats().expect("stats").attachments, 1);
        assert_eq!(site.stats().expect("stats").posts, 0);
    }

    #[test]
    fn redirects_round_trip() {
        let mut site = SqliteSite::open_in_memory().expect("site");
        site.insert_redirect(&Redirect {
            source: "/old/story".to_string(),
            target: "/new/story".to_string(),
            status_code: 301,
        })
        .expect("insert");
        let found = site.find_redirect("/old/story").expect("find").expect("present");
        assert_eq!(found.target, "/new/story");
        assert!(
            site.insert_redirect(&Redirect {
                source: "/old/story".to_string(),
                target: "/other".to_string(),
                status_code: 302,
            })
            .is_err()
        );
    }
}
