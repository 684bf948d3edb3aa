use anyhow::Result;
use tracing::debug;

use crate::store::{AuthorRef, AuthorRepository};
use crate::text::{decode_entities, normalize_spaces, slugify};

const NAME_SUFFIXES: &[&str] = &["jr", "jr.", "sr", "sr.", "ii", "iii", "iv", "phd", "ph.d.", "md"];

/// Split a free-text byline into individual author names.
///
/// Handles a leading "By", commas, semicolons, pipes, `&`, `and`, `, and`,
/// and `with`. Generational suffixes stay attached to the preceding name and
/// duplicates are dropped case-insensitively, keeping first-seen order.
pub fn split_byline(byline: &str) -> Vec<String> {
    let decoded = decode_entities(byline);
    let unified = decoded.replace(['&', ';', '|', '\n'], ",");

    let mut names: Vec<String> = Vec::new();
    for part in unified.split(',') {
        let mut current: Vec<&str> = Vec::new();
        let mut pieces: Vec<String> = Vec::new();
        for word in part.split_whitespace() {
            let lower = word.to_ascii_lowercase();
            if lower == "and" || lower == "with" {
                pieces.push(current.join(" "));
                current.clear();
                continue;
            }
            if current.is_empty()
                && pieces.is_empty()
                && names.is_empty()
                && (lower == "by" || lower == "by:")
            {
                continue;
            }
            current.push(word);
        }
        pieces.push(current.join(" "));

        for piece in pieces {
            let name = normalize_name(&piece);
            if name.is_empty() {
                continue;
            }
            if NAME_SUFFIXES.contains(&name.to_ascii_lowercase().as_str())
                && let Some(previous) = names.last_mut()
            {
                previous.push_str(", ");
                previous.push_str(&name);
                continue;
            }
            names.push(name);
        }
    }

    let mut unique: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        if !unique.iter().any(|seen| seen.eq_ignore_ascii_case(&name)) {
            unique.push(name);
        }
    }
    unique
}

/// Collapse whitespace and trim separator punctuation from both ends.
pub fn normalize_name(name: &str) -> String {
    let collapsed = normalize_spaces(name);
    collapsed
        .trim_matches(|ch: char| matches!(ch, ',' | ';' | ':' | '-' | '"' | '\'') || ch.is_whitespace())
        .to_string()
}

pub fn login_from_name(name: &str) -> String {
    slugify(name)
}

/// Existing user or guest author for `name`, matched by display name or derived login.
pub fn lookup_author<R>(repo: &R, name: &str) -> Result<Option<AuthorRef>>
where
    R: AuthorRepository + ?Sized,
{
    let name = normalize_name(name);
    let login = login_from_name(&name);
    if let Some(user) = repo.find_user(&name)? {
        return Ok(Some(user));
    }
    if !login.is_empty()
        && let Some(user) = repo.find_user(&login)?
    {
        return Ok(Some(user));
    }
    if let Some(guest) = repo.find_guest_author(&name)? {
        return Ok(Some(guest));
    }
    if !login.is_empty()
        && let Some(guest) = repo.find_guest_author(&login)?
    {
        return Ok(Some(guest));
    }
    Ok(None)
}

pub fn resolve_author<R>(repo: &mut R, name: &str) -> Result<AuthorRef>
where
    R: AuthorRepository + ?Sized,
{
    if let Some(found) = lookup_author(repo, name)? {
        return Ok(found);
    }
    let display_name = normalize_name(name);
    let login = login_from_name(&display_name);
    if login.is_empty() {
        anyhow::bail!("author name {name:?} has no usable login");
    }
    debug!(author = %display_name, login = %login, "creating guest author");
    repo.create_guest_author(&display_name, &login)
}

/// Resolves every name, dropping repeats that land on the same author.
pub fn resolve_authors<R>(repo: &mut R, names: &[String]) -> Result<Vec<AuthorRef>>
where
    R: AuthorRepository + ?Sized,
{
    let mut resolved: Vec<AuthorRef> = Vec::with_capacity(names.len());
    for name in names {
        let author = resolve_author(repo, name)?;
        if !resolved
            .iter()
            .any(|seen| seen.kind == author.kind && seen.id == author.id)
        {
            resolved.push(author);
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AuthorKind, SqliteSite};

    #[test]
    fn splits_two_names_joined_by_and() {
        assert_eq!(
            split_byline("Jane Doe and John Smith"),
            vec!["Jane Doe".to_string(), "John Smith".to_string()]
        );
    }

    #[test]
    fn splits_mixed_separators() {
        assert_eq!(
            split_byline("By Ana Ruiz, Li Wei, and Sam O'Neil & Kim Park; Lee Ray with Bo Diaz"),
            vec!["Ana Ruiz", "Li Wei", "Sam O'Neil", "Kim Park", "Lee Ray", "Bo Diaz"]
        );
    }

    #[test]
    fn keeps_suffixes_and_dedupes() {
        assert_eq!(
            split_byline("Martin Luther King, Jr. and jane doe and Jane Doe"),
            vec!["Martin Luther King, Jr.", "jane doe"]
        );
    }

    #[test]
    fn names_containing_and_are_not_split() {
        assert_eq!(split_byline("by: Andrea Anderson"), vec!["Andrea Anderson"]);
        assert!(split_byline("  , and ").is_empty());
    }

    #[test]
    fn normalize_and_login() {
        assert_eq!(normalize_name("  Jane   Doe, "), "Jane Doe");
        assert_eq!(login_from_name("José Núñez"), "jose-nunez");
    }

    #[test]
    fn resolve_prefers_users_then_existing_guests() {
        let mut site = SqliteSite::open_in_memory().expect("site");
        site.insert_user("jsmith", "John Smith").expect("user");

        let user = resolve_author(&mut site, "john smith").expect("resolve user");
        assert_eq!(user.kind, AuthorKind::User);

        let created = resolve_author(&mut site, "Jane Doe").expect("create guest");
        assert_eq!(created.kind, AuthorKind::Guest);
        assert_eq!(created.login, "jane-doe");
        let again = resolve_author(&mut site, "JANE DOE").expect("reuse guest");
        assert_eq!(again.id, created.id);
        assert_eq!(site.stats().expect("stats").guest_authors, 1);
    }

    #[test]
    fn non_latin_bylines_create_guest_authors_once() {
        let mut site = SqliteSite::open_in_memory().expect("site");
        let li = resolve_author(&mut site, "李伟").expect("cjk author");
        assert_eq!(li.kind, AuthorKind::Guest);
        assert_eq!(li.login, "李伟");

        let ivan = resolve_author(&mut site, "Иван Петров").expect("cyrillic author");
        assert_eq!(ivan.login, "иван-петров");
        let again = resolve_author(&mut site, "ИВАН ПЕТРОВ").expect("reuse by login");
        assert_eq!(again.id, ivan.id);
        assert_eq!(site.stats().expect("stats").guest_authors, 2);
    }

    #[test]
    fn resolve_authors_drops_duplicates() {
        let mut site = SqliteSite::open_in_memory().expect("site");
        let resolved = resolve_authors(
            &mut site,
            &["Jane Doe".to_string(), "jane-doe".to_string(), "John Smith".to_string()],
        )
        .expect("resolve");
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].display_name, "Jane Doe");
        assert_eq!(resolved[1].display_name, "John Smith");
    }
}
