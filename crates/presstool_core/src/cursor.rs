use anyhow::{Result, bail};

use crate::store::{PostFilter, PostRepository};

/// Keyset-paginated walk over post ids matching a filter.
///
/// Each page asks for ids strictly greater than the last one seen, so rows
/// inserted or marked between pages never cause a skip or a repeat. The
/// cursor does not hold the repository, leaving callers free to write
/// between pages.
#[derive(Debug, Clone)]
pub struct BatchCursor {
    filter: PostFilter,
    page_size: usize,
    last_seen: i64,
    remaining: Option<usize>,
    finished: bool,
}

impl BatchCursor {
    pub fn new(filter: PostFilter, page_size: usize) -> Result<Self> {
        if page_size == 0 {
            bail!("batch size must be at least 1");
        }
        Ok(Self {
            filter,
            page_size,
            last_seen: 0,
            remaining: None,
            finished: false,
        })
    }

    /// Resume after `id` instead of from the start.
    pub fn starting_after(mut self, id: i64) -> Self {
        self.last_seen = id.max(0);
        self
    }

    /// Stop after yielding `limit` ids in total.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.remaining = limit;
        self
    }

    pub fn last_seen(&self) -> i64 {
        self.last_seen
    }

    pub fn filter(&self) -> &PostFilter {
        &self.filter
    }

    /// Next page of ids, `None` when exhausted. A failed page ends the walk.
    pub fn next_page<R>(&mut self, repo: &R) -> Option<Result<Vec<i64>>>
    where
        R: PostRepository + ?Sized,
    {
        if self.finished {
            return None;
        }
        let request = match self.remaining {
            Some(0) => {
                self.finished = true;
                return None;
            }
            Some(remaining) => remaining.min(self.page_size),
            None => self.page_size,
        };

        match repo.find_post_ids(&self.filter, self.last_seen, request) {
            Ok(ids) => {
                if ids.len() < request {
                    self.finished = true;
                }
                if ids.is_empty() {
                    return None;
                }
                if let Some(last) = ids.last() {
                    self.last_seen = *last;
                }
                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining = remaining.saturating_sub(ids.len());
                }
                Some(Ok(ids))
            }
            Err(error) => {
                self.finished = true;
                Some(Err(error.context(format!(
                    "failed to fetch batch after post id {}",
                    self.last_seen
                ))))
            }
        }
    }

    /// Borrowing iterator for read-only walks.
    pub fn pages<'a, R>(&'a mut self, repo: &'a R) -> Pages<'a, R>
    where
        R: PostRepository + ?Sized,
    {
        Pages { cursor: self, repo }
    }
}

pub struct Pages<'a, R: ?Sized> {
    cursor: &'a mut BatchCursor,
    repo: &'a R,
}

impl<R> Iterator for Pages<'_, R>
where
    R: PostRepository + ?Sized,
{
    type Item = Result<Vec<i64>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.next_page(self.repo)
    }
}
