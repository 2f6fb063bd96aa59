//! Declarative job filters and keyset pagination.
//!
//! [`JobFilter`] is the only query surface the public API exposes; it
//! compiles to a store query document so callers never hand-write BSON.
//! Pages are keyset-based over `(createdAt, _id)` with opaque cursors
//! (see [`crate::cursor`]) rather than offsets, so a page stays stable
//! while the collection churns underneath it.

use chrono::{DateTime, Utc};
use mongodb::bson::{doc, DateTime as BsonDateTime, Document};

use crate::job::{Job, JobStatus};

/// Default page size for [`Page`].
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Upper bound on a single page, regardless of what the caller asks for.
pub const MAX_PAGE_SIZE: usize = 500;

/// Status predicate: a single status or any of a set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusSelector {
    One(JobStatus),
    Any(Vec<JobStatus>),
}

impl From<JobStatus> for StatusSelector {
    fn from(status: JobStatus) -> Self {
        StatusSelector::One(status)
    }
}

impl From<Vec<JobStatus>> for StatusSelector {
    fn from(statuses: Vec<JobStatus>) -> Self {
        StatusSelector::Any(statuses)
    }
}

/// A declarative filter over the jobs collection.
///
/// All fields are optional and combine conjunctively. The empty filter
/// compiles to the empty query and matches everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Exact handler name.
    pub name: Option<String>,
    /// Status predicate.
    pub status: Option<StatusSelector>,
    /// Strictly older than this instant (`createdAt < t`).
    pub older_than: Option<DateTime<Utc>>,
    /// Strictly newer than this instant (`createdAt > t`).
    pub newer_than: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<StatusSelector>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn older_than(mut self, instant: DateTime<Utc>) -> Self {
        self.older_than = Some(instant);
        self
    }

    pub fn newer_than(mut self, instant: DateTime<Utc>) -> Self {
        self.newer_than = Some(instant);
        self
    }

    /// Compile the filter into a store query document.
    pub fn to_query(&self) -> Document {
        let mut query = Document::new();

        if let Some(name) = &self.name {
            query.insert("name", name.clone());
        }

        match &self.status {
            Some(StatusSelector::One(status)) => {
                query.insert("status", status.as_str());
            }
            Some(StatusSelector::Any(statuses)) => {
                let set: Vec<&str> = statuses.iter().map(JobStatus::as_str).collect();
                query.insert("status", doc! { "$in": set });
            }
            None => {}
        }

        let mut created_at = Document::new();
        if let Some(older) = self.older_than {
            created_at.insert("$lt", BsonDateTime::from_chrono(older));
        }
        if let Some(newer) = self.newer_than {
            created_at.insert("$gt", BsonDateTime::from_chrono(newer));
        }
        if !created_at.is_empty() {
            query.insert("createdAt", created_at);
        }

        query
    }
}

/// A page request: a size and an optional cursor from a previous page.
#[derive(Debug, Clone)]
pub struct Page {
    /// Requested page size; clamped to [1, [`MAX_PAGE_SIZE`]].
    pub limit: usize,
    /// Opaque cursor from a previous [`JobPage`]. `None` starts from the
    /// beginning.
    pub cursor: Option<String>,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            cursor: None,
        }
    }
}

impl Page {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            cursor: None,
        }
    }

    pub fn with_cursor(limit: usize, cursor: impl Into<String>) -> Self {
        Self {
            limit,
            cursor: Some(cursor.into()),
        }
    }

    pub(crate) fn clamped_limit(&self) -> usize {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }
}

/// One page of query results.
#[derive(Debug, Clone)]
pub struct JobPage {
    /// The jobs, in ascending `(createdAt, id)` order.
    pub jobs: Vec<Job>,
    /// Cursor continuing past the last job, when more exist.
    pub next_cursor: Option<String>,
    /// Cursor continuing before the first job, when this page did not
    /// start at the beginning.
    pub prev_cursor: Option<String>,
}
