//! # External Collaborators
//!
//! Capability traits over the hosted data platform: a live change feed,
//! table queries and mutations, and object storage. The engine never talks to
//! a vendor SDK directly, so the backend is swappable.

use std::{cmp::Ordering, pin::Pin};

use async_trait::async_trait;
use futures_util::Stream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{RawChange, Table, Topic};

use crate::{
    error::{FeedError, PlatformError, StorageError},
    event::EntityType,
};

/// Stream of raw notifications for one open feed.
///
/// The stream ending, or yielding an error, means the feed disconnected.
pub type RawFeed = Pin<Box<dyn Stream<Item = Result<RawChange, FeedError>> + Send + 'static>>;

/// Live change-feed capability.
#[async_trait]
pub trait FeedProvider: Send + Sync {
    /// Opens a feed delivering changes to `entities` rows relevant to `topic`.
    ///
    /// Providers may deliver a superset (for example a whole table); the
    /// subscription manager filters by topic after normalization.
    ///
    /// # Errors
    /// Returns a [`FeedError`] if the feed cannot be established.
    async fn open(&self, topic: &Topic, entities: &[EntityType]) -> Result<RawFeed, FeedError>;

    /// Releases server-side resources held for `topic`'s feed.
    async fn close(&self, topic: &Topic);
}

/// Row predicate: equality leaves combined with AND/OR.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every row.
    All,
    /// Column equals value.
    Eq(String, Value),
    /// Every branch matches.
    And(Vec<Filter>),
    /// At least one branch matches.
    Or(Vec<Filter>),
}

impl Filter {
    /// Column equality leaf.
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(column.into(), value.into())
    }

    /// Conjunction.
    #[must_use]
    pub const fn and(filters: Vec<Filter>) -> Self {
        Self::And(filters)
    }

    /// Disjunction.
    #[must_use]
    pub const fn or(filters: Vec<Filter>) -> Self {
        Self::Or(filters)
    }

    /// Evaluates the predicate against a JSON row.
    #[must_use]
    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Self::All => true,
            Self::Eq(column, expected) => row.get(column) == Some(expected),
            Self::And(filters) => filters.iter().all(|filter| filter.matches(row)),
            Self::Or(filters) => filters.iter().any(|filter| filter.matches(row)),
        }
    }
}

/// Sort order for a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    /// Column to sort on.
    pub column: String,
    /// Ascending when true.
    pub ascending: bool,
}

impl Order {
    /// Compares two rows on the order column.
    #[must_use]
    pub fn compare(&self, left: &Value, right: &Value) -> Ordering {
        let ordering = compare_values(left.get(&self.column), right.get(&self.column));
        if self.ascending {
            ordering
        } else {
            ordering.reverse()
        }
    }
}

fn compare_values(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    match (left, right) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

/// Read query against one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Table to read.
    pub table: Table,
    /// Row predicate.
    pub filter: Filter,
    /// Optional ordering.
    pub order: Option<Order>,
    /// Optional row cap.
    pub limit: Option<usize>,
}

impl Query {
    /// Selects every row of `table`.
    #[must_use]
    pub const fn from(table: Table) -> Self {
        Self {
            table,
            filter: Filter::All,
            order: None,
            limit: None,
        }
    }

    /// Restricts rows to `filter`.
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Sorts on `column`.
    #[must_use]
    pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.into(),
            ascending,
        });
        self
    }

    /// Caps the number of rows returned.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Query/mutate capability over named tables.
#[async_trait]
pub trait DataPlatform: Send + Sync {
    /// Returns matching rows.
    ///
    /// # Errors
    /// Returns a [`PlatformError`] when the backend rejects the query.
    async fn select(&self, query: &Query) -> Result<Vec<Value>, PlatformError>;

    /// Counts matching rows without returning them.
    ///
    /// # Errors
    /// Returns a [`PlatformError`] when the backend rejects the query.
    async fn count(&self, query: &Query) -> Result<u64, PlatformError>;

    /// Inserts a row and returns it as stored (with server-assigned columns).
    ///
    /// # Errors
    /// Returns a [`PlatformError`] when the insert fails.
    async fn insert(&self, table: Table, row: Value) -> Result<Value, PlatformError>;

    /// Merges `changes` into every matching row, returning how many changed.
    ///
    /// # Errors
    /// Returns a [`PlatformError`] when the update fails.
    async fn update(&self, table: Table, filter: &Filter, changes: Value)
    -> Result<u64, PlatformError>;

    /// Deletes matching rows, returning how many were removed.
    ///
    /// # Errors
    /// Returns a [`PlatformError`] when the delete fails.
    async fn delete(&self, table: Table, filter: &Filter) -> Result<u64, PlatformError>;

    /// Invokes a stored procedure.
    ///
    /// # Errors
    /// Returns a [`PlatformError`] when the procedure fails or is unknown.
    async fn rpc(&self, name: &str, args: Value) -> Result<Value, PlatformError>;
}

/// Runs `query` and decodes every row as `T`.
///
/// # Errors
/// Returns a [`PlatformError`] if the query fails or a row does not decode.
pub async fn select_as<T, P>(platform: &P, query: &Query) -> Result<Vec<T>, PlatformError>
where
    T: DeserializeOwned,
    P: DataPlatform + ?Sized,
{
    platform
        .select(query)
        .await?
        .into_iter()
        .map(|row| serde_json::from_value(row).map_err(|err| PlatformError::decode(query.table, &err)))
        .collect()
}

/// Binary object storage addressed by bucket and path.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Stores `bytes` at `path`.
    ///
    /// # Errors
    /// Returns a [`StorageError`] when the upload fails.
    async fn upload(&self, bucket: &str, path: &str, bytes: Vec<u8>) -> Result<(), StorageError>;

    /// Fetches the blob at `path`.
    ///
    /// # Errors
    /// Returns [`StorageError::NotFound`] for unknown paths.
    async fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Removes the blobs at `paths`.
    ///
    /// # Errors
    /// Returns a [`StorageError`] when removal fails.
    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<(), StorageError>;
}
