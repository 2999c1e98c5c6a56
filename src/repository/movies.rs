//! Movie loading for the export executor.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::types::{DatabaseConfig, MovieRecord};

/// Errors from loading records.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("record source unavailable: {0}")]
    Unavailable(String),
}

/// Source of the records an export contains.
#[async_trait]
pub trait MovieSource: Send + Sync {
    /// Every exportable movie, ordered by id.
    async fn load_all_exportable(&self) -> Result<Vec<MovieRecord>, RepositoryError>;
}

/// Maps to the `movies` table
#[derive(Debug, FromRow)]
struct MovieRow {
    id: i64,
    title: String,
    description: String,
    director: String,
    release_date: NaiveDate,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

impl From<MovieRow> for MovieRecord {
    fn from(row: MovieRow) -> Self {
        Self {
            id: row.id,
            title: row.title,
            description: row.description,
            director: row.director,
            release_date: row.release_date,
            created_at: row.created_at.and_utc(),
            updated_at: row.updated_at.and_utc(),
        }
    }
}

const SELECT_MOVIES: &str = r#"
    SELECT CAST(id AS SIGNED) AS id,
           title,
           description,
           director,
           releaseDate AS release_date,
           createdAt AS created_at,
           updatedAt AS updated_at
    FROM movies
    ORDER BY id
"#;

/// Loads movies from MySQL.
#[derive(Clone)]
pub struct MySqlMovieSource {
    pool: MySqlPool,
}

impl MySqlMovieSource {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Build a lazily connecting pool from `config`.
    pub fn connect_lazy(config: &DatabaseConfig) -> Result<Self, RepositoryError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_lazy(&config.url)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

#[async_trait]
impl MovieSource for MySqlMovieSource {
    #[instrument(skip(self))]
    async fn load_all_exportable(&self) -> Result<Vec<MovieRecord>, RepositoryError> {
        let rows = sqlx::query_as::<_, MovieRow>(SELECT_MOVIES)
            .fetch_all(&self.pool)
            .await?;

        debug!(count = rows.len(), "Loaded movies for export");
        Ok(rows.into_iter().map(MovieRecord::from).collect())
    }
}

/// Fixed record set held in memory.
#[derive(Default)]
pub struct InMemoryMovieSource {
    movies: Mutex<Vec<MovieRecord>>,
    failure: Mutex<Option<String>>,
}

impl InMemoryMovieSource {
    pub fn new(movies: Vec<MovieRecord>) -> Self {
        Self {
            movies: Mutex::new(movies),
            failure: Mutex::new(None),
        }
    }

    pub fn set_movies(&self, movies: Vec<MovieRecord>) {
        *self.movies.lock() = movies;
    }

    /// Make every load fail with `message` until cleared with `None`.
    pub fn set_failure(&self, message: Option<&str>) {
        *self.failure.lock() = message.map(str::to_string);
    }
}

#[async_trait]
impl MovieSource for InMemoryMovieSource {
    async fn load_all_exportable(&self) -> Result<Vec<MovieRecord>, RepositoryError> {
        if let Some(message) = self.failure.lock().clone() {
            return Err(RepositoryError::Unavailable(message));
        }
        let mut movies = self.movies.lock().clone();
        movies.sort_by_key(|m| m.id);
        Ok(movies)
    }
}
