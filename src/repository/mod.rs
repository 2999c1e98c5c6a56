//! Data access for exportable records.

mod movies;

pub use movies::{InMemoryMovieSource, MovieSource, MySqlMovieSource, RepositoryError};
