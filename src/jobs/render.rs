//! CSV rendering of movie records.

use thiserror::Error;

use crate::types::MovieRecord;

/// Header row, in column order.
pub const CSV_HEADERS: [&str; 7] = [
    "ID",
    "Title",
    "Description",
    "Director",
    "Release Date",
    "Created At",
    "Updated At",
];

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("csv flush failed: {0}")]
    Flush(String),
}

/// Render `movies` as CSV with a header row.
pub fn render_csv(movies: &[MovieRecord]) -> Result<Vec<u8>, RenderError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADERS)?;

    for movie in movies {
        writer.write_record([
            movie.id.to_string(),
            movie.title.clone(),
            movie.description.clone(),
            movie.director.clone(),
            movie.release_date.format(DATE_FORMAT).to_string(),
            movie.created_at.format(TIMESTAMP_FORMAT).to_string(),
            movie.updated_at.format(TIMESTAMP_FORMAT).to_string(),
        ])?;
    }

    writer
        .into_inner()
        .map_err(|e| RenderError::Flush(e.error().to_string()))
}
