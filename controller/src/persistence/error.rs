#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0} already exists")]
    AlreadyExists(&'static str),

    #[error("{0}")]
    Conflict(&'static str),

    #[error("Unexpected error: {0}")]
    Unexpected(&'static str),
}

impl Error {
    /// Collapse a unique-constraint violation into [`Error::AlreadyExists`],
    /// leaving every other database failure untouched.
    pub fn on_unique(err: sqlx::Error, what: &'static str) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => Self::AlreadyExists(what),
            _ => Self::Database(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
