use thiserror::Error;

/// Crate-wide error type. Payloads are strings so failed items can be
/// cloned into the dead-letter buffer and replayed through error handlers.
#[derive(Debug, Clone, Error)]
pub enum GridError {
    #[error("unknown fuel category: {0}")]
    UnknownFuelCategory(String),

    #[error("invalid date range: {0}")]
    InvalidDateRange(String),

    #[error("insufficient historical data: {0}")]
    InsufficientHistory(String),

    #[error("NYISO fetch failed: {0}")]
    NyisoFetch(String),

    #[error("weather fetch failed: {0}")]
    WeatherFetch(String),

    #[error("{0}")]
    Validation(String),

    #[error("store failure: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl GridError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GridError::UnknownFuelCategory(_)
            | GridError::InvalidDateRange(_)
            | GridError::InsufficientHistory(_) => ErrorKind::Semantic,
            GridError::NyisoFetch(_) | GridError::WeatherFetch(_) => ErrorKind::DataSource,
            GridError::Validation(_) => ErrorKind::Validation,
            GridError::Store(_) => ErrorKind::Store,
            GridError::Config(_) => ErrorKind::Config,
        }
    }
}

/// Routing key for pipeline error handling. A kind covers every error
/// variant beneath it, so registering `DataSource` matches both upstream
/// fetch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Store,
    DataSource,
    Semantic,
    Config,
}

impl ErrorKind {
    pub fn matches(&self, err: &GridError) -> bool {
        err.kind() == *self
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Store => "store",
            ErrorKind::DataSource => "data_source",
            ErrorKind::Semantic => "semantic",
            ErrorKind::Config => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_cover_subtypes() {
        assert!(ErrorKind::DataSource.matches(&GridError::NyisoFetch("down".into())));
        assert!(ErrorKind::DataSource.matches(&GridError::WeatherFetch("down".into())));
        assert!(!ErrorKind::DataSource.matches(&GridError::Store("down".into())));
        assert!(ErrorKind::Validation.matches(&GridError::Validation("bad".into())));
        assert!(ErrorKind::Semantic.matches(&GridError::UnknownFuelCategory("x".into())));
    }

    #[test]
    fn validation_display_is_bare_message() {
        let err = GridError::Validation("Zero/negative total generation".into());
        assert_eq!(err.to_string(), "Zero/negative total generation");
    }
}
