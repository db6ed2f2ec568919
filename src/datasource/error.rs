use thiserror::Error;

/// Errors surfaced by datasource plugins, the registry and the driver facades.
#[derive(Error, Debug)]
pub enum DatasourceError {
    /// Mandatory configuration is missing or malformed
    #[error("{0}")]
    ConfigInvalid(String),

    /// Settings or query could not be structurally decoded
    #[error("decode failure: {0}")]
    Decode(#[from] serde_json::Error),

    /// The request is well-formed but semantically unusable
    #[error("{0}")]
    Query(String),

    /// A banned SQL token was found before any driver call
    #[error("operation {op} is forbidden, only read operations are allowed, please check your SQL")]
    OperationForbidden { op: String },

    /// The probe count exceeded the configured maximum
    #[error("query result rows count {count} exceeds the maximum limit {max}")]
    RowLimitExceeded { count: u64, max: u64 },

    /// Network, driver or remote-side failure
    #[error("transport failure: {0}")]
    Transport(String),

    /// A deadline elapsed before the driver answered
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// The adapter does not implement the requested capability
    #[error("unsupported")]
    Unsupported,

    #[error("datasource kind {0} is already registered")]
    DuplicateKind(String),

    #[error("datasource kind {0} is not registered")]
    UnknownKind(String),
}

impl DatasourceError {
    pub fn config(message: impl Into<String>) -> Self {
        DatasourceError::ConfigInvalid(message.into())
    }

    pub fn query(message: impl Into<String>) -> Self {
        DatasourceError::Query(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        DatasourceError::Transport(message.into())
    }

    pub fn forbidden(op: &str) -> Self {
        DatasourceError::OperationForbidden { op: op.to_string() }
    }

    pub fn timeout(operation: &str, seconds: u64) -> Self {
        DatasourceError::Timeout {
            operation: operation.to_string(),
            seconds,
        }
    }

    /// True for errors raised before any driver call was made.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            DatasourceError::OperationForbidden { .. } | DatasourceError::RowLimitExceeded { .. }
        )
    }
}

impl From<sqlx::Error> for DatasourceError {
    fn from(err: sqlx::Error) -> Self {
        DatasourceError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for DatasourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return DatasourceError::Transport(format!("request timed out: {}", err));
        }
        DatasourceError::Transport(err.to_string())
    }
}

#[cfg(feature = "clickhouse")]
impl From<clickhouse::error::Error> for DatasourceError {
    fn from(err: clickhouse::error::Error) -> Self {
        DatasourceError::Transport(err.to_string())
    }
}

#[cfg(feature = "mongodb")]
impl From<mongodb::error::Error> for DatasourceError {
    fn from(err: mongodb::error::Error) -> Self {
        DatasourceError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_message() {
        let err = DatasourceError::forbidden("DROP");
        assert_eq!(
            err.to_string(),
            "operation DROP is forbidden, only read operations are allowed, please check your SQL"
        );
        assert!(err.is_rejection());
    }

    #[test]
    fn test_decode_conversion() {
        let err: DatasourceError = serde_json::from_str::<u32>("\"x\"").unwrap_err().into();
        assert!(matches!(err, DatasourceError::Decode(_)));
        assert!(!err.is_rejection());
    }
}
