use crate::record::MetricRow;
use async_trait::async_trait;
use std::sync::Arc;

/// A statement the sink writer asks the sink to run.
#[derive(Clone, Debug, PartialEq)]
pub enum Statement {
    EnsureTable { table: String },
    InsertMetric { table: String, row: MetricRow },
}

impl Statement {
    pub fn sql(&self) -> String {
        match self {
            Statement::EnsureTable { table } => format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 id SERIAL PRIMARY KEY, \
                 page_url TEXT, \
                 http_code SMALLINT, \
                 response_time INT, \
                 timestamp TIMESTAMPTZ)"
            ),
            Statement::InsertMetric { table, .. } => format!(
                "INSERT INTO {table} (page_url, http_code, response_time, timestamp) \
                 VALUES ($1, $2, $3, $4)"
            ),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Statement::EnsureTable { .. } => "ensure_table",
            Statement::InsertMetric { .. } => "insert_metric",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    /// The connection is gone or unusable. The only class worth retrying.
    #[error("sink connection error: {0}")]
    Connection(String),
    /// The sink refused this particular statement.
    #[error("sink rejected statement: {0}")]
    Rejected(String),
}

impl SinkError {
    pub fn is_connection(&self) -> bool {
        matches!(self, SinkError::Connection(_))
    }
}

#[async_trait]
pub trait SinkConnection: Send + Sync {
    /// Runs one statement, returning the number of affected rows.
    async fn execute(&self, statement: &Statement) -> Result<u64, SinkError>;

    /// Releases the connection. Statements issued afterwards fail with
    /// [`SinkError::Connection`].
    async fn close(&self);

    /// Human-readable endpoint for log context.
    fn describe(&self) -> String;
}

pub type SinkHandle = Arc<dyn SinkConnection>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn renders_statements_for_configured_table() {
        let create = Statement::EnsureTable {
            table: "pagemonitor".to_string(),
        };
        assert!(create.sql().starts_with("CREATE TABLE IF NOT EXISTS pagemonitor ("));
        assert!(create.sql().contains("http_code SMALLINT"));

        let insert = Statement::InsertMetric {
            table: "pagemonitor".to_string(),
            row: MetricRow {
                page_url: "https://example.com".to_string(),
                http_code: 200,
                response_time: 10,
                ts: Utc::now(),
            },
        };
        assert_eq!(
            insert.sql(),
            "INSERT INTO pagemonitor (page_url, http_code, response_time, timestamp) VALUES ($1, $2, $3, $4)"
        );
        assert_eq!(insert.kind(), "insert_metric");
    }

    #[test]
    fn only_connection_errors_are_retryable() {
        assert!(SinkError::Connection("broken pipe".into()).is_connection());
        assert!(!SinkError::Rejected("value too long".into()).is_connection());
    }
}
