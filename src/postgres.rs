use crate::config::Config;
use crate::sink::{SinkConnection, SinkError, Statement};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection};
use std::time::Duration;
use tokio::sync::Mutex;

/// PostgreSQL sink over one session.
///
/// There is no reconnect: once the session breaks every statement fails with
/// [`SinkError::Connection`] until the process is restarted.
pub struct PgSink {
    conn: Mutex<Option<PgConnection>>,
    command_timeout: Duration,
    endpoint: String,
}

impl PgSink {
    pub async fn connect(config: &Config) -> Result<Self, SinkError> {
        let options = PgConnectOptions::new()
            .host(&config.pg_host)
            .port(config.pg_port)
            .username(&config.pg_user)
            .password(&config.pg_password)
            .database(&config.pg_database)
            .ssl_mode(config.pg_ssl_mode)
            .application_name("kafka-pg-relay");

        let conn = match tokio::time::timeout(config.pg_connect_timeout, options.connect()).await {
            Ok(result) => result.map_err(classify)?,
            Err(_) => {
                return Err(SinkError::Connection(format!(
                    "connect timed out after {:?}",
                    config.pg_connect_timeout
                )))
            }
        };

        Ok(Self::from_connection(
            conn,
            config.pg_command_timeout,
            format!("{}:{}/{}", config.pg_host, config.pg_port, config.pg_database),
        ))
    }

    pub fn from_connection(
        conn: PgConnection,
        command_timeout: Duration,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
            command_timeout,
            endpoint: endpoint.into(),
        }
    }

    async fn run(conn: &mut PgConnection, statement: &Statement) -> Result<u64, sqlx::Error> {
        let sql = statement.sql();
        let result = match statement {
            Statement::EnsureTable { .. } => sqlx::query(&sql).execute(&mut *conn).await?,
            Statement::InsertMetric { row, .. } => {
                sqlx::query(&sql)
                    .bind(&row.page_url)
                    .bind(row.http_code)
                    .bind(row.response_time)
                    .bind(row.ts)
                    .execute(&mut *conn)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SinkConnection for PgSink {
    async fn execute(&self, statement: &Statement) -> Result<u64, SinkError> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| SinkError::Connection("connection is closed".to_string()))?;

        match tokio::time::timeout(self.command_timeout, Self::run(conn, statement)).await {
            Ok(result) => result.map_err(classify),
            Err(_) => Err(SinkError::Connection(format!(
                "{} timed out after {:?}",
                statement.kind(),
                self.command_timeout
            ))),
        }
    }

    async fn close(&self) {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            if let Err(err) = conn.close().await {
                tracing::warn!(error = %err, endpoint = %self.endpoint, "error while closing PostgreSQL connection");
            }
        }
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}

/// Splits driver errors into "the connection is broken" and "this statement is bad".
pub fn classify(err: sqlx::Error) -> SinkError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => SinkError::Connection(err.to_string()),
        sqlx::Error::Database(db) => {
            let code = db.code();
            let code = code.as_deref().unwrap_or_default();
            // class 08: connection exception; 57P0x: server shutting down
            if code.starts_with("08") || matches!(code, "57P01" | "57P02" | "57P03") {
                SinkError::Connection(err.to_string())
            } else {
                SinkError::Rejected(err.to_string())
            }
        }
        _ => SinkError::Rejected(err.to_string()),
    }
}
