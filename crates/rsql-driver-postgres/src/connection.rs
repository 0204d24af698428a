//! PostgreSQL connection implementation

use async_trait::async_trait;
use parking_lot::Mutex;
use postgres_native_tls::MakeTlsConnector;
use rsql_core::{
    ColumnMeta, DriverConnection, QueryCancelHandle, QueryResult, Result, Row, SqlError, Value,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_postgres::types::ToSql;
use tokio_postgres::{CancelToken, Client, NoTls, Statement};

use crate::error::map_postgres_error;
use crate::values::{PgParam, decode_column};

/// Cancel handle for PostgreSQL queries.
///
/// Wraps the tokio-postgres `CancelToken`; the cancel request travels over
/// a separate connection, so it works while a query holds the client. That
/// connection negotiates TLS with the same connector and `sslmode` as the
/// session it cancels.
pub struct PostgresCancelHandle {
    cancel_token: CancelToken,
    tls: Option<MakeTlsConnector>,
}

impl QueryCancelHandle for PostgresCancelHandle {
    fn cancel(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no tokio runtime available, cannot send cancel request");
            return;
        };

        tracing::debug!("sending cancel request to PostgreSQL server");
        let cancel_token = self.cancel_token.clone();
        let tls = self.tls.clone();
        runtime.spawn(async move {
            let sent = match tls {
                Some(connector) => cancel_token.cancel_query(connector).await,
                None => cancel_token.cancel_query(NoTls).await,
            };
            if let Err(e) = sent {
                tracing::warn!(error = %e, "failed to cancel PostgreSQL query");
            } else {
                tracing::debug!("PostgreSQL cancel request sent");
            }
        });
    }
}

/// One live tokio-postgres client
pub struct PostgresConnection {
    client: Client,
    cancel_token: CancelToken,
    tls: Option<MakeTlsConnector>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PostgresConnection {
    pub(crate) fn new(
        client: Client,
        task: JoinHandle<()>,
        tls: Option<MakeTlsConnector>,
    ) -> Self {
        let cancel_token = client.cancel_token();
        Self {
            client,
            cancel_token,
            tls,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(SqlError::BadConnection)
        } else {
            Ok(())
        }
    }

    /// Prepare `sql` and bind `params` against the inferred parameter types
    async fn prepare(&self, sql: &str, params: &[Value]) -> Result<(Statement, Vec<PgParam>)> {
        self.ensure_open()?;
        let statement = self.client.prepare(sql).await.map_err(map_postgres_error)?;

        let param_types = statement.params();
        let pg_params = params
            .iter()
            .enumerate()
            .map(|(i, value)| match param_types.get(i) {
                Some(target) => PgParam::for_type(value, target),
                None => PgParam::from_value(value),
            })
            .collect();
        Ok((statement, pg_params))
    }
}

fn param_refs(params: &[PgParam]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

#[async_trait]
impl DriverConnection for PostgresConnection {
    fn driver_name(&self) -> &str {
        "postgresql"
    }

    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let start_time = Instant::now();
        let (statement, pg_params) = self.prepare(sql, params).await?;

        let pg_rows = self
            .client
            .query(&statement, &param_refs(&pg_params))
            .await
            .map_err(map_postgres_error)?;

        // Column metadata comes from the statement so empty results keep it
        let columns: Vec<ColumnMeta> = statement
            .columns()
            .iter()
            .enumerate()
            .map(|(ordinal, col)| ColumnMeta {
                name: col.name().to_string(),
                data_type: col.type_().name().to_string(),
                ordinal,
            })
            .collect();
        let column_names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();

        let rows: Vec<Row> = pg_rows
            .iter()
            .map(|pg_row| {
                let values = (0..columns.len())
                    .map(|idx| decode_column(pg_row, idx))
                    .collect();
                Row::new(column_names.clone(), values)
            })
            .collect();

        let execution_time_ms = start_time.elapsed().as_millis() as u64;
        tracing::debug!(
            row_count = rows.len(),
            execution_time_ms,
            "query executed successfully"
        );

        Ok(QueryResult {
            columns,
            rows,
            affected_rows: 0,
            execution_time_ms,
        })
    }

    #[tracing::instrument(skip(self, sql, params), fields(sql_preview = %sql.chars().take(100).collect::<String>()))]
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let (statement, pg_params) = self.prepare(sql, params).await?;

        let affected_rows = self
            .client
            .execute(&statement, &param_refs(&pg_params))
            .await
            .map_err(map_postgres_error)?;

        tracing::debug!(affected_rows, "statement executed");
        Ok(affected_rows)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!("closing PostgreSQL connection");
        // Dropping the connection future shuts the socket
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.client.is_closed()
    }

    fn cancel_handle(&self) -> Option<Arc<dyn QueryCancelHandle>> {
        Some(Arc::new(PostgresCancelHandle {
            cancel_token: self.cancel_token.clone(),
            tls: self.tls.clone(),
        }))
    }
}
