//! SQL Server client over the TDS protocol.
//!
//! Wraps tiberius with the conventions the rest of the crate relies on:
//!
//! - parameters are always bound as typed TDS parameters via [`Value`];
//!   row data never touches SQL text
//! - every command runs under the configured command timeout
//! - explicit `BEGIN/COMMIT/ROLLBACK TRANSACTION` control, tracked so error
//!   paths can issue a best-effort rollback

use crate::error::Error;
use crate::types::{Row, Value};
use crate::Result;
use async_trait::async_trait;
use std::borrow::Cow;
use std::time::Duration;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

/// Connection settings for one SQL Server database.
#[derive(Clone)]
pub struct ClientConfig {
    /// Server host
    pub host: String,
    /// Server port (default: 1433)
    pub port: u16,
    /// Database name
    pub database: String,
    /// Login name
    pub username: String,
    /// Password
    pub password: String,
    /// Application name reported to the server
    pub application_name: String,
    /// Enable TLS
    pub encrypt: bool,
    /// Trust the server certificate (self-signed setups)
    pub trust_server_certificate: bool,
    /// Connection open timeout
    pub connect_timeout: Duration,
    /// Per-command timeout
    pub command_timeout: Duration,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("application_name", &self.application_name)
            .field("encrypt", &self.encrypt)
            .field("trust_server_certificate", &self.trust_server_certificate)
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1433,
            database: String::new(),
            username: String::new(),
            password: String::new(),
            application_name: "tablesync".to_string(),
            encrypt: true,
            trust_server_certificate: false,
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(300),
        }
    }
}

impl ClientConfig {
    /// Start a builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Validate the settings.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::config("host is required"));
        }
        if self.database.is_empty() {
            return Err(Error::config("database is required"));
        }
        if self.username.is_empty() {
            return Err(Error::config("username is required"));
        }
        Ok(())
    }
}

/// Builder for [`ClientConfig`].
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Set the server host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the server port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the database name.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.config.database = database.into();
        self
    }

    /// Set the login name.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = username.into();
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = password.into();
        self
    }

    /// Set the application name.
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.config.application_name = name.into();
        self
    }

    /// Enable or disable TLS.
    pub fn encrypt(mut self, encrypt: bool) -> Self {
        self.config.encrypt = encrypt;
        self
    }

    /// Trust the server certificate.
    pub fn trust_server_certificate(mut self, trust: bool) -> Self {
        self.config.trust_server_certificate = trust;
        self
    }

    /// Set the connection open timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the per-command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = timeout;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<ClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Owned parameter wrapper for typed tiberius binding.
///
/// Converts [`Value`] to tiberius `ColumnData`. Parameters are sent as typed
/// protocol-level parameters, never interpolated into SQL text.
struct SqlParam(Value);

impl ToSql for SqlParam {
    fn to_sql(&self) -> ColumnData<'_> {
        use Value::*;
        match &self.0 {
            Null => ColumnData::String(None),
            Bool(b) => ColumnData::Bit(Some(*b)),
            TinyInt(n) => ColumnData::U8(Some(*n)),
            Int16(n) => ColumnData::I16(Some(*n)),
            Int32(n) => ColumnData::I32(Some(*n)),
            Int64(n) => ColumnData::I64(Some(*n)),
            Float32(n) => ColumnData::F32(Some(*n)),
            Float64(n) => ColumnData::F64(Some(*n)),
            String(s) => ColumnData::String(Some(Cow::Borrowed(s.as_str()))),
            Bytes(b) => ColumnData::Binary(Some(Cow::Borrowed(b.as_slice()))),
            Uuid(u) => ColumnData::Guid(Some(*u)),
            // Decimal and temporal values go over as ISO strings; the server
            // converts them natively, and the binding stays a typed parameter.
            Decimal(d) => ColumnData::String(Some(Cow::Owned(d.to_string()))),
            Date(d) => ColumnData::String(Some(Cow::Owned(d.format("%Y-%m-%d").to_string()))),
            Time(t) => ColumnData::String(Some(Cow::Owned(t.format("%H:%M:%S%.f").to_string()))),
            DateTime(dt) => ColumnData::String(Some(Cow::Owned(
                dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            ))),
            DateTimeTz(dt) => ColumnData::String(Some(Cow::Owned(
                dt.format("%Y-%m-%dT%H:%M:%S%.f%:z").to_string(),
            ))),
        }
    }
}

/// Build tiberius parameter references from owned wrappers.
///
/// The returned refs borrow from `params`; keep it alive for the call.
#[inline]
fn param_refs(params: &[SqlParam]) -> Vec<&dyn ToSql> {
    params.iter().map(|p| p as &dyn ToSql).collect()
}

/// Convert one tiberius column value to a [`Value`].
///
/// Probes typed accessors in order of likelihood; BIT before the integers so
/// it does not surface as bytes, binary last as the catch-all.
fn column_to_value(row: &tiberius::Row, idx: usize) -> Value {
    if let Ok(Some(v)) = row.try_get::<bool, _>(idx) {
        return Value::Bool(v);
    }
    if let Ok(Some(v)) = row.try_get::<u8, _>(idx) {
        return Value::TinyInt(v);
    }
    if let Ok(Some(v)) = row.try_get::<i16, _>(idx) {
        return Value::Int16(v);
    }
    if let Ok(Some(v)) = row.try_get::<i32, _>(idx) {
        return Value::Int32(v);
    }
    if let Ok(Some(v)) = row.try_get::<i64, _>(idx) {
        return Value::Int64(v);
    }
    if let Ok(Some(v)) = row.try_get::<f32, _>(idx) {
        return Value::Float32(v);
    }
    if let Ok(Some(v)) = row.try_get::<f64, _>(idx) {
        return Value::Float64(v);
    }
    if let Ok(Some(v)) = row.try_get::<rust_decimal::Decimal, _>(idx) {
        return Value::Decimal(v);
    }
    if let Ok(Some(v)) = row.try_get::<&str, _>(idx) {
        return Value::String(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<uuid::Uuid, _>(idx) {
        return Value::Uuid(v);
    }
    if let Ok(Some(v)) = row.try_get::<chrono::NaiveDateTime, _>(idx) {
        return Value::DateTime(v);
    }
    if let Ok(Some(v)) = row.try_get::<chrono::NaiveDate, _>(idx) {
        return Value::Date(v);
    }
    if let Ok(Some(v)) = row.try_get::<chrono::NaiveTime, _>(idx) {
        return Value::Time(v);
    }
    if let Ok(Some(v)) = row.try_get::<chrono::DateTime<chrono::Utc>, _>(idx) {
        return Value::DateTimeTz(v);
    }
    if let Ok(Some(v)) = row.try_get::<&[u8], _>(idx) {
        return Value::Bytes(v.to_vec());
    }
    Value::Null
}

/// Convert a tiberius row to a [`Row`].
fn convert_row(tib_row: &tiberius::Row) -> Row {
    let columns: Vec<String> = tib_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let values: Vec<Value> = (0..columns.len())
        .map(|i| column_to_value(tib_row, i))
        .collect();
    Row::new(columns, values)
}

/// A live connection to one SQL Server database.
pub struct SqlServerClient {
    client: Client<Compat<TcpStream>>,
    command_timeout: Duration,
    in_transaction: bool,
}

impl SqlServerClient {
    /// Open a connection.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        config.validate()?;

        debug!(
            "connecting to SQL Server {}:{}/{}",
            config.host, config.port, config.database
        );

        let mut tib_config = Config::new();
        tib_config.host(&config.host);
        tib_config.port(config.port);
        tib_config.database(&config.database);
        tib_config.application_name(&config.application_name);
        tib_config.authentication(AuthMethod::sql_server(&config.username, &config.password));

        if config.encrypt {
            tib_config.encryption(EncryptionLevel::Required);
            if config.trust_server_certificate {
                tib_config.trust_cert();
            }
        } else {
            tib_config.encryption(EncryptionLevel::NotSupported);
        }

        let connect = async {
            let tcp = TcpStream::connect(tib_config.get_addr())
                .await
                .map_err(|e| Error::connection(e.to_string()))?;
            tcp.set_nodelay(true)
                .map_err(|e| Error::connection(e.to_string()))?;
            Client::connect(tib_config, tcp.compat_write())
                .await
                .map_err(|e| Error::connection(e.to_string()))
        };

        let client = tokio::time::timeout(config.connect_timeout, connect)
            .await
            .map_err(|_| {
                Error::connection(format!(
                    "connect to {}:{} timed out after {:?}",
                    config.host, config.port, config.connect_timeout
                ))
            })??;

        info!(
            "connected to SQL Server {}:{}/{}",
            config.host, config.port, config.database
        );

        Ok(Self {
            client,
            command_timeout: config.command_timeout,
            in_transaction: false,
        })
    }

    /// Open a connection with exponential-backoff retry.
    pub async fn connect_with_retry(config: &ClientConfig, max_retries: u32) -> Result<Self> {
        let mut last_error = None;
        let mut delay = Duration::from_millis(500);

        for attempt in 1..=max_retries {
            match Self::connect(config).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    warn!(
                        "connection attempt {}/{} to {} failed: {}",
                        attempt, max_retries, config.host, e
                    );
                    last_error = Some(e);
                    if attempt < max_retries {
                        tokio::time::sleep(delay).await;
                        delay = std::cmp::min(delay * 2, Duration::from_secs(30));
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::connection("max retries exceeded")))
    }

    /// Run a query and collect all rows of the first result set.
    pub async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let timeout = self.command_timeout;
        let owned: Vec<SqlParam> = params.iter().cloned().map(SqlParam).collect();
        let refs = param_refs(&owned);

        let fut = async {
            let stream = self
                .client
                .query(sql, &refs)
                .await
                .map_err(|e| Error::query(e.to_string()))?;
            let rows = stream
                .into_first_result()
                .await
                .map_err(|e| Error::query(e.to_string()))?;
            Ok(rows.iter().map(convert_row).collect())
        };

        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| Error::Timeout {
                seconds: timeout.as_secs(),
            })?
    }

    /// Run a query and return the first row, if any.
    pub async fn query_one(&mut self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// Execute a statement; returns the affected row count.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let timeout = self.command_timeout;
        let owned: Vec<SqlParam> = params.iter().cloned().map(SqlParam).collect();
        let refs = param_refs(&owned);

        let fut = async {
            let result = self
                .client
                .execute(sql, &refs)
                .await
                .map_err(|e| Error::query(e.to_string()))?;
            Ok(result.total())
        };

        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| Error::Timeout {
                seconds: timeout.as_secs(),
            })?
    }

    /// Begin an explicit transaction.
    pub async fn begin_transaction(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(Error::query("transaction already open"));
        }
        self.execute("BEGIN TRANSACTION", &[]).await?;
        self.in_transaction = true;
        Ok(())
    }

    /// Commit the open transaction.
    pub async fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(Error::query("no open transaction to commit"));
        }
        self.execute("COMMIT TRANSACTION", &[]).await?;
        self.in_transaction = false;
        Ok(())
    }

    /// Roll back the open transaction.
    pub async fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.execute("ROLLBACK TRANSACTION", &[]).await?;
        self.in_transaction = false;
        Ok(())
    }

    /// Best-effort rollback for error paths; logs instead of failing.
    pub async fn rollback_quietly(&mut self) {
        if !self.in_transaction {
            return;
        }
        if let Err(e) = self.rollback().await {
            warn!("rollback failed: {}", e);
            self.in_transaction = false;
        }
    }

    /// Whether an explicit transaction is open.
    #[inline]
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Override the per-command timeout on an open connection.
    ///
    /// The orchestrator applies the run's configured timeout here, so the
    /// `SyncOptions` value wins over whatever the dialing config carried.
    pub fn set_command_timeout(&mut self, timeout: Duration) {
        self.command_timeout = timeout;
    }

    /// Cheap liveness probe.
    pub async fn is_valid(&mut self) -> bool {
        self.execute("SELECT 1", &[]).await.is_ok()
    }
}

/// Supplies connection pairs to sync workers.
///
/// Each worker holds its own source/destination pair; connections are never
/// shared across workers.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    /// Open a read connection to the source database.
    async fn connect_source(&self) -> Result<SqlServerClient>;

    /// Open a read/write/DDL connection to the destination database.
    async fn connect_dest(&self) -> Result<SqlServerClient>;
}

/// [`ClientProvider`] that dials fresh TDS connections from static configs.
pub struct TdsClientProvider {
    source: ClientConfig,
    dest: ClientConfig,
    max_retries: u32,
}

impl TdsClientProvider {
    /// Create a provider from source and destination configs.
    pub fn new(source: ClientConfig, dest: ClientConfig) -> Self {
        Self {
            source,
            dest,
            max_retries: 3,
        }
    }

    /// Override the connect retry budget (default: 3).
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    /// Apply run-level timeouts to both stored configs.
    pub fn with_timeouts(mut self, connect: Duration, command: Duration) -> Self {
        self.source.connect_timeout = connect;
        self.source.command_timeout = command;
        self.dest.connect_timeout = connect;
        self.dest.command_timeout = command;
        self
    }
}

#[async_trait]
impl ClientProvider for TdsClientProvider {
    async fn connect_source(&self) -> Result<SqlServerClient> {
        SqlServerClient::connect_with_retry(&self.source, self.max_retries).await
    }

    async fn connect_dest(&self) -> Result<SqlServerClient> {
        SqlServerClient::connect_with_retry(&self.dest, self.max_retries).await
    }
}
