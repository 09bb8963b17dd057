use crate::auth;
use crate::connection::{Connection, ConnectionOptions};
use crate::protocol::TransactionStatus;
use crate::query::MultiResultReader;
use crate::wire_format::BackendMessage;
use crate::{Error, Result};
use bytes::BytesMut;
use postgres_protocol::message::frontend;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_USER: &str = "postgres";

/// Client options
#[derive(Clone)]
pub struct ClientOptions {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Username
    pub user: String,
    /// Password, if the server asks for one
    pub password: Option<String>,
    /// Database name; the server falls back to the user name
    pub database: Option<String>,
    /// Reported as `application_name`
    pub application_name: Option<String>,
    /// Extra startup parameters (e.g. `search_path`)
    pub runtime_params: Vec<(String, String)>,
    /// Transport settings, including the read buffer size
    pub connection_options: ConnectionOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            user: DEFAULT_USER.to_string(),
            password: None,
            database: None,
            application_name: None,
            runtime_params: Vec::new(),
            connection_options: ConnectionOptions::default(),
        }
    }
}

impl ClientOptions {
    /// Create new client options with host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Set the database
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the username
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set the password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Add a startup parameter sent verbatim to the server
    pub fn runtime_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.runtime_params.push((name.into(), value.into()));
        self
    }

    /// Set connection options
    pub fn connection_options(mut self, options: ConnectionOptions) -> Self {
        self.connection_options = options;
        self
    }

    /// Set the minimum read buffer size in bytes
    pub fn min_read_buffer_size(mut self, bytes: usize) -> Self {
        self.connection_options.min_read_buffer_size = bytes;
        self
    }

    /// Database the session will use
    pub fn effective_database(&self) -> &str {
        self.database.as_deref().unwrap_or(&self.user)
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("database", &self.database)
            .field("application_name", &self.application_name)
            .field("runtime_params", &self.runtime_params)
            .field("connection_options", &self.connection_options)
            .finish()
    }
}

/// Process id and secret key identifying the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKey {
    pub process_id: i32,
    pub secret_key: i32,
}

/// PostgreSQL client session over one connection
pub struct Client {
    conn: Connection,
    options: ClientOptions,
    parameters: HashMap<String, String>,
    backend_key: Option<BackendKey>,
    transaction_status: TransactionStatus,
    busy: bool,
    buf: BytesMut,
}

impl Client {
    /// Connect, authenticate and wait until the server is ready for queries
    pub async fn connect(options: ClientOptions) -> Result<Self> {
        let mut conn =
            Connection::connect(&options.host, options.port, &options.connection_options)
                .await?;

        Self::send_startup(&mut conn, &options).await?;
        auth::authenticate(&mut conn, &options.user, options.password.as_deref()).await?;

        let mut client = Self {
            conn,
            options,
            parameters: HashMap::new(),
            backend_key: None,
            transaction_status: TransactionStatus::Idle,
            busy: true,
            buf: BytesMut::new(),
        };
        client.receive_ready().await?;

        info!(
            host = %client.options.host,
            port = client.options.port,
            database = client.options.effective_database(),
            read_buffer = client.min_read_buffer_size(),
            "Connected"
        );
        Ok(client)
    }

    /// Send the startup packet
    async fn send_startup(conn: &mut Connection, options: &ClientOptions) -> Result<()> {
        let mut params: Vec<(&str, &str)> = vec![
            ("user", options.user.as_str()),
            ("database", options.effective_database()),
        ];
        if let Some(name) = &options.application_name {
            params.push(("application_name", name.as_str()));
        }
        for (name, value) in &options.runtime_params {
            params.push((name.as_str(), value.as_str()));
        }
        debug!(?params, "Sending startup message");

        let mut buf = BytesMut::new();
        frontend::startup_message(params, &mut buf)?;
        conn.send(&buf).await
    }

    /// Collect session parameters until the first ReadyForQuery
    async fn receive_ready(&mut self) -> Result<()> {
        loop {
            match self.read_message().await? {
                BackendMessage::BackendKeyData { process_id, secret_key } => {
                    self.backend_key = Some(BackendKey { process_id, secret_key });
                }
                BackendMessage::ReadyForQuery(status) => {
                    self.ready(status);
                    return Ok(());
                }
                BackendMessage::ErrorResponse(err) => return Err(Error::Server(err)),
                other => {
                    return Err(Error::Protocol(format!(
                        "Unexpected message during startup: {:?}",
                        other
                    )))
                }
            }
        }
    }

    /// Submit a query string and stream its result sets.
    ///
    /// The returned reader must be drained or closed; until then the client
    /// rejects further queries with [`Error::ConnectionBusy`].
    pub async fn exec(&mut self, sql: &str) -> Result<MultiResultReader<'_>> {
        if self.busy {
            return Err(Error::ConnectionBusy);
        }
        debug!(sql, "Sending query");

        self.buf.clear();
        frontend::query(sql, &mut self.buf)?;
        self.busy = true;
        self.conn.send(&self.buf).await?;

        Ok(MultiResultReader::new(self))
    }

    /// Send Terminate and shut the socket down
    pub async fn close(mut self) -> Result<()> {
        self.buf.clear();
        frontend::terminate(&mut self.buf);
        self.conn.send(&self.buf).await?;
        self.conn.shutdown().await?;
        debug!("Connection closed");
        Ok(())
    }

    /// Next message that belongs to the current exchange; asynchronous
    /// messages are absorbed here.
    pub(crate) async fn read_message(&mut self) -> Result<BackendMessage> {
        loop {
            match self.conn.read_message().await? {
                BackendMessage::ParameterStatus { name, value } => {
                    debug!(%name, %value, "Parameter status");
                    self.parameters.insert(name, value);
                }
                BackendMessage::NoticeResponse(notice) => {
                    warn!(code = %notice.code, severity = %notice.severity, "{}", notice.message);
                }
                BackendMessage::NotificationResponse { process_id, channel, .. } => {
                    debug!(process_id, %channel, "Notification ignored");
                }
                message => return Ok(message),
            }
        }
    }

    pub(crate) fn ready(&mut self, status: TransactionStatus) {
        self.transaction_status = status;
        self.busy = false;
    }

    /// Read buffer capacity of the live connection
    pub fn min_read_buffer_size(&self) -> usize {
        self.conn.read_buffer_size()
    }

    /// Value of a server-reported parameter such as `server_version`
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn server_version(&self) -> Option<&str> {
        self.parameter("server_version")
    }

    pub fn backend_key(&self) -> Option<BackendKey> {
        self.backend_key
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Whether a previous query has not been drained yet
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("conn", &self.conn)
            .field("options", &self.options)
            .field("backend_key", &self.backend_key)
            .field("transaction_status", &self.transaction_status)
            .field("busy", &self.busy)
            .finish()
    }
}
