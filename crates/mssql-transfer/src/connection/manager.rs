//! bb8 connection manager for tiberius clients.

use std::time::Duration;

use async_trait::async_trait;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, SqlBrowser};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};

use crate::config::DatabaseConfig;

/// Session settings applied once to every new physical connection.
pub const SESSION_SETTINGS: &str = "SET ANSI_NULLS ON; \
     SET ANSI_PADDING ON; \
     SET ANSI_WARNINGS ON; \
     SET CONCAT_NULL_YIELDS_NULL ON; \
     SET QUOTED_IDENTIFIER ON; \
     SET NUMERIC_ROUNDABORT OFF; \
     SET ARITHABORT ON; \
     SET XACT_ABORT ON;";

pub type MssqlClient = Client<Compat<TcpStream>>;

/// Connection manager for bb8 pool with tiberius.
#[derive(Clone)]
pub struct TiberiusConnectionManager {
    config: DatabaseConfig,
}

impl TiberiusConnectionManager {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.database);
        config.authentication(AuthMethod::sql_server(&self.config.user, &self.config.password));

        let options = &self.config.options;
        if let Some(ref name) = options.application_name {
            config.application_name(name);
        }
        if let Some(ref instance) = options.instance_name {
            config.instance_name(instance);
        }

        if options.trust_server_cert {
            config.trust_cert();
        }
        config.encryption(if options.encrypt {
            EncryptionLevel::Required
        } else {
            EncryptionLevel::NotSupported
        });

        config
    }

    /// Open one physical connection and apply the session settings.
    pub async fn open(&self) -> Result<MssqlClient, tiberius::error::Error> {
        let timeout = Duration::from_secs(self.config.options.connect_timeout_secs);
        let endpoint = self.config.endpoint();

        let connect = async {
            let config = self.build_config();
            let tcp = if self.config.options.instance_name.is_some() {
                TcpStream::connect_named(&config).await?
            } else {
                TcpStream::connect(config.get_addr())
                    .await
                    .map_err(|e| tiberius::error::Error::Io {
                        kind: e.kind(),
                        message: e.to_string(),
                    })?
            };
            tcp.set_nodelay(true).ok();
            Client::connect(config, tcp.compat_write()).await
        };

        let mut client = match tokio::time::timeout(timeout, connect).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(tiberius::error::Error::Io {
                    kind: std::io::ErrorKind::TimedOut,
                    message: format!(
                        "Login timeout expired after {}s connecting to {}",
                        timeout.as_secs(),
                        endpoint
                    ),
                })
            }
        };

        match client.simple_query(SESSION_SETTINGS).await {
            Ok(stream) => {
                if let Err(e) = stream.into_results().await {
                    warn!("{}: session settings not applied: {}", endpoint, e);
                }
            }
            Err(e) => warn!("{}: session settings not applied: {}", endpoint, e),
        }
        debug!("Opened connection to {}/{}", endpoint, self.config.database);

        Ok(client)
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = MssqlClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.open().await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}
