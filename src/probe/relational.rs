//! Relational database probe: log in and run `SELECT 1`

use async_trait::async_trait;
use sqlx::mysql::MySqlConnectOptions;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::{ConnectOptions, Connection};
use std::str::FromStr;
use std::time::Duration;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel};
use tokio_util::compat::TokioAsyncWriteCompatExt;

use super::{connect_tcp, ProbeError, ProbeStrategy};
use crate::builder::{ConnectionTarget, RelationalTarget};
use crate::catalog::{Category, ConnectionType};
use crate::error::ErrorCode;

/// SQL Server login failure
const MSSQL_LOGIN_FAILED: u32 = 18456;

pub struct RelationalProbe;

#[async_trait]
impl ProbeStrategy for RelationalProbe {
    fn category(&self) -> Category {
        Category::Relational
    }

    async fn probe(&self, target: &ConnectionTarget, _timeout: Duration) -> Result<String, ProbeError> {
        let ConnectionTarget::Relational(target) = target else {
            return Err(ProbeError::new(
                ErrorCode::UnsupportedOperation,
                "relational probe received a non-relational target",
            ));
        };

        match target.engine {
            ConnectionType::PostgreSql => probe_postgres(target).await,
            ConnectionType::MySql | ConnectionType::MariaDb => probe_mysql(target).await,
            ConnectionType::SqlServer => probe_sql_server(target).await,
            ConnectionType::Oracle => probe_oracle(target).await,
            other => Err(ProbeError::new(
                ErrorCode::UnsupportedOperation,
                format!("{} is not a relational engine", other),
            )),
        }
    }
}

async fn probe_postgres(target: &RelationalTarget) -> Result<String, ProbeError> {
    let ssl_mode = match target.option("ssl_mode") {
        Some(mode) => PgSslMode::from_str(mode)
            .map_err(|_| ProbeError::new(ErrorCode::InvalidFormat, format!("unknown ssl_mode '{}'", mode)))?,
        None => PgSslMode::Prefer,
    };

    let options = PgConnectOptions::new()
        .host(&target.host)
        .port(target.port)
        .database(&target.database)
        .username(&target.username)
        .password(target.password.expose())
        .ssl_mode(ssl_mode)
        .application_name("connwatch");

    let mut conn = options.connect().await.map_err(|e| classify_sqlx(&e))?;
    sqlx::query("SELECT 1")
        .execute(&mut conn)
        .await
        .map_err(|e| classify_sqlx(&e))?;
    let _ = conn.close().await;

    Ok(format!("SELECT 1 succeeded on {}:{}/{}", target.host, target.port, target.database))
}

async fn probe_mysql(target: &RelationalTarget) -> Result<String, ProbeError> {
    let mut options = MySqlConnectOptions::new()
        .host(&target.host)
        .port(target.port)
        .database(&target.database)
        .username(&target.username)
        .password(target.password.expose());

    if let Some(mode) = target.option("ssl_mode") {
        let mode = sqlx::mysql::MySqlSslMode::from_str(mode)
            .map_err(|_| ProbeError::new(ErrorCode::InvalidFormat, format!("unknown ssl_mode '{}'", mode)))?;
        options = options.ssl_mode(mode);
    }

    let mut conn = options.connect().await.map_err(|e| classify_sqlx(&e))?;
    sqlx::query("SELECT 1")
        .execute(&mut conn)
        .await
        .map_err(|e| classify_sqlx(&e))?;
    let _ = conn.close().await;

    Ok(format!("SELECT 1 succeeded on {}:{}/{}", target.host, target.port, target.database))
}

async fn probe_sql_server(target: &RelationalTarget) -> Result<String, ProbeError> {
    let mut config = Config::new();
    config.host(&target.host);
    config.port(target.port);
    config.database(&target.database);
    config.authentication(AuthMethod::sql_server(&target.username, target.password.expose()));
    config.application_name("connwatch");
    if target.trust_server_certificate() {
        config.trust_cert();
    }
    if !target.encrypt() {
        config.encryption(EncryptionLevel::Off);
    }

    let tcp = connect_tcp(&target.host, target.port).await?;
    let mut client = Client::connect(config, tcp.compat_write())
        .await
        .map_err(|e| classify_tiberius(&e))?;

    client
        .simple_query("SELECT 1")
        .await
        .map_err(|e| classify_tiberius(&e))?
        .into_results()
        .await
        .map_err(|e| classify_tiberius(&e))?;
    let _ = client.close().await;

    Ok(format!("SELECT 1 succeeded on {}:{}/{}", target.host, target.port, target.database))
}

/// Oracle has no pure-Rust client; a listener that accepts the socket is
/// reported as reachable with credentials unverified.
async fn probe_oracle(target: &RelationalTarget) -> Result<String, ProbeError> {
    let _stream = connect_tcp(&target.host, target.port).await?;
    Ok(format!(
        "listener reachable at {}:{}; credentials were not verified",
        target.host, target.port
    ))
}

fn classify_sqlx(err: &sqlx::Error) -> ProbeError {
    match err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            // SQLSTATE class 28: invalid authorization; MySQL 1045 reports 28000
            if code.starts_with("28") {
                ProbeError::auth_rejected(db.message().to_string())
            } else {
                ProbeError::unexpected(format!("{} ({})", db.message(), code))
            }
        }
        sqlx::Error::Io(io) => ProbeError::from_io("database connection", io),
        sqlx::Error::Tls(e) => ProbeError::handshake(format!("TLS negotiation failed: {}", e)),
        sqlx::Error::Protocol(message) => ProbeError::handshake(format!("protocol error: {}", message)),
        sqlx::Error::Configuration(e) => ProbeError::new(ErrorCode::InvalidFormat, e.to_string()),
        other => ProbeError::unexpected(other.to_string()),
    }
}

fn classify_tiberius(err: &tiberius::error::Error) -> ProbeError {
    use tiberius::error::Error;

    match err {
        Error::Server(token) if token.code() == MSSQL_LOGIN_FAILED => {
            ProbeError::auth_rejected(token.message().to_string())
        }
        Error::Server(token) => ProbeError::unexpected(format!("{} ({})", token.message(), token.code())),
        Error::Io { message, .. } => ProbeError::unreachable(message.clone()),
        Error::Tls(message) => ProbeError::handshake(format!("TLS negotiation failed: {}", message)),
        Error::Protocol(message) => ProbeError::handshake(format!("protocol error: {}", message)),
        Error::Routing { host, port } => {
            ProbeError::unexpected(format!("server redirected the login to {}:{}", host, port))
        }
        other => ProbeError::unexpected(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnectionDraft;
    use crate::secrets::Secret;
    use tokio::net::TcpListener;

    async fn target_on(connection_type: ConnectionType, port: u16) -> ConnectionTarget {
        let mut draft = ConnectionDraft::new("app-1", connection_type);
        draft.server = Some("127.0.0.1".to_string());
        draft.port = Some(port);
        draft.database = Some("app".to_string());
        draft.username = Some("svc".to_string());
        crate::builder::build(&draft, Some(&Secret::Password("pw".to_string()))).unwrap()
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn test_oracle_reports_reachability_only() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = target_on(ConnectionType::Oracle, port).await;

        let message = RelationalProbe
            .probe(&target, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(message.contains("credentials were not verified"));
    }

    #[tokio::test]
    async fn test_refused_port_is_unreachable() {
        let port = closed_port().await;
        for connection_type in [ConnectionType::PostgreSql, ConnectionType::MySql, ConnectionType::SqlServer] {
            let target = target_on(connection_type, port).await;
            let err = RelationalProbe
                .probe(&target, Duration::from_secs(1))
                .await
                .unwrap_err();
            assert_eq!(err.code, ErrorCode::Unreachable, "{}", connection_type);
        }
    }

    #[tokio::test]
    async fn test_rejects_foreign_target() {
        let mut draft = ConnectionDraft::new("app-1", ConnectionType::RestApi);
        draft.server = Some("api.example.com".to_string());
        let target = crate::builder::build(&draft, None).unwrap();

        let err = RelationalProbe
            .probe(&target, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedOperation);
    }
}
