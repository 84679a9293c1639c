// Server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The database pool reads its own tuning vars — this module
// covers the core server settings.

use std::net::SocketAddr;

/// Core server configuration.
///
/// Constructed via [`ServerConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// JWT signing secret for connect-time credentials.
    pub jwt_secret: String,
    /// PostgreSQL connection string.
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `cinesync_server=debug`).
    pub log_filter: String,
}

const DEV_JWT_SECRET: &str = "cinesync_local_development_jwt_secret_32_chars_min";

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `CINESYNC_HOST` | `0.0.0.0` |
    /// | `CINESYNC_PORT` | `8080` |
    /// | `CINESYNC_JWT_SECRET` | dev-only placeholder |
    /// | `CINESYNC_DATABASE_URL` | *(none — required to serve)* |
    /// | `CINESYNC_CORS_ORIGINS` | *(none — cors.rs uses dev defaults)* |
    /// | `CINESYNC_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("CINESYNC_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("CINESYNC_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("CINESYNC_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());

        let database_url = env("CINESYNC_DATABASE_URL").ok();
        let cors_origins = env("CINESYNC_CORS_ORIGINS").ok();

        let log_filter = env("CINESYNC_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Self { listen_addr, jwt_secret, database_url, cors_origins, log_filter }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}
