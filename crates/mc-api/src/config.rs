use std::env;
use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub control_plane_api_key: String,
    /// Where the SSH keypair secret lives. Without it the keypair is kept
    /// in memory and a new one is generated on every start.
    pub database_url: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            listen_addr: env::var("LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".into())
                .parse()
                .expect("LISTEN_ADDR must be a valid socket address"),
            control_plane_api_key: env::var("CONTROL_PLANE_API_KEY")
                .expect("CONTROL_PLANE_API_KEY must be set"),
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
        }
    }
}
