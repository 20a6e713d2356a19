//! folio-server: collaboration gateway for manuscript sections.
//!
//! Usage:
//!   folio-server --bind 0.0.0.0:9090 --data-dir ./folio_data
//!   folio-server --in-memory --dev-auth
//!   folio-server --tokens tokens.json
//!
//! Token file:
//! ```json
//! [
//!   {"token": "t-ada", "user_id": "ada", "display_name": "Ada Lovelace"},
//!   {"token": "t-bo", "user_id": "bo", "documents": ["paper-1", "paper-2"]}
//! ]
//! ```

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;
use serde::Deserialize;

use folio_collab::auth::{Authenticator, QueryAuthenticator, TokenAuthenticator, UserIdentity};
use folio_collab::server::{CollabServer, ServerConfig};
use folio_collab::storage::{MemoryStore, RocksStore, SnapshotStore, StoreConfig};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "folio-server")]
#[command(about = "Real-time collaborative editing server for manuscript sections")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory for section snapshots
    #[arg(short, long, default_value = "folio_data")]
    data_dir: PathBuf,

    /// Keep sections in memory only
    #[arg(long, conflicts_with = "data_dir")]
    in_memory: bool,

    /// JSON token file: a list of `{token, user_id, display_name?, documents?}`
    #[arg(short, long)]
    tokens: Option<PathBuf>,

    /// Trust `?user=&name=` query parameters (development only)
    #[arg(long, conflicts_with = "tokens")]
    dev_auth: bool,

    /// Maximum participants per document
    #[arg(long, default_value_t = 100)]
    max_participants: usize,

    /// Maximum open sections per document
    #[arg(long, default_value_t = 256)]
    max_sections: usize,

    /// Seconds without a heartbeat before a participant is evicted
    #[arg(long, default_value_t = 30)]
    heartbeat_timeout: u64,

    /// Seconds a lock may sit idle before it is released
    #[arg(long, default_value_t = 120)]
    lock_idle_timeout: u64,

    /// fsync every snapshot write
    #[arg(long)]
    sync_writes: bool,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig {
            bind_addr: self.bind.clone(),
            max_participants_per_room: self.max_participants,
            max_sections_per_room: self.max_sections,
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout),
            ..ServerConfig::default()
        };
        config.section.lock_idle_timeout = Duration::from_secs(self.lock_idle_timeout);
        config
    }

    fn store(&self) -> Result<Arc<dyn SnapshotStore>, Box<dyn Error>> {
        if self.in_memory {
            info!("Sections are kept in memory only");
            return Ok(Arc::new(MemoryStore::new()));
        }
        let config = StoreConfig {
            path: self.data_dir.clone(),
            sync_writes: self.sync_writes,
            ..StoreConfig::default()
        };
        let store = RocksStore::open(config)?;
        info!("Section store at {}", self.data_dir.display());
        Ok(Arc::new(store))
    }

    fn authenticator(&self) -> Result<Arc<dyn Authenticator>, Box<dyn Error>> {
        match &self.tokens {
            Some(path) => {
                let auth = load_tokens(path)?;
                info!("Loaded {} access tokens", auth.len());
                Ok(Arc::new(auth))
            }
            None if self.dev_auth => {
                log::warn!("Development auth enabled: identities come from the query string");
                Ok(Arc::new(QueryAuthenticator))
            }
            None => Err("either --tokens or --dev-auth is required".into()),
        }
    }
}

/// One entry of the token file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TokenGrant {
    token: String,
    user_id: String,
    #[serde(default)]
    display_name: Option<String>,
    /// Documents the token may open; all documents when absent
    #[serde(default)]
    documents: Option<Vec<String>>,
}

fn load_tokens(path: &Path) -> Result<TokenAuthenticator, Box<dyn Error>> {
    let contents = std::fs::read_to_string(path)?;
    parse_tokens(&contents).map_err(|e| format!("{}: {e}", path.display()).into())
}

fn parse_tokens(contents: &str) -> Result<TokenAuthenticator, serde_json::Error> {
    let grants: Vec<TokenGrant> = serde_json::from_str(contents)?;
    Ok(grants.into_iter().fold(TokenAuthenticator::new(), |auth, grant| {
        let display_name = grant.display_name.unwrap_or_else(|| grant.user_id.clone());
        let identity = UserIdentity::new(grant.user_id, display_name);
        match grant.documents {
            Some(documents) => auth.with_restricted_token(grant.token, identity, documents),
            None => auth.with_token(grant.token, identity),
        }
    }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    info!("Starting folio-server...");

    let server = CollabServer::new(args.server_config(), args.store()?, args.authenticator()?);
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("folio-server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_collab::auth::ConnectionRequest;

    #[test]
    fn test_parse_tokens() {
        let auth = parse_tokens(
            r#"[
                {"token": "t-ada", "user_id": "ada", "display_name": "Ada Lovelace"},
                {"token": "t-bo", "user_id": "bo", "documents": ["paper-1", "paper-2"]}
            ]"#,
        )
        .unwrap();
        assert_eq!(auth.len(), 2);

        let ada = auth
            .authenticate(&ConnectionRequest::from_uri("/?token=t-ada"))
            .unwrap();
        assert_eq!(ada.display_name, "Ada Lovelace");
        assert!(auth.authorize(&ada, "anything").is_ok());

        let bo = auth
            .authenticate(&ConnectionRequest::from_uri("/?token=t-bo"))
            .unwrap();
        assert_eq!(bo.display_name, "bo");
        assert!(auth.authorize(&bo, "paper-2").is_ok());
        assert!(auth.authorize(&bo, "paper-3").is_err());
    }

    #[test]
    fn test_parse_tokens_rejects_malformed_grants() {
        assert!(parse_tokens(r#"[{"token": "lonely"}]"#).is_err());
        assert!(parse_tokens(r#"[{"token": "t", "user_id": "u", "role": "admin"}]"#).is_err());
        assert!(parse_tokens("t-ada ada").is_err());
        assert_eq!(parse_tokens("[]").unwrap().len(), 0);
    }

    #[test]
    fn test_args_map_onto_config() {
        let args = Args::parse_from([
            "folio-server",
            "--bind",
            "0.0.0.0:7000",
            "--in-memory",
            "--dev-auth",
            "--heartbeat-timeout",
            "10",
            "--lock-idle-timeout",
            "60",
        ]);
        let config = args.server_config();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(10));
        assert_eq!(config.section.lock_idle_timeout, Duration::from_secs(60));
        assert_eq!(config.max_sections_per_room, 256);
        assert!(args.store().is_ok());
        assert!(args.authenticator().is_ok());
    }

    #[test]
    fn test_auth_mode_required() {
        let args = Args::parse_from(["folio-server", "--in-memory"]);
        assert!(args.authenticator().is_err());
    }
}
