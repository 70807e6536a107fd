// crates/api/src/auth.rs
//! Bearer-token lookup for API requests.
//!
//! Tokens are read fresh on every request and every stream connect, never
//! cached by the client, so a rotated credential takes effect on the next
//! call rather than after a restart.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;

/// Environment variable overriding the credentials file.
pub const TOKEN_ENV: &str = "SPENDLENS_TOKEN";

/// Source of the bearer token attached to API requests.
pub trait TokenProvider: Send + Sync {
    /// The current token, or `None` when the request should go out
    /// unauthenticated.
    fn token(&self) -> Option<String>;
}

/// Reads `SPENDLENS_TOKEN` on every call.
#[derive(Debug, Default)]
pub struct EnvTokenProvider;

impl TokenProvider for EnvTokenProvider {
    fn token(&self) -> Option<String> {
        std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty())
    }
}

/// Fixed token, for tests and the `--token` CLI flag.
pub struct StaticTokenProvider(String);

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenProvider for StaticTokenProvider {
    fn token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Shape of `credentials.json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialsFile {
    access_token: String,
}

/// Reads the access token from a credentials file on every call. Missing
/// or malformed files yield `None`; the request then goes out without a
/// token and the server decides.
pub struct FileTokenProvider {
    path: PathBuf,
}

impl FileTokenProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.config/spendlens/credentials.json` (platform equivalent), or
    /// `None` when no config directory can be resolved.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("spendlens").join("credentials.json"))
    }
}

impl TokenProvider for FileTokenProvider {
    fn token(&self) -> Option<String> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(_) => {
                tracing::debug!(path = %self.path.display(), "no credentials file");
                return None;
            }
        };
        let creds: CredentialsFile = match serde_json::from_slice(&bytes) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "failed to parse credentials file");
                return None;
            }
        };
        if creds.access_token.is_empty() {
            None
        } else {
            Some(creds.access_token)
        }
    }
}

/// First provider with a token wins.
pub struct TokenChain(Vec<Arc<dyn TokenProvider>>);

impl TokenChain {
    pub fn new(providers: Vec<Arc<dyn TokenProvider>>) -> Self {
        Self(providers)
    }
}

impl TokenProvider for TokenChain {
    fn token(&self) -> Option<String> {
        self.0.iter().find_map(|p| p.token())
    }
}

/// The standard lookup order: `SPENDLENS_TOKEN`, then the credentials file.
pub fn default_chain() -> Arc<dyn TokenProvider> {
    let mut providers: Vec<Arc<dyn TokenProvider>> = vec![Arc::new(EnvTokenProvider)];
    if let Some(path) = FileTokenProvider::default_path() {
        providers.push(Arc::new(FileTokenProvider::new(path)));
    }
    Arc::new(TokenChain::new(providers))
}
