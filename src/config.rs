use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Lifetime of issued session tokens in seconds.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: i64,
    /// Fixed demo credentials. When both are set, a login with exactly this
    /// pair succeeds without touching the users table.
    #[serde(default)]
    pub demo_email: Option<String>,
    #[serde(default)]
    pub demo_password: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_token_ttl(),
            demo_email: None,
            demo_password: None,
        }
    }
}

fn default_token_ttl() -> i64 {
    86_400
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// External invoice-parsing service. The API key is read from the
/// `PARSER_API_KEY` environment variable, not from this file.
#[derive(Debug, Deserialize, Clone)]
pub struct ParserConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_parser_timeout")]
    pub timeout_secs: u64,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_parser_timeout(),
        }
    }
}

fn default_parser_timeout() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Upper bound on rows pulled into the linear cosine-similarity scan.
    #[serde(default = "default_max_scan")]
    pub max_scan: i64,
    #[serde(default = "default_final_limit")]
    pub final_limit: i64,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_scan: default_max_scan(),
            final_limit: default_final_limit(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

fn default_max_scan() -> i64 {
    500
}
fn default_final_limit() -> i64 {
    10
}
fn default_similarity_threshold() -> f32 {
    0.7
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    /// Fixed pacing delay between streamed characters.
    #[serde(default = "default_stream_delay_ms")]
    pub stream_delay_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            stream_delay_ms: default_stream_delay_ms(),
        }
    }
}

fn default_stream_delay_ms() -> u64 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    #[serde(default = "default_exports_dir")]
    pub exports_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            uploads_dir: default_uploads_dir(),
            exports_dir: default_exports_dir(),
        }
    }
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("./data/uploads")
}
fn default_exports_dir() -> PathBuf {
    PathBuf::from("./data/exports")
}

impl Config {
    /// All-defaults config pointing at throwaway paths. Test use only.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from(":memory:"),
            },
            server: ServerConfig {
                bind: "127.0.0.1:0".to_string(),
            },
            auth: AuthConfig::default(),
            embedding: EmbeddingConfig::default(),
            parser: ParserConfig::default(),
            retrieval: RetrievalConfig::default(),
            chat: ChatConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate auth
    if config.auth.token_ttl_secs < 60 {
        anyhow::bail!("auth.token_ttl_secs must be >= 60");
    }
    if config.auth.demo_email.is_some() != config.auth.demo_password.is_some() {
        anyhow::bail!("auth.demo_email and auth.demo_password must be set together");
    }

    // Validate retrieval
    if config.retrieval.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }
    if config.retrieval.max_scan < 1 {
        anyhow::bail!("retrieval.max_scan must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        anyhow::bail!("retrieval.similarity_threshold must be in [0.0, 1.0]");
    }

    // Validate embedding
    if config.embedding.provider == "openai" {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!("embedding.dims must be > 0 when provider is 'openai'");
        }
        if config.embedding.model.is_none() {
            anyhow::bail!("embedding.model must be specified when provider is 'openai'");
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "mock" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or mock.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("ledgerbox.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn minimal_config_loads_with_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_config(
            tmp.path(),
            r#"
[db]
path = "./data/app.sqlite"

[server]
bind = "127.0.0.1:8400"
"#,
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.embedding.provider, "disabled");
        assert_eq!(cfg.retrieval.max_scan, 500);
        assert_eq!(cfg.chat.stream_delay_ms, 20);
        assert_eq!(cfg.auth.token_ttl_secs, 86_400);
    }

    #[test]
    fn openai_provider_requires_model_and_dims() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_config(
            tmp.path(),
            r#"
[db]
path = "./data/app.sqlite"

[server]
bind = "127.0.0.1:8400"

[embedding]
provider = "openai"
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn demo_credentials_must_be_paired() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_config(
            tmp.path(),
            r#"
[db]
path = "./data/app.sqlite"

[server]
bind = "127.0.0.1:8400"

[auth]
demo_email = "demo@example.com"
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("demo_email"));
    }

    #[test]
    fn unknown_provider_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_config(
            tmp.path(),
            r#"
[db]
path = "./data/app.sqlite"

[server]
bind = "127.0.0.1:8400"

[embedding]
provider = "pgvector"
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }
}
