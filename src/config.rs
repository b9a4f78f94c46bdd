//! Configuration loading, grounded on `fritztv`'s `Settings`/`Args` split in
//! `main.rs` — a `clap` CLI overlay on a `config`-crate TOML file.

use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config.toml")]
    pub config: String,

    /// Override the public HTTP port
    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub remote: RemoteConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub metadata: MetadataApiConfig,
    pub metadata_api_key: String,
    #[serde(default)]
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub internal_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub api_id: String,
    pub api_hash: String,
    pub session: String,
    pub channel_id: i64,
    /// Base URL of the chat backend's HTTP bridge/gateway.
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataApiConfig {
    #[serde(default = "default_metadata_base_url")]
    pub base_url: String,
    #[serde(default = "default_metadata_image_base_url")]
    pub image_base_url: String,
}

impl Default for MetadataApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_metadata_base_url(),
            image_base_url: default_metadata_image_base_url(),
        }
    }
}

fn default_metadata_base_url() -> String {
    "https://api.themoviedb.org/3".to_string()
}

fn default_metadata_image_base_url() -> String {
    "https://image.tmdb.org/t/p/w500".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: u64,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_cache_size: default_max_cache_size(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_chunk_size() -> u64 {
    1024 * 1024
}

fn default_max_cache_size() -> u64 {
    100 * 1024 * 1024
}

fn default_data_dir() -> String {
    "./data".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AdminConfig {
    pub jwt_secret: Option<String>,
    pub admin_user: Option<String>,
    pub admin_password: Option<String>,
}

pub fn load(args: &Args) -> anyhow::Result<Settings> {
    let builder = config::Config::builder().add_source(config::File::with_name(&args.config));
    let built = builder.build()?;
    let mut settings: Settings = built.try_deserialize()?;
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    Ok(settings)
}
