//! Server configuration: defaults, then an optional file, then
//! `MODEL_SERVER__*` environment variables, then command-line flags.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dataplane_core::cloudevent::CloudEventOptions;
use dataplane_core::{DataPlaneConfig, Protocol, RemoteModelConfig};
use serde::{Deserialize, Serialize};

pub const ENV_PREFIX: &str = "MODEL_SERVER";
pub const CONFIG_FILE_ENV: &str = "MODEL_SERVER_CONFIG_FILE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server_name: String,
    pub http_port: u16,
    pub grpc_port: u16,
    pub enable_grpc: bool,
    /// Runtime worker threads; unset uses the tokio default.
    #[serde(default)]
    pub workers: Option<usize>,
    pub max_body_bytes: usize,
    pub models_dir: String,
    #[serde(default)]
    pub model_names: Vec<String>,
    #[serde(default)]
    pub predictor_host: Option<String>,
    #[serde(default)]
    pub explainer_host: Option<String>,
    pub predictor_protocol: String,
    pub predictor_use_ssl: bool,
    pub request_timeout_secs: u64,
    pub probe_retries: usize,
    pub probe_backoff_ms: u64,
    pub lazy_load: bool,
    pub enable_latency_logging: bool,
    #[serde(default)]
    pub ce_source: Option<String>,
    #[serde(default)]
    pub ce_type: Option<String>,
    pub ce_merge: bool,
    pub log_level: String,
    pub json_log: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "model-server".into(),
            http_port: 8080,
            grpc_port: 8081,
            enable_grpc: true,
            workers: None,
            max_body_bytes: 16 * 1024 * 1024,
            models_dir: "/mnt/models".into(),
            model_names: vec![],
            predictor_host: None,
            explainer_host: None,
            predictor_protocol: "v1".into(),
            predictor_use_ssl: false,
            request_timeout_secs: 60,
            probe_retries: 5,
            probe_backoff_ms: 500,
            lazy_load: false,
            enable_latency_logging: false,
            ce_source: None,
            ce_type: None,
            ce_merge: false,
            log_level: "info".into(),
            json_log: false,
        }
    }
}

impl ServerConfig {
    pub fn http_addr(&self) -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], self.http_port)) }

    pub fn grpc_addr(&self) -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], self.grpc_port)) }

    pub fn dataplane_config(&self) -> DataPlaneConfig {
        DataPlaneConfig {
            server_name: self.server_name.clone(),
            lazy_load: self.lazy_load,
            enable_latency_logging: self.enable_latency_logging,
            cloudevents: CloudEventOptions { source: self.ce_source.clone(), event_type: self.ce_type.clone(), merge: self.ce_merge },
        }
    }

    /// Remote handle settings when a predictor host is configured.
    pub fn remote_config(&self) -> Result<Option<RemoteModelConfig>> {
        let Some(host) = &self.predictor_host else { return Ok(None) };
        let protocol: Protocol = self.predictor_protocol.parse().with_context(|| format!("predictor_protocol {}", self.predictor_protocol))?;
        let mut cfg = RemoteModelConfig::new(host.clone(), protocol);
        cfg.explainer_host = self.explainer_host.clone();
        cfg.timeout = Duration::from_secs(self.request_timeout_secs);
        cfg.probe_retries = self.probe_retries;
        cfg.probe_backoff = Duration::from_millis(self.probe_backoff_ms);
        cfg.use_ssl = self.predictor_use_ssl;
        Ok(Some(cfg))
    }
}

#[derive(Debug, Default, Parser)]
#[command(name = "model-server", about = "Open inference protocol model server")]
pub struct Cli {
    /// Configuration file (YAML, TOML or JSON).
    #[arg(long, env = CONFIG_FILE_ENV)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub http_port: Option<u16>,
    #[arg(long)]
    pub grpc_port: Option<u16>,
    #[arg(long)]
    pub enable_grpc: Option<bool>,
    #[arg(long)]
    pub workers: Option<usize>,
    #[arg(long)]
    pub max_body_bytes: Option<usize>,
    #[arg(long)]
    pub models_dir: Option<String>,
    /// May be repeated.
    #[arg(long = "model-name")]
    pub model_names: Vec<String>,
    #[arg(long)]
    pub predictor_host: Option<String>,
    #[arg(long)]
    pub explainer_host: Option<String>,
    #[arg(long)]
    pub predictor_protocol: Option<String>,
    #[arg(long)]
    pub predictor_use_ssl: Option<bool>,
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,
    #[arg(long)]
    pub lazy_load: Option<bool>,
    #[arg(long)]
    pub enable_latency_logging: Option<bool>,
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Cli {
    fn apply(self, cfg: &mut ServerConfig) {
        if let Some(v) = self.http_port { cfg.http_port = v; }
        if let Some(v) = self.grpc_port { cfg.grpc_port = v; }
        if let Some(v) = self.enable_grpc { cfg.enable_grpc = v; }
        if self.workers.is_some() { cfg.workers = self.workers; }
        if let Some(v) = self.max_body_bytes { cfg.max_body_bytes = v; }
        if let Some(v) = self.models_dir { cfg.models_dir = v; }
        if !self.model_names.is_empty() { cfg.model_names = self.model_names; }
        if self.predictor_host.is_some() { cfg.predictor_host = self.predictor_host; }
        if self.explainer_host.is_some() { cfg.explainer_host = self.explainer_host; }
        if let Some(v) = self.predictor_protocol { cfg.predictor_protocol = v; }
        if let Some(v) = self.predictor_use_ssl { cfg.predictor_use_ssl = v; }
        if let Some(v) = self.request_timeout_secs { cfg.request_timeout_secs = v; }
        if let Some(v) = self.lazy_load { cfg.lazy_load = v; }
        if let Some(v) = self.enable_latency_logging { cfg.enable_latency_logging = v; }
        if let Some(v) = self.log_level { cfg.log_level = v; }
    }
}

/// Merges defaults, the config file, the environment and `cli`.
pub fn load_config(cli: Cli) -> Result<ServerConfig> {
    let d = ServerConfig::default();
    let mut builder = config::Config::builder()
        .set_default("server_name", d.server_name.clone())?
        .set_default("http_port", d.http_port as i64)?
        .set_default("grpc_port", d.grpc_port as i64)?
        .set_default("enable_grpc", d.enable_grpc)?
        .set_default("max_body_bytes", d.max_body_bytes as i64)?
        .set_default("models_dir", d.models_dir.clone())?
        .set_default("predictor_protocol", d.predictor_protocol.clone())?
        .set_default("predictor_use_ssl", d.predictor_use_ssl)?
        .set_default("request_timeout_secs", d.request_timeout_secs as i64)?
        .set_default("probe_retries", d.probe_retries as i64)?
        .set_default("probe_backoff_ms", d.probe_backoff_ms as i64)?
        .set_default("lazy_load", d.lazy_load)?
        .set_default("enable_latency_logging", d.enable_latency_logging)?
        .set_default("ce_merge", d.ce_merge)?
        .set_default("log_level", d.log_level.clone())?
        .set_default("json_log", d.json_log)?;

    if let Some(file) = &cli.config {
        builder = builder.add_source(config::File::from(file.as_path()).required(true));
    }
    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("model_names"),
    );
    let mut cfg: ServerConfig = builder.build()?.try_deserialize().context("invalid server configuration")?;
    cli.apply(&mut cfg);
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_sources() {
        let cfg = load_config(Cli::default()).unwrap();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.grpc_port, 8081);
        assert_eq!(cfg.max_body_bytes, 16 * 1024 * 1024);
        assert!(cfg.remote_config().unwrap().is_none());
        assert!(!cfg.dataplane_config().lazy_load);
    }

    #[test]
    fn file_then_cli_override() {
        let mut f = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(f, "http_port: 9000\nlazy_load: true\npredictor_host: predictor.local:8080\npredictor_protocol: grpc-v2\nmodel_names: [a, b]").unwrap();
        let cli = Cli { config: Some(f.path().to_path_buf()), http_port: Some(9100), ..Default::default() };
        let cfg = load_config(cli).unwrap();
        assert_eq!(cfg.http_port, 9100);
        assert!(cfg.lazy_load);
        assert_eq!(cfg.model_names, vec!["a".to_string(), "b".to_string()]);
        let remote = cfg.remote_config().unwrap().unwrap();
        assert_eq!(remote.protocol, Protocol::GrpcV2);
        assert_eq!(remote.timeout, Duration::from_secs(60));
    }

    #[test]
    fn bad_protocol_is_rejected() {
        let cfg = ServerConfig { predictor_host: Some("h".into()), predictor_protocol: "v9".into(), ..Default::default() };
        assert!(cfg.remote_config().is_err());
    }

    #[test]
    fn cli_parses_repeated_model_names() {
        let cli = Cli::parse_from(["model-server", "--model-name", "a", "--model-name", "b", "--lazy-load", "true"]);
        assert_eq!(cli.model_names, vec!["a", "b"]);
        assert_eq!(cli.lazy_load, Some(true));
    }
}
