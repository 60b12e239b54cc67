use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use switchboard_core::config::{
    HttpSettings, Settings, TransportSettings, WebSocketSettings,
};
use switchboard_mcp::tools::echo_tool;
use switchboard_mcp::transport::{HttpTransport, StdioTransport, WebSocketTransport};
use switchboard_mcp::{McpServer, OutboundClient, ToolRegistry, Transport};

const DEFAULT_BIND: &str = "127.0.0.1:8080";

/// Transport selected on the command line, replacing the configured list
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TransportKind {
    Stdio,
    Http,
    Websocket,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// File the settings were read from, if it existed
    pub source: Option<PathBuf>,
    pub settings: Settings,
}

impl ServerConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        // Load config file if it exists, otherwise use defaults
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read configuration file {}", config_path.display()))?;
            let settings = Settings::from_toml_str(&content)
                .with_context(|| format!("Failed to parse configuration file {}", config_path.display()))?;
            Ok(Self {
                source: Some(config_path.to_path_buf()),
                settings,
            })
        } else {
            tracing::info!(path = %config_path.display(), "Configuration file not found, using defaults");
            Ok(Self {
                source: None,
                settings: Settings::default(),
            })
        }
    }

    /// Apply `--transport` / `--bind`. A bind address without a transport
    /// applies to every configured listener.
    pub fn apply_overrides(&mut self, transport: Option<TransportKind>, bind: Option<String>) -> Result<()> {
        if let Some(kind) = transport {
            let bind = Some(bind.clone().unwrap_or_else(|| DEFAULT_BIND.to_string()));
            self.settings.transports = vec![match kind {
                TransportKind::Stdio => TransportSettings::Stdio,
                TransportKind::Http => TransportSettings::Http(HttpSettings {
                    bind,
                    ..Default::default()
                }),
                TransportKind::Websocket => TransportSettings::Websocket(WebSocketSettings {
                    bind,
                    ..Default::default()
                }),
            }];
        } else if let Some(bind) = bind {
            for transport in &mut self.settings.transports {
                match transport {
                    TransportSettings::Http(http) => http.bind = Some(bind.clone()),
                    TransportSettings::Websocket(ws) => ws.bind = Some(bind.clone()),
                    TransportSettings::Stdio => {}
                }
            }
        }

        self.settings
            .validate()
            .context("Invalid configuration after command-line overrides")
    }

    pub fn build_transports(&self) -> Result<Vec<Arc<dyn Transport>>> {
        let token = self.settings.auth.required_token().map(str::to_string);
        self.settings
            .transports
            .iter()
            .map(|transport| -> Result<Arc<dyn Transport>> {
                Ok(match transport {
                    TransportSettings::Stdio => Arc::new(StdioTransport::new()),
                    TransportSettings::Http(http) => Arc::new(
                        HttpTransport::new(http.clone())
                            .context("Failed to configure HTTP transport")?
                            .with_auth_token(token.clone()),
                    ),
                    TransportSettings::Websocket(ws) => Arc::new(
                        WebSocketTransport::new(ws.clone(), self.settings.reconnect.clone())
                            .context("Failed to configure WebSocket transport")?
                            .with_auth_token(token.clone()),
                    ),
                })
            })
            .collect()
    }

    /// Registry with the built-in tools
    pub fn build_registry(&self) -> Result<Arc<ToolRegistry>> {
        let registry = ToolRegistry::new(self.settings.tools.call_timeout());
        registry
            .register(echo_tool())
            .context("Failed to register built-in tools")?;
        Ok(Arc::new(registry))
    }

    pub fn build_outbound(&self) -> Result<Option<OutboundClient>> {
        self.settings
            .outbound
            .as_ref()
            .map(|outbound| {
                OutboundClient::new(outbound, self.settings.pool.clone())
                    .context("Failed to configure outbound client")
            })
            .transpose()
    }

    pub fn build_server(&self) -> Result<McpServer> {
        let mut builder = McpServer::builder()
            .name(self.settings.server.name.clone())
            .transports(self.build_transports()?)
            .tool_registry(self.build_registry()?)
            .session_config(self.settings.session.clone());
        if let Some(outbound) = self.build_outbound()? {
            builder = builder.outbound(outbound);
        }
        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::load(&dir.path().join("switchboard.toml")).unwrap();

        assert!(config.source.is_none());
        assert_eq!(config.settings.transports, vec![TransportSettings::Stdio]);
        assert_eq!(config.settings.server.name, "switchboard");
    }

    #[test]
    fn test_load_file() {
        let file = write_config(
            r#"
            [server]
            name = "edge"

            [[transports]]
            type = "http"
            bind = "127.0.0.1:0"

            [[transports]]
            type = "websocket"
            bind = "127.0.0.1:0"
            path = "/socket"

            [auth]
            method = "bearer"
            token = "s3cret"

            [pool]
            max_size = 4

            [outbound]
            type = "http"
            url = "http://localhost:9000/mcp"
            "#,
        );
        let config = ServerConfig::load(file.path()).unwrap();

        assert_eq!(config.source.as_deref(), Some(file.path()));
        assert_eq!(config.settings.server.name, "edge");
        assert_eq!(config.settings.transports.len(), 2);
        assert_eq!(config.settings.pool.max_size, 4);
        assert_eq!(config.settings.auth.required_token(), Some("s3cret"));

        let transports = config.build_transports().unwrap();
        let names: Vec<&str> = transports.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["http", "websocket"]);
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let file = write_config("[pool]\nmax_size = 0\n");
        let err = ServerConfig::load(file.path()).unwrap_err();
        let message = format!("{:#}", err);

        assert!(message.contains("Failed to parse configuration file"));
        assert!(message.contains("max_size"));
    }

    #[test]
    fn test_transport_override_replaces_list() {
        let mut config = ServerConfig {
            source: None,
            settings: Settings::default(),
        };
        config
            .apply_overrides(Some(TransportKind::Websocket), Some("0.0.0.0:9001".to_string()))
            .unwrap();

        match &config.settings.transports[..] {
            [TransportSettings::Websocket(ws)] => {
                assert_eq!(ws.bind.as_deref(), Some("0.0.0.0:9001"));
                assert_eq!(ws.path, "/ws");
            }
            other => panic!("unexpected transports: {:?}", other),
        }
    }

    #[test]
    fn test_bind_override_applies_to_listeners() {
        let mut config = ServerConfig {
            source: None,
            settings: Settings::default(),
        };
        config.settings.transports = vec![
            TransportSettings::Stdio,
            TransportSettings::Http(HttpSettings::default()),
        ];
        config.apply_overrides(None, Some("127.0.0.1:7000".to_string())).unwrap();

        assert_eq!(config.settings.transports[0], TransportSettings::Stdio);
        match &config.settings.transports[1] {
            TransportSettings::Http(http) => assert_eq!(http.bind.as_deref(), Some("127.0.0.1:7000")),
            other => panic!("unexpected transport: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_built_server_serves_echo() {
        let file = write_config(
            r#"
            [[transports]]
            type = "http"
            bind = "127.0.0.1:0"
            "#,
        );
        let config = ServerConfig::load(file.path()).unwrap();
        let server = config.build_server().unwrap();

        assert!(server.tools().contains("echo"));
        assert!(server.outbound().is_none());
        server.start().await.unwrap();
        assert!(server.health().iter().all(|h| h.healthy));
        server.stop().await.unwrap();
    }
}
