// npc/src/tunnel_file.rs
//
// Loading of the tunnel file used by the file-driven mode and `status`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use npc_core::client::{ClientError, ClientOptions};
use npc_core::config::TransportKind;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommonSection {
    pub server_addr: String,
    pub vkey: String,
    #[serde(default = "default_conn_type")]
    pub conn_type: TransportKind,
    #[serde(default)]
    pub proxy_url: Option<String>,
    /// Seconds
    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout: u64,
}

fn default_conn_type() -> TransportKind {
    TransportKind::Tcp
}

fn default_disconnect_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TunnelSpec {
    pub mode: String,
    pub server_port: u16,
    pub target_addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelFile {
    pub common: CommonSection,
    /// Declaration order is kept.
    pub tunnels: Vec<(String, TunnelSpec)>,
}

impl TunnelFile {
    pub fn load(path: &Path) -> Result<Self, ClientError> {
        debug!("loading tunnel file {:?}", path);
        let content = fs::read_to_string(path).map_err(|err| file_error(path, err))?;
        let value: toml::Value = content.parse().map_err(|err| file_error(path, err))?;
        let file = Self::from_toml_value(value).map_err(|reason| ClientError::TunnelFile {
            path: path.display().to_string(),
            reason,
        })?;
        info!("loaded {} tunnels from {:?}", file.tunnels.len(), path);
        Ok(file)
    }

    fn from_toml_value(value: toml::Value) -> Result<Self, String> {
        let table = value.as_table().ok_or("root must be a table")?;

        let common: CommonSection = table
            .get("common")
            .ok_or("missing [common] table")?
            .clone()
            .try_into()
            .map_err(|err| format!("[common]: {err}"))?;

        let mut tunnels = Vec::new();
        if let Some(section) = table.get("tunnels").and_then(|v| v.as_table()) {
            for (name, value) in section {
                let spec: TunnelSpec = value
                    .clone()
                    .try_into()
                    .map_err(|err| format!("[tunnels.{name}]: {err}"))?;
                tunnels.push((name.clone(), spec));
            }
        }

        Ok(TunnelFile { common, tunnels })
    }

    /// Connection parameters of the `[common]` table.
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            endpoint: self.common.server_addr.clone(),
            auth_key: self.common.vkey.clone(),
            transport: self.common.conn_type,
            proxy_url: self.common.proxy_url.clone().filter(|p| !p.is_empty()),
            disconnect_timeout: Duration::from_secs(self.common.disconnect_timeout),
        }
    }
}

fn file_error(path: &Path, err: impl std::fmt::Display) -> ClientError {
    ClientError::TunnelFile {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}
