//! Configuration loading.
//!
//! A JSON file in the data directory is deserialized into [`dto::ConfFile`]
//! and resolved into [`Conf`]. Missing file means first start: a default
//! file is written so operators have something to edit.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use tap::prelude::*;

const DEFAULT_SSH_LISTENER: &str = "0.0.0.0:22";
const DEFAULT_CHANNEL_OPEN_TIMEOUT_SECS: u64 = 20;

pub fn get_data_dir() -> Utf8PathBuf {
    if let Ok(dir) = std::env::var("DRAWBRIDGE_HOME") {
        Utf8PathBuf::from(dir)
    } else {
        Utf8PathBuf::from("/var/lib/drawbridge")
    }
}

#[derive(Debug, Clone)]
pub struct Conf {
    pub hostname: String,
    pub ssh_listener: SocketAddr,
    pub database_path: Utf8PathBuf,
    pub recording_path: Utf8PathBuf,
    pub host_key_file: Utf8PathBuf,
    pub log_file: Utf8PathBuf,
    pub log_directive: String,
    pub rdp_enabled: bool,
    /// How long a freshly authenticated client may take to open its first
    /// channel before the connection is dropped.
    pub channel_open_timeout: Duration,
}

impl Conf {
    fn from_conf_file(conf_file: &dto::ConfFile) -> anyhow::Result<Self> {
        let data_dir = get_data_dir();

        let hostname = conf_file
            .hostname
            .clone()
            .unwrap_or_else(|| default_hostname().unwrap_or_else(|| "localhost".to_owned()));

        let ssh_listener = conf_file
            .ssh_listener
            .as_deref()
            .unwrap_or(DEFAULT_SSH_LISTENER)
            .parse::<SocketAddr>()
            .context("invalid SshListener address")?;

        let database_path = conf_file
            .database_file
            .clone()
            .unwrap_or_else(|| data_dir.join("drawbridge.db"));

        let recording_path = conf_file
            .recording_path
            .clone()
            .unwrap_or_else(|| data_dir.join("recordings"));

        let host_key_file = conf_file
            .host_key_file
            .clone()
            .unwrap_or_else(|| data_dir.join("ssh_host_key"));

        let log_file = conf_file.log_file.clone().unwrap_or_else(|| data_dir.join("gateway"));

        let log_directive = conf_file
            .log_directive
            .clone()
            .unwrap_or_else(|| "info,russh=warn".to_owned());

        let channel_open_timeout = Duration::from_secs(
            conf_file
                .channel_open_timeout_secs
                .unwrap_or(DEFAULT_CHANNEL_OPEN_TIMEOUT_SECS),
        );

        Ok(Conf {
            hostname,
            ssh_listener,
            database_path,
            recording_path,
            host_key_file,
            log_file,
            log_directive,
            rdp_enabled: conf_file.rdp_enabled.unwrap_or(true),
            channel_open_timeout,
        })
    }
}

#[derive(Clone)]
pub struct ConfHandle {
    inner: Arc<Conf>,
}

impl ConfHandle {
    /// Reads the configuration file, writing a default one on first start.
    pub fn init() -> anyhow::Result<Self> {
        let conf_file = load_conf_file_or_generate()?;
        let conf = Conf::from_conf_file(&conf_file)?;

        Ok(Self { inner: Arc::new(conf) })
    }

    pub fn from_conf(conf: Conf) -> Self {
        Self { inner: Arc::new(conf) }
    }

    pub fn get_conf(&self) -> Arc<Conf> {
        Arc::clone(&self.inner)
    }
}

fn conf_file_path() -> Utf8PathBuf {
    get_data_dir().join("gateway.json")
}

fn load_conf_file_or_generate() -> anyhow::Result<dto::ConfFile> {
    let path = conf_file_path();

    if path.exists() {
        std::fs::read_to_string(&path)
            .with_context(|| format!("couldn't read {path}"))?
            .pipe_deref(serde_json::from_str)
            .with_context(|| format!("invalid config file at {path}"))
    } else {
        let defaults = dto::ConfFile::default();
        std::fs::create_dir_all(get_data_dir()).context("couldn't create data directory")?;
        std::fs::write(&path, serde_json::to_string_pretty(&defaults)?)
            .with_context(|| format!("couldn't write default config to {path}"))?;
        Ok(defaults)
    }
}

fn default_hostname() -> Option<String> {
    let hostname = std::process::Command::new("hostname").output().ok()?;
    let hostname = String::from_utf8(hostname.stdout).ok()?;
    let hostname = hostname.trim();
    (!hostname.is_empty()).then(|| hostname.to_owned())
}

pub mod dto {
    use camino::Utf8PathBuf;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct ConfFile {
        /// Name advertised in logs; defaults to the machine hostname.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub hostname: Option<String>,
        /// Address the SSH proxy listens on, `host:port`.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub ssh_listener: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub database_file: Option<Utf8PathBuf>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub recording_path: Option<Utf8PathBuf>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub host_key_file: Option<Utf8PathBuf>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub log_file: Option<Utf8PathBuf>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub log_directive: Option<String>,
        /// Bring up RDP listeners on the allocated proxy addresses.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub rdp_enabled: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub channel_open_timeout_secs: Option<u64>,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve() {
        let conf = Conf::from_conf_file(&dto::ConfFile::default()).unwrap();
        assert_eq!(conf.ssh_listener.port(), 22);
        assert!(conf.rdp_enabled);
        assert_eq!(conf.channel_open_timeout, Duration::from_secs(20));
    }

    #[test]
    fn conf_file_round_trips() {
        let json = r#"{
            "SshListener": "10.0.160.129:2222",
            "RdpEnabled": false,
            "LogDirective": "debug"
        }"#;
        let file: dto::ConfFile = serde_json::from_str(json).unwrap();
        let conf = Conf::from_conf_file(&file).unwrap();
        assert_eq!(conf.ssh_listener.port(), 2222);
        assert!(!conf.rdp_enabled);
        assert_eq!(conf.log_directive, "debug");
    }
}
