//! Managed pluggable-transport configuration (client side).
//!
//! The host process (e.g. Tor) hands configuration to this proxy through
//! environment variables and expects announcements on stdout, one line per
//! event:
//!
//! ```text
//! VERSION 1
//! CMETHOD obfs2 socks5 127.0.0.1:43533
//! CMETHODS DONE
//! ```
//!
//! Only client operation is supported; a server-side environment is a
//! bootstrap failure.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const ENV_TRANSPORT_VER: &str = "TOR_PT_MANAGED_TRANSPORT_VER";
const ENV_CLIENT_TRANSPORTS: &str = "TOR_PT_CLIENT_TRANSPORTS";
const ENV_SERVER_TRANSPORTS: &str = "TOR_PT_SERVER_TRANSPORTS";
const ENV_STATE_LOCATION: &str = "TOR_PT_STATE_LOCATION";

/// The protocol version this proxy speaks.
const SUPPORTED_VERSION: &str = "1";

/// Client-side PT configuration, as supplied by the host.
#[derive(Debug, Clone)]
pub struct PtClientConfig {
    state_dir: PathBuf,
    transports: Vec<String>,
}

impl PtClientConfig {
    /// Read the managed-transport environment.
    ///
    /// Emits the `VERSION` (or `VERSION-ERROR`) line as a side effect; the
    /// state directory is created if missing.
    pub fn from_env() -> Result<Self> {
        let ver = env::var(ENV_TRANSPORT_VER).ok();
        let client = env::var(ENV_CLIENT_TRANSPORTS).ok();
        let server_mode = env::var_os(ENV_SERVER_TRANSPORTS).is_some();
        let state = env::var(ENV_STATE_LOCATION).ok();

        let config = match Self::parse(
            ver.as_deref(),
            client.as_deref(),
            server_mode,
            state.as_deref(),
        ) {
            Ok(config) => config,
            Err(e) => {
                if matches!(&e, Error::PtConfig(msg) if msg.contains("version")) {
                    println!("VERSION-ERROR no-version");
                }
                return Err(e);
            }
        };

        std::fs::create_dir_all(&config.state_dir)?;
        println!("VERSION {}", SUPPORTED_VERSION);
        Ok(config)
    }

    /// Validate the raw environment values.
    fn parse(
        ver: Option<&str>,
        client_transports: Option<&str>,
        server_mode: bool,
        state_dir: Option<&str>,
    ) -> Result<Self> {
        let ver = ver.ok_or_else(|| Error::pt_config("no managed transport version"))?;
        if !ver.split(',').any(|v| v.trim() == SUPPORTED_VERSION) {
            return Err(Error::pt_config(format!(
                "unsupported managed transport version {:?}",
                ver
            )));
        }

        if server_mode {
            return Err(Error::pt_config(
                "server transports requested; this proxy only runs as a client",
            ));
        }
        let transports: Vec<String> = client_transports
            .ok_or_else(|| Error::pt_config("no client transports requested"))?
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if transports.is_empty() {
            return Err(Error::pt_config("empty client transport list"));
        }

        let state_dir = state_dir.ok_or_else(|| Error::pt_config("no state directory"))?;

        Ok(Self {
            state_dir: PathBuf::from(state_dir),
            transports,
        })
    }

    /// The host-provided state directory (logs live here).
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Whether the host requested this method.
    pub fn is_requested(&self, method: &str) -> bool {
        self.transports.iter().any(|t| t == method || t == "*")
    }

    /// Announce a working method and its SOCKS5 address.
    pub fn report_method(&self, method: &str, addr: SocketAddr) {
        println!("CMETHOD {} socks5 {}", method, addr);
    }

    /// Announce a method that failed to come up.
    pub fn report_error(&self, method: &str, msg: &str) {
        println!("CMETHOD-ERROR {} {}", method, msg);
    }

    /// Announce that every requested method has been reported.
    pub fn methods_done(&self) {
        println!("CMETHODS DONE");
    }
}
