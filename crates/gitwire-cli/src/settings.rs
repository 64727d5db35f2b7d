//! Client configuration from file, environment and flags.
//!
//! Later sources win: built-in defaults, then `gitwire.yaml` (or the file
//! given with `--config`), then `GITWIRE_*` variables, then flags. Nested
//! keys use a double underscore, e.g. `GITWIRE_HTTP__TIMEOUT_SECS=60`.

use anyhow::{bail, Context as _, Result};
use config::{Config, Environment, File};
use gitwire_protocol::{ClientConfig, ProtocolVersion};
use std::path::Path;

/// Default configuration file, looked up in the working directory.
const DEFAULT_FILE: &str = "gitwire";

pub fn load(path: Option<&Path>, protocol: Option<u8>) -> Result<ClientConfig> {
    let mut builder = Config::builder();
    builder = match path {
        Some(path) => builder.add_source(File::from(path).required(true)),
        None => builder.add_source(File::with_name(DEFAULT_FILE).required(false)),
    };
    builder = builder.add_source(
        Environment::with_prefix("GITWIRE")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    let mut client: ClientConfig = builder
        .build()
        .context("failed to load configuration")?
        .try_deserialize()
        .context("invalid configuration")?;

    if let Some(version) = protocol {
        client.protocol_version = match ProtocolVersion::try_from(version) {
            Ok(version) => version,
            Err(_) => bail!("unsupported protocol version {version}"),
        };
    }
    tracing::debug!(agent = %client.agent, version = %client.protocol_version, "configuration loaded");
    Ok(client)
}
