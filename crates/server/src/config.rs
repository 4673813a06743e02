//! Server configuration file.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use spindle_rpc::SessionConfig;

/// Contents of the `--config` TOML file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
	/// Address to listen on.
	#[serde(default = "default_listen")]
	pub listen: SocketAddr,
	/// Settings applied to every accepted session.
	#[serde(default)]
	pub session: SessionConfig,
}

/// Returns the default listen address.
pub fn default_listen() -> SocketAddr {
	SocketAddr::from(([127, 0, 0, 1], 7878))
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			listen: default_listen(),
			session: SessionConfig::default(),
		}
	}
}

impl ServerConfig {
	/// Parses and validates a configuration document.
	///
	/// # Errors
	///
	/// Fails on TOML syntax errors, unknown keys and invalid session settings.
	pub fn parse(text: &str) -> anyhow::Result<Self> {
		let config: Self = toml::from_str(text)?;
		config.session.validate()?;
		Ok(config)
	}

	/// Reads `path`, or returns the defaults when no path is given.
	///
	/// # Errors
	///
	/// Fails if the file cannot be read or parsed.
	pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
		let Some(path) = path else {
			return Ok(Self::default());
		};
		let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
		Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use spindle_rpc::{Framing, WireFormat};

	use super::*;

	#[test]
	fn empty_document_uses_defaults() {
		assert_eq!(ServerConfig::parse("").expect("parse"), ServerConfig::default());
	}

	#[test]
	fn session_table_is_nested() {
		let config = ServerConfig::parse(
			r#"
			listen = "0.0.0.0:9000"

			[session]
			format = "json"
			framing = "content-length"
			call_timeout_ms = 250
			"#,
		)
		.expect("parse");
		assert_eq!(config.listen, "0.0.0.0:9000".parse().expect("addr"));
		assert_eq!(config.session.format, WireFormat::Json);
		assert_eq!(config.session.framing(), Framing::ContentLength);
		assert_eq!(config.session.call_timeout_ms, Some(250));
	}

	#[test]
	fn invalid_session_settings_are_rejected() {
		let err = ServerConfig::parse("[session]\nformat = \"native\"\nframing = \"json-stream\"\n")
			.expect_err("json-stream cannot carry postcard");
		assert!(err.to_string().contains("configuration"), "{err}");
	}

	#[test]
	fn unknown_keys_are_rejected() {
		assert!(ServerConfig::parse("port = 1\n").is_err());
	}

	#[test]
	fn missing_file_reports_path() {
		let err = ServerConfig::load(Some(Path::new("/nonexistent/spindle.toml"))).expect_err("missing");
		assert!(format!("{err:#}").contains("/nonexistent/spindle.toml"));
	}
}
