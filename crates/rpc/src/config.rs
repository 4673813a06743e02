//! Per-session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::WireFormat;
use crate::error::{Error, Result};
use crate::framer::Framing;

/// Settings of one session. Deserializes from a TOML/JSON table; every field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
	/// Wire format of message bodies.
	#[serde(default)]
	pub format: WireFormat,
	/// Framing override. Defaults to [`WireFormat::default_framing`].
	#[serde(default)]
	pub framing: Option<Framing>,
	/// Timeout applied to calls that do not pass one. `None` waits forever.
	#[serde(default)]
	pub call_timeout_ms: Option<u64>,
	/// Longest single reactor wait while a blocking call is in progress.
	#[serde(default = "default_max_wait_ms")]
	pub max_wait_ms: u64,
	/// Largest accepted frame body.
	#[serde(default = "default_max_frame_len")]
	pub max_frame_len: usize,
	/// Narrows the call-id space below what the format supports.
	#[serde(default)]
	pub id_limit: Option<u64>,
}

/// Returns the default driver wait slice in milliseconds.
fn default_max_wait_ms() -> u64 {
	50
}

/// Returns the default frame size limit (16 MiB).
fn default_max_frame_len() -> usize {
	16 * 1024 * 1024
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			format: WireFormat::default(),
			framing: None,
			call_timeout_ms: None,
			max_wait_ms: default_max_wait_ms(),
			max_frame_len: default_max_frame_len(),
			id_limit: None,
		}
	}
}

impl SessionConfig {
	/// Configuration for `format` with every other setting at its default.
	#[must_use]
	pub fn for_format(format: WireFormat) -> Self {
		Self {
			format,
			..Self::default()
		}
	}

	/// The framing in effect.
	#[must_use]
	pub fn framing(&self) -> Framing {
		self.framing.unwrap_or_else(|| self.format.default_framing())
	}

	/// The default call timeout.
	#[must_use]
	pub fn call_timeout(&self) -> Option<Duration> {
		self.call_timeout_ms.map(Duration::from_millis)
	}

	/// The driver wait slice.
	#[must_use]
	pub fn max_wait(&self) -> Duration {
		Duration::from_millis(self.max_wait_ms)
	}

	/// The call-id limit in effect.
	#[must_use]
	pub fn id_limit(&self) -> u64 {
		let codec_limit = self.format.codec().id_limit();
		self.id_limit.map_or(codec_limit, |limit| limit.min(codec_limit))
	}

	/// Checks that the settings can work together.
	///
	/// # Errors
	///
	/// [`Error::Config`] for a framing that cannot delimit the format, a zero wait slice or frame
	/// limit, or an `id_limit` wider than the format can carry.
	pub fn validate(&self) -> Result<()> {
		let framing = self.framing();
		if !framing.supports(self.format) {
			return Err(Error::Config(format!("{framing} framing cannot carry {} messages", self.format)));
		}
		if self.max_wait_ms == 0 {
			return Err(Error::Config("max_wait_ms must be positive".into()));
		}
		if self.max_frame_len == 0 {
			return Err(Error::Config("max_frame_len must be positive".into()));
		}
		let codec_limit = self.format.codec().id_limit();
		if let Some(limit) = self.id_limit
			&& limit > codec_limit
		{
			return Err(Error::Config(format!(
				"id_limit {limit} exceeds what {} can carry ({codec_limit})",
				self.format
			)));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	#[test]
	fn empty_table_is_the_default() {
		let config: SessionConfig = toml::from_str("").expect("parse");
		assert_eq!(config, SessionConfig::default());
		assert_eq!(config.framing(), Framing::MsgPack);
		assert_eq!(config.max_wait(), Duration::from_millis(50));
		assert!(config.validate().is_ok());
	}

	#[test]
	fn fields_parse_from_toml() {
		let config: SessionConfig = toml::from_str(
			r#"
			format = "json"
			framing = "content-length"
			call_timeout_ms = 250
			id_limit = 99
			"#,
		)
		.expect("parse");
		assert_eq!(config.format, WireFormat::Json);
		assert_eq!(config.framing(), Framing::ContentLength);
		assert_eq!(config.call_timeout(), Some(Duration::from_millis(250)));
		assert_eq!(config.id_limit(), 99);
		assert!(config.validate().is_ok());
	}

	#[test]
	fn unknown_fields_are_rejected() {
		assert!(toml::from_str::<SessionConfig>("timeout = 3").is_err());
	}

	#[test]
	fn incompatible_settings_fail_validation() {
		let mismatched = SessionConfig {
			framing: Some(Framing::JsonStream),
			..SessionConfig::for_format(WireFormat::MsgPack)
		};
		assert!(matches!(mismatched.validate(), Err(Error::Config(_))));

		let too_wide = SessionConfig {
			id_limit: Some(u64::from(u32::MAX) + 1),
			..SessionConfig::for_format(WireFormat::MsgPack)
		};
		assert!(matches!(too_wide.validate(), Err(Error::Config(_))));

		let no_wait = SessionConfig {
			max_wait_ms: 0,
			..SessionConfig::default()
		};
		assert!(matches!(no_wait.validate(), Err(Error::Config(_))));
	}
}
