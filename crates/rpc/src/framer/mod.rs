//! Incremental extraction of complete wire messages from a byte stream.
//!
//! A [`Framer`] owns the receive buffer of one connection. Bytes are appended with
//! [`Framer::feed`] in whatever chunks the transport delivers; [`Framer::try_extract`] hands out
//! one complete message body at a time and keeps any partial tail byte-for-byte until more input
//! arrives.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::WireFormat;
use crate::error::FramingError;

mod scan;

use scan::Progress;

/// Upper bound on a `Content-Length` header block, terminator excluded.
pub const MAX_HEADER_LEN: usize = 8 * 1024;

const HEADER_END: &[u8] = b"\r\n\r\n";
const LENGTH_PREFIX: usize = 4;

/// How message boundaries are found in the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
	/// A `u32` little-endian body length followed by the body.
	LengthPrefixed,
	/// An LSP style `Content-Length: N` header block terminated by an empty line.
	ContentLength,
	/// Self-delimiting msgpack: the extent of one top-level array.
	MsgPack,
	/// Self-delimiting concatenated JSON objects or arrays, optionally separated by whitespace.
	JsonStream,
}

impl Framing {
	/// Every framing, in declaration order.
	pub const ALL: [Self; 4] = [Self::LengthPrefixed, Self::ContentLength, Self::MsgPack, Self::JsonStream];

	/// Kebab-case framing name.
	#[must_use]
	pub const fn name(self) -> &'static str {
		match self {
			Self::LengthPrefixed => "length-prefixed",
			Self::ContentLength => "content-length",
			Self::MsgPack => "msgpack",
			Self::JsonStream => "json-stream",
		}
	}

	/// Whether bodies of `format` can be delimited with this framing.
	///
	/// Explicit length framings carry any body; the scanning framings only understand their own
	/// encoding.
	#[must_use]
	pub const fn supports(self, format: WireFormat) -> bool {
		match self {
			Self::LengthPrefixed | Self::ContentLength => true,
			Self::MsgPack => matches!(format, WireFormat::MsgPack),
			Self::JsonStream => matches!(format, WireFormat::Json),
		}
	}

	/// Appends one framed message to `out`.
	///
	/// # Errors
	///
	/// Returns [`FramingError::TooLarge`] when a length-prefixed body does not fit the `u32`
	/// prefix.
	pub fn write_frame(self, body: &[u8], out: &mut BytesMut) -> Result<(), FramingError> {
		match self {
			Self::LengthPrefixed => {
				let len = u32::try_from(body.len()).map_err(|_| FramingError::TooLarge {
					len: body.len(),
					limit: u32::MAX as usize,
				})?;
				out.reserve(LENGTH_PREFIX + body.len());
				out.put_u32_le(len);
			}
			Self::ContentLength => {
				let header = format!("Content-Length: {}\r\n\r\n", body.len());
				out.reserve(header.len() + body.len());
				out.put_slice(header.as_bytes());
			}
			Self::MsgPack | Self::JsonStream => out.reserve(body.len()),
		}
		out.put_slice(body);
		Ok(())
	}

	/// Locates the first complete frame in `buf`, resuming the scan recorded in `progress`.
	///
	/// Returns the body range; the frame ends where the body ends.
	fn split(self, buf: &[u8], limit: usize, progress: &mut Progress) -> Result<Option<Range<usize>>, FramingError> {
		match self {
			Self::LengthPrefixed => {
				let Some(prefix) = buf.first_chunk::<LENGTH_PREFIX>() else {
					return Ok(None);
				};
				let len = u32::from_le_bytes(*prefix) as usize;
				if len > limit {
					return Err(FramingError::TooLarge { len, limit });
				}
				let end = LENGTH_PREFIX + len;
				Ok((buf.len() >= end).then_some(LENGTH_PREFIX..end))
			}
			Self::ContentLength => {
				let Some((header_len, len)) = parse_header(buf)? else {
					return Ok(None);
				};
				if len > limit {
					return Err(FramingError::TooLarge { len, limit });
				}
				let start = header_len + HEADER_END.len();
				let end = start + len;
				Ok((buf.len() >= end).then_some(start..end))
			}
			Self::MsgPack => Ok(progress.msgpack(buf, limit)?.map(|end| 0..end)),
			Self::JsonStream => Ok(progress.json(buf, limit)?.map(|end| 0..end)),
		}
	}
}

impl fmt::Display for Framing {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

impl FromStr for Framing {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::ALL
			.into_iter()
			.find(|framing| framing.name().eq_ignore_ascii_case(s))
			.ok_or_else(|| {
				format!("unknown framing '{s}' (expected length-prefixed, content-length, msgpack or json-stream)")
			})
	}
}

/// Parses a complete header block at the start of `buf`.
///
/// Returns the header length (terminator excluded) and the declared body length, or `None`
/// while the terminator has not arrived.
fn parse_header(buf: &[u8]) -> Result<Option<(usize, usize)>, FramingError> {
	let window = &buf[..buf.len().min(MAX_HEADER_LEN + HEADER_END.len())];
	let Some(header_len) = memchr::memmem::find(window, HEADER_END) else {
		if buf.len() > MAX_HEADER_LEN + HEADER_END.len() {
			return Err(FramingError::Header(format!("header block exceeds {MAX_HEADER_LEN} bytes")));
		}
		return Ok(None);
	};

	let block = std::str::from_utf8(&buf[..header_len])
		.map_err(|_| FramingError::Header("header block is not valid UTF-8".into()))?;

	let mut content_length = None;
	for line in block.split("\r\n") {
		let (name, value) = line
			.split_once(':')
			.ok_or_else(|| FramingError::Header(format!("malformed header line '{line}'")))?;
		if name.trim().eq_ignore_ascii_case("content-length") {
			let len = value
				.trim()
				.parse::<usize>()
				.map_err(|e| FramingError::Header(format!("invalid Content-Length '{}': {e}", value.trim())))?;
			content_length = Some(len);
		}
	}

	content_length
		.map(|len| Some((header_len, len)))
		.ok_or_else(|| FramingError::Header("missing Content-Length".into()))
}

/// Per-connection receive buffer and frame extractor.
#[derive(Debug)]
pub struct Framer {
	framing: Framing,
	buf: BytesMut,
	max_frame_len: usize,
	progress: Progress,
}

impl Framer {
	/// Creates an empty framer. Frames whose body exceeds `max_frame_len` are rejected.
	#[must_use]
	pub fn new(framing: Framing, max_frame_len: usize) -> Self {
		Self {
			framing,
			buf: BytesMut::new(),
			max_frame_len,
			progress: Progress::default(),
		}
	}

	/// The framing this framer splits on.
	#[must_use]
	pub const fn framing(&self) -> Framing {
		self.framing
	}

	/// Appends received bytes.
	pub fn feed(&mut self, bytes: &[u8]) {
		self.buf.extend_from_slice(bytes);
	}

	/// Removes and returns the next complete message body, if one is buffered.
	///
	/// # Errors
	///
	/// Returns a [`FramingError`] when the buffered bytes can never form a valid frame. The buffer
	/// contents are unspecified afterwards; the connection is expected to close.
	pub fn try_extract(&mut self) -> Result<Option<Bytes>, FramingError> {
		if self.framing == Framing::JsonStream && !self.progress.in_frame() {
			let ws = self
				.buf
				.iter()
				.position(|b| !matches!(b, b' ' | b'\t' | b'\n' | b'\r'))
				.unwrap_or(self.buf.len());
			self.buf.advance(ws);
		}

		let Some(body) = self.framing.split(&self.buf, self.max_frame_len, &mut self.progress)? else {
			return Ok(None);
		};
		let mut frame = self.buf.split_to(body.end);
		frame.advance(body.start);
		Ok(Some(frame.freeze()))
	}

	/// Number of buffered bytes not yet returned as frames.
	#[must_use]
	pub fn buffered(&self) -> usize {
		self.buf.len()
	}

	/// Discards everything buffered.
	pub fn clear(&mut self) {
		self.buf.clear();
		self.progress.reset();
	}
}
