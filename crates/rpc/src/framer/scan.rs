//! Extent scanners for the self-delimiting framings.
//!
//! Both return the length of the first complete value in the buffer, `None` while it is still
//! incomplete, and fail as soon as the value is known to exceed the frame limit. Scans resume
//! where the previous call stopped.

use serde::de::IgnoredAny;

use crate::error::FramingError;

enum Stop {
	Incomplete,
	TooLarge(usize),
	Invalid { marker: u8, offset: usize },
}

struct Cursor<'a> {
	buf: &'a [u8],
	pos: usize,
	limit: usize,
}

impl Cursor<'_> {
	fn need(&self, n: usize) -> Result<(), Stop> {
		let end = self.pos.saturating_add(n);
		if end > self.limit {
			return Err(Stop::TooLarge(end));
		}
		if end > self.buf.len() {
			return Err(Stop::Incomplete);
		}
		Ok(())
	}

	fn skip(&mut self, n: usize) -> Result<(), Stop> {
		self.need(n)?;
		self.pos += n;
		Ok(())
	}

	fn byte(&mut self) -> Result<u8, Stop> {
		self.need(1)?;
		let b = self.buf[self.pos];
		self.pos += 1;
		Ok(b)
	}

	/// Reads a big-endian length field of `width` bytes.
	fn len(&mut self, width: usize) -> Result<usize, Stop> {
		self.need(width)?;
		let n = self.buf[self.pos..self.pos + width]
			.iter()
			.fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
		self.pos += width;
		Ok(usize::try_from(n).unwrap_or(usize::MAX))
	}

	/// Skips a length-prefixed payload: `width` length bytes, `extra` fixed bytes, then the data.
	fn sized(&mut self, width: usize, extra: usize) -> Result<usize, Stop> {
		let n = self.len(width)?;
		self.skip(extra.saturating_add(n))?;
		Ok(0)
	}

	fn fixed(&mut self, n: usize) -> Result<usize, Stop> {
		self.skip(n)?;
		Ok(0)
	}
}

/// Progress through the frame at the start of the receive buffer.
///
/// Each scan resumes at the last element (msgpack) or byte (JSON) it fully accepted, so a frame
/// delivered in many chunks is examined once overall instead of once per chunk. Reset whenever a
/// frame is split off or the buffer is cleared.
#[derive(Debug, Default)]
pub(super) struct Progress {
	/// Bytes of the current frame already accepted.
	pos: usize,
	/// msgpack elements still to be scanned; 0 before the first byte.
	remaining: usize,
	/// Closing brackets the JSON value still owes, innermost last.
	closers: Vec<u8>,
	in_string: bool,
	escaped: bool,
}

impl Progress {
	pub(super) fn reset(&mut self) {
		self.pos = 0;
		self.remaining = 0;
		self.closers.clear();
		self.in_string = false;
		self.escaped = false;
	}

	/// Whether part of a frame has already been accepted.
	pub(super) fn in_frame(&self) -> bool {
		self.pos > 0
	}

	/// Extent of the msgpack array at the start of `buf`.
	pub(super) fn msgpack(&mut self, buf: &[u8], limit: usize) -> Result<Option<usize>, FramingError> {
		if self.remaining == 0 {
			let Some(&first) = buf.first() else {
				return Ok(None);
			};
			if !matches!(first, 0x90..=0x9f | 0xdc | 0xdd) {
				return Err(FramingError::UnexpectedByte { format: "msgpack", byte: first });
			}
			self.pos = 0;
			self.remaining = 1;
		}

		let mut cursor = Cursor { buf, pos: self.pos, limit };
		let scanned = scan_msgpack(&mut cursor, &mut self.remaining, &mut self.pos);
		match scanned {
			Ok(()) => {
				let end = self.pos;
				self.reset();
				Ok(Some(end))
			}
			Err(Stop::Incomplete) => Ok(None),
			Err(Stop::TooLarge(len)) => Err(FramingError::TooLarge { len, limit }),
			Err(Stop::Invalid { marker, offset }) => Err(FramingError::Malformed {
				format: "msgpack",
				reason: format!("invalid marker 0x{marker:02x} at offset {offset}"),
			}),
		}
	}

	/// Extent of the JSON object or array at the start of `buf`.
	///
	/// Brackets are matched outside strings; the completed extent is then validated once by
	/// `serde_json` without materializing it.
	pub(super) fn json(&mut self, buf: &[u8], limit: usize) -> Result<Option<usize>, FramingError> {
		if !self.in_frame() {
			let Some(&first) = buf.first() else {
				return Ok(None);
			};
			if first != b'{' && first != b'[' {
				return Err(FramingError::UnexpectedByte { format: "json", byte: first });
			}
		}

		let window = &buf[..buf.len().min(limit)];
		while let Some(&b) = window.get(self.pos) {
			self.pos += 1;
			if self.in_string {
				if self.escaped {
					self.escaped = false;
				} else if b == b'\\' {
					self.escaped = true;
				} else if b == b'"' {
					self.in_string = false;
				}
				continue;
			}
			match b {
				b'"' => self.in_string = true,
				b'{' => self.closers.push(b'}'),
				b'[' => self.closers.push(b']'),
				b'}' | b']' => {
					if self.closers.pop() != Some(b) {
						return Err(FramingError::Malformed {
							format: "json",
							reason: format!("unbalanced '{}' at offset {}", char::from(b), self.pos - 1),
						});
					}
					if self.closers.is_empty() {
						let end = self.pos;
						self.reset();
						serde_json::from_slice::<IgnoredAny>(&buf[..end]).map_err(|e| FramingError::Malformed {
							format: "json",
							reason: e.to_string(),
						})?;
						return Ok(Some(end));
					}
				}
				_ => {}
			}
		}

		if buf.len() >= limit {
			return Err(FramingError::TooLarge {
				len: buf.len().max(limit.saturating_add(1)),
				limit,
			});
		}
		Ok(None)
	}
}

/// Walks msgpack elements until `remaining` reaches zero.
///
/// `committed` advances past each element only once it is complete, so an incomplete element is
/// rescanned from its marker on the next call.
fn scan_msgpack(cursor: &mut Cursor<'_>, remaining: &mut usize, committed: &mut usize) -> Result<(), Stop> {
	while *remaining > 0 {
		let offset = cursor.pos;
		let marker = cursor.byte()?;
		let children = match marker {
			0x00..=0x7f | 0xc0 | 0xc2 | 0xc3 | 0xe0..=0xff => 0,
			0x80..=0x8f => 2 * usize::from(marker & 0x0f),
			0x90..=0x9f => usize::from(marker & 0x0f),
			0xa0..=0xbf => cursor.fixed(usize::from(marker & 0x1f))?,
			0xc1 => return Err(Stop::Invalid { marker, offset }),
			0xc4 | 0xd9 => cursor.sized(1, 0)?,
			0xc5 | 0xda => cursor.sized(2, 0)?,
			0xc6 | 0xdb => cursor.sized(4, 0)?,
			0xc7 => cursor.sized(1, 1)?,
			0xc8 => cursor.sized(2, 1)?,
			0xc9 => cursor.sized(4, 1)?,
			0xcc | 0xd0 => cursor.fixed(1)?,
			0xcd | 0xd1 => cursor.fixed(2)?,
			0xca | 0xce | 0xd2 => cursor.fixed(4)?,
			0xcb | 0xcf | 0xd3 => cursor.fixed(8)?,
			0xd4 => cursor.fixed(2)?,
			0xd5 => cursor.fixed(3)?,
			0xd6 => cursor.fixed(5)?,
			0xd7 => cursor.fixed(9)?,
			0xd8 => cursor.fixed(17)?,
			0xdc => cursor.len(2)?,
			0xdd => cursor.len(4)?,
			0xde => cursor.len(2)?.saturating_mul(2),
			0xdf => cursor.len(4)?.saturating_mul(2),
		};
		*remaining = (*remaining - 1).saturating_add(children);
		*committed = cursor.pos;

		// Every outstanding element occupies at least one byte.
		let floor = cursor.pos.saturating_add(*remaining);
		if floor > cursor.limit {
			return Err(Stop::TooLarge(floor));
		}
	}
	Ok(())
}
