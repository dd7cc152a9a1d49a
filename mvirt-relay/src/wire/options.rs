//! Option TLV walker.
//!
//! DHCPv4 options are `code(1) len(1) value`, with the single-byte PAD (0) and
//! END (255) tags. DHCPv6 options are `code(2) len(2) value` with no padding or
//! terminator. [`TlvCursor`] walks either form over a borrowed slice and never
//! reads past its end.

use thiserror::Error;

/// DHCPv4 PAD option
pub const PAD: u8 = 0;

/// DHCPv4 END option
pub const END: u8 = 255;

/// DHCPv4 Option Overload (RFC 2132 section 9.3)
pub const OPTION_OVERLOAD: u8 = 52;

/// A single option found in a stream.
///
/// `offset` is the position of the option code relative to the start of the
/// walked slice, `end` is the position right after the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub offset: usize,
    pub end: usize,
    pub code: u16,
    pub value: &'a [u8],
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TlvError {
    #[error("option at offset {offset} overruns the buffer")]
    Truncated { offset: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Dhcpv4,
    Dhcpv6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    Ended(Option<usize>),
    Failed,
}

/// Lazy, restartable cursor over an option stream.
#[derive(Debug, Clone)]
pub struct TlvCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    format: Format,
    state: State,
}

impl<'a> TlvCursor<'a> {
    /// Walk a DHCPv4 option area (PAD skipped, END terminates).
    pub fn dhcpv4(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            format: Format::Dhcpv4,
            state: State::Running,
        }
    }

    /// Walk a DHCPv6 option area.
    pub fn dhcpv6(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            format: Format::Dhcpv6,
            state: State::Running,
        }
    }

    /// Rewind to the first option.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.state = State::Running;
    }

    /// Current read position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Offset of the END option, once the walk has reached it.
    pub fn end_offset(&self) -> Option<usize> {
        match self.state {
            State::Ended(end) => end,
            _ => None,
        }
    }

    /// Return the next option, `None` once the stream is exhausted.
    ///
    /// After an error the cursor yields nothing until [`reset`](Self::reset).
    pub fn next_tlv(&mut self) -> Option<Result<Tlv<'a>, TlvError>> {
        if self.state != State::Running {
            return None;
        }

        let result = match self.format {
            Format::Dhcpv4 => self.next_v4(),
            Format::Dhcpv6 => self.next_v6(),
        };

        match result {
            Some(Err(e)) => {
                self.state = State::Failed;
                Some(Err(e))
            }
            other => other,
        }
    }

    fn next_v4(&mut self) -> Option<Result<Tlv<'a>, TlvError>> {
        loop {
            let Some(&code) = self.buf.get(self.pos) else {
                self.state = State::Ended(None);
                return None;
            };

            match code {
                PAD => {
                    self.pos += 1;
                    continue;
                }
                END => {
                    self.state = State::Ended(Some(self.pos));
                    return None;
                }
                _ => {}
            }

            let offset = self.pos;
            let Some(&len) = self.buf.get(offset + 1) else {
                return Some(Err(TlvError::Truncated { offset }));
            };
            let start = offset + 2;
            let end = start + len as usize;
            if end > self.buf.len() {
                return Some(Err(TlvError::Truncated { offset }));
            }

            self.pos = end;
            return Some(Ok(Tlv {
                offset,
                end,
                code: code as u16,
                value: &self.buf[start..end],
            }));
        }
    }

    fn next_v6(&mut self) -> Option<Result<Tlv<'a>, TlvError>> {
        let offset = self.pos;
        if offset >= self.buf.len() {
            self.state = State::Ended(None);
            return None;
        }
        if offset + 4 > self.buf.len() {
            return Some(Err(TlvError::Truncated { offset }));
        }

        let code = u16::from_be_bytes([self.buf[offset], self.buf[offset + 1]]);
        let len = u16::from_be_bytes([self.buf[offset + 2], self.buf[offset + 3]]) as usize;
        let start = offset + 4;
        let end = start + len;
        if end > self.buf.len() {
            return Some(Err(TlvError::Truncated { offset }));
        }

        self.pos = end;
        Some(Ok(Tlv {
            offset,
            end,
            code,
            value: &self.buf[start..end],
        }))
    }
}

impl<'a> Iterator for TlvCursor<'a> {
    type Item = Result<Tlv<'a>, TlvError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_tlv()
    }
}

/// Which BOOTP header fields carry extra options (Option 52).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Overload {
    #[default]
    None,
    File,
    Sname,
    Both,
}

impl Overload {
    fn from_value(value: u8) -> Self {
        match value {
            1 => Overload::File,
            2 => Overload::Sname,
            3 => Overload::Both,
            _ => Overload::None,
        }
    }

    /// The `file` field holds options.
    pub fn file(self) -> bool {
        matches!(self, Overload::File | Overload::Both)
    }

    /// The `sname` field holds options.
    pub fn sname(self) -> bool {
        matches!(self, Overload::Sname | Overload::Both)
    }
}

/// Result of [`scan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scan<'a> {
    pub found: Option<Tlv<'a>>,
    pub overload: Overload,
}

/// Scan a DHCPv4 option area for `tag`.
///
/// Also reports any Option Overload seen on the way, so the caller can continue
/// in the `file`/`sname` fields when the tag is not in the main area.
pub fn scan(options: &[u8], tag: u8) -> Result<Scan<'_>, TlvError> {
    let mut overload = Overload::None;

    for item in TlvCursor::dhcpv4(options) {
        let tlv = item?;
        if tlv.code == OPTION_OVERLOAD as u16
            && let Some(&value) = tlv.value.first()
        {
            overload = Overload::from_value(value);
        }
        if tlv.code == tag as u16 {
            return Ok(Scan {
                found: Some(tlv),
                overload,
            });
        }
    }

    Ok(Scan {
        found: None,
        overload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v4_skips_pad_and_stops_at_end() {
        let buf = [0, 0, 53, 1, 1, 0, 12, 2, b'h', b'i', 255, 61, 1, 9];
        let mut cursor = TlvCursor::dhcpv4(&buf);

        let first = cursor.next_tlv().unwrap().unwrap();
        assert_eq!(first.code, 53);
        assert_eq!(first.offset, 2);
        assert_eq!(first.value, &[1]);

        let second = cursor.next_tlv().unwrap().unwrap();
        assert_eq!(second.code, 12);
        assert_eq!(second.value, b"hi");
        assert_eq!(second.end, 10);

        assert!(cursor.next_tlv().is_none());
        assert_eq!(cursor.end_offset(), Some(10));
    }

    #[test]
    fn test_v4_truncated_length() {
        let buf = [53, 1, 1, 82, 10, 1, 2];
        let items: Vec<_> = TlvCursor::dhcpv4(&buf).collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1], Err(TlvError::Truncated { offset: 3 }));
    }

    #[test]
    fn test_v4_missing_length_byte() {
        let buf = [53, 1, 1, 82];
        let mut cursor = TlvCursor::dhcpv4(&buf);
        assert!(cursor.next_tlv().unwrap().is_ok());
        assert_eq!(
            cursor.next_tlv(),
            Some(Err(TlvError::Truncated { offset: 3 }))
        );
        assert!(cursor.next_tlv().is_none());
    }

    #[test]
    fn test_v4_without_end_runs_to_buffer_end() {
        let buf = [53, 1, 3];
        let mut cursor = TlvCursor::dhcpv4(&buf);
        assert!(cursor.next_tlv().unwrap().is_ok());
        assert!(cursor.next_tlv().is_none());
        assert_eq!(cursor.end_offset(), None);
        assert_eq!(cursor.position(), 3);
    }

    #[test]
    fn test_cursor_is_restartable() {
        let buf = [53, 1, 1, 255];
        let mut cursor = TlvCursor::dhcpv4(&buf);
        assert_eq!(cursor.by_ref().count(), 1);
        cursor.reset();
        assert_eq!(cursor.count(), 1);
    }

    #[test]
    fn test_v6_options() {
        let buf = [0, 9, 0, 2, 0xaa, 0xbb, 0, 18, 0, 4, 0, 0, 0, 7];
        let tlvs: Vec<_> = TlvCursor::dhcpv6(&buf).map(|r| r.unwrap()).collect();
        assert_eq!(tlvs.len(), 2);
        assert_eq!(tlvs[0].code, 9);
        assert_eq!(tlvs[0].value, &[0xaa, 0xbb]);
        assert_eq!(tlvs[1].code, 18);
        assert_eq!(tlvs[1].offset, 6);
    }

    #[test]
    fn test_v6_truncated_header() {
        let buf = [0, 9, 0];
        assert_eq!(
            TlvCursor::dhcpv6(&buf).next(),
            Some(Err(TlvError::Truncated { offset: 0 }))
        );
    }

    #[test]
    fn test_scan_reports_overload() {
        let buf = [52, 1, 3, 53, 1, 5, 255];
        let scan_result = scan(&buf, 54).unwrap();
        assert!(scan_result.found.is_none());
        assert_eq!(scan_result.overload, Overload::Both);
        assert!(scan_result.overload.file());
        assert!(scan_result.overload.sname());

        let found = scan(&buf, 53).unwrap().found.unwrap();
        assert_eq!(found.value, &[5]);
    }
}
