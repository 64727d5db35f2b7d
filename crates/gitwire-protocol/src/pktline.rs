//! Git pkt-line format implementation.
//!
//! The pkt-line format is used for all git protocol communication.
//! Each line is prefixed with a 4-character hex length that counts the
//! prefix itself, or is one of the special packets "0000" (flush) and
//! "0001" (delimiter).

use crate::{GitError, Result};
use std::io::{self, Read, Write};

/// Largest total packet length, prefix included.
pub const MAX_PKT_LEN: usize = 65520;

/// Largest payload a data packet can carry.
pub const MAX_DATA_LEN: usize = MAX_PKT_LEN - 4;

/// A pkt-line packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// Data line with content.
    Data(Vec<u8>),
    /// Flush packet (0000).
    Flush,
    /// Delimiter packet (0001).
    Delim,
}

impl PktLine {
    /// Creates a data packet from a string slice.
    pub fn from_string(s: &str) -> Self {
        Self::Data(s.as_bytes().to_vec())
    }

    /// Creates a data packet from bytes.
    pub fn from_bytes(b: impl Into<Vec<u8>>) -> Self {
        Self::Data(b.into())
    }

    /// Encodes the packet to bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Data(data) => {
                let mut result = format!("{:04x}", data.len() + 4).into_bytes();
                result.extend_from_slice(data);
                result
            }
            Self::Flush => b"0000".to_vec(),
            Self::Delim => b"0001".to_vec(),
        }
    }

    /// Returns true if this is a flush packet.
    pub fn is_flush(&self) -> bool {
        matches!(self, Self::Flush)
    }

    /// Returns the data content, or None for special packets.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Returns the data as a string, trimming any trailing newline.
    pub fn as_str(&self) -> Option<&str> {
        self.data()
            .and_then(|d| std::str::from_utf8(d).ok())
            .map(|s| s.trim_end_matches('\n'))
    }

    /// Like [`PktLine::as_str`], but fails for special packets and non UTF-8 data.
    pub fn as_text(&self) -> Result<&str> {
        match self {
            Self::Data(data) => std::str::from_utf8(data)
                .map(|s| s.trim_end_matches('\n'))
                .map_err(|_| GitError::Protocol("line is not valid UTF-8".to_string())),
            Self::Flush => Err(GitError::Protocol("unexpected flush packet".to_string())),
            Self::Delim => Err(GitError::Protocol("unexpected delimiter packet".to_string())),
        }
    }
}

/// Parses a 4-byte length prefix.
fn parse_len(len_buf: &[u8; 4]) -> Result<usize> {
    let len_str = std::str::from_utf8(len_buf)
        .map_err(|_| GitError::InvalidPktLine("invalid length prefix".to_string()))?;
    if !len_str.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(GitError::InvalidPktLine(format!(
            "invalid length prefix {len_str:?}"
        )));
    }
    usize::from_str_radix(len_str, 16)
        .map_err(|_| GitError::InvalidPktLine(format!("invalid length prefix {len_str:?}")))
}

/// Reader for pkt-line format.
pub struct PktLineReader<R> {
    reader: R,
}

impl<R: Read> PktLineReader<R> {
    /// Creates a new pkt-line reader.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next packet.
    ///
    /// Returns `None` on a clean end of stream at a packet boundary. A stream
    /// that ends inside a packet, including inside the length prefix, is an
    /// [`GitError::UnexpectedEof`].
    pub fn read(&mut self) -> Result<Option<PktLine>> {
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            match self.reader.read(&mut len_buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => return Err(GitError::UnexpectedEof),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        match parse_len(&len_buf)? {
            0 => Ok(Some(PktLine::Flush)),
            1 => Ok(Some(PktLine::Delim)),
            len if len < 4 => Err(GitError::InvalidPktLine(format!(
                "length {len} is below the minimum of 4"
            ))),
            len if len > MAX_PKT_LEN => Err(GitError::InvalidPktLine(format!(
                "length {len} exceeds the maximum of {MAX_PKT_LEN}"
            ))),
            len => {
                let mut data = vec![0u8; len - 4];
                self.reader.read_exact(&mut data)?;
                tracing::trace!(len = data.len(), "pkt-line read");
                Ok(Some(PktLine::Data(data)))
            }
        }
    }

    /// Reads the next packet, treating end of stream as an error.
    pub fn read_line(&mut self) -> Result<PktLine> {
        self.read()?.ok_or(GitError::UnexpectedEof)
    }

    /// Reads all packets until a flush packet.
    pub fn read_until_flush(&mut self) -> Result<Vec<PktLine>> {
        let mut packets = Vec::new();
        loop {
            match self.read_line()? {
                PktLine::Flush => break,
                pkt => packets.push(pkt),
            }
        }
        Ok(packets)
    }

    /// Returns a mutable reference to the inner reader.
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Consumes the reader and returns the inner reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Writer for pkt-line format.
pub struct PktLineWriter<W> {
    writer: W,
}

impl<W: Write> PktLineWriter<W> {
    /// Creates a new pkt-line writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes a packet.
    ///
    /// Data packets must carry between 1 and [`MAX_DATA_LEN`] bytes.
    pub fn write(&mut self, pkt: &PktLine) -> Result<()> {
        if let PktLine::Data(data) = pkt {
            if data.is_empty() {
                return Err(GitError::InvalidPktLine(
                    "refusing to write an empty data packet".to_string(),
                ));
            }
            if data.len() > MAX_DATA_LEN {
                return Err(GitError::InvalidPktLine(format!(
                    "payload of {} bytes exceeds the maximum of {MAX_DATA_LEN}",
                    data.len()
                )));
            }
        }
        self.writer.write_all(&pkt.encode())?;
        Ok(())
    }

    /// Writes a data line.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.write(&PktLine::Data(data.to_vec()))
    }

    /// Writes a string line (with newline).
    pub fn write_line(&mut self, s: &str) -> Result<()> {
        tracing::trace!(line = %s.trim_end_matches('\n'), "pkt-line write");
        let mut data = s.as_bytes().to_vec();
        if !s.ends_with('\n') {
            data.push(b'\n');
        }
        self.write(&PktLine::Data(data))
    }

    /// Writes a flush packet.
    pub fn flush_pkt(&mut self) -> Result<()> {
        self.write(&PktLine::Flush)
    }

    /// Writes a delimiter packet.
    pub fn delim_pkt(&mut self) -> Result<()> {
        self.write(&PktLine::Delim)
    }

    /// Flushes the underlying writer.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Returns a mutable reference to the inner writer.
    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Returns the inner writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_pktline_encode() {
        assert_eq!(PktLine::from_string("hello\n").encode(), b"000ahello\n");
        assert_eq!(PktLine::Flush.encode(), b"0000");
        assert_eq!(PktLine::Delim.encode(), b"0001");
    }

    #[test]
    fn test_pktline_roundtrip() {
        let packets = vec![
            PktLine::from_string("hello\n"),
            PktLine::Delim,
            PktLine::from_string("world\n"),
            PktLine::Flush,
        ];

        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            for pkt in &packets {
                writer.write(pkt).unwrap();
            }
        }

        let mut reader = PktLineReader::new(Cursor::new(buf));
        for pkt in &packets {
            assert_eq!(reader.read().unwrap().as_ref(), Some(pkt));
        }
        assert_eq!(reader.read().unwrap(), None);
    }

    #[test]
    fn test_pktline_as_str() {
        assert_eq!(PktLine::from_string("hello\n").as_str(), Some("hello"));
        assert_eq!(PktLine::from_string("no newline").as_str(), Some("no newline"));
        assert!(PktLine::from_bytes(vec![0xff, 0xfe]).as_str().is_none());
        assert!(PktLine::Flush.as_str().is_none());
    }

    #[test]
    fn test_pktline_as_text_rejects_special_packets() {
        assert_eq!(PktLine::from_string("NAK\n").as_text().unwrap(), "NAK");
        assert!(PktLine::Flush.as_text().is_err());
        assert!(PktLine::Delim.as_text().is_err());
    }

    #[test]
    fn test_pktline_read_until_flush() {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_line("line1").unwrap();
            writer.write_line("line2").unwrap();
            writer.flush_pkt().unwrap();
            writer.write_line("line3").unwrap();
        }

        let mut reader = PktLineReader::new(Cursor::new(buf));
        let packets = reader.read_until_flush().unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(reader.read_line().unwrap().as_str(), Some("line3"));
    }

    #[test]
    fn test_pktline_read_until_flush_requires_flush() {
        let mut reader = PktLineReader::new(Cursor::new(b"0009line\n".to_vec()));
        assert!(matches!(
            reader.read_until_flush(),
            Err(GitError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_pktline_writer_write_line() {
        let mut buf = Vec::new();
        PktLineWriter::new(&mut buf).write_line("test").unwrap();
        // "test\n" is 5 bytes, + 4 for length = 9, so hex "0009"
        assert_eq!(buf, b"0009test\n");

        let mut buf = Vec::new();
        PktLineWriter::new(&mut buf).write_line("test\n").unwrap();
        assert_eq!(buf, b"0009test\n");
    }

    #[test]
    fn test_pktline_writer_rejects_empty_data() {
        let mut buf = Vec::new();
        let result = PktLineWriter::new(&mut buf).write_data(b"");
        assert!(matches!(result, Err(GitError::InvalidPktLine(_))));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_pktline_writer_rejects_oversized_data() {
        let mut buf = Vec::new();
        let mut writer = PktLineWriter::new(&mut buf);
        assert!(writer.write_data(&vec![b'x'; MAX_DATA_LEN]).is_ok());
        assert!(writer.write_data(&vec![b'x'; MAX_DATA_LEN + 1]).is_err());
    }

    #[test]
    fn test_pktline_reader_accepts_empty_data_packet() {
        let mut reader = PktLineReader::new(Cursor::new(b"0004".to_vec()));
        assert_eq!(reader.read().unwrap(), Some(PktLine::Data(Vec::new())));
    }

    #[test]
    fn test_pktline_read_invalid_length() {
        for bad in [&b"0002"[..], b"0003"] {
            let mut reader = PktLineReader::new(Cursor::new(bad.to_vec()));
            assert!(matches!(reader.read(), Err(GitError::InvalidPktLine(_))));
        }
    }

    #[test]
    fn test_pktline_read_short_length() {
        let mut reader = PktLineReader::new(Cursor::new(b"000".to_vec()));
        assert!(matches!(reader.read(), Err(GitError::UnexpectedEof)));
    }

    #[test]
    fn test_pktline_read_non_hex_length() {
        let mut reader = PktLineReader::new(Cursor::new(b"00zz".to_vec()));
        assert!(matches!(reader.read(), Err(GitError::InvalidPktLine(_))));

        let mut reader = PktLineReader::new(Cursor::new(b"+00a".to_vec()));
        assert!(matches!(reader.read(), Err(GitError::InvalidPktLine(_))));
    }

    #[test]
    fn test_pktline_read_truncated_payload() {
        let mut reader = PktLineReader::new(Cursor::new(b"000ahel".to_vec()));
        assert!(matches!(reader.read(), Err(GitError::UnexpectedEof)));
    }

    #[test]
    fn test_pktline_read_eof_on_empty() {
        let mut reader = PktLineReader::new(Cursor::new(Vec::<u8>::new()));
        assert!(reader.read().unwrap().is_none());
        assert!(matches!(reader.read_line(), Err(GitError::UnexpectedEof)));
    }

    #[test]
    fn test_pktline_large_packet() {
        let data = vec![b'x'; MAX_DATA_LEN];
        let encoded = PktLine::from_bytes(data.clone()).encode();
        assert_eq!(&encoded[..4], b"fff0");

        let mut reader = PktLineReader::new(Cursor::new(encoded));
        assert_eq!(reader.read().unwrap(), Some(PktLine::Data(data)));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    proptest! {
        /// Property: any legal payload survives encode then decode
        #[test]
        fn prop_data_roundtrip(len in 0usize..=MAX_DATA_LEN, seed in any::<u8>()) {
            let data: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect();
            let encoded = PktLine::Data(data.clone()).encode();
            prop_assert_eq!(encoded.len(), len + 4);

            let mut reader = PktLineReader::new(Cursor::new(encoded));
            prop_assert_eq!(reader.read().unwrap(), Some(PktLine::Data(data)));
        }

        /// Property: arbitrary input never panics the reader
        #[test]
        fn prop_reader_no_panic(data in prop::collection::vec(any::<u8>(), 0..512)) {
            let mut reader = PktLineReader::new(Cursor::new(data));
            for _ in 0..64 {
                match reader.read() {
                    Ok(Some(_)) => continue,
                    _ => break,
                }
            }
        }
    }
}
