//! Side-band demultiplexing.
//!
//! When side-band is active every data packet starts with a channel byte:
//! 1 carries pack data, 2 progress text and 3 a fatal error message.
//! [`SideBandReader`] pulls one packet at a time and only buffers the
//! remainder of the current pack data packet.

use crate::pktline::{PktLine, PktLineReader};
use crate::GitError;
use std::io::{self, Read, Write};

/// Channel carrying pack data.
pub const CHANNEL_DATA: u8 = 1;
/// Channel carrying progress messages.
pub const CHANNEL_PROGRESS: u8 = 2;
/// Channel carrying a fatal error message.
pub const CHANNEL_ERROR: u8 = 3;

/// Destination for remote progress text.
pub type ProgressSink = Box<dyn Write + Send>;

/// A reader that yields the pack data channel of a side-band stream.
pub struct SideBandReader<R> {
    reader: PktLineReader<R>,
    progress: Option<ProgressSink>,
    frame: Vec<u8>,
    pos: usize,
    finished: bool,
    fatal: Option<String>,
}

impl<R: Read> SideBandReader<R> {
    /// Wraps a pkt-line reader positioned at the first side-band packet.
    pub fn new(reader: PktLineReader<R>, progress: Option<ProgressSink>) -> Self {
        Self {
            reader,
            progress,
            frame: Vec::new(),
            pos: 0,
            finished: false,
            fatal: None,
        }
    }

    /// Returns true once the terminating flush packet was read.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Returns the message of a fatal remote error, if one was received.
    pub fn fatal_error(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    /// Consumes the reader, returning the underlying pkt-line reader.
    pub fn into_inner(self) -> PktLineReader<R> {
        self.reader
    }

    /// Loads the next pack data frame. Returns false at the end of the stream.
    fn fill_frame(&mut self) -> crate::Result<bool> {
        loop {
            let data = match self.reader.read()? {
                Some(PktLine::Data(data)) => data,
                Some(PktLine::Flush) => {
                    self.finished = true;
                    if let Some(progress) = self.progress.as_mut() {
                        progress.flush()?;
                    }
                    return Ok(false);
                }
                Some(PktLine::Delim) => {
                    return Err(GitError::Protocol(
                        "unexpected delimiter in side-band stream".to_string(),
                    ))
                }
                None => return Err(GitError::UnexpectedEof),
            };

            let Some((&channel, payload)) = data.split_first() else {
                return Err(GitError::Protocol("empty side-band packet".to_string()));
            };
            match channel {
                CHANNEL_DATA => {
                    if payload.is_empty() {
                        continue;
                    }
                    self.frame = data;
                    self.pos = 1;
                    return Ok(true);
                }
                CHANNEL_PROGRESS => {
                    if let Some(progress) = self.progress.as_mut() {
                        progress.write_all(payload)?;
                    } else {
                        tracing::trace!(message = %String::from_utf8_lossy(payload).trim_end(), "remote progress");
                    }
                }
                CHANNEL_ERROR => {
                    let message = String::from_utf8_lossy(payload).trim_end().to_string();
                    tracing::debug!(message = %message, "remote reported a fatal error");
                    self.fatal = Some(message.clone());
                    return Err(GitError::Remote(message));
                }
                other => {
                    return Err(GitError::Protocol(format!(
                        "invalid side-band channel {other}"
                    )))
                }
            }
        }
    }
}

impl<R: Read> Read for SideBandReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(message) = &self.fatal {
            return Err(GitError::Remote(message.clone()).into());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos >= self.frame.len() {
            if self.finished || !self.fill_frame()? {
                return Ok(0);
            }
        }
        let available = &self.frame[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktline::PktLineWriter;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    /// Progress sink that records everything written to it.
    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<u8>>>);

    impl Write for Recorder {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn frames(frames: &[(u8, &[u8])], flush: bool) -> PktLineReader<Cursor<Vec<u8>>> {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            for (channel, payload) in frames {
                let mut data = vec![*channel];
                data.extend_from_slice(payload);
                writer.write_data(&data).unwrap();
            }
            if flush {
                writer.flush_pkt().unwrap();
            }
        }
        PktLineReader::new(Cursor::new(buf))
    }

    #[test]
    fn test_demultiplexes_data_and_progress() {
        let recorder = Recorder::default();
        let reader = frames(
            &[
                (CHANNEL_PROGRESS, b"Counting objects\r"),
                (CHANNEL_DATA, b"PACK"),
                (CHANNEL_PROGRESS, b"done\n"),
                (CHANNEL_DATA, b"rest"),
            ],
            true,
        );
        let mut sideband = SideBandReader::new(reader, Some(Box::new(recorder.clone())));
        let mut out = Vec::new();
        sideband.read_to_end(&mut out).unwrap();

        assert_eq!(out, b"PACKrest");
        assert!(sideband.is_finished());
        assert_eq!(recorder.0.lock().unwrap().as_slice(), b"Counting objects\rdone\n");
    }

    #[test]
    fn test_small_reads_drain_buffered_frame() {
        let reader = frames(&[(CHANNEL_DATA, b"abcdef")], true);
        let mut sideband = SideBandReader::new(reader, None);
        let mut buf = [0u8; 4];
        assert_eq!(sideband.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(sideband.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(sideband.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_fatal_error_aborts() {
        let reader = frames(
            &[(CHANNEL_DATA, b"PA"), (CHANNEL_ERROR, b"upload-pack: not our ref\n")],
            false,
        );
        let mut sideband = SideBandReader::new(reader, None);
        let mut out = Vec::new();
        let err: GitError = sideband.read_to_end(&mut out).unwrap_err().into();
        assert!(matches!(err, GitError::Remote(ref m) if m == "upload-pack: not our ref"));
        assert_eq!(sideband.fatal_error(), Some("upload-pack: not our ref"));

        // No further reads reach the underlying stream.
        let err: GitError = sideband.read(&mut [0u8; 8]).unwrap_err().into();
        assert!(err.is_remote());
    }

    #[test]
    fn test_missing_flush_is_unexpected_eof() {
        let reader = frames(&[(CHANNEL_DATA, b"PACK")], false);
        let mut sideband = SideBandReader::new(reader, None);
        let mut out = Vec::new();
        let err: GitError = sideband.read_to_end(&mut out).unwrap_err().into();
        assert!(matches!(err, GitError::UnexpectedEof));
    }

    #[test]
    fn test_invalid_channel() {
        let reader = frames(&[(9, b"??")], true);
        let mut sideband = SideBandReader::new(reader, None);
        let err: GitError = sideband.read(&mut [0u8; 8]).unwrap_err().into();
        assert!(matches!(err, GitError::Protocol(_)));
    }
}
