//! `std::io` adapter over a built stream.

use std::io::{self, Read, Seek, SeekFrom};

use crate::builder::BuiltStream;

/// A `Read + Seek` cursor over a [`BuiltStream`].
///
/// Seeking past the end is allowed; reads there return 0 bytes.
pub struct StreamCursor<'a> {
    stream: &'a BuiltStream,
    position: u64,
}

impl<'a> StreamCursor<'a> {
    pub fn new(stream: &'a BuiltStream) -> Self {
        Self {
            stream,
            position: 0,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Read for StreamCursor<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.stream.total_length() {
            return Ok(0);
        }
        let n = self.stream.read(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for StreamCursor<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.stream.total_length().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };

        match target {
            Some(position) => {
                self.position = position;
                Ok(position)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
        }
    }
}
