use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::serial::error::SerialPortError;

/// Longest line a device may send before it is considered garbage.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// This codec has a configurable delimiter character for reading,
/// and optionally adds a character to each line it encodes.
///
/// A carriage return right before the read delimiter is dropped,
/// so `\r\n` terminated devices yield the same lines as `\n` terminated ones.
#[derive(Debug, Clone)]
pub struct LinesCodec {
    /// How far we have looked for a newline into the buffer
    cursor: usize,

    /// How to delimit incoming byte streams.
    /// This delimiter is not included in the yielded frames.
    read_delimiter: u8,

    /// If provided, which byte to append when writing (encoding) messages.
    /// If `None`, forwards the data as-is.
    write_delimiter: Option<u8>,

    /// Lines longer than this are an error.
    max_length: usize,
}

impl LinesCodec {
    /// Create a new codec.
    pub fn new(read_delimiter: u8, write_delimiter: Option<u8>) -> Self {
        Self {
            cursor: 0,
            read_delimiter,
            write_delimiter,
            max_length: MAX_LINE_LENGTH,
        }
    }

    /// Change the longest line accepted.
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    fn too_long(&mut self, src: &mut BytesMut) -> SerialPortError {
        self.cursor = 0;
        src.clear();
        SerialPortError::LineTooLong(self.max_length)
    }

    /// Return a [StringCodec], which does the same thing as the underlying [LinesCodec].
    /// The difference is that it writes strings instead of vectors of bytes.
    /// It also reads strings, and it is configurable whether bad utf8
    /// should result in an error, or be replaced with some lossy character.
    pub fn into_string_codec(self, lossy: bool) -> StringCodec {
        StringCodec {
            lossy,
            wrapped: self,
        }
    }
}

impl Default for LinesCodec {
    fn default() -> Self {
        Self::new(b'\n', Some(b'\n'))
    }
}

fn without_carriage_return(mut line: Vec<u8>) -> Vec<u8> {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    line
}

impl Decoder for LinesCodec {
    type Item = Vec<u8>;
    type Error = SerialPortError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let read_to = src.len();

        let look_at = &src[self.cursor..read_to];

        if let Some(position) = look_at.iter().position(|&byte| byte == self.read_delimiter) {
            // Since we might "start late" in the buffer (from the cursor),
            // the "global" position within the buffer has to be calculated.
            let actual_position = self.cursor + position;
            if actual_position > self.max_length {
                return Err(self.too_long(src));
            }

            // Next time we need to start over.
            self.cursor = 0;

            // Split at the delimiter, getting a slice of the bytes before it.
            let line = src.split_to(actual_position);

            // Discard the newline by advancing the source buffer beyond it.
            src.advance(1);

            Ok(Some(without_carriage_return(line[..].to_vec())))
        } else if read_to > self.max_length {
            Err(self.too_long(src))
        } else {
            // We did not find a full frame.
            // The next time we are called the same buffer `src` will be provided to us (same starting point),
            // but possibly with more data.
            // Since our job is to find the delimiter, we don't need to re-read the bytes we have already looked at.
            self.cursor = read_to;

            // Indicate that we need more bytes to look at.
            Ok(None)
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }

        // The stream ended without a final delimiter.
        // What is left is still a line.
        self.cursor = 0;
        if src.len() > self.max_length {
            Err(self.too_long(src))
        } else if src.is_empty() {
            Ok(None)
        } else {
            let line = src.split_to(src.len());
            Ok(Some(without_carriage_return(line[..].to_vec())))
        }
    }
}

impl Encoder<Vec<u8>> for LinesCodec {
    type Error = SerialPortError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);

        if let Some(character) = self.write_delimiter {
            dst.extend_from_slice(&[character]);
        }
        Ok(())
    }
}

/// This does the same thing as the underlying [LinesCodec].
/// The difference is that it reads strings, and it is configurable whether bad utf8
/// should result in an error, or be replaced with some lossy character.
///
/// It can write and read strings.
#[derive(Debug, Clone)]
pub struct StringCodec {
    lossy: bool,
    wrapped: LinesCodec,
}

impl StringCodec {
    fn stringify(&self, bytes: Vec<u8>) -> Result<String, SerialPortError> {
        if self.lossy {
            Ok(String::from_utf8_lossy(&bytes).to_string())
        } else {
            Ok(String::from_utf8(bytes)?)
        }
    }
}

impl Decoder for StringCodec {
    type Item = String;
    type Error = SerialPortError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.wrapped.decode(src)? {
            Some(bytes) => self.stringify(bytes).map(Some),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.wrapped.decode_eof(src)? {
            Some(bytes) => self.stringify(bytes).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<String> for StringCodec {
    type Error = SerialPortError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.wrapped.encode(item.into_bytes(), dst)
    }
}

impl Encoder<Vec<u8>> for StringCodec {
    type Error = SerialPortError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.wrapped.encode(item, dst)
    }
}
