use bytes::{buf::Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use blaster_core::IoSerial;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("serde JSON error {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("io error {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON representation contained newline")]
    NewlineInData,
}

// -------------------------

/// JSON Lines text format, also called newline-delimited JSON.
#[derive(Default)]
pub struct JsonLinesCodec {}

impl JsonLinesCodec {
    pub fn new() -> Self {
        Self {}
    }
}

impl Decoder for JsonLinesCodec {
    type Item = IoSerial;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // Serial reads can end anywhere, wait for a complete line.
            let Some(newline) = memchr::memchr(b'\n', &buf[..]) else {
                return Ok(None);
            };
            let line = buf.split_to(newline + 1);
            let line = trim_line_end(&line[..]);
            if line.is_empty() {
                continue;
            }
            // A bad line has already been consumed above, so an error here
            // does not make us parse it again.
            let msg = serde_json::from_slice(line)?;
            return Ok(Some(msg));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(msg) => Ok(Some(msg)),
            None => {
                // trailing garbage without newline at end of stream is dropped
                if !buf.is_empty() {
                    tracing::debug!("dropping {} bytes of partial line at EOF", buf.len());
                    buf.advance(buf.remaining());
                }
                Ok(None)
            }
        }
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &line[..end]
}

// We encode `T` and not `&T` because we do not want to deal with
// the lifetime issues (this is used in async contexts.)
impl Encoder<IoSerial> for JsonLinesCodec {
    type Error = Error;
    fn encode(&mut self, msg: IoSerial, final_buf: &mut bytes::BytesMut) -> Result<(), Self::Error> {
        let mut v = serde_json::to_vec(&msg)?;
        if memchr::memchr2(b'\n', b'\r', &v).is_some() {
            return Err(Error::NewlineInData);
        }
        v.push(b'\n');
        final_buf.extend_from_slice(v.as_slice());
        Ok(())
    }
}
