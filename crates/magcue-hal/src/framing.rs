//! CRLF line framing for the device byte stream.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Longest line kept in memory before it is discarded as garbage.
pub const MAX_LINE_BYTES: usize = 1024;

/// Outcome of one [`read_crlf_line`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRead {
    /// A complete line is in the buffer, delimiter stripped.
    Line,
    /// A line exceeded [`MAX_LINE_BYTES`]; its bytes were dropped.
    Overflow,
    /// The stream ended.  Any partial line is discarded.
    Eof,
}

/// Read bytes into `buf` until the two-byte `\r\n` delimiter.
///
/// A bare `\n` is kept as line content.  `buf` is cleared first.
pub async fn read_crlf_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut overflow = false;

    loop {
        let (found_lf, used) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(LineRead::Eof);
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    buf.extend_from_slice(&available[..=i]);
                    (true, i + 1)
                }
                None => {
                    buf.extend_from_slice(available);
                    (false, available.len())
                }
            }
        };
        reader.consume(used);

        if found_lf && buf.ends_with(b"\r\n") {
            buf.truncate(buf.len() - 2);
            return Ok(if overflow { LineRead::Overflow } else { LineRead::Line });
        }

        if buf.len() > MAX_LINE_BYTES {
            overflow = true;
            // Keep the last byte: it may be the '\r' of the delimiter.
            let keep_from = buf.len() - 1;
            buf.drain(..keep_from);
        }
    }
}
