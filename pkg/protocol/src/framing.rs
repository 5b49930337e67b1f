use std::io::{BufRead, Read, Write};

use crate::ProtocolError;

/// Upper bound for a single control line, newline excluded.
pub const MAX_CONTROL_LINE_BYTES: usize = 4096;

/// Reads one newline-terminated control line and returns it trimmed.
///
/// Returns `Ok(None)` when the peer closed the stream before sending any
/// byte. A final line without a trailing newline is accepted as-is.
pub fn read_line<R: BufRead>(
    reader: &mut R,
    limit: usize,
) -> Result<Option<String>, ProtocolError> {
    let mut buf = Vec::new();
    let read = reader
        .by_ref()
        .take(limit as u64 + 1)
        .read_until(b'\n', &mut buf)?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if buf.len() > limit {
        return Err(ProtocolError::LineTooLong { limit });
    }
    let line = String::from_utf8(buf).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok(Some(line.trim().to_string()))
}

/// Like [`read_line`], but treats end-of-stream as an error.
pub(crate) fn expect_line<R: BufRead>(
    reader: &mut R,
    waiting_for: &'static str,
) -> Result<String, ProtocolError> {
    read_line(reader, MAX_CONTROL_LINE_BYTES)?.ok_or(ProtocolError::ConnectionClosed(waiting_for))
}

pub fn write_line<W: Write>(writer: &mut W, line: &str) -> Result<(), ProtocolError> {
    let mut framed = Vec::with_capacity(line.len() + 1);
    framed.extend_from_slice(line.as_bytes());
    framed.push(b'\n');
    writer.write_all(&framed)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn read_line_trims_crlf_and_whitespace() {
        let mut reader = Cursor::new(b"  PERMITIDO \r\nNEGADO\n".to_vec());
        assert_eq!(
            read_line(&mut reader, 64).unwrap().as_deref(),
            Some("PERMITIDO")
        );
        assert_eq!(read_line(&mut reader, 64).unwrap().as_deref(), Some("NEGADO"));
        assert_eq!(read_line(&mut reader, 64).unwrap(), None);
    }

    #[test]
    fn read_line_accepts_unterminated_final_line() {
        let mut reader = Cursor::new(b"LIBERTAR".to_vec());
        assert_eq!(
            read_line(&mut reader, 64).unwrap().as_deref(),
            Some("LIBERTAR")
        );
    }

    #[test]
    fn read_line_rejects_overlong_line() {
        let mut reader = Cursor::new(vec![b'x'; 100]);
        let err = read_line(&mut reader, 16).expect_err("line should be too long");
        assert!(matches!(err, ProtocolError::LineTooLong { limit: 16 }));
    }

    #[test]
    fn read_line_leaves_following_bytes_unread() {
        let mut reader = Cursor::new(b"FILE:a.csv|SIZE:3\nabc".to_vec());
        read_line(&mut reader, 64).unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"abc");
    }

    #[test]
    fn expect_line_reports_closed_stream() {
        let mut reader = Cursor::new(Vec::new());
        let err = expect_line(&mut reader, "waiting for ACK").unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed("waiting for ACK")));
    }

    #[test]
    fn write_line_appends_newline() {
        let mut out = Vec::new();
        write_line(&mut out, "SOLICITAR").unwrap();
        assert_eq!(out, b"SOLICITAR\n");
    }
}
