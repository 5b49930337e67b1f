//! File transfer session between the aggregator and the downstream collector.
//!
//! ```text
//! client                          server
//! AGREGADOR_READY          ->
//!                          <-     ACK
//! FILE:<name>|SIZE:<n>     ->
//! <n raw bytes>            ->
//!                          <-     RECEBIDO
//! ... one exchange per file ...
//! FIM_TRANSFERENCIA        ->
//! ```

use std::{
    fmt,
    io::{BufReader, Read, Write},
};

use tracing::{debug, warn};

use crate::{
    ACK_LINE, END_TRANSFER_LINE, ERROR_LINE, ProtocolError, READY_LINE, RECEIVED_LINE,
    framing::{MAX_CONTROL_LINE_BYTES, expect_line, read_line, write_line},
};

/// Largest single file a server accepts by default.
pub const MAX_TRANSFER_FILE_BYTES: u64 = 64 * 1024 * 1024;

const FILE_PREFIX: &str = "FILE:";
const SIZE_SEPARATOR: &str = "|SIZE:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub name: String,
    pub size: u64,
}

impl FileHeader {
    pub fn new(name: impl Into<String>, size: u64) -> Result<Self, ProtocolError> {
        let name = name.into();
        if name.is_empty() || name.contains(['|', '\n', '\r']) {
            return Err(ProtocolError::MalformedHeader(name));
        }
        Ok(Self { name, size })
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let malformed = || ProtocolError::MalformedHeader(line.to_string());
        let rest = line.trim().strip_prefix(FILE_PREFIX).ok_or_else(malformed)?;
        let (name, size) = rest.split_once(SIZE_SEPARATOR).ok_or_else(malformed)?;
        let size = size.trim().parse::<u64>().map_err(|_| malformed())?;
        Self::new(name.trim(), size).map_err(|_| malformed())
    }

    pub fn to_line(&self) -> String {
        format!("{FILE_PREFIX}{}{SIZE_SEPARATOR}{}", self.name, self.size)
    }
}

impl fmt::Display for FileHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// What the server answered for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Confirmed,
    Rejected(String),
}

/// Client half of one transfer session. Files go out strictly one at a time;
/// the next header is only sent after the previous confirmation arrived.
pub struct TransferSession<S: Read + Write> {
    reader: BufReader<S>,
}

impl<S: Read + Write> TransferSession<S> {
    /// Announces readiness and waits for the server's `ACK`.
    pub fn open(stream: S) -> Result<Self, ProtocolError> {
        let mut reader = BufReader::new(stream);
        write_line(reader.get_mut(), READY_LINE)?;
        let reply = expect_line(&mut reader, "waiting for ACK")?;
        if reply != ACK_LINE {
            return Err(ProtocolError::UnexpectedLine {
                expected: ACK_LINE,
                got: reply,
            });
        }
        Ok(Self { reader })
    }

    pub fn send_file(&mut self, name: &str, payload: &[u8]) -> Result<Delivery, ProtocolError> {
        let header = FileHeader::new(name, payload.len() as u64)?;
        let stream = self.reader.get_mut();
        write_line(stream, &header.to_line())?;
        stream.write_all(payload)?;
        stream.flush()?;

        let reply = expect_line(&mut self.reader, "waiting for file confirmation")?;
        if reply == RECEIVED_LINE {
            Ok(Delivery::Confirmed)
        } else {
            Ok(Delivery::Rejected(reply))
        }
    }

    pub fn get_ref(&self) -> &S {
        self.reader.get_ref()
    }

    /// Sends the end-of-session marker.
    pub fn finish(mut self) -> Result<(), ProtocolError> {
        write_line(self.reader.get_mut(), END_TRANSFER_LINE)
    }
}

/// Destination for files received by [`serve_transfer_session`].
pub trait FileSink {
    fn accept_file(&mut self, header: &FileHeader, payload: &[u8]) -> std::io::Result<()>;
}

impl<F> FileSink for F
where
    F: FnMut(&FileHeader, &[u8]) -> std::io::Result<()>,
{
    fn accept_file(&mut self, header: &FileHeader, payload: &[u8]) -> std::io::Result<()> {
        self(header, payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionSummary {
    pub files_received: usize,
    pub files_failed: usize,
    /// False when the client disconnected before the end marker.
    pub completed: bool,
}

/// Server half of a transfer session.
pub fn serve_transfer_session<S, K>(
    stream: S,
    sink: &mut K,
    max_file_bytes: u64,
) -> Result<SessionSummary, ProtocolError>
where
    S: Read + Write,
    K: FileSink + ?Sized,
{
    let mut reader = BufReader::new(stream);
    let hello = expect_line(&mut reader, "waiting for readiness")?;
    if hello != READY_LINE {
        return Err(ProtocolError::UnexpectedLine {
            expected: READY_LINE,
            got: hello,
        });
    }
    write_line(reader.get_mut(), ACK_LINE)?;

    let mut summary = SessionSummary::default();
    loop {
        let Some(line) = read_line(&mut reader, MAX_CONTROL_LINE_BYTES)? else {
            warn!(
                files_received = summary.files_received,
                "transfer session closed without end marker"
            );
            return Ok(summary);
        };
        if line == END_TRANSFER_LINE {
            summary.completed = true;
            return Ok(summary);
        }

        let header = FileHeader::parse(&line)?;
        if header.size > max_file_bytes {
            return Err(ProtocolError::PayloadTooLarge {
                size: header.size,
                limit: max_file_bytes,
            });
        }
        let mut payload = Vec::with_capacity(header.size as usize);
        (&mut reader).take(header.size).read_to_end(&mut payload)?;
        if payload.len() as u64 != header.size {
            return Err(ProtocolError::ConnectionClosed("reading file payload"));
        }

        match sink.accept_file(&header, &payload) {
            Ok(()) => {
                debug!(file = %header.name, bytes = header.size, "file received");
                summary.files_received += 1;
                write_line(reader.get_mut(), RECEIVED_LINE)?;
            }
            Err(err) => {
                warn!(file = %header.name, error = %err, "file sink rejected payload");
                summary.files_failed += 1;
                write_line(reader.get_mut(), ERROR_LINE)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{net::TcpListener, thread};

    #[test]
    fn file_header_parses_wire_form() {
        let header = FileHeader::parse("FILE:humidade.csv|SIZE:42").unwrap();
        assert_eq!(header.name, "humidade.csv");
        assert_eq!(header.size, 42);
        assert_eq!(header.to_line(), "FILE:humidade.csv|SIZE:42");
    }

    #[test]
    fn file_header_rejects_malformed_lines() {
        for line in [
            "humidade.csv|SIZE:42",
            "FILE:humidade.csv",
            "FILE:humidade.csv|SIZE:-1",
            "FILE:|SIZE:3",
            "FILE:a|b|SIZE:3",
        ] {
            assert!(
                matches!(FileHeader::parse(line), Err(ProtocolError::MalformedHeader(_))),
                "{line} should be rejected"
            );
        }
    }

    #[test]
    fn session_round_trip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            let mut sink = |header: &FileHeader, payload: &[u8]| -> std::io::Result<()> {
                received.push((header.name.clone(), payload.to_vec()));
                Ok(())
            };
            let summary = serve_transfer_session(stream, &mut sink, 1024).unwrap();
            (summary, received)
        });

        let stream = std::net::TcpStream::connect(addr).unwrap();
        let mut session = TransferSession::open(stream).unwrap();
        assert_eq!(
            session.send_file("ph.csv", b"ID,Hora,Valor\n1,12:00,7.1\n").unwrap(),
            Delivery::Confirmed
        );
        assert_eq!(
            session.send_file("humidade.csv", b"ID,Hora,Valor\n1,12:00,60\n").unwrap(),
            Delivery::Confirmed
        );
        session.finish().unwrap();

        let (summary, received) = server.join().unwrap();
        assert!(summary.completed);
        assert_eq!(summary.files_received, 2);
        assert_eq!(received[0].0, "ph.csv");
        assert_eq!(received[1].1, b"ID,Hora,Valor\n1,12:00,60\n");
    }

    #[test]
    fn failing_sink_answers_error_token() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut sink = |_: &FileHeader, _: &[u8]| -> std::io::Result<()> {
                Err(std::io::Error::other("disk full"))
            };
            serve_transfer_session(stream, &mut sink, 1024).unwrap()
        });

        let stream = std::net::TcpStream::connect(addr).unwrap();
        let mut session = TransferSession::open(stream).unwrap();
        assert_eq!(
            session.send_file("ph.csv", b"x").unwrap(),
            Delivery::Rejected("ERRO".to_string())
        );
        session.finish().unwrap();
        let summary = server.join().unwrap();
        assert_eq!(summary.files_failed, 1);
        assert!(summary.completed);
    }

    #[test]
    fn open_fails_without_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            read_line(&mut reader, 64).unwrap();
            write_line(reader.get_mut(), "BUSY").unwrap();
        });

        let stream = std::net::TcpStream::connect(addr).unwrap();
        let err = TransferSession::open(stream).err().expect("open should fail");
        assert!(matches!(err, ProtocolError::UnexpectedLine { expected: "ACK", .. }));
        server.join().unwrap();
    }

    #[test]
    fn server_rejects_oversized_payload_header() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut sink = |_: &FileHeader, _: &[u8]| -> std::io::Result<()> { Ok(()) };
            serve_transfer_session(stream, &mut sink, 4)
        });

        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        stream
            .write_all(b"AGREGADOR_READY\nFILE:ph.csv|SIZE:99\n")
            .unwrap();
        let result = server.join().unwrap();
        assert!(matches!(
            result,
            Err(ProtocolError::PayloadTooLarge { size: 99, limit: 4 })
        ));
    }
}
