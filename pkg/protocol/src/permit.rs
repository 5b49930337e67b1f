//! Permit handshake between a permit holder and the coordinator.
//!
//! A client sends `SOLICITAR` and reads back `PERMITIDO` or `NEGADO`. A
//! granted client keeps the same connection open and later sends `LIBERTAR`.

use std::{
    io::{BufReader, ErrorKind},
    net::{TcpStream, ToSocketAddrs},
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{
    ProtocolError,
    framing::{expect_line, write_line},
};

pub const REQUEST_LINE: &str = "SOLICITAR";
pub const GRANTED_LINE: &str = "PERMITIDO";
pub const DENIED_LINE: &str = "NEGADO";
pub const RELEASE_LINE: &str = "LIBERTAR";

/// How long a holder treats a granted permit as its own. Must stay below the
/// coordinator's lease TTL (120 s by default).
pub const DEFAULT_LEASE_BUDGET: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermitRequest {
    Acquire,
    Release,
}

impl PermitRequest {
    pub fn as_line(self) -> &'static str {
        match self {
            Self::Acquire => REQUEST_LINE,
            Self::Release => RELEASE_LINE,
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            REQUEST_LINE => Some(Self::Acquire),
            RELEASE_LINE => Some(Self::Release),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermitReply {
    Granted,
    Denied,
}

impl PermitReply {
    pub fn as_line(self) -> &'static str {
        match self {
            Self::Granted => GRANTED_LINE,
            Self::Denied => DENIED_LINE,
        }
    }

    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            GRANTED_LINE => Some(Self::Granted),
            DENIED_LINE => Some(Self::Denied),
            _ => None,
        }
    }
}

/// Opens a TCP connection with connect, read and write timeouts applied.
pub fn connect_with_timeout(addr: &str, timeout: Duration) -> Result<TcpStream, ProtocolError> {
    let mut last_err = None;
    for candidate in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err
        .unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no address resolved for '{addr}'"),
            )
        })
        .into())
}

/// Client side of the permit handshake.
#[derive(Debug, Clone)]
pub struct PermitClient {
    addr: String,
    timeout: Duration,
    lease_budget: Duration,
}

impl PermitClient {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            lease_budget: DEFAULT_LEASE_BUDGET,
        }
    }

    pub fn with_lease_budget(mut self, lease_budget: Duration) -> Self {
        self.lease_budget = lease_budget;
        self
    }

    /// Requests the permit once. A denial is a normal outcome, not an error;
    /// retrying is left to the caller.
    pub fn acquire(&self) -> Result<PermitOutcome, ProtocolError> {
        // Counted from before the request so the local deadline always falls
        // ahead of the coordinator's expiry.
        let deadline = Instant::now() + self.lease_budget;
        let stream = connect_with_timeout(&self.addr, self.timeout)?;
        let mut reader = BufReader::new(stream);
        write_line(reader.get_mut(), PermitRequest::Acquire.as_line())?;
        let reply = expect_line(&mut reader, "waiting for permit reply")?;
        match PermitReply::parse(&reply) {
            Some(PermitReply::Granted) => {
                debug!(coordinator = %self.addr, "permit granted");
                Ok(PermitOutcome::Granted(PermitGuard {
                    stream: Some(reader.into_inner()),
                    deadline,
                }))
            }
            Some(PermitReply::Denied) => {
                debug!(coordinator = %self.addr, "permit denied");
                Ok(PermitOutcome::Denied)
            }
            None => Err(ProtocolError::UnexpectedLine {
                expected: "PERMITIDO or NEGADO",
                got: reply,
            }),
        }
    }
}

#[derive(Debug)]
pub enum PermitOutcome {
    Granted(PermitGuard),
    Denied,
}

impl PermitOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// Held permit. The coordinator connection stays open for as long as the
/// guard lives; `LIBERTAR` is sent on [`PermitGuard::release`] or on drop.
///
/// Holding the guard is not enough to act under the permit: the coordinator
/// reclaims a lease once it expires. Work done under the permit must check
/// [`PermitGuard::remaining`] and stop when it returns `None`.
#[derive(Debug)]
pub struct PermitGuard {
    stream: Option<TcpStream>,
    deadline: Instant,
}

impl PermitGuard {
    /// Time left on the lease budget, or `None` once the budget is spent or
    /// the coordinator has closed the connection.
    pub fn remaining(&self) -> Option<Duration> {
        let remaining = self.deadline.checked_duration_since(Instant::now())?;
        if remaining.is_zero() || !self.coordinator_connected() {
            return None;
        }
        Some(remaining)
    }

    fn coordinator_connected(&self) -> bool {
        let Some(stream) = &self.stream else {
            return false;
        };
        if stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut byte = [0u8; 1];
        let connected = match stream.peek(&mut byte) {
            Ok(0) => false,
            Ok(_) => true,
            Err(err) => err.kind() == ErrorKind::WouldBlock,
        };
        stream.set_nonblocking(false).is_ok() && connected
    }

    pub fn release(mut self) -> Result<(), ProtocolError> {
        match self.stream.take() {
            Some(mut stream) => write_line(&mut stream, RELEASE_LINE),
            None => Ok(()),
        }
    }
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        if let Some(mut stream) = self.stream.take()
            && let Err(err) = write_line(&mut stream, RELEASE_LINE)
        {
            warn!(error = %err, "failed to release permit on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::read_line;
    use std::{net::TcpListener, thread};

    fn fake_coordinator(reply: &'static str) -> (String, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut seen = Vec::new();
            seen.push(read_line(&mut reader, 64).unwrap().unwrap());
            write_line(reader.get_mut(), reply).unwrap();
            while let Some(line) = read_line(&mut reader, 64).unwrap() {
                seen.push(line);
            }
            seen
        });
        (addr, handle)
    }

    #[test]
    fn request_and_reply_lines_parse() {
        assert_eq!(PermitRequest::parse("SOLICITAR\n"), Some(PermitRequest::Acquire));
        assert_eq!(PermitRequest::parse("LIBERTAR"), Some(PermitRequest::Release));
        assert_eq!(PermitRequest::parse("HELLO"), None);
        assert_eq!(PermitReply::parse(" PERMITIDO "), Some(PermitReply::Granted));
        assert_eq!(PermitReply::parse("NEGADO"), Some(PermitReply::Denied));
        assert_eq!(PermitReply::parse("MAYBE"), None);
    }

    #[test]
    fn granted_permit_sends_release_line() {
        let (addr, server) = fake_coordinator(GRANTED_LINE);
        let client = PermitClient::new(addr, Duration::from_secs(5));
        let PermitOutcome::Granted(guard) = client.acquire().unwrap() else {
            panic!("permit should be granted");
        };
        guard.release().unwrap();
        assert_eq!(server.join().unwrap(), vec!["SOLICITAR", "LIBERTAR"]);
    }

    #[test]
    fn dropped_guard_releases_permit() {
        let (addr, server) = fake_coordinator(GRANTED_LINE);
        let client = PermitClient::new(addr, Duration::from_secs(5));
        let outcome = client.acquire().unwrap();
        assert!(outcome.is_granted());
        drop(outcome);
        assert_eq!(server.join().unwrap(), vec!["SOLICITAR", "LIBERTAR"]);
    }

    #[test]
    fn denied_permit_never_sends_release() {
        let (addr, server) = fake_coordinator(DENIED_LINE);
        let client = PermitClient::new(addr, Duration::from_secs(5));
        assert!(matches!(client.acquire().unwrap(), PermitOutcome::Denied));
        assert_eq!(server.join().unwrap(), vec!["SOLICITAR"]);
    }

    #[test]
    fn unexpected_reply_is_a_protocol_error() {
        let (addr, _server) = fake_coordinator("BUSY");
        let client = PermitClient::new(addr, Duration::from_secs(5));
        let err = client.acquire().unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedLine { .. }));
    }

    #[test]
    fn lease_budget_runs_out() {
        let (addr, server) = fake_coordinator(GRANTED_LINE);
        let client = PermitClient::new(addr, Duration::from_secs(5))
            .with_lease_budget(Duration::from_millis(80));
        let PermitOutcome::Granted(guard) = client.acquire().unwrap() else {
            panic!("permit should be granted");
        };
        assert!(guard.remaining().is_some_and(|left| left <= Duration::from_millis(80)));
        thread::sleep(Duration::from_millis(120));
        assert_eq!(guard.remaining(), None);
        guard.release().unwrap();
        assert_eq!(server.join().unwrap(), vec!["SOLICITAR", "LIBERTAR"]);
    }

    #[test]
    fn closed_coordinator_connection_ends_the_lease() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            read_line(&mut reader, 64).unwrap();
            write_line(reader.get_mut(), GRANTED_LINE).unwrap();
        });
        let client = PermitClient::new(addr, Duration::from_secs(5));
        let PermitOutcome::Granted(guard) = client.acquire().unwrap() else {
            panic!("permit should be granted");
        };
        server.join().unwrap();

        let mut remaining = guard.remaining();
        for _ in 0..50 {
            if remaining.is_none() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
            remaining = guard.remaining();
        }
        assert_eq!(remaining, None);
    }

    #[test]
    fn unreachable_coordinator_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let client = PermitClient::new(addr, Duration::from_millis(500));
        assert!(matches!(client.acquire(), Err(ProtocolError::Io(_))));
    }
}
