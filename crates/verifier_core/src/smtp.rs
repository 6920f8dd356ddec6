//! SMTP probing of mail exchangers
//!
//! A probe opens a TCP connection to one exchanger, walks the SMTP dialog
//! up to `RCPT TO`, and reports whether the recipient was accepted. When
//! the server advertises STARTTLS the connection is upgraded first. No
//! message body is ever submitted; the session always ends with `QUIT`
//! before `DATA`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Upper bound on any single SMTP read, write, or TLS handshake after the
/// connection is open. The connect itself uses the configured timeout.
const TURN_TIMEOUT: Duration = Duration::from_secs(60);

const SMTP_PORT: u16 = 25;

/// Outcome of probing a single mail exchanger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The dialog reached `RCPT TO` without a rejection
    Delivered,
    /// The server rejected a step; the text is the verdict for the address
    Rejected(String),
    /// The connection or greeting failed; the caller tries the next record
    Unreachable,
}

/// Capability interface for SMTP probing, injectable in tests.
#[async_trait]
pub trait SmtpProber: Send + Sync {
    /// Probe `host` on behalf of `domain`, using `from` as the envelope
    /// sender and `to` as the candidate recipient.
    async fn probe(&self, host: &str, domain: &str, from: &str, to: &str) -> ProbeOutcome;
}

#[derive(Debug, Error)]
enum SmtpError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{code} {text}")]
    Reply { code: u16, text: String },
    #[error("tls handshake failed: {0}")]
    Tls(String),
    #[error("{0}")]
    Protocol(String),
}

impl SmtpError {
    fn timed_out() -> Self {
        Self::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "smtp turn timed out",
        ))
    }

    fn from_reply(reply: SmtpReply) -> Self {
        Self::Reply {
            code: reply.code,
            text: reply.lines.join(" "),
        }
    }
}

/// One SMTP reply, possibly multiline.
#[derive(Debug, Clone)]
struct SmtpReply {
    code: u16,
    lines: Vec<String>,
}

impl SmtpReply {
    fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Whether any reply line starts with the given EHLO keyword.
    fn has_capability(&self, keyword: &str) -> bool {
        self.lines.iter().any(|line| {
            line.split_whitespace()
                .next()
                .map(|token| token.eq_ignore_ascii_case(keyword))
                .unwrap_or(false)
        })
    }
}

enum SessionStream {
    Plain(BufReader<TcpStream>),
    Tls(Box<BufReader<TlsStream<TcpStream>>>),
    // placeholder while the plain stream is being upgraded
    Detached,
}

/// One exclusively-owned SMTP session. Every probe exit path goes through
/// `quit` so the exchanger sees an orderly close.
struct SmtpSession {
    host: String,
    stream: SessionStream,
}

impl SmtpSession {
    fn new(host: &str, stream: TcpStream) -> Self {
        Self {
            host: host.to_string(),
            stream: SessionStream::Plain(BufReader::new(stream)),
        }
    }

    async fn read_line(&mut self) -> Result<String, SmtpError> {
        let mut line = String::new();
        let read = match &mut self.stream {
            SessionStream::Plain(reader) => {
                timeout(TURN_TIMEOUT, reader.read_line(&mut line)).await
            }
            SessionStream::Tls(reader) => timeout(TURN_TIMEOUT, reader.read_line(&mut line)).await,
            SessionStream::Detached => {
                return Err(SmtpError::Protocol("connection detached".to_string()))
            }
        }
        .map_err(|_| SmtpError::timed_out())??;
        if read == 0 {
            return Err(SmtpError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed",
            )));
        }
        debug!(host = %self.host, line = %line.trim_end(), "smtp <");
        Ok(line)
    }

    async fn write_line(&mut self, line: &str) -> Result<(), SmtpError> {
        debug!(host = %self.host, line, "smtp >");
        let data = format!("{line}\r\n");
        match &mut self.stream {
            SessionStream::Plain(reader) => {
                timeout(TURN_TIMEOUT, reader.get_mut().write_all(data.as_bytes())).await
            }
            SessionStream::Tls(reader) => {
                timeout(TURN_TIMEOUT, reader.get_mut().write_all(data.as_bytes())).await
            }
            SessionStream::Detached => {
                return Err(SmtpError::Protocol("connection detached".to_string()))
            }
        }
        .map_err(|_| SmtpError::timed_out())??;
        Ok(())
    }

    /// Read one full reply, collapsing `NNN-` continuation lines.
    async fn read_reply(&mut self) -> Result<SmtpReply, SmtpError> {
        let mut code = None;
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            let line = line.trim_end_matches(['\r', '\n']);
            if line.len() < 3 {
                return Err(SmtpError::Protocol(format!("short smtp reply: {line:?}")));
            }
            let parsed: u16 = line[..3]
                .parse()
                .map_err(|_| SmtpError::Protocol(format!("malformed smtp reply: {line:?}")))?;
            let code = *code.get_or_insert(parsed);
            if code != parsed {
                return Err(SmtpError::Protocol(format!(
                    "inconsistent reply codes {code} and {parsed}"
                )));
            }
            let more = line.as_bytes().get(3) == Some(&b'-');
            lines.push(line.get(4..).unwrap_or("").to_string());
            if !more {
                return Ok(SmtpReply { code, lines });
            }
        }
    }

    async fn command(&mut self, line: &str) -> Result<SmtpReply, SmtpError> {
        self.write_line(line).await?;
        self.read_reply().await
    }

    async fn upgrade_tls(&mut self, domain: &str, connector: &TlsConnector) -> Result<(), SmtpError> {
        let stream = std::mem::replace(&mut self.stream, SessionStream::Detached);
        let plain = match stream {
            SessionStream::Plain(reader) => reader.into_inner(),
            other => {
                self.stream = other;
                return Err(SmtpError::Protocol("connection already upgraded".to_string()));
            }
        };
        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|e| SmtpError::Tls(e.to_string()))?;
        let tls = timeout(TURN_TIMEOUT, connector.connect(server_name, plain))
            .await
            .map_err(|_| SmtpError::timed_out())?
            .map_err(|e| SmtpError::Tls(e.to_string()))?;
        self.stream = SessionStream::Tls(Box::new(BufReader::new(tls)));
        Ok(())
    }

    /// Best-effort orderly close; failures are irrelevant at this point.
    async fn quit(&mut self) {
        if self.write_line("QUIT").await.is_ok() {
            let _ = self.read_reply().await;
        }
    }
}

/// The production prober: real TCP, real TLS.
pub struct NetworkProber {
    connect_timeout: Duration,
    port: u16,
    tls: TlsConnector,
}

impl NetworkProber {
    /// Build a prober with the given TCP connect timeout.
    ///
    /// `danger_accept_invalid_certs` disables certificate verification on
    /// STARTTLS upgrades; exchanger certificates rarely match the
    /// recipient domain, so best-effort probing runs with this on.
    pub fn new(connect_timeout: Duration, danger_accept_invalid_certs: bool) -> Self {
        let config = if danger_accept_invalid_certs {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoVerification))
                .with_no_client_auth()
        } else {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };
        Self {
            connect_timeout,
            port: SMTP_PORT,
            tls: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Probe a nonstandard port instead of 25.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    async fn dialog(
        &self,
        session: &mut SmtpSession,
        domain: &str,
        from: &str,
        to: &str,
    ) -> Result<(), SmtpError> {
        let ehlo = session.command(&format!("EHLO {domain}")).await?;
        let greeting = if ehlo.is_positive() {
            ehlo
        } else {
            let helo = session.command(&format!("HELO {domain}")).await?;
            if !helo.is_positive() {
                return Err(SmtpError::from_reply(helo));
            }
            helo
        };

        if greeting.has_capability("STARTTLS") {
            let reply = session.command("STARTTLS").await?;
            if !reply.is_positive() {
                return Err(SmtpError::from_reply(reply));
            }
            session.upgrade_tls(domain, &self.tls).await?;
            let reply = session.command(&format!("EHLO {domain}")).await?;
            if !reply.is_positive() {
                return Err(SmtpError::from_reply(reply));
            }
        }

        let reply = session.command(&format!("MAIL FROM:<{from}>")).await?;
        if !reply.is_positive() {
            return Err(SmtpError::from_reply(reply));
        }
        let reply = session.command(&format!("RCPT TO:<{to}>")).await?;
        if !reply.is_positive() {
            return Err(SmtpError::from_reply(reply));
        }
        Ok(())
    }
}

#[async_trait]
impl SmtpProber for NetworkProber {
    async fn probe(&self, host: &str, domain: &str, from: &str, to: &str) -> ProbeOutcome {
        let addr = format!("{}:{}", host.trim_end_matches('.'), self.port);
        let stream = match timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!(%addr, error = %err, "mx connect failed");
                return ProbeOutcome::Unreachable;
            }
            Err(_) => {
                debug!(%addr, "mx connect timed out");
                return ProbeOutcome::Unreachable;
            }
        };

        let mut session = SmtpSession::new(host, stream);
        match session.read_reply().await {
            Ok(banner) if banner.code == 220 => {}
            _ => {
                debug!(%addr, "smtp greeting failed");
                return ProbeOutcome::Unreachable;
            }
        }

        let outcome = match self.dialog(&mut session, domain, from, to).await {
            Ok(()) => ProbeOutcome::Delivered,
            Err(err) => ProbeOutcome::Rejected(err.to_string()),
        };
        session.quit().await;
        outcome
    }
}

mod danger {
    //! Certificate verifier that accepts anything, for best-effort probing
    //! of exchangers whose certificates do not match the recipient domain.

    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub(super) struct NoVerification;

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }
}
