//! Minimal SMTP mailer for operational reports.
//!
//! Speaks the protocol directly over a tokio TCP stream: EHLO, AUTH PLAIN,
//! MAIL FROM, RCPT TO, DATA. The whole dialogue runs under one 30 second
//! timeout. Bodies are dot-stuffed per RFC 5321 before transmission.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, WriteHalf};
use tokio::net::TcpStream;

use crate::error::{BillingError, BillingResult};

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

impl SmtpConfig {
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("SMTP_HOST").ok().filter(|v| !v.is_empty())?;
        let from = std::env::var("SMTP_FROM").ok().filter(|v| !v.is_empty())?;
        Some(Self {
            host,
            port: std::env::var("SMTP_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(587),
            username: std::env::var("SMTP_USERNAME").unwrap_or_default(),
            password: std::env::var("SMTP_PASSWORD").unwrap_or_default(),
            from,
        })
    }
}

/// Escape lines starting with '.' by doubling the dot, per RFC 5321 §4.5.2.
pub fn dot_stuff(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    for (i, line) in body.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
    }
    out
}

/// AUTH PLAIN initial response: base64("\0user\0password").
pub fn auth_plain(username: &str, password: &str) -> String {
    let mut raw = Vec::with_capacity(username.len() + password.len() + 2);
    raw.push(0);
    raw.extend_from_slice(username.as_bytes());
    raw.push(0);
    raw.extend_from_slice(password.as_bytes());
    BASE64.encode(raw)
}

/// Assemble the RFC 5322 message: headers, blank line, dot-stuffed body,
/// CRLF line endings throughout.
pub fn build_message(from: &str, to: &str, subject: &str, body: &str) -> String {
    let stuffed = dot_stuff(body);
    format!(
        "From: {}\r\nTo: {}\r\nSubject: {}\r\nMIME-Version: 1.0\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n",
        from,
        to,
        subject,
        stuffed.replace('\n', "\r\n")
    )
}

#[derive(Clone)]
pub struct ReportMailer {
    config: SmtpConfig,
}

impl ReportMailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    /// Send one plain-text message. The full protocol exchange is bounded
    /// by a single timeout so a stalled server can never wedge a worker.
    pub async fn send(&self, to: &str, subject: &str, body: &str) -> BillingResult<()> {
        tokio::time::timeout(SMTP_TIMEOUT, self.dialogue(to, subject, body))
            .await
            .map_err(|_| BillingError::Smtp("smtp dialogue timed out".into()))??;
        tracing::info!(to = to, subject = subject, "Report email sent");
        Ok(())
    }

    async fn dialogue(&self, to: &str, subject: &str, body: &str) -> BillingResult<()> {
        let stream = TcpStream::connect((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| BillingError::Smtp(format!("connect failed: {}", e)))?;
        let (read_half, mut write) = tokio::io::split(stream);
        let mut read = BufReader::new(read_half);

        expect_code(&mut read, 220).await?;

        command(&mut write, &mut read, &format!("EHLO {}", self.config.host), 250).await?;

        if !self.config.username.is_empty() {
            command(
                &mut write,
                &mut read,
                &format!(
                    "AUTH PLAIN {}",
                    auth_plain(&self.config.username, &self.config.password)
                ),
                235,
            )
            .await?;
        }

        command(
            &mut write,
            &mut read,
            &format!("MAIL FROM:<{}>", self.config.from),
            250,
        )
        .await?;
        command(&mut write, &mut read, &format!("RCPT TO:<{}>", to), 250).await?;
        command(&mut write, &mut read, "DATA", 354).await?;

        let message = build_message(&self.config.from, to, subject, body);
        write
            .write_all(message.as_bytes())
            .await
            .map_err(|e| BillingError::Smtp(e.to_string()))?;
        command(&mut write, &mut read, ".", 250).await?;
        command(&mut write, &mut read, "QUIT", 221).await?;

        Ok(())
    }
}

async fn command<R>(
    write: &mut WriteHalf<TcpStream>,
    read: &mut BufReader<R>,
    line: &str,
    expected: u16,
) -> BillingResult<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    write
        .write_all(format!("{}\r\n", line).as_bytes())
        .await
        .map_err(|e| BillingError::Smtp(e.to_string()))?;
    expect_code(read, expected).await
}

/// Read one (possibly multiline) SMTP reply and check its code. Multiline
/// replies use `NNN-` continuation lines and end with `NNN `.
async fn expect_code<R>(read: &mut BufReader<R>, expected: u16) -> BillingResult<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        let mut line = String::new();
        let n = read
            .read_line(&mut line)
            .await
            .map_err(|e| BillingError::Smtp(e.to_string()))?;
        if n == 0 {
            return Err(BillingError::Smtp("connection closed by server".into()));
        }

        let code: u16 = line
            .get(..3)
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| BillingError::Smtp(format!("unparseable reply: {}", line.trim())))?;

        if line.as_bytes().get(3) == Some(&b'-') {
            continue;
        }
        if code != expected {
            return Err(BillingError::Smtp(format!(
                "expected {}, server said: {}",
                expected,
                line.trim()
            )));
        }
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_stuffing_doubles_leading_dots() {
        assert_eq!(dot_stuff("hello\n.world\n..x"), "hello\n..world\n...x");
        assert_eq!(dot_stuff(".start"), "..start");
        assert_eq!(dot_stuff("no dots here"), "no dots here");
        assert_eq!(dot_stuff("mid.dle stays"), "mid.dle stays");
    }

    #[test]
    fn auth_plain_encoding() {
        // \0user\0pass
        assert_eq!(auth_plain("user", "pass"), BASE64.encode(b"\0user\0pass"));
    }

    #[test]
    fn message_has_crlf_and_header_separator() {
        let msg = build_message("a@x.co", "b@y.co", "Weekly report", "line1\n.dotted");
        assert!(msg.starts_with("From: a@x.co\r\n"));
        assert!(msg.contains("\r\n\r\nline1\r\n..dotted"));
        assert!(!msg.replace("\r\n", "").contains('\r'));
    }
}
