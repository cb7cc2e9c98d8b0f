//! Call origination through the Asterisk Manager Interface.
//!
//! AMI is a line based protocol: every message is a block of `Key: Value` lines terminated by an
//! empty line. After the one-line banner we log in, send a single `Originate` action and log off.
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

use cdr_common::call::OriginateStatus;

// Slack on top of the ring timeout, since Originate only answers once the call is up or gave up.
const RESPONSE_GRACE: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum OriginateError {
    #[error("cannot connect to Asterisk Manager: {0}")]
    ConnectionError(std::io::Error),
    #[error("Asterisk Manager closed the connection")]
    ConnectionClosed,
    #[error("Asterisk Manager rejected the login: {0}")]
    LoginRejected(String),
    #[error("Asterisk Manager did not respond within {0:?}")]
    Timeout(Duration),
}

impl From<std::io::Error> for OriginateError {
    fn from(error: std::io::Error) -> Self {
        OriginateError::ConnectionError(error)
    }
}

#[async_trait]
pub trait Originator: Send + Sync {
    /// Ring `from` and, once answered, connect it to `to`, presenting `caller_id` to `from`.
    async fn originate(
        &self,
        from: &str,
        to: &str,
        caller_id: &str,
    ) -> Result<OriginateStatus, OriginateError>;
}

pub struct AmiOriginator {
    address: String,
    username: String,
    secret: String,
    context: String,
    call_timeout: Duration,
}

impl AmiOriginator {
    pub fn new(
        address: &str,
        username: &str,
        secret: &str,
        context: &str,
        call_timeout: Duration,
    ) -> Self {
        Self {
            address: address.to_owned(),
            username: username.to_owned(),
            secret: secret.to_owned(),
            context: context.to_owned(),
            call_timeout,
        }
    }

    async fn run(
        &self,
        from: &str,
        to: &str,
        caller_id: &str,
    ) -> Result<OriginateStatus, OriginateError> {
        let stream = TcpStream::connect(&self.address).await?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let mut banner = String::new();
        if reader.read_line(&mut banner).await? == 0 {
            return Err(OriginateError::ConnectionClosed);
        }
        debug!(banner = banner.trim(), "connected to Asterisk Manager");

        send_action(
            &mut writer,
            &[
                ("Action", "Login"),
                ("ActionID", "1"),
                ("Username", self.username.as_str()),
                ("Secret", self.secret.as_str()),
            ],
        )
        .await?;
        let login = read_response(&mut reader, "1").await?;
        if login.get("Response") != Some("Success") {
            return Err(OriginateError::LoginRejected(
                login.get("Message").unwrap_or_default().to_owned(),
            ));
        }

        let channel = format!("Local/{}@{}", from, self.context);
        let timeout_ms = self.call_timeout.as_millis().to_string();
        send_action(
            &mut writer,
            &[
                ("Action", "Originate"),
                ("ActionID", "2"),
                ("Channel", channel.as_str()),
                ("Exten", to),
                ("Context", self.context.as_str()),
                ("Priority", "1"),
                ("Timeout", timeout_ms.as_str()),
                ("CallerID", caller_id),
            ],
        )
        .await?;
        let response = read_response(&mut reader, "2").await?;

        if let Err(error) = send_action(&mut writer, &[("Action", "Logoff")]).await {
            debug!("failed to log off from Asterisk Manager: {}", error);
        }

        Ok(OriginateStatus {
            status: response.get("Response").unwrap_or_default().to_owned(),
            message: response.get("Message").unwrap_or_default().to_owned(),
        })
    }
}

#[async_trait]
impl Originator for AmiOriginator {
    async fn originate(
        &self,
        from: &str,
        to: &str,
        caller_id: &str,
    ) -> Result<OriginateStatus, OriginateError> {
        let deadline = self.call_timeout + RESPONSE_GRACE;
        let status = tokio::time::timeout(deadline, self.run(from, to, caller_id))
            .await
            .map_err(|_| OriginateError::Timeout(deadline))??;

        info!(from, to, status = %status.status, "originate finished");
        metrics::counter!("originate_requests_total", "status" => status.status.clone())
            .increment(1);

        Ok(status)
    }
}

/// One AMI message: ordered `Key: Value` headers.
#[derive(Debug, Default, PartialEq)]
struct AmiMessage {
    headers: Vec<(String, String)>,
}

impl AmiMessage {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

fn encode_action(fields: &[(&str, &str)]) -> String {
    let mut out = String::new();
    for (key, value) in fields {
        // A line break inside a value would end the header early.
        let value: String = value.chars().filter(|c| *c != '\r' && *c != '\n').collect();
        out.push_str(key);
        out.push_str(": ");
        out.push_str(&value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

async fn send_action<W>(writer: &mut W, fields: &[(&str, &str)]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(encode_action(fields).as_bytes()).await?;
    writer.flush().await
}

/// Read the next message block, `None` once the connection is closed.
async fn read_message<R>(reader: &mut R) -> std::io::Result<Option<AmiMessage>>
where
    R: AsyncBufRead + Unpin,
{
    let mut message = AmiMessage::default();
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok((!message.headers.is_empty()).then_some(message));
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            if message.headers.is_empty() {
                continue;
            }
            return Ok(Some(message));
        }

        if let Some((key, value)) = trimmed.split_once(':') {
            message
                .headers
                .push((key.trim().to_owned(), value.trim().to_owned()));
        }
    }
}

/// Read until the response to `action_id`, skipping the unsolicited events in between.
async fn read_response<R>(reader: &mut R, action_id: &str) -> Result<AmiMessage, OriginateError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let message = read_message(reader)
            .await?
            .ok_or(OriginateError::ConnectionClosed)?;

        if message.get("Response").is_none() {
            continue;
        }
        match message.get("ActionID") {
            Some(id) if id != action_id => continue,
            _ => return Ok(message),
        }
    }
}
