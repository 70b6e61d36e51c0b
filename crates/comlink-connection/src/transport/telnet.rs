//! Telnet: TCP with IAC negotiation stripped, read a line at a time.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::{ConnectionError, Result};

const KIND: &str = "telnet";

/// How long a partial line may sit before it is returned without a newline
/// (prompts such as `login: ` never get one).
const PARTIAL_LINE_WAIT: Duration = Duration::from_millis(200);

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum IacState {
    #[default]
    Data,
    Iac,
    Option(u8),
    Sub,
    SubIac,
}

/// Separates telnet commands from data and refuses every option.
#[derive(Debug, Default)]
pub struct IacDecoder {
    state: IacState,
}

impl IacDecoder {
    /// Returns `(data, replies)` for `input`. State carries over between
    /// calls, so a command split across reads is handled.
    pub fn feed(&mut self, input: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut data = Vec::with_capacity(input.len());
        let mut replies = Vec::new();
        for &b in input {
            self.state = match self.state {
                IacState::Data if b == IAC => IacState::Iac,
                IacState::Data => {
                    data.push(b);
                    IacState::Data
                }
                IacState::Iac => match b {
                    IAC => {
                        data.push(IAC);
                        IacState::Data
                    }
                    DO | DONT | WILL | WONT => IacState::Option(b),
                    SB => IacState::Sub,
                    _ => IacState::Data,
                },
                IacState::Option(verb) => {
                    match verb {
                        DO => replies.extend_from_slice(&[IAC, WONT, b]),
                        WILL => replies.extend_from_slice(&[IAC, DONT, b]),
                        _ => {}
                    }
                    IacState::Data
                }
                IacState::Sub if b == IAC => IacState::SubIac,
                IacState::Sub => IacState::Sub,
                IacState::SubIac if b == SE => IacState::Data,
                IacState::SubIac => IacState::Sub,
            };
        }
        (data, replies)
    }
}

#[derive(Debug)]
pub struct TelnetTransport {
    host: String,
    port: u16,
    reader: Option<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,
    decoder: IacDecoder,
    pending: Vec<u8>,
}

impl TelnetTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            reader: None,
            writer: None,
            decoder: IacDecoder::default(),
            pending: Vec::new(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub async fn open(&mut self) -> Result<()> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| ConnectionError::transport(KIND, format!("{}: {}", self.endpoint(), e)))?;
        let (reader, writer) = stream.into_split();
        debug!(endpoint = %self.endpoint(), "telnet connected");
        self.reader = Some(reader);
        self.writer = Some(writer);
        self.decoder = IacDecoder::default();
        self.pending.clear();
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            // Shutdown fails if the peer already left; nothing to do then.
            let _ = writer.shutdown().await;
        }
        self.reader = None;
        Ok(())
    }

    /// Writes `data` plus CRLF, doubling any literal IAC byte.
    pub async fn send(&mut self, data: &str) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ConnectionError::transport(KIND, "not open"))?;
        let mut out = Vec::with_capacity(data.len() + 2);
        for &b in data.as_bytes() {
            out.push(b);
            if b == IAC {
                out.push(IAC);
            }
        }
        out.extend_from_slice(b"\r\n");
        writer.write_all(&out).await?;
        Ok(())
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.pending.drain(..=pos).collect();
        Some(
            String::from_utf8_lossy(&line)
                .trim_end_matches(['\r', '\n'])
                .to_string(),
        )
    }

    fn take_partial(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string()
    }

    /// Next line. A trailing partial line is returned once the peer has
    /// been quiet for a moment.
    pub async fn receive(&mut self) -> Result<String> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }

            let reader = self
                .reader
                .as_mut()
                .ok_or_else(|| ConnectionError::transport(KIND, "not open"))?;
            let mut buf = [0u8; 4096];
            let n = if self.pending.is_empty() {
                reader.read(&mut buf).await?
            } else {
                match tokio::time::timeout(PARTIAL_LINE_WAIT, reader.read(&mut buf)).await {
                    Ok(read) => read?,
                    Err(_) => return Ok(self.take_partial()),
                }
            };

            if n == 0 {
                if self.pending.is_empty() {
                    return Err(ConnectionError::transport(KIND, "closed by peer"));
                }
                return Ok(self.take_partial());
            }

            let (data, replies) = self.decoder.feed(&buf[..n]);
            if !replies.is_empty() {
                trace!(bytes = replies.len(), "refusing telnet options");
                if let Some(writer) = self.writer.as_mut() {
                    writer.write_all(&replies).await?;
                }
            }
            self.pending.extend_from_slice(&data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_strips_and_refuses() {
        let mut d = IacDecoder::default();
        let (data, replies) = d.feed(&[IAC, DO, 1, b'h', b'i', IAC, WILL, 3, IAC, IAC]);
        assert_eq!(data, vec![b'h', b'i', IAC]);
        assert_eq!(replies, vec![IAC, WONT, 1, IAC, DONT, 3]);
    }

    #[test]
    fn test_decoder_skips_subnegotiation() {
        let mut d = IacDecoder::default();
        let (data, _) = d.feed(&[b'a', IAC, SB, 24, 1, IAC, SE, b'b']);
        assert_eq!(data, b"ab");
    }

    #[test]
    fn test_decoder_handles_split_commands() {
        let mut d = IacDecoder::default();
        let (first, _) = d.feed(&[b'x', IAC]);
        let (second, replies) = d.feed(&[DO, 31, b'y']);
        assert_eq!(first, b"x");
        assert_eq!(second, b"y");
        assert_eq!(replies, vec![IAC, WONT, 31]);
    }
}
