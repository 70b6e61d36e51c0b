//! Line-oriented character device.

use std::path::PathBuf;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::error::{ConnectionError, Result};

const KIND: &str = "serial";

#[derive(Debug)]
pub struct SerialTransport {
    device: PathBuf,
    reader: Option<BufReader<File>>,
    writer: Option<File>,
}

impl SerialTransport {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            reader: None,
            writer: None,
        }
    }

    pub fn endpoint(&self) -> String {
        self.device.display().to_string()
    }

    /// Opens separate read and write handles on the device.
    pub async fn open(&mut self) -> Result<()> {
        let reader = OpenOptions::new()
            .read(true)
            .open(&self.device)
            .await
            .map_err(|e| ConnectionError::transport(KIND, format!("{}: {}", self.endpoint(), e)))?;
        let writer = OpenOptions::new()
            .write(true)
            .open(&self.device)
            .await
            .map_err(|e| ConnectionError::transport(KIND, format!("{}: {}", self.endpoint(), e)))?;
        debug!(device = %self.endpoint(), "serial device opened");
        self.reader = Some(BufReader::new(reader));
        self.writer = Some(writer);
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
        }
        self.reader = None;
        Ok(())
    }

    /// Writes `data` followed by CRLF.
    pub async fn send(&mut self, data: &str) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ConnectionError::transport(KIND, "device not open"))?;
        writer.write_all(data.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Next line, without its terminator. End of file is a transport failure.
    pub async fn receive(&mut self) -> Result<String> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| ConnectionError::transport(KIND, "device not open"))?;
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(ConnectionError::transport(KIND, "device closed"));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_reads_lines_until_eof() {
        let dir = tempdir().unwrap();
        let device = dir.path().join("ttyFAKE");
        std::fs::write(&device, "boot ok\r\nready\n").unwrap();

        let mut serial = SerialTransport::new(&device);
        serial.open().await.unwrap();

        assert_eq!(serial.receive().await.unwrap(), "boot ok");
        assert_eq!(serial.receive().await.unwrap(), "ready");
        assert!(matches!(
            serial.receive().await,
            Err(ConnectionError::Transport { kind: "serial", .. })
        ));
        serial.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_missing_device_fails() {
        let dir = tempdir().unwrap();
        let mut serial = SerialTransport::new(dir.path().join("nope"));
        assert!(serial.open().await.is_err());
    }
}
