//! External cache backend speaking the memcached text protocol.

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::cache::CacheKey;
use crate::errors::Error;

/// One connection to a memcached server. The cache facade serializes
/// access, so a single connection per process is enough.
pub struct MemcachedClient {
    stream: BufReader<TcpStream>,
}

impl MemcachedClient {
    pub async fn connect(host: &str, port: u16) -> Result<Self, Error> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|err| Error::SocketError(format!("memcached connect: {err}")))?;
        Ok(Self {
            stream: BufReader::new(stream),
        })
    }

    async fn read_line(&mut self) -> Result<String, Error> {
        let mut line = String::new();
        let n = self
            .stream
            .read_line(&mut line)
            .await
            .map_err(|err| Error::SocketError(format!("memcached read: {err}")))?;
        if n == 0 {
            return Err(Error::ConnectionLost("memcached closed".into()));
        }
        Ok(line.trim_end().to_string())
    }

    pub async fn set(&mut self, key: &CacheKey, exptime: u32, data: &[u8]) -> Result<(), Error> {
        let header = format!("set {} 0 {} {}\r\n", key.to_hex(), exptime, data.len());
        self.stream
            .get_mut()
            .write_all(header.as_bytes())
            .await
            .map_err(|err| Error::SocketError(format!("memcached write: {err}")))?;
        self.stream
            .get_mut()
            .write_all(data)
            .await
            .map_err(|err| Error::SocketError(format!("memcached write: {err}")))?;
        self.stream
            .get_mut()
            .write_all(b"\r\n")
            .await
            .map_err(|err| Error::SocketError(format!("memcached write: {err}")))?;

        let reply = self.read_line().await?;
        if reply != "STORED" {
            return Err(Error::CacheCorrupt(format!(
                "memcached refused set: {reply}"
            )));
        }
        Ok(())
    }

    pub async fn get(&mut self, key: &CacheKey) -> Result<Option<Vec<u8>>, Error> {
        let command = format!("get {}\r\n", key.to_hex());
        self.stream
            .get_mut()
            .write_all(command.as_bytes())
            .await
            .map_err(|err| Error::SocketError(format!("memcached write: {err}")))?;

        let header = self.read_line().await?;
        if header == "END" {
            return Ok(None);
        }
        // VALUE <key> <flags> <bytes>
        let len: usize = header
            .split_whitespace()
            .nth(3)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::CacheCorrupt(format!("memcached bad reply: {header}")))?;

        let mut data = vec![0u8; len + 2]; // payload + CRLF
        self.stream
            .read_exact(&mut data)
            .await
            .map_err(|err| Error::SocketError(format!("memcached read: {err}")))?;
        data.truncate(len);

        let tail = self.read_line().await?;
        if tail != "END" {
            return Err(Error::CacheCorrupt(format!(
                "memcached bad trailer: {tail}"
            )));
        }
        Ok(Some(data))
    }

    pub async fn delete(&mut self, key: &CacheKey) -> Result<(), Error> {
        let command = format!("delete {}\r\n", key.to_hex());
        self.stream
            .get_mut()
            .write_all(command.as_bytes())
            .await
            .map_err(|err| Error::SocketError(format!("memcached write: {err}")))?;
        // DELETED or NOT_FOUND are both fine.
        let _ = self.read_line().await?;
        Ok(())
    }

    pub async fn flush_all(&mut self) -> Result<(), Error> {
        self.stream
            .get_mut()
            .write_all(b"flush_all\r\n")
            .await
            .map_err(|err| Error::SocketError(format!("memcached write: {err}")))?;
        let _ = self.read_line().await?;
        Ok(())
    }
}
