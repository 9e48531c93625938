//! Framed read/write over one connection.
//!
//! Every message is `kind (1 byte) + length (4 bytes, big-endian, includes
//! itself) + payload`. The stream keeps an internal pushback stack so higher
//! layers may return a whole frame for re-parsing; pushed frames come back
//! in LIFO order. Writes are buffered until `flush`.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::errors::Error;
use crate::messages::constants::MAX_MESSAGE_SIZE;

/// A buffered, framed protocol stream.
pub struct WireStream<S> {
    stream: BufReader<S>,
    outbuf: BytesMut,
    pushback: Vec<(u8, BytesMut)>,
}

impl<S> WireStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            outbuf: BytesMut::with_capacity(8192),
            pushback: Vec::new(),
        }
    }

    /// Read one typed message. Pushed-back frames are returned first.
    pub async fn read_message(&mut self) -> Result<(u8, BytesMut), Error> {
        if let Some(frame) = self.pushback.pop() {
            return Ok(frame);
        }

        let kind = match self.stream.read_u8().await {
            Ok(kind) => kind,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::ConnectionLost("peer closed the connection".into()))
            }
            Err(err) => return Err(Error::SocketError(format!("read message kind: {err}"))),
        };

        let payload = self.read_body().await?;
        Ok((kind, payload))
    }

    /// Read the length + payload part of a frame whose kind byte was already
    /// consumed (or which has none, like startup packets).
    async fn read_body(&mut self) -> Result<BytesMut, Error> {
        let len = self
            .stream
            .read_i32()
            .await
            .map_err(|err| Error::ProtocolViolation(format!("short read in message length: {err}")))?;

        if !(4..=MAX_MESSAGE_SIZE).contains(&len) {
            return Err(Error::ProtocolViolation(format!(
                "invalid message length {len}"
            )));
        }

        let mut payload = BytesMut::with_capacity((len - 4) as usize);
        payload.resize((len - 4) as usize, 0);
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|err| Error::ProtocolViolation(format!("short read in message body: {err}")))?;

        Ok(payload)
    }

    /// Return the next kind byte without consuming it. Pushed-back frames win.
    pub async fn peek_kind(&mut self) -> Result<u8, Error> {
        if let Some((kind, _)) = self.pushback.last() {
            return Ok(*kind);
        }
        let buf = self
            .stream
            .fill_buf()
            .await
            .map_err(|err| Error::SocketError(format!("peek message kind: {err}")))?;
        match buf.first() {
            Some(kind) => Ok(*kind),
            None => Err(Error::ConnectionLost("peer closed the connection".into())),
        }
    }

    /// Push a whole frame back; the next `read_message` returns it verbatim.
    pub fn unread_message(&mut self, kind: u8, payload: BytesMut) {
        self.pushback.push((kind, payload));
    }

    pub fn has_pushback(&self) -> bool {
        !self.pushback.is_empty()
    }

    /// Read an untyped startup-phase packet: `length + version + body`.
    pub async fn read_startup(&mut self) -> Result<(i32, BytesMut), Error> {
        let mut body = self.read_body().await?;
        if body.remaining() < 4 {
            return Err(Error::ProtocolViolation(
                "startup packet too short for protocol version".into(),
            ));
        }
        let version = body.get_i32();
        Ok((version, body))
    }

    /// Queue one typed message. A zero kind writes the bare `length + payload`
    /// form used by startup-phase packets.
    pub fn write_message(&mut self, kind: u8, payload: &[u8]) {
        if kind != 0 {
            self.outbuf.put_u8(kind);
        }
        self.outbuf.put_i32(payload.len() as i32 + 4);
        self.outbuf.put_slice(payload);
    }

    /// Queue bytes that are already framed.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.outbuf.put_slice(bytes);
    }

    /// Force everything queued onto the wire.
    pub async fn flush(&mut self) -> Result<(), Error> {
        if !self.outbuf.is_empty() {
            let buf = self.outbuf.split();
            self.stream
                .write_all(&buf)
                .await
                .map_err(|err| Error::SocketError(format!("write to socket: {err}")))?;
        }
        self.stream
            .flush()
            .await
            .map_err(|err| Error::SocketError(format!("flush socket: {err}")))
    }

    pub async fn write_and_flush(&mut self, kind: u8, payload: &[u8]) -> Result<(), Error> {
        self.write_message(kind, payload);
        self.flush().await
    }

    pub fn get_mut(&mut self) -> &mut BufReader<S> {
        &mut self.stream
    }
}

/// Write a pre-framed buffer without flushing.
pub async fn write_all<S>(stream: &mut S, buf: BytesMut) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&buf)
        .await
        .map_err(|err| Error::SocketError(format!("write to socket: {err}")))
}

/// Write a pre-framed buffer and flush.
pub async fn write_all_flush<S>(stream: &mut S, buf: &[u8]) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(buf)
        .await
        .map_err(|err| Error::SocketError(format!("write to socket: {err}")))?;
    stream
        .flush()
        .await
        .map_err(|err| Error::SocketError(format!("flush socket: {err}")))
}

/// Read one typed message from a bare reader (no pushback, no buffering).
pub async fn read_message<S>(stream: &mut S) -> Result<(u8, BytesMut), Error>
where
    S: AsyncRead + Unpin,
{
    let kind = match stream.read_u8().await {
        Ok(kind) => kind,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::ConnectionLost("peer closed the connection".into()))
        }
        Err(err) => return Err(Error::SocketError(format!("read message kind: {err}"))),
    };
    let len = stream
        .read_i32()
        .await
        .map_err(|err| Error::ProtocolViolation(format!("short read in message length: {err}")))?;
    if !(4..=MAX_MESSAGE_SIZE).contains(&len) {
        return Err(Error::ProtocolViolation(format!(
            "invalid message length {len}"
        )));
    }
    let mut payload = BytesMut::with_capacity((len - 4) as usize);
    payload.resize((len - 4) as usize, 0);
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|err| Error::ProtocolViolation(format!("short read in message body: {err}")))?;
    Ok((kind, payload))
}
