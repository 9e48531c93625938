//! Small helpers over raw message payloads.

use bytes::{Buf, BytesMut};

use crate::errors::Error;

/// Reader extensions for protocol payloads held in `BytesMut`.
pub trait BytesMutReader {
    /// Consume and return a NUL-terminated string together with the number
    /// of bytes consumed (terminator included).
    fn read_string(&mut self) -> Result<(String, usize), Error>;
    fn read_i32(&mut self) -> Result<i32, Error>;
    fn read_i16(&mut self) -> Result<i16, Error>;
    fn read_u8(&mut self) -> Result<u8, Error>;
}

impl BytesMutReader for BytesMut {
    fn read_string(&mut self) -> Result<(String, usize), Error> {
        let nul = self
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::ProtocolViolation("string is not nul-terminated".into()))?;
        let raw = self.split_to(nul + 1);
        let s = String::from_utf8_lossy(&raw[..nul]).to_string();
        Ok((s, nul + 1))
    }

    fn read_i32(&mut self) -> Result<i32, Error> {
        if self.remaining() < 4 {
            return Err(Error::ProtocolViolation(
                "message too short for i32".into(),
            ));
        }
        Ok(self.get_i32())
    }

    fn read_i16(&mut self) -> Result<i16, Error> {
        if self.remaining() < 2 {
            return Err(Error::ProtocolViolation(
                "message too short for i16".into(),
            ));
        }
        Ok(self.get_i16())
    }

    fn read_u8(&mut self) -> Result<u8, Error> {
        if self.remaining() < 1 {
            return Err(Error::ProtocolViolation("message too short for u8".into()));
        }
        Ok(self.get_u8())
    }
}

/// Convert a password payload to a string, trimming the protocol's trailing NUL.
pub fn vec_to_string(mut bytes: Vec<u8>) -> Result<String, Error> {
    if bytes.last() == Some(&0) {
        bytes.pop();
    }
    String::from_utf8(bytes)
        .map_err(|_| Error::ProtocolViolation("password is not valid UTF-8".into()))
}

/// Column types used by the handful of synthetic result sets we produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Text,
    Int4,
    Oid,
}

impl From<&DataType> for i32 {
    fn from(t: &DataType) -> i32 {
        match t {
            DataType::Text => 25,
            DataType::Int4 => 23,
            DataType::Oid => 26,
        }
    }
}
