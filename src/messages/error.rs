//! Parsing of ErrorResponse / NoticeResponse payloads.

use bytes::BytesMut;

use crate::errors::Error;
use crate::messages::types::BytesMutReader;

/// The fields of an `ErrorResponse` ('E') or `NoticeResponse` ('N') payload
/// we care about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PgErrorMsg {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl PgErrorMsg {
    pub fn parse(payload: &BytesMut) -> Result<PgErrorMsg, Error> {
        let mut buf = payload.clone();
        let mut msg = PgErrorMsg::default();

        loop {
            let field = buf.read_u8()?;
            if field == 0 {
                break;
            }
            let (value, _) = buf.read_string()?;
            match field {
                b'S' => msg.severity = value,
                b'C' => msg.code = value,
                b'M' => msg.message = value,
                b'D' => msg.detail = Some(value),
                b'H' => msg.hint = Some(value),
                _ => {} // fields we don't surface
            }
        }

        if msg.message.is_empty() {
            return Err(Error::ProtocolViolation(
                "error response carries no message field".into(),
            ));
        }
        Ok(msg)
    }
}
