//! Fixed-width request and response records.
//!
//! Request: `message_id:u16 | opcode:u8 | key:u16 | operand:u16` (7 bytes).
//! Response: `message_id:u16 | status:u8 | value:u16` (5 bytes).
//! All integers are big-endian.

use crate::errors::{DispatchError, Result};

pub const REQUEST_LEN: usize = 7;
pub const RESPONSE_LEN: usize = 5;

pub type RequestBytes = [u8; REQUEST_LEN];
pub type ResponseBytes = [u8; RESPONSE_LEN];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    /// Termination sentinel for the worker owning the key.
    End = 0x02,
    /// Operand is an `i16` delta.
    Add = 0x03,
}

impl TryFrom<u8> for Opcode {
    type Error = DispatchError;

    fn try_from(byte: u8) -> Result<Opcode> {
        match byte {
            0x00 => Ok(Opcode::Get),
            0x01 => Ok(Opcode::Set),
            0x02 => Ok(Opcode::End),
            0x03 => Ok(Opcode::Add),
            other => Err(DispatchError::MalformedRecord(format!(
                "unknown opcode {:#04x}",
                other
            ))),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Request {
    pub message_id: u16,
    pub opcode: Opcode,
    pub key: u16,
    pub operand: u16,
}

impl Request {
    pub fn get(message_id: u16, key: u16) -> Request {
        Request { message_id, opcode: Opcode::Get, key, operand: 0 }
    }

    pub fn set(message_id: u16, key: u16, value: u16) -> Request {
        Request { message_id, opcode: Opcode::Set, key, operand: value }
    }

    pub fn add(message_id: u16, key: u16, delta: i16) -> Request {
        Request { message_id, opcode: Opcode::Add, key, operand: delta as u16 }
    }

    pub fn end(key: u16) -> Request {
        Request { message_id: 0, opcode: Opcode::End, key, operand: 0 }
    }

    pub fn is_sentinel(&self) -> bool {
        self.opcode == Opcode::End
    }

    pub fn encode(&self) -> RequestBytes {
        let mut buf = [0u8; REQUEST_LEN];
        buf[0..2].copy_from_slice(&self.message_id.to_be_bytes());
        buf[2] = self.opcode as u8;
        buf[3..5].copy_from_slice(&self.key.to_be_bytes());
        buf[5..7].copy_from_slice(&self.operand.to_be_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Request> {
        if bytes.len() != REQUEST_LEN {
            return Err(DispatchError::MalformedRecord(format!(
                "request must be {} bytes, got {}",
                REQUEST_LEN,
                bytes.len()
            )));
        }
        Ok(Request {
            message_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            opcode: Opcode::try_from(bytes[2])?,
            key: u16::from_be_bytes([bytes[3], bytes[4]]),
            operand: u16::from_be_bytes([bytes[5], bytes[6]]),
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ack = 0x06,
    Cancel = 0x18,
}

/// Error codes carried in the value field of a `Cancel` response.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum FailureCode {
    OutOfRange = 1,
    WorkerPanic = 2,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Response {
    pub message_id: u16,
    pub status: Status,
    pub value: u16,
}

impl Response {
    pub fn ack(message_id: u16, value: u16) -> Response {
        Response { message_id, status: Status::Ack, value }
    }

    pub fn cancel(message_id: u16, code: FailureCode) -> Response {
        Response { message_id, status: Status::Cancel, value: code as u16 }
    }

    pub fn is_ack(&self) -> bool {
        self.status == Status::Ack
    }

    pub fn failure(&self) -> Option<FailureCode> {
        match (self.status, self.value) {
            (Status::Ack, _) => None,
            (Status::Cancel, 1) => Some(FailureCode::OutOfRange),
            (Status::Cancel, _) => Some(FailureCode::WorkerPanic),
        }
    }

    pub fn encode(&self) -> ResponseBytes {
        let mut buf = [0u8; RESPONSE_LEN];
        buf[0..2].copy_from_slice(&self.message_id.to_be_bytes());
        buf[2] = self.status as u8;
        buf[3..5].copy_from_slice(&self.value.to_be_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Response> {
        if bytes.len() != RESPONSE_LEN {
            return Err(DispatchError::MalformedRecord(format!(
                "response must be {} bytes, got {}",
                RESPONSE_LEN,
                bytes.len()
            )));
        }
        let status = match bytes[2] {
            0x06 => Status::Ack,
            0x18 => Status::Cancel,
            other => {
                return Err(DispatchError::MalformedRecord(format!(
                    "unknown status {:#04x}",
                    other
                )))
            }
        };
        Ok(Response {
            message_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            status,
            value: u16::from_be_bytes([bytes[3], bytes[4]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout_is_big_endian() {
        let bytes = Request::set(0x0102, 0x0304, 0x0506).encode();
        assert_eq!(bytes, [0x01, 0x02, 0x01, 0x03, 0x04, 0x05, 0x06]);
    }

    #[test]
    fn add_carries_negative_delta() {
        let req = Request::decode(&Request::add(7, 1, -5).encode()).unwrap();
        assert_eq!(req.opcode, Opcode::Add);
        assert_eq!(req.operand as i16, -5);
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert!(matches!(
            Request::decode(&[0u8; 6]),
            Err(DispatchError::MalformedRecord(_))
        ));
        assert!(matches!(
            Response::decode(&[0u8; 7]),
            Err(DispatchError::MalformedRecord(_))
        ));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut bytes = Request::get(1, 1).encode();
        bytes[2] = 0x7f;
        assert!(matches!(
            Request::decode(&bytes),
            Err(DispatchError::MalformedRecord(_))
        ));
    }

    #[test]
    fn cancel_response_exposes_failure_code() {
        let resp = Response::decode(&Response::cancel(9, FailureCode::OutOfRange).encode()).unwrap();
        assert!(!resp.is_ack());
        assert_eq!(resp.failure(), Some(FailureCode::OutOfRange));
        assert_eq!(Response::ack(9, 3).failure(), None);
    }
}
