//! Modbus TCP framing.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

/// Largest register count a single read request may ask for.
pub const MAX_READ_COUNT: u16 = 125;
/// Largest register count a single write request may carry.
pub const MAX_WRITE_COUNT: u16 = 123;

/// Unit id addressing "no particular unit" on single-device buses.
pub const UNIT_ID_OMITTED: u8 = 0xFF;

/// MBAP header length up to and including the unit id.
const HEADER_LENGTH: usize = 7;

#[derive(Debug, Clone)]
pub struct Request {
    pub unit_id: u8,
    pub transaction_id: u16,
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    GetHoldings { address: u16, count: u16 },
    GetInputs { address: u16, count: u16 },
    SetHolding { address: u16, value: u16 },
    SetHoldings { address: u16, values: Vec<u16> },
}

impl Operation {
    pub fn function_code(&self) -> u8 {
        match self {
            Operation::GetHoldings { .. } => 3,
            Operation::GetInputs { .. } => 4,
            Operation::SetHolding { .. } => 6,
            Operation::SetHoldings { .. } => 16,
        }
    }

    pub fn address(&self) -> u16 {
        match *self {
            Operation::GetHoldings { address, .. }
            | Operation::GetInputs { address, .. }
            | Operation::SetHolding { address, .. }
            | Operation::SetHoldings { address, .. } => address,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub unit_id: u8,
    pub transaction_id: u16,
    pub kind: ResponseKind,
}

impl Response {
    pub fn exception(&self) -> Option<Exception> {
        match self.kind {
            ResponseKind::Exception(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_server_busy(&self) -> bool {
        self.exception().map(|e| e.kind()) == Some(Some(ExceptionCode::ServerDeviceBusy))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    Exception(Exception),
    GetHoldings { values: Vec<u16> },
    GetInputs { values: Vec<u16> },
    SetHolding { address: u16, value: u16 },
    SetHoldings { address: u16, count: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDevice = 0x0B,
}

/// A Modbus exception code as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exception(pub u8);

impl Exception {
    pub fn kind(self) -> Option<ExceptionCode> {
        ExceptionCode::from_u8(self.0)
    }

    /// The device does not implement the requested function at all.
    pub fn is_illegal_function(self) -> bool {
        self.kind() == Some(ExceptionCode::IllegalFunction)
    }
}

impl std::fmt::Display for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind() {
            Some(kind) => write!(f, "exception {:#04x} ({kind:?})", self.0),
            None => write!(f, "exception {:#04x}", self.0),
        }
    }
}

pub struct ModbusTCPCodec {}

impl Encoder<Request> for ModbusTCPCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let invalid = |message: &'static str| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, message)
        };
        let pdu_length = match &req.operation {
            Operation::GetHoldings { count, .. } | Operation::GetInputs { count, .. } => {
                if !(1..=MAX_READ_COUNT).contains(count) {
                    return Err(invalid("register count of a read request is out of range"));
                }
                5
            }
            Operation::SetHolding { .. } => 5,
            Operation::SetHoldings { values, .. } => {
                if values.is_empty() || values.len() > usize::from(MAX_WRITE_COUNT) {
                    return Err(invalid("register count of a write request is out of range"));
                }
                6 + 2 * values.len()
            }
        };
        // Bounded by the counts checked above.
        let length = (pdu_length + 1) as u16;
        dst.reserve(HEADER_LENGTH - 1 + usize::from(length));
        dst.put_u16(req.transaction_id);
        dst.put_u16(0);
        dst.put_u16(length);
        dst.put_u8(req.unit_id);
        dst.put_u8(req.operation.function_code());
        match req.operation {
            Operation::GetHoldings { address, count } | Operation::GetInputs { address, count } => {
                dst.put_u16(address);
                dst.put_u16(count);
            }
            Operation::SetHolding { address, value } => {
                dst.put_u16(address);
                dst.put_u16(value);
            }
            Operation::SetHoldings { address, values } => {
                dst.put_u16(address);
                dst.put_u16(values.len() as u16);
                dst.put_u8((2 * values.len()) as u8);
                for value in values {
                    dst.put_u16(value);
                }
            }
        }
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

fn words(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2).map(|w| u16::from_be_bytes([w[0], w[1]])).collect()
}

impl Decoder for ModbusTCPCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message = "attempt at decoding", buffer = ?src);
            if src.len() < HEADER_LENGTH + 1 {
                return Ok(None);
            }
            let transaction_id = u16::from_be_bytes([src[0], src[1]]);
            let proto = u16::from_be_bytes([src[2], src[3]]);
            if proto != 0 {
                src.advance(1);
                continue;
            }
            let length = usize::from(u16::from_be_bytes([src[4], src[5]]));
            if length < 2 {
                src.advance(1);
                continue;
            }
            let frame_length = HEADER_LENGTH - 1 + length;
            if src.len() < frame_length {
                src.reserve(frame_length - src.len());
                return Ok(None);
            }
            let frame = src.split_to(frame_length);
            let unit_id = frame[6];
            let function_code = frame[7];
            let data = &frame[8..];
            let kind = if function_code & 0x80 != 0 {
                let Some(&code) = data.first() else {
                    debug!(message = "exception response without a code", transaction_id);
                    continue;
                };
                ResponseKind::Exception(Exception(code))
            } else {
                match (function_code, data) {
                    // The byte count is redundant with the MBAP length and not consulted.
                    (3, [_, values @ ..]) => ResponseKind::GetHoldings { values: words(values) },
                    (4, [_, values @ ..]) => ResponseKind::GetInputs { values: words(values) },
                    (6, [a0, a1, v0, v1]) => ResponseKind::SetHolding {
                        address: u16::from_be_bytes([*a0, *a1]),
                        value: u16::from_be_bytes([*v0, *v1]),
                    },
                    (16, [a0, a1, c0, c1]) => ResponseKind::SetHoldings {
                        address: u16::from_be_bytes([*a0, *a1]),
                        count: u16::from_be_bytes([*c0, *c1]),
                    },
                    _ => {
                        debug!(
                            message = "skipping a response we cannot decode",
                            transaction_id,
                            function_code,
                            length = data.len()
                        );
                        continue;
                    }
                }
            };
            return Ok(Some(Response { transaction_id, unit_id, kind }));
        }
    }
}
