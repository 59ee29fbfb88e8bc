//! A stable register read/write surface over Modbus client backends.
//!
//! Backends differ in how a request is addressed to a unit on the bus. Rather than pin a
//! backend to one style, [`Transport`] probes the styles in [`CallConvention::PROBE_ORDER`]
//! with the first request it makes and uses the first accepted one for the rest of the
//! backend's lifetime.

pub mod sync;

use std::future::Future;

use tracing::{debug, trace};

use crate::connection;
use crate::modbus::{self, Exception, Operation, Response, ResponseKind};

/// How a backend addresses the target unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum CallConvention {
    /// The slave id travels with every request.
    Slave,
    /// The backend is bound to one unit id when constructed and only accepts that one.
    Unit,
    /// No unit addressing at all (single-device buses).
    Omitted,
}

impl CallConvention {
    pub const PROBE_ORDER: [CallConvention; 3] =
        [CallConvention::Slave, CallConvention::Unit, CallConvention::Omitted];
}

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("the client does not support the `{0}` calling convention")]
    Unsupported(CallConvention),
    #[error(transparent)]
    Connection(#[from] connection::Error),
}

/// A Modbus client backend.
pub trait RawClient: Send {
    fn call(
        &mut self,
        convention: CallConvention,
        slave_id: u8,
        operation: Operation,
    ) -> impl Future<Output = Result<Response, ClientError>> + Send;

    fn close(self) -> impl Future<Output = Result<(), ClientError>> + Send
    where
        Self: Sized;
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("the Modbus client does not accept any known calling convention")]
    UnsupportedClientApi,
    #[error("the client stopped accepting the `{0}` calling convention it was detected with")]
    ConventionRejected(CallConvention),
    #[error("the device responded with {0}")]
    Exception(Exception),
    #[error("function {function_code} can carry 1 to {max} registers, not {count}")]
    InvalidCount { function_code: u8, count: usize, max: u16 },
    #[error("unexpected response to function {function_code} at {address}: {kind:?}")]
    UnexpectedResponse { function_code: u8, address: u16, kind: ResponseKind },
    #[error(transparent)]
    Connection(connection::Error),
}

impl Error {
    /// The session is unusable and must be re-established.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Error::Connection(e) if e.is_session_lost())
    }

    /// No request on this client can succeed.
    pub fn is_unsupported_client(&self) -> bool {
        matches!(self, Error::UnsupportedClientApi | Error::ConventionRejected(_))
    }

    pub fn exception(&self) -> Option<Exception> {
        match self {
            Error::Exception(e) => Some(*e),
            _ => None,
        }
    }
}

pub struct Transport<C> {
    client: C,
    convention: Option<CallConvention>,
}

impl<C: RawClient> Transport<C> {
    pub fn new(client: C) -> Self {
        Self { client, convention: None }
    }

    /// Skip probing and use the given convention.
    pub fn with_convention(client: C, convention: CallConvention) -> Self {
        Self { client, convention: Some(convention) }
    }

    /// The convention in use, if it has been determined already.
    pub fn convention(&self) -> Option<CallConvention> {
        self.convention
    }

    pub async fn close(self) -> Result<(), ClientError> {
        self.client.close().await
    }

    async fn call(&mut self, slave_id: u8, operation: Operation) -> Result<ResponseKind, Error> {
        let response = match self.convention {
            Some(convention) => match self.client.call(convention, slave_id, operation).await {
                Ok(response) => response,
                Err(ClientError::Unsupported(c)) => return Err(Error::ConventionRejected(c)),
                Err(ClientError::Connection(e)) => return Err(Error::Connection(e)),
            },
            None => self.probe(slave_id, operation).await?,
        };
        match response.kind {
            ResponseKind::Exception(e) => Err(Error::Exception(e)),
            kind => Ok(kind),
        }
    }

    async fn probe(&mut self, slave_id: u8, operation: Operation) -> Result<Response, Error> {
        for convention in CallConvention::PROBE_ORDER {
            match self.client.call(convention, slave_id, operation.clone()).await {
                Ok(response) => {
                    debug!(message = "detected the client calling convention", %convention);
                    self.convention = Some(convention);
                    return Ok(response);
                }
                Err(ClientError::Unsupported(_)) => {
                    trace!(message = "client rejected calling convention", %convention);
                }
                Err(ClientError::Connection(e)) => return Err(Error::Connection(e)),
            }
        }
        Err(Error::UnsupportedClientApi)
    }

    fn check_count(function_code: u8, count: usize, max: u16) -> Result<u16, Error> {
        match u16::try_from(count) {
            Ok(c) if (1..=max).contains(&c) => Ok(c),
            _ => Err(Error::InvalidCount { function_code, count, max }),
        }
    }

    /// Read holding registers (function code 3).
    pub async fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
        slave_id: u8,
    ) -> Result<Vec<u16>, Error> {
        Self::check_count(3, usize::from(count), modbus::MAX_READ_COUNT)?;
        let operation = Operation::GetHoldings { address, count };
        match self.call(slave_id, operation).await? {
            ResponseKind::GetHoldings { values } if values.len() == usize::from(count) => {
                Ok(values)
            }
            kind => Err(Error::UnexpectedResponse { function_code: 3, address, kind }),
        }
    }

    /// Read input registers (function code 4).
    pub async fn read_input_registers(
        &mut self,
        address: u16,
        count: u16,
        slave_id: u8,
    ) -> Result<Vec<u16>, Error> {
        Self::check_count(4, usize::from(count), modbus::MAX_READ_COUNT)?;
        let operation = Operation::GetInputs { address, count };
        match self.call(slave_id, operation).await? {
            ResponseKind::GetInputs { values } if values.len() == usize::from(count) => Ok(values),
            kind => Err(Error::UnexpectedResponse { function_code: 4, address, kind }),
        }
    }

    /// Write a single holding register (function code 6).
    pub async fn write_register(
        &mut self,
        address: u16,
        value: u16,
        slave_id: u8,
    ) -> Result<(), Error> {
        let operation = Operation::SetHolding { address, value };
        match self.call(slave_id, operation).await? {
            ResponseKind::SetHolding { address: a, value: v } if a == address && v == value => {
                Ok(())
            }
            kind => Err(Error::UnexpectedResponse { function_code: 6, address, kind }),
        }
    }

    /// Write consecutive holding registers (function code 16).
    pub async fn write_registers(
        &mut self,
        address: u16,
        values: &[u16],
        slave_id: u8,
    ) -> Result<(), Error> {
        let count = Self::check_count(16, values.len(), modbus::MAX_WRITE_COUNT)?;
        let operation = Operation::SetHoldings { address, values: values.to_vec() };
        match self.call(slave_id, operation).await? {
            ResponseKind::SetHoldings { address: a, count: c } if a == address && c == count => {
                Ok(())
            }
            kind => Err(Error::UnexpectedResponse { function_code: 16, address, kind }),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{Client, Failure};
    use super::*;
    use crate::modbus::ExceptionCode;

    fn client(conventions: &[CallConvention]) -> Client {
        let client = Client::default();
        {
            let mut device = client.device();
            device.conventions = conventions.to_vec();
            device.holdings.extend([(1000, 3), (1001, 0), (2002, 600)]);
            device.inputs.insert(10, 7);
        }
        client
    }

    #[tokio::test]
    async fn slave_convention_is_detected_and_kept() {
        let client = client(&[CallConvention::Slave]);
        let mut transport = Transport::new(client.clone());
        assert_eq!(transport.convention(), None);
        assert_eq!(transport.read_holding_registers(1000, 2, 1).await.unwrap(), [3, 0]);
        assert_eq!(transport.convention(), Some(CallConvention::Slave));
        assert_eq!(transport.read_input_registers(10, 1, 1).await.unwrap(), [7]);
        transport.write_register(5051, 225, 1).await.unwrap();
        transport.write_registers(1020, &[0, 1], 1).await.unwrap();
        let device = client.device();
        assert_eq!(device.rejected, 0);
        assert_eq!(device.calls.len(), 4);
        assert!(device.calls.iter().all(|(c, _)| *c == CallConvention::Slave));
        assert_eq!(device.holdings[&5051], 225);
        assert_eq!(device.holdings[&1021], 1);
    }

    #[tokio::test]
    async fn probing_happens_once_per_client() {
        let client = client(&[CallConvention::Unit]);
        let mut transport = Transport::new(client.clone());
        transport.read_holding_registers(2002, 1, 1).await.unwrap();
        // `slave` was tried and rejected before `unit` was accepted.
        assert_eq!(client.device().rejected, 1);
        transport.read_holding_registers(1000, 1, 1).await.unwrap();
        transport.write_register(5051, 200, 1).await.unwrap();
        transport.read_input_registers(10, 1, 1).await.unwrap();
        let device = client.device();
        assert_eq!(device.rejected, 1);
        assert!(device.calls.iter().all(|(c, _)| *c == CallConvention::Unit));
    }

    #[tokio::test]
    async fn omitted_unit_is_the_last_resort() {
        let client = client(&[CallConvention::Omitted]);
        let mut transport = Transport::new(client.clone());
        transport.read_holding_registers(1000, 1, 1).await.unwrap();
        assert_eq!(transport.convention(), Some(CallConvention::Omitted));
        assert_eq!(client.device().rejected, 2);
    }

    #[tokio::test]
    async fn no_convention_is_an_unsupported_client() {
        let mut transport = Transport::new(Rejecting);
        assert!(matches!(
            transport.read_holding_registers(1000, 1, 1).await,
            Err(Error::UnsupportedClientApi)
        ));
        assert_eq!(transport.convention(), None);
    }

    struct Rejecting;

    impl RawClient for Rejecting {
        async fn call(
            &mut self,
            convention: CallConvention,
            _: u8,
            _: Operation,
        ) -> Result<Response, ClientError> {
            Err(ClientError::Unsupported(convention))
        }

        async fn close(self) -> Result<(), ClientError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn exceptions_do_not_void_the_detected_convention() {
        let client = client(&[CallConvention::Slave]);
        let exception = Failure::Exception(ExceptionCode::IllegalDataAddress);
        client.device().failures.insert(1000, exception);
        let mut transport = Transport::new(client.clone());
        let error = transport.read_holding_registers(1000, 1, 1).await.unwrap_err();
        assert_eq!(error.exception(), Some(Exception(0x02)));
        assert!(!error.is_connection_lost());
        assert_eq!(transport.convention(), Some(CallConvention::Slave));
    }

    #[tokio::test]
    async fn connection_errors_are_classified() {
        let client = client(&[]);
        client.device().failures.insert(1000, Failure::Disconnect);
        client.device().failures.insert(1001, Failure::Timeout);
        let mut transport = Transport::with_convention(client.clone(), CallConvention::Slave);
        let lost = transport.read_holding_registers(1000, 1, 1).await.unwrap_err();
        assert!(lost.is_connection_lost());
        let timed_out = transport.read_holding_registers(1001, 1, 1).await.unwrap_err();
        assert!(!timed_out.is_connection_lost());
    }

    #[tokio::test]
    async fn oversized_requests_never_reach_the_client() {
        let client = client(&[]);
        let mut transport = Transport::new(client.clone());
        assert!(matches!(
            transport.write_registers(1000, &[0; 130], 1).await,
            Err(Error::InvalidCount { function_code: 16, count: 130, max: 123 })
        ));
        assert!(matches!(
            transport.write_registers(1000, &[], 1).await,
            Err(Error::InvalidCount { function_code: 16, count: 0, .. })
        ));
        assert!(matches!(
            transport.read_holding_registers(1000, 126, 1).await,
            Err(Error::InvalidCount { function_code: 3, count: 126, max: 125 })
        ));
        assert!(matches!(
            transport.read_input_registers(10, 0, 1).await,
            Err(Error::InvalidCount { function_code: 4, .. })
        ));
        assert!(client.device().calls.is_empty());
        assert_eq!(transport.convention(), None);
        transport.write_registers(1000, &[0; 123], 1).await.unwrap();
    }

    #[tokio::test]
    async fn short_reads_are_unexpected_responses() {
        let client = client(&[]);
        let mut transport = Transport::new(client.clone());
        // Only 1000 and 1001 exist.
        let error = transport.read_holding_registers(1000, 3, 1).await.unwrap_err();
        assert_eq!(error.exception(), Some(Exception(0x02)));
        assert!(matches!(
            transport.read_input_registers(1000, 1, 1).await,
            Err(Error::Exception(_))
        ));
    }
}
