//! Blocking access to a [`super::Transport`] for callers outside of an async context.

use crate::connection::{self, Connection};

use super::{ClientError, Error, RawClient};

#[derive(thiserror::Error, Debug)]
pub enum SetupError {
    #[error("could not start the I/O runtime")]
    Runtime(#[source] std::io::Error),
    #[error(transparent)]
    Connect(#[from] connection::Error),
}

/// Owns a current-thread runtime which drives the wrapped transport on every call.
///
/// Must not be used from within an async context: the calls block the thread.
pub struct Transport<C> {
    core: tokio::runtime::Runtime,
    inner: super::Transport<C>,
}

impl<C: RawClient> Transport<C> {
    pub fn new(client: C) -> Result<Self, SetupError> {
        let core = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(SetupError::Runtime)?;
        Ok(Self { core, inner: super::Transport::new(client) })
    }

    pub fn convention(&self) -> Option<super::CallConvention> {
        self.inner.convention()
    }

    pub fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
        slave_id: u8,
    ) -> Result<Vec<u16>, Error> {
        self.core.block_on(self.inner.read_holding_registers(address, count, slave_id))
    }

    pub fn read_input_registers(
        &mut self,
        address: u16,
        count: u16,
        slave_id: u8,
    ) -> Result<Vec<u16>, Error> {
        self.core.block_on(self.inner.read_input_registers(address, count, slave_id))
    }

    pub fn write_register(&mut self, address: u16, value: u16, slave_id: u8) -> Result<(), Error> {
        self.core.block_on(self.inner.write_register(address, value, slave_id))
    }

    pub fn write_registers(
        &mut self,
        address: u16,
        values: &[u16],
        slave_id: u8,
    ) -> Result<(), Error> {
        self.core.block_on(self.inner.write_registers(address, values, slave_id))
    }

    pub fn close(self) -> Result<(), ClientError> {
        let Self { core, inner } = self;
        core.block_on(inner.close())
    }
}

impl Transport<Connection> {
    /// Establish a Modbus TCP session driven by a fresh runtime.
    pub fn connect(args: &connection::Args) -> Result<Self, SetupError> {
        let core = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(SetupError::Runtime)?;
        let connection = core.block_on(Connection::connect(args))?;
        Ok(Self { core, inner: super::Transport::new(connection) })
    }
}
