use crate::modbus::{self, ModbusTCPCodec, Operation, Request, Response};
use crate::transport::{CallConvention, ClientError, RawClient};
use futures::{SinkExt as _, StreamExt as _};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("`{0}` did not resolve to any address")]
    NoAddress(String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("connecting to `{0}` timed out")]
    ConnectTimeout(String),
    #[error("could not send out the request")]
    Send(#[source] std::io::Error),
    #[error("could not read data from the stream")]
    Receive(#[source] std::io::Error),
    #[error("the server closed the connection")]
    Closed,
    #[error("no response to transaction {0} received in time")]
    Timeout(u16),
    #[error("could not shut down the connection")]
    Shutdown(#[source] std::io::Error),
}

impl Error {
    /// Whether the session can no longer be used after this error.
    pub fn is_session_lost(&self) -> bool {
        !matches!(self, Error::Timeout(_))
    }
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Host name or IP address of the heat pump controller.
    #[arg(long)]
    pub host: String,

    /// Modbus TCP port of the controller.
    #[arg(long, default_value_t = 502)]
    pub port: u16,

    /// If the modbus response isn't received in this amount of time, consider the request
    /// failed.
    #[arg(long, default_value = "3s")]
    pub read_timeout: humantime::Duration,

    /// Give up establishing the TCP session after this amount of time.
    #[arg(long, default_value = "5s")]
    pub connect_timeout: humantime::Duration,

    /// The amount of additional time to wait between sending requests over TCP.
    ///
    /// Interacting too fast can make some Modbus TCP interfaces behave poorly.
    #[arg(long, default_value = "20ms")]
    pub tcp_send_delay: humantime::Duration,
}

impl Args {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

type TcpIo = Framed<TcpStream, ModbusTCPCodec>;

/// A Modbus TCP session with a single request in flight at any time.
///
/// The device family does not handle pipelined requests, so every [`Connection::send`] waits
/// for the matching response (or its timeout) before the next request goes out.
pub struct Connection {
    io: TcpIo,
    transaction_id: u16,
    read_timeout: Duration,
    tcp_send_delay: Duration,
    next_send: Instant,
}

impl Connection {
    pub async fn connect(args: &Args) -> Result<Connection, Error> {
        let address = args.address();
        info!(message = "connecting...", address);
        let connect = async {
            let addresses = tokio::net::lookup_host(&address)
                .await
                .map_err(|e| Error::LookupHost(e, address.clone()))?
                .collect::<Vec<_>>();
            debug!(message = "resolved", ?addresses);
            if addresses.is_empty() {
                return Err(Error::NoAddress(address.clone()));
            }
            TcpStream::connect(&*addresses)
                .await
                .map_err(|e| Error::Connect(e, address.clone()))
        };
        let socket = tokio::time::timeout(*args.connect_timeout, connect)
            .await
            .map_err(|_| Error::ConnectTimeout(address.clone()))??;
        let nodelay_result = socket.set_nodelay(true);
        trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
        info!(message = "connected", address);
        Ok(Connection {
            io: Framed::new(socket, ModbusTCPCodec {}),
            transaction_id: 0,
            read_timeout: *args.read_timeout,
            tcp_send_delay: *args.tcp_send_delay,
            next_send: Instant::now(),
        })
    }

    pub fn new_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }

    pub async fn send(&mut self, unit_id: u8, operation: Operation) -> Result<Response, Error> {
        tokio::time::sleep_until(self.next_send).await;
        let transaction_id = self.new_transaction_id();
        let request = modbus::Request { unit_id, transaction_id, operation };
        trace!(message = "sending request", transaction_id, operation = ?request.operation);
        let result = self.exchange(request).await;
        self.next_send = Instant::now() + self.tcp_send_delay;
        result
    }

    async fn exchange(&mut self, request: Request) -> Result<Response, Error> {
        let transaction_id = request.transaction_id;
        self.io.send(request).await.map_err(Error::Send)?;
        let deadline = Instant::now() + self.read_timeout;
        loop {
            let response = match tokio::time::timeout_at(deadline, self.io.next()).await {
                Err(_) => {
                    debug!(message = "request timed out", transaction_id);
                    return Err(Error::Timeout(transaction_id));
                }
                Ok(None) => return Err(Error::Closed),
                Ok(Some(Err(e))) => return Err(Error::Receive(e)),
                Ok(Some(Ok(response))) => response,
            };
            if response.transaction_id == transaction_id {
                return Ok(response);
            }
            // Most likely a late response to a request which has timed out earlier.
            debug!(
                message = "a response we were not expecting",
                transaction = response.transaction_id,
                expected = transaction_id
            );
        }
    }

    pub async fn close(mut self) -> Result<(), Error> {
        self.io.close().await.map_err(Error::Shutdown)
    }
}

impl RawClient for Connection {
    async fn call(
        &mut self,
        convention: CallConvention,
        slave_id: u8,
        operation: Operation,
    ) -> Result<Response, ClientError> {
        let unit_id = match convention {
            CallConvention::Slave => slave_id,
            CallConvention::Omitted => modbus::UNIT_ID_OMITTED,
            CallConvention::Unit => return Err(ClientError::Unsupported(convention)),
        };
        Ok(self.send(unit_id, operation).await?)
    }

    async fn close(self) -> Result<(), ClientError> {
        Connection::close(self).await.map_err(ClientError::from)
    }
}
