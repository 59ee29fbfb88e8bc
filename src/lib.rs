pub mod codec;
pub mod commands;
pub mod compatibility;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod disabled;
pub mod modbus;
pub mod output;
pub mod registers;
pub mod transport;
