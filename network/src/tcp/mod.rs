// TCP over hardware socket slots

pub mod client;
pub mod server;

pub use client::{TcpClient, DEFAULT_SEND_TIMEOUT_MS, TCP_CLIENT_BUFFER_SIZE};
pub use server::{TcpServer, WAIT_FOREVER};
