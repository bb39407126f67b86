//! # Marketplace RPC
//!
//! The request/response surface local clients use to drive the market.
//! Frames are `u32_be length || bincode payload`, length-capped; a
//! connection carries any number of request/response pairs sequentially.
//!
//! The server side is a plain accept loop with one task per connection.
//! [`MarketClient`] is the typed wrapper local tools and tests use.
//!
//! Errors from the market core travel back as
//! [`MarketResponse::Error`](crate::messages::MarketResponse) with the
//! category name leading the message text.

use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::market::Market;
use crate::messages::{self, MarketRequest, MarketResponse, User, MAX_DESERIALIZE_SIZE};

/// Default port of the marketplace RPC listener.
pub const DEFAULT_RPC_PORT: u16 = 50051;

/// Width of the frame length prefix.
const FRAME_HEADER_LEN: usize = 4;

/// Error type for RPC client failures.
#[derive(Debug)]
pub enum RpcError {
    /// Transport failure.
    Io(std::io::Error),
    /// The server answered with an error; the message leads with the
    /// error category.
    Remote(String),
    /// The peer violated the framing or answered out of protocol.
    Protocol(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Io(err) => write!(f, "RPC transport failed: {err}"),
            RpcError::Remote(msg) => write!(f, "{msg}"),
            RpcError::Protocol(msg) => write!(f, "RPC protocol violation: {msg}"),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io(err)
    }
}

/// Serve the marketplace API on an already-bound listener until the task
/// is cancelled or the listener fails.
pub async fn serve(listener: TcpListener, market: Arc<Market>) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "marketplace RPC listening");
    }
    loop {
        let (stream, remote) = listener.accept().await?;
        let market = market.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, market).await {
                debug!(%remote, %err, "client connection closed with error");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, market: Arc<Market>) -> std::io::Result<()> {
    loop {
        let frame = match read_frame(&mut stream).await? {
            Some(frame) => frame,
            None => return Ok(()), // clean EOF between requests
        };

        let response = match messages::decode_request(&frame) {
            Ok(request) => dispatch(&market, request).await,
            Err(err) => MarketResponse::Error {
                message: format!("malformed request: {err}"),
            },
        };

        let payload = messages::encode_response(&response)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        write_frame(&mut stream, &payload).await?;
    }
}

async fn dispatch(market: &Market, request: MarketRequest) -> MarketResponse {
    match request {
        MarketRequest::RegisterFile { file_hash, user } => {
            match market.register_file(&file_hash, user).await {
                Ok(()) => MarketResponse::Registered,
                Err(err) => MarketResponse::Error {
                    message: err.to_string(),
                },
            }
        }
        MarketRequest::CheckHolders { file_hash } => {
            match market.check_holders(&file_hash).await {
                Ok(holders) => MarketResponse::Holders(holders),
                Err(err) => MarketResponse::Error {
                    message: err.to_string(),
                },
            }
        }
    }
}

/// Read one length-prefixed frame. `Ok(None)` means the peer closed the
/// connection cleanly before a new frame started.
async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let len = u32::from_be_bytes(header) as u64;
    if len > MAX_DESERIALIZE_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the {MAX_DESERIALIZE_SIZE}-byte cap"),
        ));
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
    if payload.len() as u64 > MAX_DESERIALIZE_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame exceeds the size cap",
        ));
    }
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

/// Typed client for the marketplace RPC.
pub struct MarketClient {
    stream: TcpStream,
}

impl MarketClient {
    /// Connect to a market node's RPC listener.
    pub async fn connect(addr: &str) -> Result<Self, RpcError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self { stream })
    }

    /// Advertise a held file. The server fills in the identity, so
    /// `user.id` may be left empty.
    pub async fn register_file(&mut self, file_hash: &str, user: User) -> Result<(), RpcError> {
        let response = self
            .call(MarketRequest::RegisterFile {
                file_hash: file_hash.to_string(),
                user,
            })
            .await?;
        match response {
            MarketResponse::Registered => Ok(()),
            MarketResponse::Error { message } => Err(RpcError::Remote(message)),
            other => Err(RpcError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }

    /// List the current holders of a file.
    pub async fn check_holders(&mut self, file_hash: &str) -> Result<Vec<User>, RpcError> {
        let response = self
            .call(MarketRequest::CheckHolders {
                file_hash: file_hash.to_string(),
            })
            .await?;
        match response {
            MarketResponse::Holders(holders) => Ok(holders),
            MarketResponse::Error { message } => Err(RpcError::Remote(message)),
            other => Err(RpcError::Protocol(format!("unexpected response: {other:?}"))),
        }
    }

    async fn call(&mut self, request: MarketRequest) -> Result<MarketResponse, RpcError> {
        let payload = messages::encode_request(&request)
            .map_err(|err| RpcError::Protocol(err.to_string()))?;
        write_frame(&mut self.stream, &payload).await?;

        let frame = read_frame(&mut self.stream)
            .await?
            .ok_or_else(|| RpcError::Protocol("connection closed mid-call".to_string()))?;
        messages::decode_response(&frame).map_err(|err| RpcError::Protocol(err.to_string()))
    }
}
