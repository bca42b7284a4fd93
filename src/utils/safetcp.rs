//! TCP bind/connect helpers and length-prefixed message read/write.

use std::net::SocketAddr;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, Duration};

use crate::utils::ViewKvError;

/// Sends a message of type `T` through the given writable connection,
/// prefixed by its encoded length in big-endian bytes.
pub(crate) async fn send_msg<T, Conn>(
    conn_write: &mut Conn,
    msg: &T,
) -> Result<(), ViewKvError>
where
    T: Serialize,
    Conn: AsyncWriteExt + Unpin,
{
    let msg_bytes = encode_to_vec(msg)?;
    conn_write.write_u64(msg_bytes.len() as u64).await?;
    conn_write.write_all(&msg_bytes[..]).await?;
    conn_write.flush().await?;
    Ok(())
}

/// Receives a message of type `T` from the given readable connection. The
/// caller must be the only reader of the connection, and must not drop the
/// returned future midway (requests and replies here are strictly
/// alternating, so no handler reads inside a `select!` branch).
pub(crate) async fn recv_msg<T, Conn>(
    conn_read: &mut Conn,
) -> Result<T, ViewKvError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    let msg_len = conn_read.read_u64().await?;
    let mut msg_buf: Vec<u8> = vec![0; msg_len as usize];
    conn_read.read_exact(&mut msg_buf[..]).await?;
    let msg = decode_from_slice(&msg_buf[..])?;
    Ok(msg)
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, ViewKvError> {
    loop {
        match TcpListener::bind(bind_addr).await {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, ViewKvError> {
    loop {
        match TcpStream::connect(conn_addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
