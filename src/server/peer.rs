//! Primary-side stub for calling the backup replica.

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio::time::{self, Duration};

use crate::server::{ApiReply, ApiRequest};
use crate::utils::{recv_msg, send_msg, ViewKvError};

/// One request/reply connection to a peer replica. No reconnection logic
/// here: the owner drops the stub on any error and dials afresh, since the
/// authority is the one deciding whether the peer is gone for good.
pub(crate) struct PeerStub {
    /// The peer's name, i.e. its address string.
    pub(crate) name: String,

    /// Established TCP connection to the peer.
    conn: TcpStream,
}

impl PeerStub {
    /// Connects to the named peer replica, within the given timeout.
    pub(crate) async fn connect(
        name: String,
        timeout: Duration,
    ) -> Result<Self, ViewKvError> {
        let addr: SocketAddr = name.parse()?;
        let conn = time::timeout(timeout, TcpStream::connect(addr)).await??;
        conn.set_nodelay(true)?;
        Ok(PeerStub { name, conn })
    }

    /// Issues one request and awaits its reply, within the given timeout.
    pub(crate) async fn call(
        &mut self,
        req: &ApiRequest,
        timeout: Duration,
    ) -> Result<ApiReply, ViewKvError> {
        time::timeout(timeout, async {
            send_msg(&mut self.conn, req).await?;
            recv_msg(&mut self.conn).await
        })
        .await?
    }
}
