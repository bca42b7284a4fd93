//! Client-side stub to a replica server.

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio::time::{self, Duration};

use crate::server::{ApiReply, ApiRequest};
use crate::utils::{recv_msg, send_msg, ViewKvError};

/// Connection stub to one replica server.
pub(crate) struct ApiStub {
    /// Established TCP connection to the replica.
    conn: TcpStream,
}

impl ApiStub {
    /// Connects to the named replica, within the given timeout.
    pub(crate) async fn new_by_connect(
        server: &str,
        timeout: Duration,
    ) -> Result<Self, ViewKvError> {
        let addr: SocketAddr = server.parse()?;
        let conn = time::timeout(timeout, TcpStream::connect(addr)).await??;
        conn.set_nodelay(true)?;
        pf_debug!("c"; "connected to server '{}'", server);
        Ok(ApiStub { conn })
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
