//! Client-side stub to the view authority.

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio::time::{self, Duration};

use crate::authority::{CtrlReply, CtrlRequest, View};
use crate::utils::{recv_msg, send_msg, tcp_connect_with_retry, ViewKvError};

/// Connection stub to the view authority.
pub(crate) struct CtrlStub {
    /// Established TCP connection to the authority.
    conn: TcpStream,
}

impl CtrlStub {
    /// Connects to the view authority, retrying for a while if it is not up
    /// yet.
    pub(crate) async fn new_by_connect(
        authority: SocketAddr,
        retries: u8,
    ) -> Result<Self, ViewKvError> {
        let conn = tcp_connect_with_retry(authority, retries).await?;
        pf_debug!("c"; "connected to view authority '{}'", authority);
        Ok(CtrlStub { conn })
    }

    /// Queries the current view, within the given timeout.
    pub(crate) async fn get_view(
        &mut self,
        timeout: Duration,
    ) -> Result<View, ViewKvError> {
        let reply: CtrlReply = time::timeout(timeout, async {
            send_msg(&mut self.conn, &CtrlRequest::GetView).await?;
            recv_msg(&mut self.conn).await
        })
        .await??;
        Ok(reply.view)
    }
}
