// rust_link_utils/src/client/transport.rs

//! 操作端 TCP 连接。

use crate::error::LinkUtilError;
use crate::message::{ClientFrameDecoder, WireMessage, receive_message, send_message};
use log::{debug, info};
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

/// 一条到网关的连接，读写两半分开持有。
pub struct ClientConnection {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    decoder: ClientFrameDecoder,
    peer_addr: SocketAddr,
}

impl ClientConnection {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<ClientConnection, LinkUtilError> {
        let stream = TcpStream::connect(addr).await?;
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        info!("[ClientConnection] 已连接到 {}", peer_addr);
        Ok(ClientConnection { reader, writer, decoder: ClientFrameDecoder::new(), peer_addr })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn send_message(&mut self, message: &WireMessage) -> Result<(), LinkUtilError> {
        debug!("[ClientConnection] 发送消息: type={}, id={}", message.message_type, message.message_id);
        send_message(&mut self.writer, message).await
    }

    /// 发送未经分帧处理的原始字节。
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), LinkUtilError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// 接收下一条消息，`None` 表示网关关闭了连接。
    pub async fn receive_message(&mut self) -> Option<Result<WireMessage, LinkUtilError>> {
        receive_message(&mut self.reader, &mut self.decoder).await
    }

    /// 关闭写方向，通知网关本端不再发送。
    pub async fn close(mut self) -> Result<(), LinkUtilError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
