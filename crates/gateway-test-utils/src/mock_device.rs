use bytes::BytesMut;
use dny_protocol::{DecodedMessage, DnyCodec, OutboundDnyFrame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Decoder;

/// Drives a raw TCP connection as a simulated DNY device, for integration
/// tests that exercise a `Gateway` bound to a real ephemeral port.
pub struct MockDevice {
    stream: TcpStream,
    codec: DnyCodec,
    pending: BytesMut,
}

impl MockDevice {
    /// Open a new connection to the gateway's listen address.
    pub async fn connect(addr: impl tokio::net::ToSocketAddrs) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            stream,
            codec: DnyCodec::new(),
            pending: BytesMut::new(),
        })
    }

    /// Send the ICCID sentinel that opens every session.
    pub async fn send_iccid(&mut self, iccid: &str) -> std::io::Result<()> {
        debug_assert_eq!(iccid.len(), 20);
        self.stream.write_all(iccid.as_bytes()).await
    }

    /// Send the literal 4-byte link heartbeat.
    pub async fn send_link_heartbeat(&mut self) -> std::io::Result<()> {
        self.stream.write_all(b"link").await
    }

    /// Send a binary DNY frame, checksum computed for the caller.
    pub async fn send_dny(
        &mut self,
        physical_id: u32,
        message_id: u16,
        command: u8,
        payload: Vec<u8>,
    ) -> std::io::Result<()> {
        let bytes = dny_protocol::encode_frame(&OutboundDnyFrame::new(
            physical_id,
            message_id,
            command,
            payload,
        ));
        self.stream.write_all(&bytes).await
    }

    /// Send raw bytes verbatim, for tests that need to construct a malformed
    /// or boundary-straddling frame by hand.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await
    }

    /// Read and decode the next message the gateway writes back, blocking
    /// until one arrives or the connection closes.
    pub async fn recv(&mut self) -> std::io::Result<Option<DecodedMessage>> {
        loop {
            if let Some(msg) = self
                .codec
                .decode(&mut self.pending)
                .map_err(std::io::Error::other)?
            {
                return Ok(Some(msg));
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }
}
