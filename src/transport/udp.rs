//! Plain UDP RTP reader

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{MAX_DATAGRAM, ReadSummary};
use crate::pipeline::receiver::Depacketizer;
use crate::telemetry::SharedTelemetry;
use crate::{emit_info, emit_warn};

pub struct UdpRtpReader {
    socket: UdpSocket,
    depacketizer: Arc<Depacketizer>,
    cancel: CancellationToken,
    telemetry: SharedTelemetry,
}

impl UdpRtpReader {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        depacketizer: Arc<Depacketizer>,
        cancel: CancellationToken,
        telemetry: SharedTelemetry,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            depacketizer,
            cancel,
            telemetry,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Read datagrams until cancelled. A socket error ends the reader.
    pub async fn run(self) -> ReadSummary {
        let mut summary = ReadSummary::default();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        if let Ok(addr) = self.socket.local_addr() {
            emit_info!(self.telemetry, "transport", "listening for RTP on {}", addr);
        }

        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((len, _)) => {
                    let datagram = Bytes::copy_from_slice(&buf[..len]);
                    summary.record(self.depacketizer.push_packet(datagram));
                }
                Err(err) => {
                    emit_warn!(self.telemetry, "transport", "socket error: {}", err);
                    break;
                }
            }
        }

        emit_info!(self.telemetry, "transport", "udp reader stopped: {}", summary);
        summary
    }

    pub fn spawn(self) -> JoinHandle<ReadSummary> {
        tokio::spawn(self.run())
    }
}
