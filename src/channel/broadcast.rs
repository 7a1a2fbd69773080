//! UDP completion notices.
//!
//! A producer that finishes its output can announce it with a
//! [`BroadcastNotifier`]; file input channels listening with a
//! [`BroadcastListener`] pick the notice up before their next poll of the
//! job coordinator. Notices are advisory: a lost datagram only delays the
//! download until the next poll.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use crate::error::Result;
use crate::job::CompletedTask;

/// Largest datagram accepted.
const MAX_NOTICE_LEN: usize = 8 * 1024;

pub struct BroadcastNotifier {
    socket: UdpSocket,
    target: SocketAddr,
}

impl BroadcastNotifier {
    /// Notifier sending to `target` (a broadcast or unicast address).
    pub fn new(target: SocketAddr) -> Result<Self> {
        let bind: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind)?;
        socket.set_broadcast(true)?;
        Ok(Self { socket, target })
    }

    pub fn notify(&self, task: &CompletedTask) -> Result<()> {
        let payload = serde_json::to_vec(task)?;
        self.socket.send_to(&payload, self.target)?;
        tracing::debug!(task = %task.task_attempt_id, target = %self.target, "completion broadcast");
        Ok(())
    }
}

pub struct BroadcastListener {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl BroadcastListener {
    pub fn bind(port: u16) -> Result<Self> {
        Self::bind_addr(([0, 0, 0, 0], port).into())
    }

    pub fn bind_addr(addr: SocketAddr) -> Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind(addr)?,
            buf: vec![0u8; MAX_NOTICE_LEN],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Wait up to `timeout` for one notice. Malformed datagrams are dropped.
    pub fn recv(&mut self, timeout: Duration) -> Result<Option<CompletedTask>> {
        self.socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let (len, peer) = match self.socket.recv_from(&mut self.buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<CompletedTask>(&self.buf[..len]) {
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                tracing::warn!(%peer, "ignoring malformed completion notice: {}", e);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobId, ServerAddress, TaskAttemptId, TaskId};

    #[test]
    fn test_notice_delivered() {
        let mut listener = BroadcastListener::bind_addr(([127, 0, 0, 1], 0).into()).unwrap();
        let notifier = BroadcastNotifier::new(listener.local_addr().unwrap()).unwrap();
        let task = CompletedTask {
            job_id: JobId::new(),
            task_attempt_id: TaskAttemptId::new(TaskId::new("Map", 4), 1),
            task_server: ServerAddress::new("worker7", 9000),
            file_server_port: 9001,
        };
        notifier.notify(&task).unwrap();
        let received = listener.recv(Duration::from_secs(5)).unwrap();
        assert_eq!(received, Some(task));
    }

    #[test]
    fn test_timeout_and_garbage_yield_none() {
        let mut listener = BroadcastListener::bind_addr(([127, 0, 0, 1], 0).into()).unwrap();
        assert!(listener.recv(Duration::from_millis(10)).unwrap().is_none());
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"not json", listener.local_addr().unwrap()).unwrap();
        assert!(listener.recv(Duration::from_secs(5)).unwrap().is_none());
    }
}
