//! In-band listener client
//!
//! A launched kernel may expose a small TCP listener for receiving signal
//! and shutdown requests without OS-level signaling. Requests are one-shot:
//! open a connection, send a JSON object, close.

use std::io::ErrorKind;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// A request sent to the kernel launcher's listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListenerRequest {
    /// Deliver a signal to the kernel process
    Signal { signum: i32 },
    /// Instruct the listener to shut itself down
    Shutdown { shutdown: u8 },
}

impl ListenerRequest {
    /// The shutdown directive
    pub fn shutdown() -> Self {
        ListenerRequest::Shutdown { shutdown: 1 }
    }
}

/// Result of a listener send attempt
#[derive(Debug, PartialEq, Eq)]
pub enum ListenerSendResult {
    /// The request was written to the listener
    Sent,
    /// The connection was actively refused: there is no process behind the
    /// port, which callers treat as "nothing left to signal".
    Refused,
    /// Any other failure (timeout, unreachable, reset)
    Failed(ErrorKind),
}

/// Send one request to `(ip, port)` with a short timeout
///
/// The timeout is deliberately ms-scale: the listener is expected to be
/// same-host or low-latency, so a slow response means "treat as
/// unreachable", not "wait longer". When `shutdown_socket` is set the write
/// side is half-closed after the send, letting the listener observe EOF.
pub async fn send_listener_request(
    ip: &str,
    port: u16,
    request: &ListenerRequest,
    timeout: Duration,
    shutdown_socket: bool,
) -> ListenerSendResult {
    let payload = match serde_json::to_vec(request) {
        Ok(payload) => payload,
        Err(_) => return ListenerSendResult::Failed(ErrorKind::InvalidData),
    };

    let connect = tokio::time::timeout(timeout, TcpStream::connect((ip, port))).await;
    let mut stream = match connect {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
            return ListenerSendResult::Refused;
        }
        Ok(Err(e)) => return ListenerSendResult::Failed(e.kind()),
        Err(_) => return ListenerSendResult::Failed(ErrorKind::TimedOut),
    };

    let send = async {
        stream.write_all(&payload).await?;
        if shutdown_socket {
            // NotConnected here is a follow-on to a dead peer; ignore it.
            match stream.shutdown().await {
                Err(e) if e.kind() != ErrorKind::NotConnected => return Err(e),
                _ => {}
            }
        }
        Ok::<(), std::io::Error>(())
    };

    match tokio::time::timeout(timeout, send).await {
        Ok(Ok(())) => ListenerSendResult::Sent,
        Ok(Err(e)) => ListenerSendResult::Failed(e.kind()),
        Err(_) => ListenerSendResult::Failed(ErrorKind::TimedOut),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_request_wire_format() {
        let signal = serde_json::to_string(&ListenerRequest::Signal { signum: 2 }).unwrap();
        assert_eq!(signal, r#"{"signum":2}"#);

        let shutdown = serde_json::to_string(&ListenerRequest::shutdown()).unwrap();
        assert_eq!(shutdown, r#"{"shutdown":1}"#);
    }

    #[tokio::test]
    async fn test_send_to_live_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let result = send_listener_request(
            "127.0.0.1",
            port,
            &ListenerRequest::Signal { signum: 15 },
            Duration::from_millis(250),
            true,
        )
        .await;
        assert_eq!(result, ListenerSendResult::Sent);

        let received = accept.await.unwrap();
        let parsed: ListenerRequest = serde_json::from_slice(&received).unwrap();
        assert_eq!(parsed, ListenerRequest::Signal { signum: 15 });
    }

    #[tokio::test]
    async fn test_send_connection_refused() {
        // Bind then drop to obtain a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = send_listener_request(
            "127.0.0.1",
            port,
            &ListenerRequest::Signal { signum: 9 },
            Duration::from_millis(250),
            false,
        )
        .await;
        assert_eq!(result, ListenerSendResult::Refused);
    }
}
