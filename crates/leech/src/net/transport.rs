use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

// A unified trait for peer transport streams (TCP, or in-memory pipes in tests)
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type Transport = Box<dyn TransportStream>;

pub fn from_tcp(stream: TcpStream) -> Transport {
    Box::new(stream)
}

/// Dial `addr`, giving up after `timeout` with `ErrorKind::TimedOut`.
pub async fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<Transport> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(stream) => {
            let stream = stream?;
            stream.set_nodelay(true)?;
            Ok(from_tcp(stream))
        }
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, format!("connect to {} timed out", addr))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        assert!(connect(addr, Duration::from_secs(5)).await.is_ok());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(connect(addr, Duration::from_secs(5)).await.is_err());
    }
}
