use crate::error::{Error, Result};
use std::net::SocketAddr;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Manager-side reader connected to one relay. Reads are strictly
/// sequential.
pub struct Proxy {
    path: String,
    endpoint: SocketAddr,
    stream: TcpStream,
    size: u64,
    offset: u64,
    eof: bool,
}

impl Proxy {
    pub async fn connect(path: &str, endpoint: SocketAddr, size: u64) -> Result<Self> {
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            path: path.to_string(),
            endpoint,
            stream,
            size,
            offset: 0,
            eof: false,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Relay endpoint this proxy is connected to; names the relay in close
    /// requests.
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read up to `size` bytes at `offset`, which must equal the running
    /// offset. Blocks until `size` bytes arrived or the relay closed; an
    /// empty result means end of file.
    pub async fn read(&mut self, size: usize, offset: u64) -> Result<Vec<u8>> {
        if offset != self.offset {
            return Err(Error::Protocol(format!(
                "{}: out-of-order read at {offset}, expected {}",
                self.path, self.offset
            )));
        }

        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size && !self.eof {
            let n = self.stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                self.eof = true;
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        self.offset += filled as u64;

        if self.eof && self.offset < self.size {
            debug!(path = %self.path, offset = self.offset, size = self.size, "relay closed early");
            return Err(Error::Inconsistent(format!(
                "{}: stream ended at {} of {} bytes",
                self.path, self.offset, self.size
            )));
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn serve(bytes: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(bytes).await.unwrap();
            sock.shutdown().await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_out_of_order_offset_fails_before_reading() {
        let addr = serve(b"hello").await;
        let mut proxy = Proxy::connect("/a.txt", addr, 5).await.unwrap();
        assert!(matches!(proxy.read(3, 2).await, Err(Error::Protocol(_))));
        assert_eq!(proxy.offset(), 0);
        // nothing was consumed from the socket
        assert_eq!(proxy.read(5, 0).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_sequential_reads_then_eof() {
        let addr = serve(b"hello").await;
        let mut proxy = Proxy::connect("/a.txt", addr, 5).await.unwrap();
        assert_eq!(proxy.read(3, 0).await.unwrap(), b"hel");
        assert_eq!(proxy.read(2, 3).await.unwrap(), b"lo");
        assert!(proxy.read(1, 5).await.unwrap().is_empty());
        assert!(proxy.read(1, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_early_close_is_inconsistent() {
        let addr = serve(b"he").await;
        let mut proxy = Proxy::connect("/a.txt", addr, 5).await.unwrap();
        assert!(matches!(
            proxy.read(5, 0).await,
            Err(Error::Inconsistent(_))
        ));
    }
}
