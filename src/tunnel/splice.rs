// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bidirectional byte splicing between a local socket and a forwarded channel.
//!
//! The local socket drives the lifetime of the splice:
//!
//! - EOF from the local client ends the splice at once, whatever the channel
//!   is doing. The connection is not kept half open.
//! - EOF from the channel shuts down the write half of the local socket and
//!   keeps forwarding client bytes until the client closes too.
//!
//! The first I/O error stops both directions and is tagged with the side
//! that produced it.

use std::io;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

const SPLICE_BUFFER_SIZE: usize = 16 * 1024;

/// Transfer statistics for one spliced connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpliceStats {
    /// Bytes read from the local socket and written to the channel
    pub bytes_local_to_remote: u64,
    /// Bytes read from the channel and written to the local socket
    pub bytes_remote_to_local: u64,
    /// Time spent splicing
    pub duration: Duration,
}

impl SpliceStats {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_local_to_remote + self.bytes_remote_to_local
    }
}

/// I/O failure during a splice, by side.
#[derive(Debug, Error)]
pub enum SpliceError {
    #[error("local socket: {0}")]
    Local(#[source] io::Error),
    #[error("forwarded channel: {0}")]
    Channel(#[source] io::Error),
}

#[derive(Clone, Copy)]
enum Side {
    Local,
    Channel,
}

impl Side {
    fn error(self, e: io::Error) -> SpliceError {
        match self {
            Side::Local => SpliceError::Local(e),
            Side::Channel => SpliceError::Channel(e),
        }
    }
}

/// Copy from `reader` to `writer` until EOF. Returns once the reader ends.
async fn pump<R, W>(
    reader: &mut R,
    reader_side: Side,
    writer: &mut W,
    writer_side: Side,
    transferred: &mut u64,
) -> Result<(), SpliceError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; SPLICE_BUFFER_SIZE];
    loop {
        let n = reader
            .read(&mut buffer)
            .await
            .map_err(|e| reader_side.error(e))?;
        if n == 0 {
            return Ok(());
        }
        writer
            .write_all(&buffer[..n])
            .await
            .map_err(|e| writer_side.error(e))?;
        *transferred += n as u64;
    }
}

/// Forward bytes between `local` and `channel` until the local side ends.
pub async fn splice<L, R>(local: &mut L, channel: &mut R) -> Result<SpliceStats, SpliceError>
where
    L: AsyncRead + AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let started_at = Instant::now();
    let mut bytes_local_to_remote = 0u64;
    let mut bytes_remote_to_local = 0u64;
    trace!("Starting bidirectional splice");

    {
        let (mut local_read, mut local_write) = tokio::io::split(local);
        let (mut channel_read, mut channel_write) = tokio::io::split(channel);

        let upstream = pump(
            &mut local_read,
            Side::Local,
            &mut channel_write,
            Side::Channel,
            &mut bytes_local_to_remote,
        );
        let downstream = async {
            pump(
                &mut channel_read,
                Side::Channel,
                &mut local_write,
                Side::Local,
                &mut bytes_remote_to_local,
            )
            .await?;
            trace!("Channel EOF, waiting for local socket to close");
            local_write.shutdown().await.map_err(SpliceError::Local)
        };
        tokio::pin!(upstream);
        tokio::pin!(downstream);

        tokio::select! {
            result = &mut upstream => {
                result?;
                trace!("Local socket closed, ending splice");
            }
            result = &mut downstream => {
                result?;
                upstream.await?;
            }
        }
    }

    let stats = SpliceStats {
        bytes_local_to_remote,
        bytes_remote_to_local,
        duration: started_at.elapsed(),
    };
    trace!(
        "Splice completed: {} bytes L→R, {} bytes R→L in {:?}",
        stats.bytes_local_to_remote,
        stats.bytes_remote_to_local,
        stats.duration
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;
    use tokio::time::timeout;

    /// Stream whose every read fails, like a channel whose transport died.
    struct BrokenStream;

    impl AsyncRead for BrokenStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "transport lost",
            )))
        }
    }

    impl AsyncWrite for BrokenStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_splice_moves_bytes_both_ways() {
        let (mut client, mut local) = tokio::io::duplex(64);
        let (mut channel, mut remote) = tokio::io::duplex(64);

        let splicer = tokio::spawn(async move { splice(&mut local, &mut channel).await });

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        remote.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client);

        let stats = splicer.await.unwrap().unwrap();
        assert_eq!(stats.bytes_local_to_remote, 4);
        assert_eq!(stats.bytes_remote_to_local, 5);
        assert_eq!(stats.total_bytes(), 9);
    }

    #[tokio::test]
    async fn test_local_eof_ends_splice_with_silent_channel() {
        let (mut client, mut local) = tokio::io::duplex(64);
        // remote end stays open and never writes
        let (mut channel, _remote) = tokio::io::duplex(64);

        let splicer = tokio::spawn(async move { splice(&mut local, &mut channel).await });

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let stats = timeout(Duration::from_secs(1), splicer)
            .await
            .expect("local EOF should end the splice")
            .unwrap()
            .unwrap();
        assert_eq!(stats.bytes_local_to_remote, 7);
        assert_eq!(stats.bytes_remote_to_local, 0);
    }

    #[tokio::test]
    async fn test_channel_eof_keeps_local_direction_open() {
        let (mut client, mut local) = tokio::io::duplex(64);
        let (mut channel, mut remote) = tokio::io::duplex(64);

        let splicer = tokio::spawn(async move { splice(&mut local, &mut channel).await });

        remote.write_all(b"bye").await.unwrap();
        remote.shutdown().await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");
        assert!(!splicer.is_finished());

        // client bytes still reach the channel after its EOF
        client.write_all(b"late").await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"late");

        client.shutdown().await.unwrap();
        let stats = splicer.await.unwrap().unwrap();
        assert_eq!(stats.bytes_remote_to_local, 3);
        assert_eq!(stats.bytes_local_to_remote, 4);
    }

    #[tokio::test]
    async fn test_channel_failure_is_tagged_channel() {
        let (_client, mut local) = tokio::io::duplex(64);
        let mut channel = BrokenStream;

        let err = splice(&mut local, &mut channel).await.unwrap_err();
        assert!(matches!(
            err,
            SpliceError::Channel(ref e) if e.kind() == io::ErrorKind::ConnectionAborted
        ));
    }

    #[tokio::test]
    async fn test_local_failure_is_tagged_local() {
        let mut local = BrokenStream;
        let (mut channel, _remote) = tokio::io::duplex(64);

        let err = splice(&mut local, &mut channel).await.unwrap_err();
        assert!(matches!(err, SpliceError::Local(_)));
    }
}
