use std::{
    io,
    sync::atomic::{AtomicU8, Ordering},
};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

/// Lifecycle of one side of a bridged pair.
///
/// Only ever moves forward: `Open -> Closing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Write side of a duplex connection, guarded by its [`ConnectionState`].
#[derive(Debug)]
pub struct Connection<W> {
    state: AtomicU8,
    write: Mutex<Option<W>>,
}

impl<W> Connection<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(write: W) -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Open as u8),
            write: Mutex::new(Some(write)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Writes the whole chunk, or silently drops it if the connection is no
    /// longer open.
    pub async fn write(&self, chunk: &[u8]) -> io::Result<()> {
        if self.state() != ConnectionState::Open {
            return Ok(());
        }

        let mut write = self.write.lock().await;

        // Released while we were waiting for the lock
        let Some(write) = write.as_mut() else {
            return Ok(());
        };

        write.write_all(chunk).await
    }

    /// Half-closes the connection, then releases the write side.
    ///
    /// Only the first call does anything.
    pub async fn close(&self) {
        let opened = self.state.compare_exchange(
            ConnectionState::Open as u8,
            ConnectionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        if opened.is_err() {
            return;
        }

        let released = self.write.lock().await.take();

        if let Some(mut write) = released {
            // Peer may already be gone, nothing left to report to
            let _ = write.shutdown().await;
        }

        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }
}
