//! Non-blocking view of a remote interactive shell
//!
//! The russh channel is owned by a dedicated task (see `session.rs`). That task
//! pushes remote output into an mpsc queue and drains an input queue into the
//! channel. [`RemoteShell`] is the consumer side: every read and exit check is
//! a `try_recv`, so the bridge loop never suspends on the remote side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use super::error::SshError;

/// Queue depth for remote output and client input
pub const SHELL_CHANNEL_CAPACITY: usize = 1024;

/// Cloneable close handle for a remote shell.
///
/// Closing cancels the channel-owner task, which closes the channel and
/// disconnects the SSH connection. Only the first call has any effect.
/// The owner task reports that it is done through [`ShellControl::mark_finished`].
#[derive(Clone, Debug, Default)]
pub struct ShellControl {
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
    finished: CancellationToken,
}

impl ShellControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request close. Returns `true` for the call that actually closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Token observed by the channel-owner task
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Called by the channel owner once the channel is closed and the
    /// connection disconnected
    pub fn mark_finished(&self) {
        self.finished.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Wait until the channel owner has released the connection
    pub async fn finished(&self) {
        self.finished.cancelled().await
    }
}

/// Consumer side of a remote PTY shell
pub struct RemoteShell {
    input_tx: mpsc::Sender<Vec<u8>>,
    output_rx: mpsc::Receiver<Vec<u8>>,
    /// Output received but not yet handed out
    pending: BytesMut,
    /// The owner task dropped its output sender
    finished: bool,
    control: ShellControl,
}

impl RemoteShell {
    /// Assemble a shell from its queues.
    ///
    /// The owner of `output_tx` signals remote exit by dropping it.
    pub fn from_parts(
        input_tx: mpsc::Sender<Vec<u8>>,
        output_rx: mpsc::Receiver<Vec<u8>>,
        control: ShellControl,
    ) -> Self {
        Self {
            input_tx,
            output_rx,
            pending: BytesMut::new(),
            finished: false,
            control,
        }
    }

    pub fn control(&self) -> ShellControl {
        self.control.clone()
    }

    fn fill(&mut self) {
        if !self.pending.is_empty() || self.finished {
            return;
        }
        match self.output_rx.try_recv() {
            Ok(data) => self.pending.extend_from_slice(&data),
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => self.finished = true,
        }
    }

    /// Is remote output available right now
    pub fn read_ready(&mut self) -> bool {
        self.fill();
        !self.pending.is_empty()
    }

    /// Take up to `max` bytes of available output without waiting
    pub fn try_read(&mut self, max: usize) -> Option<Bytes> {
        self.fill();
        if self.pending.is_empty() || max == 0 {
            return None;
        }
        let n = max.min(self.pending.len());
        Some(self.pending.split_to(n).freeze())
    }

    /// Queue bytes for the remote shell's stdin
    pub async fn write(&self, data: &[u8]) -> Result<(), SshError> {
        if self.control.is_closed() {
            return Err(SshError::Disconnected);
        }
        self.input_tx
            .send(data.to_vec())
            .await
            .map_err(|_| SshError::Disconnected)
    }

    /// The remote side has ended and every byte of its output has been read
    pub fn has_exited(&mut self) -> bool {
        self.fill();
        self.finished && self.pending.is_empty()
    }

    /// Idempotent close; see [`ShellControl::close`]
    pub fn close(&self) -> bool {
        self.control.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell() -> (RemoteShell, mpsc::Receiver<Vec<u8>>, mpsc::Sender<Vec<u8>>) {
        let (input_tx, input_rx) = mpsc::channel(8);
        let (output_tx, output_rx) = mpsc::channel(8);
        (
            RemoteShell::from_parts(input_tx, output_rx, ShellControl::new()),
            input_rx,
            output_tx,
        )
    }

    #[test]
    fn test_read_is_chunked_and_ordered() {
        let (mut shell, _input, output) = shell();
        assert!(!shell.read_ready());
        assert!(shell.try_read(4).is_none());

        output.try_send(b"hello world".to_vec()).unwrap();
        output.try_send(b"!".to_vec()).unwrap();
        assert!(shell.read_ready());

        let mut collected = Vec::new();
        while let Some(chunk) = shell.try_read(4) {
            assert!(chunk.len() <= 4);
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"hello world!");
    }

    #[test]
    fn test_exit_waits_for_drain() {
        let (mut shell, _input, output) = shell();
        output.try_send(b"bye".to_vec()).unwrap();
        drop(output);

        assert!(!shell.has_exited());
        assert_eq!(shell.try_read(1024).unwrap().as_ref(), b"bye");
        assert!(shell.has_exited());
    }

    #[tokio::test]
    async fn test_write_reaches_input_queue() {
        let (shell, mut input, _output) = shell();
        shell.write(b"ls\n").await.unwrap();
        assert_eq!(input.recv().await.unwrap(), b"ls\n");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (shell, _input, _output) = shell();
        let control = shell.control();
        let token = control.cancellation();

        assert!(shell.close());
        assert!(!shell.close());
        assert!(!control.close());
        assert!(token.is_cancelled());
        assert!(matches!(
            shell.write(b"x").await,
            Err(SshError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_finished_is_separate_from_close() {
        let control = ShellControl::new();
        control.close();
        assert!(!control.is_finished());

        let owner = control.clone();
        tokio::spawn(async move {
            owner.cancellation().cancelled().await;
            owner.mark_finished();
        });
        tokio::time::timeout(std::time::Duration::from_secs(1), control.finished())
            .await
            .unwrap();
        assert!(control.is_finished());
    }
}
