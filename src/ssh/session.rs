//! SSH Session management

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;
use super::shell::{RemoteShell, ShellControl, SHELL_CHANNEL_CAPACITY};

/// Upper bound on waiting for the SSH transport to wind down after disconnect
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Authenticated SSH connection, before a shell is opened
pub struct SshSession {
    handle: Handle<ClientHandler>,
    term: String,
    cols: u32,
    rows: u32,
}

impl SshSession {
    pub fn new(handle: Handle<ClientHandler>, term: String, cols: u32, rows: u32) -> Self {
        Self {
            handle,
            term,
            cols,
            rows,
        }
    }

    /// Request a PTY and start an interactive shell.
    ///
    /// The connection handle and channel move into an owner task; the
    /// returned [`RemoteShell`] talks to it through queues. `label` only
    /// tags log lines.
    pub async fn request_shell(self, label: &str) -> Result<RemoteShell, SshError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::ChannelError(format!("Channel open failed: {}", e)))?;

        debug!("Channel opened, requesting PTY ({} {}x{})", self.term, self.cols, self.rows);

        channel
            .request_pty(false, &self.term, self.cols, self.rows, 0, 0, &[])
            .await
            .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;

        info!("Interactive shell started for {}", label);

        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(SHELL_CHANNEL_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(SHELL_CHANNEL_CAPACITY);
        let control = ShellControl::new();

        tokio::spawn(run_channel_owner(
            self.handle,
            channel,
            input_rx,
            output_tx,
            control.clone(),
            label.to_string(),
        ));

        Ok(RemoteShell::from_parts(input_tx, output_rx, control))
    }
}

/// Push one chunk of remote output, giving up if the shell is closed meanwhile
async fn forward_output(
    output_tx: &mpsc::Sender<Vec<u8>>,
    cancel: &CancellationToken,
    data: &[u8],
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = output_tx.send(data.to_vec()) => sent.is_ok(),
    }
}

/// Sole owner of the SSH handle and shell channel for one session
async fn run_channel_owner(
    handle: Handle<ClientHandler>,
    mut channel: Channel<Msg>,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
    output_tx: mpsc::Sender<Vec<u8>>,
    control: ShellControl,
    label: String,
) {
    debug!("Channel owner started for {}", label);
    let cancel = control.cancellation();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Close requested for {}", label);
                break;
            }

            input = input_rx.recv() => match input {
                Some(data) => {
                    if let Err(e) = channel.data(&data[..]).await {
                        warn!("Failed to send data to SSH channel for {}: {}", label, e);
                        break;
                    }
                }
                None => {
                    debug!("Input queue closed for {}", label);
                    break;
                }
            },

            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if !forward_output(&output_tx, &cancel, &data).await {
                        break;
                    }
                }
                // stderr shares the terminal
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    if !forward_output(&output_tx, &cancel, &data).await {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    info!("Remote shell exited with status {} for {}", exit_status, label);
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    info!("Remote shell killed by signal {:?} for {}", signal_name, label);
                }
                Some(ChannelMsg::Eof) => {
                    info!("SSH channel EOF for {}", label);
                    break;
                }
                Some(ChannelMsg::Close) | None => {
                    info!("SSH channel closed for {}", label);
                    break;
                }
                Some(_) => {}
            },
        }
    }

    // Dropping the output sender is what RemoteShell reports as exit
    drop(output_tx);

    let _ = channel.eof().await;
    let _ = channel.close().await;
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "session closed", "en")
        .await
    {
        debug!("SSH disconnect for {} failed: {}", label, e);
    }

    // The session task exits once the disconnect is written out
    let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
        while !handle.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if flushed.is_err() {
        debug!("SSH transport for {} still open after disconnect", label);
    }

    info!("SSH connection closed for {}", label);
    control.mark_finished();
}
