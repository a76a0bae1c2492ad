use tokio::sync::broadcast::{self, error::RecvError};

/// A handle which can be used to stop a running scheduler.
/// Clones are connected: shutting down any of them is seen by all.
#[derive(Debug)]
pub struct Shutdown {
    notify: broadcast::Sender<ExitStatus>,
    /// Subscribed when the handle is created, so a status sent before anyone
    /// waits is not lost.
    receiver: broadcast::Receiver<ExitStatus>,
    /// Keeps track of the last status received so `wait_for_shutdown` can be
    /// called more than once.
    last_status: Option<ExitStatus>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (notify, receiver) = broadcast::channel(1);
        Self {
            notify,
            receiver,
            last_status: None,
        }
    }

    /// Sends `ExitStatus::Exited` to every connected handle.
    pub fn shut_down(&self) {
        self.shut_down_with_status(ExitStatus::Exited)
    }

    pub fn shut_down_with_status(&self, status: ExitStatus) {
        if let Err(e) = self.notify.send(status) {
            tracing::error!("Failed to initiate shutdown: {}", e);
        }
    }

    /// Returns the status if a shutdown has been requested, without waiting.
    pub fn poll_status(&mut self) -> Option<ExitStatus> {
        if self.last_status.is_none() {
            loop {
                match self.receiver.try_recv() {
                    Ok(status) => {
                        self.last_status = Some(status);
                        break;
                    }
                    Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
        }
        self.last_status
    }

    /// Waits to receive a shutdown status.
    pub async fn wait_for_shutdown(&mut self) -> ExitStatus {
        if let Some(status) = self.last_status {
            return status;
        }
        loop {
            match self.receiver.recv().await {
                Ok(status) => {
                    self.last_status = Some(status);
                    return status;
                }
                // We hold a sender, so the channel cannot close.
                Err(RecvError::Closed) => return ExitStatus::Exited,
                Err(RecvError::Lagged(_)) => (),
            }
        }
    }
}

impl Clone for Shutdown {
    fn clone(&self) -> Self {
        Self {
            notify: self.notify.clone(),
            receiver: self.notify.subscribe(),
            last_status: self.last_status,
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a scheduler run ended.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ExitStatus {
    Status(u32),
    Exited,
    /// The run reached its tick limit.
    TickLimit,
}
