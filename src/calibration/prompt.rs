//! Operator confirmation gate for live calibration

use std::io::{self, BufRead, Write};

use tracing::{debug, warn};

use crate::error::CalibrationError;

/// Proof that an operator confirmed the target is in place.
///
/// Only an [`OperatorPrompt`] can hand one out.
#[derive(Debug)]
pub struct Confirmation {
    _private: (),
}

impl Confirmation {
    fn granted() -> Self {
        Self { _private: () }
    }
}

/// A synchronous, blocking confirmation step.
pub trait OperatorPrompt: Send + Sync {
    fn await_confirmation(&self, message: &str) -> Result<Confirmation, CalibrationError>;
}

/// Prints the message and waits for one line on stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl OperatorPrompt for TerminalPrompt {
    fn await_confirmation(&self, message: &str) -> Result<Confirmation, CalibrationError> {
        confirm_over(io::stdin().lock(), io::stdout().lock(), message)
    }
}

/// Show `message` on `output`, then wait for one line of `input`. End of
/// input cancels.
fn confirm_over(
    mut input: impl BufRead,
    mut output: impl Write,
    message: &str,
) -> Result<Confirmation, CalibrationError> {
    if let Err(e) = writeln!(output, "{message}").and_then(|()| output.flush()) {
        warn!(error = %e, "Could not show the operator prompt");
    }
    drop(output);

    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(0) => Err(CalibrationError::Cancelled),
        Ok(_) => Ok(Confirmation::granted()),
        Err(e) => {
            warn!(error = %e, "Could not read the operator response");
            Err(CalibrationError::Cancelled)
        }
    }
}

/// Confirmation delivered by another thread through a channel.
///
/// Each prompt is forwarded to the [`ConfirmHandle`], and only a
/// confirmation sent after that prompt releases it. Confirmations sent while
/// nothing was waiting are discarded.
#[derive(Debug)]
pub struct ChannelPrompt {
    rx: flume::Receiver<()>,
    prompts: flume::Sender<String>,
}

/// Operator side of a [`ChannelPrompt`].
#[derive(Debug, Clone)]
pub struct ConfirmHandle {
    tx: flume::Sender<()>,
    prompts: flume::Receiver<String>,
}

impl ConfirmHandle {
    /// Block until the prompt side asks for confirmation. `None` once the
    /// prompt is gone.
    pub fn next_prompt(&self) -> Option<String> {
        self.prompts.recv().ok()
    }

    /// Release the waiting prompt. Returns false if the prompt side is gone.
    pub fn confirm(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

impl ChannelPrompt {
    pub fn new() -> (Self, ConfirmHandle) {
        let (tx, rx) = flume::unbounded();
        let (msg_tx, msg_rx) = flume::unbounded();
        (
            Self {
                rx,
                prompts: msg_tx,
            },
            ConfirmHandle {
                tx,
                prompts: msg_rx,
            },
        )
    }
}

impl OperatorPrompt for ChannelPrompt {
    fn await_confirmation(&self, message: &str) -> Result<Confirmation, CalibrationError> {
        let stale = self.rx.drain().count();
        if stale > 0 {
            debug!(stale, "Discarded confirmations sent before the prompt");
        }
        // A dropped handle also disconnects `rx`, so recv below reports it.
        let _ = self.prompts.send(message.to_string());
        debug!("Waiting for operator confirmation");
        self.rx
            .recv()
            .map(|()| Confirmation::granted())
            .map_err(|_| CalibrationError::Cancelled)
    }
}
