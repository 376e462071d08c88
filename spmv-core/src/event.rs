//! Completion handles for enqueued device commands.
//!
//! Every asynchronous step hands back a handle instead of synchronizing in
//! place: a kernel or upload finishes into a [`Completion`], a readback
//! finishes into a [`TransferHandle`] carrying the data. Handles are cheap
//! to clone and can be awaited by several consumers, which is what lets the
//! exchange coordinator wait on exactly the transfers a device needs.

use std::sync::Arc;

use bytemuck::Pod;
use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};

use crate::context::ComputeContext;
use crate::error::CoreError;

type SharedReceiver<T> = Shared<oneshot::Receiver<Result<T, CoreError>>>;

/// Completion of a single enqueued command (kernel launch or upload).
///
/// GPU commands on one queue are ordered by submission, so their handles are
/// created already complete; host lanes signal through the channel.
#[derive(Clone)]
pub struct Completion {
    rx: Option<SharedReceiver<()>>,
}

impl Completion {
    /// A handle that is already complete.
    pub(crate) fn ready() -> Self {
        Completion { rx: None }
    }

    pub(crate) fn pending() -> (CompletionSender, Self) {
        let (tx, rx) = oneshot::channel();
        (
            CompletionSender { tx },
            Completion {
                rx: Some(rx.shared()),
            },
        )
    }

    /// Waits for the command to finish.
    pub async fn wait(&self) -> Result<(), CoreError> {
        match &self.rx {
            None => Ok(()),
            Some(shared) => match shared.clone().await {
                Ok(result) => result,
                Err(_canceled) => Err(CoreError::QueueClosed(
                    "command dropped before completing".to_string(),
                )),
            },
        }
    }

    /// Blocking wait, for use inside worker lanes.
    pub(crate) fn wait_blocking(&self) -> Result<(), CoreError> {
        pollster::block_on(self.wait())
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("ready", &self.rx.is_none())
            .finish()
    }
}

pub(crate) struct CompletionSender {
    tx: oneshot::Sender<Result<(), CoreError>>,
}

impl CompletionSender {
    pub(crate) fn finish(self, result: Result<(), CoreError>) {
        // The receiver side may already be gone; nothing to do then.
        let _ = self.tx.send(result);
    }
}

/// Completion of a device-to-host readback, carrying the data.
///
/// `wait` may be called by several consumers; each gets its own copy of the
/// payload. On GPU contexts waiting drives the device poll loop so the
/// underlying map can resolve.
#[derive(Clone)]
pub struct TransferHandle<T: Pod> {
    inner: TransferInner<T>,
}

#[derive(Clone)]
enum TransferInner<T: Pod> {
    Ready(Vec<T>),
    Pending {
        rx: SharedReceiver<Vec<T>>,
        ctx: Arc<ComputeContext>,
    },
}

impl<T: Pod + Send> TransferHandle<T> {
    pub(crate) fn ready(data: Vec<T>) -> Self {
        TransferHandle {
            inner: TransferInner::Ready(data),
        }
    }

    pub(crate) fn pending(ctx: Arc<ComputeContext>) -> (TransferSender<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (TransferSender { tx }, Self::from_receiver(rx, ctx))
    }

    /// Wraps a receiver whose sender is already wired to the device, e.g. a
    /// wgpu map callback.
    pub(crate) fn from_receiver(
        rx: oneshot::Receiver<Result<Vec<T>, CoreError>>,
        ctx: Arc<ComputeContext>,
    ) -> Self {
        TransferHandle {
            inner: TransferInner::Pending {
                rx: rx.shared(),
                ctx,
            },
        }
    }

    /// Waits for the transfer and returns the data.
    pub async fn wait(&self) -> Result<Vec<T>, CoreError> {
        match &self.inner {
            TransferInner::Ready(data) => Ok(data.clone()),
            TransferInner::Pending { rx, ctx } => {
                ctx.drive();
                match rx.clone().await {
                    Ok(result) => result,
                    Err(_canceled) => Err(CoreError::QueueClosed(
                        "transfer dropped before completing".to_string(),
                    )),
                }
            }
        }
    }
}

impl<T: Pod> std::fmt::Debug for TransferHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.inner {
            TransferInner::Ready(data) => format!("ready({} elems)", data.len()),
            TransferInner::Pending { .. } => "pending".to_string(),
        };
        f.debug_struct("TransferHandle").field("state", &state).finish()
    }
}

pub(crate) struct TransferSender<T> {
    tx: oneshot::Sender<Result<Vec<T>, CoreError>>,
}

impl<T> TransferSender<T> {
    pub(crate) fn finish(self, result: Result<Vec<T>, CoreError>) {
        let _ = self.tx.send(result);
    }
}
