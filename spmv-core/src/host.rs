//! Host device backend: worker-thread command lanes and rayon kernels.
//!
//! A host context owns two FIFO lanes (primary for kernels, transfer for
//! staged copies), mirroring the two queues a GPU device gets. Commands are
//! boxed closures; ordering within a lane is the enqueue order, ordering
//! across lanes goes through explicit [`Completion`](crate::Completion)
//! handles.

use std::sync::mpsc::{channel, Sender};
use std::thread::{self, JoinHandle};

use rayon::prelude::*;

use crate::error::CoreError;
use crate::ops::ELL_SENTINEL;
use crate::scalar::Scalar;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct CommandLane {
    tx: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl CommandLane {
    fn spawn(name: String) -> Result<Self, CoreError> {
        let (tx, rx) = channel::<Job>();
        let worker = thread::Builder::new()
            .name(name)
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            })
            .map_err(|e| CoreError::Init(format!("failed to spawn lane worker: {e}")))?;
        Ok(CommandLane {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    pub(crate) fn enqueue(&self, job: Job) -> Result<(), CoreError> {
        self.tx
            .as_ref()
            .ok_or_else(|| CoreError::QueueClosed("lane already shut down".to_string()))?
            .send(job)
            .map_err(|_| CoreError::QueueClosed("lane worker exited".to_string()))
    }
}

impl Drop for CommandLane {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain remaining jobs and exit.
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

pub(crate) struct HostContext {
    pub(crate) primary: CommandLane,
    pub(crate) transfer: CommandLane,
    threads: usize,
}

impl HostContext {
    pub(crate) fn new(id: u64) -> Result<Self, CoreError> {
        let threads = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        log::info!("initializing host context {id} ({threads} threads)");
        Ok(HostContext {
            primary: CommandLane::spawn(format!("spmv-host-{id}"))?,
            transfer: CommandLane::spawn(format!("spmv-host-{id}-xfer"))?,
            threads,
        })
    }

    /// Launch width: minimum rows per parallel task.
    pub(crate) fn launch_chunk(&self) -> usize {
        (4096 / self.threads.max(1)).max(64)
    }
}

pub(crate) fn spmv_csr<T: Scalar>(
    row_offsets: &[u32],
    cols: &[u32],
    values: &[T],
    x: &[T],
    y: &mut [T],
    alpha: T,
    append: bool,
    chunk: usize,
) {
    y.par_iter_mut()
        .enumerate()
        .with_min_len(chunk)
        .for_each(|(i, yi)| {
            let beg = row_offsets[i] as usize;
            let end = row_offsets[i + 1] as usize;
            let mut sum = T::zero();
            for j in beg..end {
                sum = sum + values[j] * x[cols[j] as usize];
            }
            *yi = if append { *yi + alpha * sum } else { alpha * sum };
        });
}

pub(crate) fn spmv_ell<T: Scalar>(
    width: usize,
    pitch: usize,
    cols: &[u32],
    values: &[T],
    x: &[T],
    y: &mut [T],
    alpha: T,
    append: bool,
    chunk: usize,
) {
    y.par_iter_mut()
        .enumerate()
        .with_min_len(chunk)
        .for_each(|(i, yi)| {
            let mut sum = T::zero();
            for j in 0..width {
                let c = cols[i + j * pitch];
                if c != ELL_SENTINEL {
                    sum = sum + values[i + j * pitch] * x[c as usize];
                }
            }
            *yi = if append { *yi + alpha * sum } else { alpha * sum };
        });
}

pub(crate) fn spmv_ccsr<T: Scalar>(
    patterns: &[u32],
    pattern_offsets: &[u32],
    col_offsets: &[i32],
    values: &[T],
    x: &[T],
    y: &mut [T],
    alpha: T,
    append: bool,
    chunk: usize,
) {
    y.par_iter_mut()
        .enumerate()
        .with_min_len(chunk)
        .for_each(|(i, yi)| {
            let p = patterns[i] as usize;
            let beg = pattern_offsets[p] as usize;
            let end = pattern_offsets[p + 1] as usize;
            let mut sum = T::zero();
            for j in beg..end {
                // Offsets are relative to the row index; validated in range
                // at construction.
                let c = (i as i64 + col_offsets[j] as i64) as usize;
                sum = sum + values[j] * x[c];
            }
            *yi = if append { *yi + alpha * sum } else { alpha * sum };
        });
}

pub(crate) fn gather<T: Scalar>(idx: &[u32], src: &[T], dst: &mut [T]) {
    for (slot, &i) in dst.iter_mut().zip(idx) {
        *slot = src[i as usize];
    }
}
