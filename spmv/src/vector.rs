//! Vectors split across device queues.

use spmv_core::{DeviceBuffer, DeviceQueue, Scalar};

use crate::error::{Error, Result};
use crate::partition::Partition;

/// A dense vector laid out like the row partition of the matrices it
/// multiplies with. Element storage lives on the devices; reads and writes
/// move through the owning queues and follow their command order.
pub struct Vector<T: Scalar> {
    partition: Partition,
    queues: Vec<DeviceQueue>,
    parts: Vec<DeviceBuffer<T>>,
}

impl<T: Scalar> Vector<T> {
    pub(crate) fn zeros(
        queues: &[DeviceQueue],
        partition: Partition,
        label: &str,
    ) -> Result<Vector<T>> {
        let mut parts = Vec::with_capacity(queues.len());
        for (device, queue) in queues.iter().enumerate() {
            parts.push(queue.alloc::<T>(label, partition.size(device))?);
        }
        Ok(Vector {
            partition,
            queues: queues.to_vec(),
            parts,
        })
    }

    pub(crate) fn from_slice(
        queues: &[DeviceQueue],
        partition: Partition,
        label: &str,
        data: &[T],
    ) -> Result<Vector<T>> {
        let mut parts = Vec::with_capacity(queues.len());
        for (device, queue) in queues.iter().enumerate() {
            parts.push(queue.upload(label, &data[partition.range(device)])?);
        }
        Ok(Vector {
            partition,
            queues: queues.to_vec(),
            parts,
        })
    }

    pub fn n(&self) -> usize {
        self.partition.n()
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub(crate) fn part(&self, device: usize) -> &DeviceBuffer<T> {
        &self.parts[device]
    }

    pub(crate) fn queues(&self) -> &[DeviceQueue] {
        &self.queues
    }

    /// Reads the whole vector back, ordered after every product issued
    /// against it so far.
    pub async fn read_to_vec(&self) -> Result<Vec<T>> {
        let mut handles = Vec::with_capacity(self.parts.len());
        for (queue, part) in self.queues.iter().zip(&self.parts) {
            handles.push(queue.read_buffer(part)?);
        }
        let mut out = Vec::with_capacity(self.n());
        for handle in &handles {
            out.extend(handle.wait().await?);
        }
        Ok(out)
    }

    /// Overwrites every element, ordered before any later product.
    pub fn write_from_slice(&mut self, data: &[T]) -> Result<()> {
        if data.len() != self.n() {
            return Err(Error::DimensionMismatch(format!(
                "{} elements written into a vector of dimension {}",
                data.len(),
                self.n()
            )));
        }
        for (device, queue) in self.queues.iter().enumerate() {
            queue.write_buffer(&self.parts[device], &data[self.partition.range(device)])?;
        }
        Ok(())
    }

    /// Device-side copy from a vector with the same layout.
    pub fn copy_from(&mut self, other: &Vector<T>) -> Result<()> {
        self.check_compatible(other)?;
        for (device, queue) in self.queues.iter().enumerate() {
            queue.copy_buffer(&other.parts[device], &self.parts[device])?;
        }
        Ok(())
    }

    pub(crate) fn check_compatible(&self, other: &Vector<T>) -> Result<()> {
        if self.partition != other.partition {
            return Err(Error::DimensionMismatch(
                "vectors use different partitions".to_string(),
            ));
        }
        for (a, b) in self.queues.iter().zip(&other.queues) {
            if !a.same_context(b) {
                return Err(Error::DimensionMismatch(
                    "vectors live on different devices".to_string(),
                ));
            }
        }
        Ok(())
    }
}
