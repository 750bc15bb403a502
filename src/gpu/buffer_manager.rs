//! Storage buffer creation, resizing and synchronous readback

use crate::error::EngineError;
use bytemuck::Pod;
use std::sync::Arc;
use thiserror::Error;
use wgpu::util::DeviceExt;

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("No GPU adapter available")]
    AdapterNotFound,

    #[error("Device request failed: {0}")]
    DeviceRequest(String),

    #[error("Buffer {label} size mismatch: expected {expected} bytes, got {actual} bytes")]
    SizeMismatch {
        label: String,
        expected: u64,
        actual: u64,
    },

    #[error("Buffer readback failed: {0}")]
    Readback(String),
}

impl From<GpuError> for EngineError {
    fn from(error: GpuError) -> Self {
        match error {
            GpuError::AdapterNotFound => EngineError::DeviceNotFound,
            GpuError::DeviceRequest(error) => EngineError::GpuOperationFailed {
                operation: "request_device".to_string(),
                error,
            },
            GpuError::SizeMismatch { .. } => EngineError::BufferError {
                operation: "validate".to_string(),
                error: error.to_string(),
            },
            GpuError::Readback(error) => EngineError::BufferError {
                operation: "readback".to_string(),
                error,
            },
        }
    }
}

/// Usage flags for buffers written by compute passes and read back on demand
pub const STORAGE_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_DST)
    .union(wgpu::BufferUsages::COPY_SRC);

/// Creates, resizes and reads back buffers on one device
pub struct GpuBufferManager {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
}

impl GpuBufferManager {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self { device, queue }
    }

    /// Zero-initialised storage buffer. Sizes are padded to at least 4 bytes.
    pub fn create_storage(&self, label: &str, size: u64, extra: wgpu::BufferUsages) -> wgpu::Buffer {
        log::debug!("[GpuBufferManager] Creating storage buffer '{}' ({} bytes)", label, size);
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: padded_size(size),
            usage: STORAGE_USAGE | extra,
            mapped_at_creation: false,
        })
    }

    /// Storage buffer initialised from a slice
    pub fn create_storage_init<T: Pod>(&self, label: &str, data: &[T]) -> wgpu::Buffer {
        if data.is_empty() {
            return self.create_storage(label, 4, wgpu::BufferUsages::empty());
        }
        self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(data),
            usage: STORAGE_USAGE,
        })
    }

    /// Uniform buffer holding one value
    pub fn create_uniform<T: Pod>(&self, label: &str, data: &T) -> wgpu::Buffer {
        self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::bytes_of(data),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        })
    }

    /// Reallocate `slot` when its size differs from `size`. Returns true when a
    /// new buffer was created.
    pub fn ensure_storage(
        &self,
        slot: &mut Option<wgpu::Buffer>,
        label: &str,
        size: u64,
        extra: wgpu::BufferUsages,
    ) -> bool {
        let wanted = padded_size(size);
        match slot {
            Some(buffer) if buffer.size() == wanted => false,
            _ => {
                *slot = Some(self.create_storage(label, size, extra));
                true
            }
        }
    }

    /// Upload a slice, checking that it fits the destination
    pub fn write<T: Pod>(&self, label: &str, buffer: &wgpu::Buffer, data: &[T]) -> Result<(), GpuError> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() as u64 > buffer.size() {
            return Err(GpuError::SizeMismatch {
                label: label.to_string(),
                expected: buffer.size(),
                actual: bytes.len() as u64,
            });
        }
        if !bytes.is_empty() {
            self.queue.write_buffer(buffer, 0, bytes);
        }
        Ok(())
    }

    /// Copy `count` elements of `src` into a staging buffer and wait for them.
    ///
    /// This stalls the calling thread until the queue drains.
    pub fn read<T: Pod>(&self, src: &wgpu::Buffer, count: usize) -> Result<Vec<T>, GpuError> {
        let size = (count * std::mem::size_of::<T>()) as u64;
        if size == 0 {
            return Ok(Vec::new());
        }
        if size > src.size() {
            return Err(GpuError::SizeMismatch {
                label: "readback".to_string(),
                expected: src.size(),
                actual: size,
            });
        }

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Readback Encoder"),
        });
        encoder.copy_buffer_to_buffer(src, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let buffer_slice = staging.slice(..);
        let (tx, rx) = flume::bounded(1);
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| GpuError::Readback(e.to_string()))?
            .map_err(|e| GpuError::Readback(e.to_string()))?;

        let data = buffer_slice.get_mapped_range();
        let values = bytemuck::cast_slice::<u8, T>(&data).to_vec();

        // Drop the mapped range before unmapping
        drop(data);
        staging.unmap();

        Ok(values)
    }
}

/// Buffers must be non-empty and 4-byte aligned
pub fn padded_size(size: u64) -> u64 {
    size.max(4).div_ceil(4) * 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_size() {
        assert_eq!(padded_size(0), 4);
        assert_eq!(padded_size(5), 8);
        assert_eq!(padded_size(96), 96);
    }

    #[test]
    fn test_gpu_error_converts() {
        let err: EngineError = GpuError::AdapterNotFound.into();
        assert_eq!(err, EngineError::DeviceNotFound);
    }
}
