//! GPU device access and buffer helpers
//!
//! The fusion compute backend only needs a device, a queue and a handful of
//! storage-buffer utilities. Device acquisition mirrors the renderer's
//! recovery strategy: try a few power preferences before giving up, and let
//! the caller fall back to the CPU kernels when no adapter exists.

pub mod buffer_manager;
pub mod dispatch;

pub use buffer_manager::{GpuBufferManager, GpuError};
pub use dispatch::{calculate_workgroups, workgroups_2d, workgroups_3d};

use std::sync::Arc;

/// Shared device and queue handles
#[derive(Clone)]
pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub adapter_info: Option<wgpu::AdapterInfo>,
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext")
            .field("adapter", &self.adapter_info.as_ref().map(|info| info.name.as_str()))
            .finish()
    }
}

impl GpuContext {
    /// Wrap an existing device owned by the host application
    pub fn from_parts(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self {
            device,
            queue,
            adapter_info: None,
        }
    }

    /// Acquire a headless compute device, blocking the calling thread
    pub fn new_blocking() -> Result<Self, GpuError> {
        pollster::block_on(Self::request())
    }

    /// Acquire a headless compute device
    pub async fn request() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let power_preferences = [
            wgpu::PowerPreference::HighPerformance,
            wgpu::PowerPreference::LowPower,
        ];

        let mut adapter = None;
        for power_pref in power_preferences {
            adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: power_pref,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await;
            if adapter.is_some() {
                log::debug!("[GpuContext] Adapter found with {:?} preference", power_pref);
                break;
            }
        }

        let adapter = adapter.ok_or(GpuError::AdapterNotFound)?;
        let adapter_info = adapter.get_info();
        log::info!(
            "[GpuContext] Using adapter '{}' ({:?})",
            adapter_info.name,
            adapter_info.backend
        );

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Fusion Compute Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                },
                None,
            )
            .await
            .map_err(|e| GpuError::DeviceRequest(e.to_string()))?;

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info: Some(adapter_info),
        })
    }

    /// Buffer manager bound to this device
    pub fn buffers(&self) -> GpuBufferManager {
        GpuBufferManager::new(self.device.clone(), self.queue.clone())
    }
}
