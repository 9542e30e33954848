//! GPU texture domain types and the texture pool.
//!
//! A [`Texture`] is an opaque GPU-resident 2D image. Textures are owned by
//! the [`TexturePool`]; nodes borrow them for the duration of a single run
//! and return them through [`TexturePool::release_scratch`] once the
//! scheduler determines all consumers have read them.

use std::collections::HashMap;

use crate::error::ResourceError;
use crate::value::Size;

/// Pixel format of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// 8 bits per channel, four channels. Used for images and the packed
    /// keypoint wire format.
    Rgba8Unorm,
    /// 32-bit float per channel, four channels. Used for intermediate
    /// results that need headroom beyond `[0, 1]`.
    Rgba32Float,
}

impl TextureFormat {
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm => 4,
            TextureFormat::Rgba32Float => 16,
        }
    }

    pub(crate) fn to_wgpu(self) -> wgpu::TextureFormat {
        match self {
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        }
    }
}

/// Describes a texture's shape independent of any particular GPU allocation.
/// Used both to request a scratch texture from the pool and as the pool's
/// free-list key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    pub size: Size,
    pub format: TextureFormat,
    /// Mip level count; the engine never generates mip chains itself but
    /// preserves this for nodes that declare a pre-mipped input.
    pub mip_level_count: u32,
}

impl TextureDescriptor {
    pub fn new(size: Size, format: TextureFormat) -> Self {
        TextureDescriptor {
            size,
            format,
            mip_level_count: 1,
        }
    }

    pub(crate) fn to_wgpu(self, usage: wgpu::TextureUsages) -> wgpu::TextureDescriptor<'static> {
        wgpu::TextureDescriptor {
            label: None,
            size: wgpu::Extent3d {
                width: self.size.width.max(1),
                height: self.size.height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: self.mip_level_count.max(1),
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: self.format.to_wgpu(),
            usage,
            view_formats: &[],
        }
    }
}

/// An opaque handle identifying one GPU texture owned by the pool.
///
/// Invariant: a texture may be written by at most one kernel dispatch at a
/// time; the scheduler enforces this by only handing a handle to the one
/// node currently running.
#[derive(Debug)]
pub struct Texture {
    pub(crate) descriptor: TextureDescriptor,
    pub(crate) handle: wgpu::Texture,
    pub(crate) view: wgpu::TextureView,
}

impl Texture {
    pub fn descriptor(&self) -> TextureDescriptor {
        self.descriptor
    }

    pub fn size(&self) -> Size {
        self.descriptor.size
    }

    pub fn format(&self) -> TextureFormat {
        self.descriptor.format
    }

    pub(crate) fn wgpu_view(&self) -> &wgpu::TextureView {
        &self.view
    }
}

/// A handle identifying a scratch texture that has been lent out by the pool
/// for the duration of the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScratchHandle(usize);

/// Allocates, recycles, and tracks lifetimes of 2D textures used as
/// intermediate buffers between nodes.
///
/// Free lists are keyed by `(width, height, format, mip_level_count)` (i.e.
/// by [`TextureDescriptor`]) so that `alloc_scratch` can return an existing
/// free texture of exactly the right shape rather than reallocating, the
/// same per-descriptor free-list strategy the teacher's `pool::Cache` uses
/// for textures, buffers, shaders, and pipelines.
pub struct TexturePool {
    free: HashMap<TextureDescriptor, Vec<Texture>>,
    in_use: HashMap<ScratchHandle, Texture>,
    next_handle: usize,
    capacity: Option<usize>,
    total_allocated: usize,
}

impl TexturePool {
    pub fn new() -> Self {
        TexturePool {
            free: HashMap::new(),
            in_use: HashMap::new(),
            next_handle: 0,
            capacity: None,
            total_allocated: 0,
        }
    }

    /// Bound the number of textures the pool will ever allocate concurrently
    /// (free + in-use). Exceeding it yields `ResourceError::PoolExhausted`.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut pool = Self::new();
        pool.capacity = Some(capacity);
        pool
    }

    /// Number of textures currently sitting in a free list, available for
    /// immediate reuse.
    pub fn free_count(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }

    /// Number of textures currently lent out to a running node.
    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    /// Acquire a scratch texture matching `descriptor`, reusing a free one of
    /// the exact same shape if available.
    pub fn alloc_scratch(
        &mut self,
        device: &wgpu::Device,
        descriptor: TextureDescriptor,
    ) -> Result<ScratchHandle, ResourceError> {
        let texture = if let Some(free_list) = self.free.get_mut(&descriptor) {
            free_list.pop()
        } else {
            None
        };

        let texture = match texture {
            Some(texture) => texture,
            None => {
                if let Some(capacity) = self.capacity {
                    if self.total_allocated >= capacity {
                        return Err(ResourceError::PoolExhausted { capacity });
                    }
                }
                let handle = device.create_texture(&descriptor.to_wgpu(
                    wgpu::TextureUsages::TEXTURE_BINDING
                        | wgpu::TextureUsages::RENDER_ATTACHMENT
                        | wgpu::TextureUsages::COPY_SRC
                        | wgpu::TextureUsages::COPY_DST,
                ));
                let view = handle.create_view(&wgpu::TextureViewDescriptor::default());
                self.total_allocated += 1;
                Texture {
                    descriptor,
                    handle,
                    view,
                }
            }
        };

        let handle = ScratchHandle(self.next_handle);
        self.next_handle += 1;
        self.in_use.insert(handle, texture);
        log::trace!("alloc_scratch {:?} -> {:?}", descriptor, handle);
        Ok(handle)
    }

    /// Return a previously acquired scratch texture to the free list.
    ///
    /// A handle that is not currently in use is a no-op: it is valid for a
    /// message to be released more than once when multiple downstream nodes
    /// shared the final reference.
    pub fn release_scratch(&mut self, handle: ScratchHandle) {
        if let Some(texture) = self.in_use.remove(&handle) {
            log::trace!("release_scratch {:?}", handle);
            self.free.entry(texture.descriptor).or_default().push(texture);
        }
    }

    pub fn get(&self, handle: ScratchHandle) -> Option<&Texture> {
        self.in_use.get(&handle)
    }

    /// Release every in-use texture back to the free lists.
    ///
    /// Used by the scheduler when a run ends (normally or with an error) and
    /// by pipeline teardown, guaranteeing no scratch texture is ever leaked
    /// across a run boundary.
    pub fn release_all(&mut self) {
        let handles: Vec<_> = self.in_use.keys().copied().collect();
        for handle in handles {
            self.release_scratch(handle);
        }
    }
}

impl Default for TexturePool {
    fn default() -> Self {
        Self::new()
    }
}
