//! Non-blocking read-back of a texture's pixels into a host byte buffer.
//!
//! The reader owns a small ring of staging buffers. Scheduling a read copies
//! the texture into the next staging buffer and returns a future
//! that resolves when the copy completes. If the owning pipeline is released
//! while a read is outstanding, the future resolves to `Cancelled` instead.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::device::DeviceContext;
use crate::error::EngineError;
use crate::texture::Texture;

/// Outcome of an in-flight read, shared between the future and the
/// `map_async` callback that wgpu invokes on completion.
enum ReadState {
    Pending,
    Ready(Vec<u8>),
    Failed(EngineError),
    Cancelled,
}

struct Shared {
    state: ReadState,
    waker: Option<Waker>,
}

/// A future yielding the row-major RGBA byte contents of a texture.
pub struct ReadPixelsFuture {
    shared: Rc<RefCell<Shared>>,
}

impl Future for ReadPixelsFuture {
    type Output = Result<Vec<u8>, EngineError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared = self.shared.borrow_mut();
        match std::mem::replace(&mut shared.state, ReadState::Pending) {
            ReadState::Pending => {
                shared.waker = Some(cx.waker().clone());
                Poll::Pending
            }
            ReadState::Ready(bytes) => Poll::Ready(Ok(bytes)),
            ReadState::Failed(err) => Poll::Ready(Err(err)),
            ReadState::Cancelled => Poll::Ready(Err(EngineError::Cancelled)),
        }
    }
}

/// A handle retained by the pipeline so it can cancel outstanding reads on
/// teardown without holding on to the future itself.
pub struct CancelToken {
    shared: Rc<RefCell<Shared>>,
}

impl CancelToken {
    pub fn cancel(&self) {
        let mut shared = self.shared.borrow_mut();
        if matches!(shared.state, ReadState::Pending) {
            shared.state = ReadState::Cancelled;
            if let Some(waker) = shared.waker.take() {
                waker.wake();
            }
        }
    }
}

/// A small ring of host-visible staging buffers used to pipeline read-backs
/// without waiting for the previous one to be mapped and consumed.
pub struct StagingRing {
    capacity: usize,
    outstanding: Vec<CancelToken>,
}

impl StagingRing {
    pub fn new(capacity: usize) -> Self {
        StagingRing {
            capacity: capacity.max(1),
            outstanding: Vec::new(),
        }
    }

    /// Schedule a device-to-host copy of `texture`'s pixels.
    ///
    /// The returned future resolves once the copy completes; a read
    /// scheduled after a write observes that write, since both are
    /// submitted to the same device queue in program order.
    pub fn read_pixels(&mut self, context: &DeviceContext, texture: &Texture) -> ReadPixelsFuture {
        if self.outstanding.len() >= self.capacity {
            self.outstanding.remove(0);
        }

        let shared = Rc::new(RefCell::new(Shared {
            state: ReadState::Pending,
            waker: None,
        }));

        self.outstanding.push(CancelToken {
            shared: Rc::clone(&shared),
        });

        let size = texture.size();
        let bytes_per_row = align_to(size.width * texture.format().bytes_per_texel(), 256);
        let buffer_size = u64::from(bytes_per_row) * u64::from(size.height.max(1));

        let staging = context.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some("kinegraph staging"),
            size: buffer_size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = context
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        encoder.copy_texture_to_buffer(
            texture.handle.as_image_copy(),
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row),
                    rows_per_image: Some(size.height.max(1)),
                },
            },
            wgpu::Extent3d {
                width: size.width.max(1),
                height: size.height.max(1),
                depth_or_array_layers: 1,
            },
        );
        context.queue().submit(Some(encoder.finish()));

        let staging = Rc::new(staging);
        let callback_staging = Rc::clone(&staging);
        let callback_shared = Rc::clone(&shared);
        let width = size.width;
        let height = size.height;
        let bytes_per_texel = texture.format().bytes_per_texel();

        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let mut shared = callback_shared.borrow_mut();
                if !matches!(shared.state, ReadState::Pending) {
                    // Cancelled or already resolved before the callback fired.
                    return;
                }

                shared.state = match result {
                    Ok(()) => {
                        let view = callback_staging.slice(..).get_mapped_range();
                        let row_bytes = (width * bytes_per_texel) as usize;
                        let mut packed = Vec::with_capacity(row_bytes * height as usize);
                        for row in 0..height as usize {
                            let start = row * bytes_per_row as usize;
                            packed.extend_from_slice(&view[start..start + row_bytes]);
                        }
                        drop(view);
                        callback_staging.unmap();
                        ReadState::Ready(packed)
                    }
                    Err(err) => ReadState::Failed(crate::error::EngineError::Resource(
                        crate::error::ResourceError::Allocation(err.to_string()),
                    )),
                };

                if let Some(waker) = shared.waker.take() {
                    waker.wake();
                }
            });

        ReadPixelsFuture { shared }
    }

    /// Cancel every outstanding read, resolving them with `Cancelled`. Called
    /// when the owning pipeline is released.
    pub fn cancel_all(&mut self) {
        for token in self.outstanding.drain(..) {
            token.cancel();
        }
    }
}

fn align_to(value: u32, alignment: u32) -> u32 {
    let remainder = value % alignment;
    if remainder == 0 {
        value
    } else {
        value + (alignment - remainder)
    }
}

impl Default for StagingRing {
    fn default() -> Self {
        Self::new(3)
    }
}
