//! Owns the GPU device handle and provides the kernel-dispatch primitive.
//!
//! Splits "pick a capable adapter" from "describe the device we want from
//! it", checking every texture format this crate's nodes might require
//! rather than a single hardcoded one.

use crate::error::{EngineError, ResourceError};
use crate::texture::{Texture, TextureFormat};

/// A compiled fragment kernel: a full-screen-quad shader that a node
/// dispatches once per output pixel. This type only carries the contract
/// the device context needs to run one; kernel shader sources for specific
/// detectors live with their nodes.
pub struct KernelProgram {
    pub(crate) pipeline: wgpu::RenderPipeline,
    pub(crate) bind_group_layout: wgpu::BindGroupLayout,
    /// Number of (texture, sampler) binding pairs the kernel's bind group
    /// layout expects, at bindings `2*i`/`2*i+1`.
    pub(crate) input_count: u32,
}

/// Process-scoped owner of the GPU device handle.
///
/// Created explicitly via [`DeviceContext::request`]; never re-created
/// implicitly. Dropping it flushes pending reads by virtue of dropping the
/// `wgpu::Device`/`Queue`, which is sufficient since wgpu itself guarantees
/// queue submissions complete or are abandoned on drop.
pub struct DeviceContext {
    pub(crate) device: wgpu::Device,
    pub(crate) queue: wgpu::Queue,
}

impl DeviceContext {
    /// Choose an applicable adapter from the ones presented, requiring
    /// support for every texture format the engine may need to render to or
    /// sample from.
    pub fn choose_adapter(
        mut from: impl Iterator<Item = wgpu::Adapter>,
    ) -> Result<wgpu::Adapter, ResourceError> {
        const REQUIRED: [TextureFormat; 2] = [TextureFormat::Rgba8Unorm, TextureFormat::Rgba32Float];

        for adapter in from.by_ref() {
            let supported = REQUIRED.iter().all(|format| {
                let features = adapter.get_texture_format_features(format.to_wgpu());
                features
                    .allowed_usages
                    .contains(wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::RENDER_ATTACHMENT)
            });

            if supported {
                return Ok(adapter);
            }
        }

        Err(ResourceError::NoSuitableAdapter)
    }

    /// Request a device and queue from `adapter` and take ownership of them.
    pub fn request(adapter: &wgpu::Adapter) -> Result<DeviceContext, EngineError> {
        let descriptor = wgpu::DeviceDescriptor {
            label: Some("kinegraph device"),
            required_features: wgpu::Features::PUSH_CONSTANTS,
            required_limits: wgpu::Limits {
                max_push_constant_size: 64,
                ..wgpu::Limits::default()
            },
            ..Default::default()
        };

        let (device, queue) = pollster::block_on(adapter.request_device(&descriptor, None))
            .map_err(|err| ResourceError::Allocation(err.to_string()))?;

        log::debug!("device context created: {:?}", adapter.get_info());
        Ok(DeviceContext { device, queue })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Upload `bytes` (row-major, tightly packed) into `texture` wholesale.
    /// Used by host-computed keypoint nodes to write back a re-encoded dense
    /// buffer, and by [`crate::media::ImageMedia`] for frame ingestion.
    pub fn write_texture(&self, texture: &Texture, bytes: &[u8]) {
        let size = texture.size();
        let bytes_per_row = size.width * texture.format().bytes_per_texel();
        self.queue.write_texture(
            texture.handle.as_image_copy(),
            bytes,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(size.height.max(1)),
            },
            wgpu::Extent3d {
                width: size.width.max(1),
                height: size.height.max(1),
                depth_or_array_layers: 1,
            },
        );
    }

    /// Compile a fragment kernel from WGSL source exposing a `vs_main`
    /// full-screen-triangle vertex stage and an `fs_main` fragment stage.
    /// `input_count` input textures are bound as `(texture_2d<f32>, sampler)`
    /// pairs at consecutive bindings starting at 0; `push_constant_bytes` is
    /// the size of the uniform block `fs_main` reads via push constants.
    ///
    /// Callers building detector/tracker nodes supply their own kernel
    /// source here; this crate only promises the binding convention above.
    pub fn compile_kernel(
        &self,
        label: &str,
        wgsl_source: &str,
        input_count: u32,
        output_format: TextureFormat,
        push_constant_bytes: u32,
    ) -> Result<KernelProgram, EngineError> {
        let shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(wgsl_source.into()),
        });

        let mut entries = Vec::with_capacity(input_count as usize * 2);
        for i in 0..input_count {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: i * 2,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            });
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: i * 2 + 1,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            });
        }

        let bind_group_layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(label),
            entries: &entries,
        });

        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[wgpu::PushConstantRange {
                stages: wgpu::ShaderStages::FRAGMENT,
                range: 0..push_constant_bytes,
            }],
        });

        let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(label),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: output_format.to_wgpu(),
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        Ok(KernelProgram {
            pipeline,
            bind_group_layout,
            input_count,
        })
    }

    /// Build a bind group for `program` sampling `textures` in order, each
    /// with a default filtering sampler.
    pub fn build_sampled_bind_group(
        &self,
        program: &KernelProgram,
        textures: &[&Texture],
    ) -> Result<wgpu::BindGroup, EngineError> {
        if textures.len() as u32 != program.input_count {
            return Err(EngineError::NotSupported(format!(
                "kernel expects {} input textures, got {}",
                program.input_count,
                textures.len()
            )));
        }

        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor::default());
        let mut entries = Vec::with_capacity(textures.len() * 2);
        for (i, texture) in textures.iter().enumerate() {
            let i = i as u32;
            entries.push(wgpu::BindGroupEntry {
                binding: i * 2,
                resource: wgpu::BindingResource::TextureView(texture.wgpu_view()),
            });
            entries.push(wgpu::BindGroupEntry {
                binding: i * 2 + 1,
                resource: wgpu::BindingResource::Sampler(&sampler),
            });
        }

        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &program.bind_group_layout,
            entries: &entries,
        }))
    }

    /// Dispatch a kernel: bind its uniforms, set `output` as the render
    /// target, and draw a screen-filling primitive so the fragment program
    /// executes once per output pixel.
    ///
    /// Dispatches submitted on this context's single queue execute in
    /// submission order, so a dispatch reading `output` after this call
    /// observes this write.
    pub fn run_kernel(
        &self,
        program: &KernelProgram,
        output: &Texture,
        bind_group: &wgpu::BindGroup,
        uniforms: &[u8],
    ) {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: None,
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: output.wgpu_view(),
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            pass.set_pipeline(&program.pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            if !uniforms.is_empty() {
                pass.set_push_constants(wgpu::ShaderStages::FRAGMENT, 0, uniforms);
            }
            pass.draw(0..3, 0..1);
        }

        log::trace!("run_kernel dispatch, output size {:?}", output.size());
        self.queue.submit(Some(encoder.finish()));
    }
}
