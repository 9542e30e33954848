//! Node kinds and the capability set every node implements.
//!
//! A tagged enumeration of node kinds sits behind a small capability set,
//! not a deep inheritance chain. [`NodeKind`] is that tag; [`NodeBehavior`]
//! is the capability set (`declare_ports`/`init`/`run`/`release`), stored
//! as a trait object per node rather than matching on a type tag to find
//! the right code path.

use std::collections::HashMap;
use std::rc::Rc;
use std::cell::RefCell;

use crate::config::{ClipperConfig, DetectorConfig, MixerConfig, TrackerConfig};
use crate::device::{DeviceContext, KernelProgram};
use crate::error::{EngineError, IllegalOperationError, ResourceError};
use crate::keypoint::{self, CandidateKeypoint, KeypointLayout};
use crate::media::Media;
use crate::port::{Message, PortSpec};
use crate::texture::{ScratchHandle, Texture, TextureDescriptor, TextureFormat, TexturePool};
use crate::value::{Keypoint, Size};

/// Identifies which of the engine's node kinds a [`crate::pipeline::Node`]
/// is, for diagnostics and for `Pipeline` validation rules that care about
/// kind (e.g. a sink must structurally have no downstream consumers,
/// regardless of kind, but portals additionally publish to a
/// [`PortalRegistry`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    ImageSource,
    ImageSink,
    KeypointSink,
    ImageMixer,
    FastDetector,
    HarrisDetector,
    OrbDescriptor,
    LkTracker,
    KeypointClipper,
    KeypointBuffer,
    KeypointMixer,
    KeypointMultiplexer,
    KeypointTransformer,
    SubpixelRefiner,
    KeypointPortalSource,
    KeypointPortalSink,
    ImagePortalSource,
    ImagePortalSink,
}

/// Everything a node needs to do its one unit of work for a run: the device,
/// the pool it borrows scratch textures from, and its resolved input
/// messages (one per declared input port, already validated by
/// [`crate::pipeline::Pipeline::init`]).
pub struct NodeContext<'a> {
    pub device: &'a DeviceContext,
    pub pool: &'a mut TexturePool,
    pub inputs: &'a HashMap<String, Message>,
}

impl<'a> NodeContext<'a> {
    pub fn input(&self, port: &str) -> Option<&Message> {
        self.inputs.get(port)
    }
}

/// The capability set every node kind implements.
pub trait NodeBehavior {
    fn declare_ports(&self) -> Vec<PortSpec>;

    /// Called once, after construction and before the first `run`.
    fn init(&mut self, _device: &DeviceContext) -> Result<(), EngineError> {
        Ok(())
    }

    /// Produce this run's output messages from `ctx.inputs`.
    fn run(&mut self, ctx: &mut NodeContext<'_>) -> Result<HashMap<String, Message>, EngineError>;

    /// Called once when the node is removed from a pipeline.
    fn release(&mut self, _pool: &mut TexturePool) {}
}

fn image_descriptor(size: Size) -> TextureDescriptor {
    TextureDescriptor::new(size, TextureFormat::Rgba8Unorm)
}

fn require_image(message: &Message, node: &str, port: &str) -> Result<(ScratchHandle, bool), EngineError> {
    match message {
        Message::Image { texture, greyscale } => Ok((*texture, *greyscale)),
        _ => Err(IllegalOperationError::WrongMessageKind {
            node: node.to_string(),
            port: port.to_string(),
        }
        .into()),
    }
}

fn require_keypoints(
    message: &Message,
    node: &str,
    port: &str,
) -> Result<(ScratchHandle, usize, usize, u32), EngineError> {
    match message {
        Message::Keypoint {
            encoded_keypoints,
            descriptor_size,
            extra_size,
            encoder_length,
        } => Ok((*encoded_keypoints, *descriptor_size, *extra_size, *encoder_length)),
        _ => Err(IllegalOperationError::WrongMessageKind {
            node: node.to_string(),
            port: port.to_string(),
        }
        .into()),
    }
}

/// Read back and decode a keypoint message synchronously, blocking the
/// current `run()` call on `pollster::block_on` rather than suspending the
/// scheduler across steps.
fn decode_keypoints_blocking(
    ctx: &mut NodeContext<'_>,
    handle: ScratchHandle,
    layout: &KeypointLayout,
    fix_resolution: u32,
) -> Result<Vec<Keypoint>, EngineError> {
    let texture = ctx
        .pool
        .get(handle)
        .ok_or_else(|| EngineError::Resource(ResourceError::Allocation("stale scratch handle".to_string())))?;
    let mut staging = crate::reader::StagingRing::new(1);
    let future = staging.read_pixels(ctx.device, texture);
    ctx.device.device().poll(wgpu::Maintain::Wait);
    let bytes = pollster::block_on(future)?;
    Ok(keypoint::decode_dense(&bytes, layout, fix_resolution))
}

/// Re-encodes an already-decoded keypoint list into a fresh scratch texture,
/// directly by list index (see [`keypoint::encode_keypoints_dense`]) rather
/// than rounding each keypoint back down to a raster cell and re-scanning
/// it as a [`keypoint::SparseRaster`] would.
fn encode_keypoints_to_new_texture(
    ctx: &mut NodeContext<'_>,
    keypoints: &[Keypoint],
    layout: &KeypointLayout,
    fix_resolution: u32,
) -> Result<ScratchHandle, EngineError> {
    let bytes = keypoint::encode_keypoints_dense(keypoints, layout, fix_resolution);
    let descriptor = TextureDescriptor::new(Size::new(layout.encoder_length, layout.encoder_length), TextureFormat::Rgba8Unorm);
    let handle = ctx.pool.alloc_scratch(ctx.device.device(), descriptor)?;
    let texture = ctx.pool.get(handle).expect("just allocated");
    ctx.device.write_texture(texture, &bytes);
    Ok(handle)
}

/// A source node: uploads a caller-supplied [`Media`] frame into a freshly
/// acquired scratch texture and publishes it.
pub struct ImageSourceNode {
    media: Box<dyn Media>,
    greyscale: bool,
}

impl ImageSourceNode {
    pub fn new(media: Box<dyn Media>, greyscale: bool) -> Self {
        ImageSourceNode { media, greyscale }
    }
}

impl NodeBehavior for ImageSourceNode {
    fn declare_ports(&self) -> Vec<PortSpec> {
        let mut port = PortSpec::output("image", crate::port::MessageKind::Image);
        if self.greyscale {
            port = port.guarantees_greyscale();
        }
        vec![port]
    }

    fn run(&mut self, ctx: &mut NodeContext<'_>) -> Result<HashMap<String, Message>, EngineError> {
        let descriptor = image_descriptor(self.media.size());
        let handle = ctx.pool.alloc_scratch(ctx.device.device(), descriptor)?;
        let texture = ctx.pool.get(handle).expect("just allocated");
        self.media.upload_into(ctx.device, texture)?;

        let mut outputs = HashMap::new();
        outputs.insert(
            "image".to_string(),
            Message::Image {
                texture: handle,
                greyscale: self.greyscale,
            },
        );
        Ok(outputs)
    }
}

/// A terminal node: identity on its single input. `Execution` captures the
/// sink's resolved input directly rather than relying on any output this
/// node produces, so `run` is a pure no-op validation step.
pub struct ImageSinkNode;

impl NodeBehavior for ImageSinkNode {
    fn declare_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::input("image", crate::port::MessageKind::Image)]
    }

    fn run(&mut self, ctx: &mut NodeContext<'_>) -> Result<HashMap<String, Message>, EngineError> {
        require_image(
            ctx.input("image").ok_or_else(|| IllegalOperationError::ReadBeforeWrite {
                node: "image sink".to_string(),
                port: "image".to_string(),
            })?,
            "image sink",
            "image",
        )?;
        Ok(HashMap::new())
    }
}

/// A terminal node for keypoint-producing branches: identity on its single
/// input, the same way [`ImageSinkNode`] is for image branches. A sink
/// either hands the current texture to the caller as a drawable image, or
/// reads it back to host memory and decodes it into a list of keypoints;
/// this node is the keypoint half of that pair, since none of the other
/// keypoint node kinds terminate a pipeline.
pub struct KeypointSinkNode;

impl NodeBehavior for KeypointSinkNode {
    fn declare_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::input("keypoints", crate::port::MessageKind::Keypoint)]
    }

    fn run(&mut self, ctx: &mut NodeContext<'_>) -> Result<HashMap<String, Message>, EngineError> {
        require_keypoints(
            ctx.input("keypoints").ok_or_else(|| IllegalOperationError::ReadBeforeWrite {
                node: "keypoint sink".to_string(),
                port: "keypoints".to_string(),
            })?,
            "keypoint sink",
            "keypoints",
        )?;
        Ok(HashMap::new())
    }
}

/// `output = alpha*a + beta*b + gamma`, dispatched as a real GPU kernel,
/// unlike the detector/tracker nodes whose kernel source is caller-supplied.
pub struct ImageMixerNode {
    config: MixerConfig,
    program: Option<KernelProgram>,
}

const MIXER_WGSL: &str = r#"
struct Uniforms {
    alpha: f32,
    beta: f32,
    gamma: f32,
    _pad: f32,
}
var<push_constant> uniforms: Uniforms;

@group(0) @binding(0) var tex_a: texture_2d<f32>;
@group(0) @binding(1) var samp_a: sampler;
@group(0) @binding(2) var tex_b: texture_2d<f32>;
@group(0) @binding(3) var samp_b: sampler;

struct VsOut {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VsOut {
    var positions = array<vec2<f32>, 3>(
        vec2<f32>(-1.0, -1.0),
        vec2<f32>(3.0, -1.0),
        vec2<f32>(-1.0, 3.0),
    );
    var out: VsOut;
    let p = positions[index];
    out.position = vec4<f32>(p, 0.0, 1.0);
    out.uv = vec2<f32>(p.x * 0.5 + 0.5, 1.0 - (p.y * 0.5 + 0.5));
    return out;
}

@fragment
fn fs_main(in: VsOut) -> @location(0) vec4<f32> {
    let a = textureSample(tex_a, samp_a, in.uv);
    let b = textureSample(tex_b, samp_b, in.uv);
    return a * uniforms.alpha + b * uniforms.beta + vec4<f32>(uniforms.gamma, uniforms.gamma, uniforms.gamma, 0.0);
}
"#;

impl ImageMixerNode {
    pub fn new(config: MixerConfig) -> Self {
        ImageMixerNode { config, program: None }
    }
}

impl NodeBehavior for ImageMixerNode {
    fn declare_ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("a", crate::port::MessageKind::Image),
            PortSpec::input("b", crate::port::MessageKind::Image),
            PortSpec::output("out", crate::port::MessageKind::Image),
        ]
    }

    fn init(&mut self, device: &DeviceContext) -> Result<(), EngineError> {
        self.program = Some(device.compile_kernel("image mixer", MIXER_WGSL, 2, TextureFormat::Rgba8Unorm, 16)?);
        Ok(())
    }

    fn run(&mut self, ctx: &mut NodeContext<'_>) -> Result<HashMap<String, Message>, EngineError> {
        let a = ctx.input("a").ok_or_else(|| IllegalOperationError::ReadBeforeWrite {
            node: "image mixer".to_string(),
            port: "a".to_string(),
        })?;
        let b = ctx.input("b").ok_or_else(|| IllegalOperationError::ReadBeforeWrite {
            node: "image mixer".to_string(),
            port: "b".to_string(),
        })?;
        let (handle_a, grey_a) = require_image(a, "image mixer", "a")?;
        let (handle_b, grey_b) = require_image(b, "image mixer", "b")?;

        let size = ctx.pool.get(handle_a).map(Texture::size).ok_or_else(|| {
            EngineError::Resource(ResourceError::Allocation("stale scratch handle".to_string()))
        })?;
        let output_handle = ctx.pool.alloc_scratch(ctx.device.device(), image_descriptor(size))?;

        let program = self.program.as_ref().expect("init ran before run");
        {
            let texture_a = ctx.pool.get(handle_a).expect("validated above");
            let texture_b = ctx.pool.get(handle_b).expect("validated above");
            let output = ctx.pool.get(output_handle).expect("just allocated");
            let bind_group = ctx.device.build_sampled_bind_group(program, &[texture_a, texture_b])?;
            let uniforms = [self.config.alpha, self.config.beta, self.config.gamma, 0.0];
            ctx.device
                .run_kernel(program, output, &bind_group, bytemuck::cast_slice(&uniforms));
        }

        let mut outputs = HashMap::new();
        outputs.insert(
            "out".to_string(),
            Message::Image {
                texture: output_handle,
                greyscale: grey_a && grey_b,
            },
        );
        Ok(outputs)
    }
}

/// FAST/Harris-style corner detectors: given a greyscale image and a
/// threshold/capacity, dispatch a caller-supplied kernel and publish its
/// output as a keypoint message. The corner-detection algorithm itself
/// lives in the supplied shader, not in this node.
pub struct DetectorNode {
    config: DetectorConfig,
    program: Rc<KernelProgram>,
}

impl DetectorNode {
    pub fn new(config: DetectorConfig, program: Rc<KernelProgram>) -> Self {
        DetectorNode { config, program }
    }
}

impl NodeBehavior for DetectorNode {
    fn declare_ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("image", crate::port::MessageKind::Image).expect_greyscale(),
            PortSpec::output("keypoints", crate::port::MessageKind::Keypoint),
        ]
    }

    fn run(&mut self, ctx: &mut NodeContext<'_>) -> Result<HashMap<String, Message>, EngineError> {
        let input = ctx.input("image").ok_or_else(|| IllegalOperationError::ReadBeforeWrite {
            node: "detector".to_string(),
            port: "image".to_string(),
        })?;
        let (handle, _) = require_image(input, "detector", "image")?;

        let source_size = ctx.pool.get(handle).map(Texture::size).ok_or_else(|| {
            EngineError::Resource(ResourceError::Allocation("stale scratch handle".to_string()))
        })?;
        let layout = KeypointLayout::for_capacity(self.config.capacity, 0, 0);
        let descriptor =
            TextureDescriptor::new(Size::new(layout.encoder_length, layout.encoder_length), TextureFormat::Rgba8Unorm);
        let output_handle = ctx.pool.alloc_scratch(ctx.device.device(), descriptor)?;

        {
            let input_texture = ctx.pool.get(handle).expect("validated above");
            let output_texture = ctx.pool.get(output_handle).expect("just allocated");
            let bind_group = ctx.device.build_sampled_bind_group(&self.program, &[input_texture])?;
            let uniforms = [self.config.threshold as f32, self.config.capacity as f32];
            ctx.device
                .run_kernel(&self.program, output_texture, &bind_group, bytemuck::cast_slice(&uniforms));
        }

        let _ = source_size;
        let mut outputs = HashMap::new();
        outputs.insert(
            "keypoints".to_string(),
            Message::Keypoint {
                encoded_keypoints: output_handle,
                descriptor_size: 0,
                extra_size: 0,
                encoder_length: layout.encoder_length,
            },
        );
        Ok(outputs)
    }
}

/// ORB-style descriptor computation: a contract-only node whose algorithm
/// lives in the caller-supplied kernel. Consumes an image plus the
/// keypoints detected on it, re-publishes a keypoint message whose cells
/// now carry `descriptor_size` bytes produced by that kernel.
pub struct DescriptorNode {
    descriptor_size: usize,
    program: Rc<KernelProgram>,
}

impl DescriptorNode {
    pub fn new(descriptor_size: usize, program: Rc<KernelProgram>) -> Self {
        DescriptorNode { descriptor_size, program }
    }
}

impl NodeBehavior for DescriptorNode {
    fn declare_ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("image", crate::port::MessageKind::Image).expect_greyscale(),
            PortSpec::input("keypoints", crate::port::MessageKind::Keypoint),
            PortSpec::output("keypoints", crate::port::MessageKind::Keypoint),
        ]
    }

    fn run(&mut self, ctx: &mut NodeContext<'_>) -> Result<HashMap<String, Message>, EngineError> {
        let image = ctx.input("image").ok_or_else(|| IllegalOperationError::ReadBeforeWrite {
            node: "orb descriptor".to_string(),
            port: "image".to_string(),
        })?;
        let keypoints = ctx.input("keypoints").ok_or_else(|| IllegalOperationError::ReadBeforeWrite {
            node: "orb descriptor".to_string(),
            port: "keypoints".to_string(),
        })?;
        let (image_handle, _) = require_image(image, "orb descriptor", "image")?;
        let (keypoints_handle, _, extra_size, in_encoder_length) =
            require_keypoints(keypoints, "orb descriptor", "keypoints")?;

        let capacity = {
            let texture = ctx
                .pool
                .get(keypoints_handle)
                .ok_or_else(|| EngineError::Resource(ResourceError::Allocation("stale scratch handle".to_string())))?;
            (texture.size().width as usize * texture.size().height as usize)
                / KeypointLayout::for_capacity(1, 0, extra_size).cell_pixels()
        };
        let out_layout = KeypointLayout::for_capacity(capacity, self.descriptor_size, extra_size);
        let descriptor = TextureDescriptor::new(
            Size::new(out_layout.encoder_length, out_layout.encoder_length),
            TextureFormat::Rgba8Unorm,
        );
        let output_handle = ctx.pool.alloc_scratch(ctx.device.device(), descriptor)?;

        {
            let image_texture = ctx.pool.get(image_handle).expect("validated above");
            let keypoints_texture = ctx.pool.get(keypoints_handle).expect("validated above");
            let output_texture = ctx.pool.get(output_handle).expect("just allocated");
            let bind_group = ctx
                .device
                .build_sampled_bind_group(&self.program, &[image_texture, keypoints_texture])?;
            ctx.device.run_kernel(&self.program, output_texture, &bind_group, &[]);
        }

        let _ = in_encoder_length;
        let mut outputs = HashMap::new();
        outputs.insert(
            "keypoints".to_string(),
            Message::Keypoint {
                encoded_keypoints: output_handle,
                descriptor_size: self.descriptor_size,
                extra_size,
                encoder_length: out_layout.encoder_length,
            },
        );
        Ok(outputs)
    }
}

/// Lucas-Kanade-style tracker: out of scope algorithm, contract-only node.
/// Consumes the previous frame's keypoints (typically fed by a
/// [`KeypointBufferNode`]) and the current frame's image, publishes updated
/// keypoint positions.
pub struct TrackerNode {
    config: TrackerConfig,
    program: Rc<KernelProgram>,
}

impl TrackerNode {
    pub fn new(config: TrackerConfig, program: Rc<KernelProgram>) -> Self {
        TrackerNode { config, program }
    }
}

impl NodeBehavior for TrackerNode {
    fn declare_ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("image", crate::port::MessageKind::Image).expect_greyscale(),
            PortSpec::input("previous_keypoints", crate::port::MessageKind::Keypoint),
            PortSpec::output("keypoints", crate::port::MessageKind::Keypoint),
        ]
    }

    fn run(&mut self, ctx: &mut NodeContext<'_>) -> Result<HashMap<String, Message>, EngineError> {
        let image = ctx.input("image").ok_or_else(|| IllegalOperationError::ReadBeforeWrite {
            node: "lk tracker".to_string(),
            port: "image".to_string(),
        })?;
        let previous = ctx
            .input("previous_keypoints")
            .ok_or_else(|| IllegalOperationError::ReadBeforeWrite {
                node: "lk tracker".to_string(),
                port: "previous_keypoints".to_string(),
            })?;
        let (image_handle, _) = require_image(image, "lk tracker", "image")?;
        let (prev_handle, descriptor_size, extra_size, encoder_length) =
            require_keypoints(previous, "lk tracker", "previous_keypoints")?;

        let descriptor = TextureDescriptor::new(Size::new(encoder_length, encoder_length), TextureFormat::Rgba8Unorm);
        let output_handle = ctx.pool.alloc_scratch(ctx.device.device(), descriptor)?;

        {
            let image_texture = ctx.pool.get(image_handle).expect("validated above");
            let prev_texture = ctx.pool.get(prev_handle).expect("validated above");
            let output_texture = ctx.pool.get(output_handle).expect("just allocated");
            let bind_group = ctx
                .device
                .build_sampled_bind_group(&self.program, &[image_texture, prev_texture])?;
            let uniforms = [
                self.config.window as f32,
                self.config.iterations as f32,
                self.config.pyramid_depth as f32,
            ];
            ctx.device
                .run_kernel(&self.program, output_texture, &bind_group, bytemuck::cast_slice(&uniforms));
        }

        let mut outputs = HashMap::new();
        outputs.insert(
            "keypoints".to_string(),
            Message::Keypoint {
                encoded_keypoints: output_handle,
                descriptor_size,
                extra_size,
                encoder_length,
            },
        );
        Ok(outputs)
    }
}

/// Retains the highest-scoring `config.size` keypoints, implemented as a
/// genuine host-side decode/sort/re-encode rather than a GPU kernel.
pub struct KeypointClipperNode {
    config: ClipperConfig,
}

impl KeypointClipperNode {
    pub fn new(config: ClipperConfig) -> Self {
        KeypointClipperNode { config }
    }
}

impl NodeBehavior for KeypointClipperNode {
    fn declare_ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("keypoints", crate::port::MessageKind::Keypoint),
            PortSpec::output("keypoints", crate::port::MessageKind::Keypoint),
        ]
    }

    fn run(&mut self, ctx: &mut NodeContext<'_>) -> Result<HashMap<String, Message>, EngineError> {
        let input = ctx.input("keypoints").ok_or_else(|| IllegalOperationError::ReadBeforeWrite {
            node: "keypoint clipper".to_string(),
            port: "keypoints".to_string(),
        })?;
        let (handle, descriptor_size, extra_size, encoder_length) = require_keypoints(input, "keypoint clipper", "keypoints")?;
        let fix_resolution = keypoint::fix_resolution_for(encoder_length);
        let in_layout = KeypointLayout {
            descriptor_size,
            extra_size,
            encoder_length,
        };

        let mut decoded = decode_keypoints_blocking(ctx, handle, &in_layout, fix_resolution)?;
        decoded.sort_by(|a, b| b.score.cmp(&a.score));
        decoded.truncate(self.config.size);

        let out_layout = KeypointLayout::for_capacity(self.config.size, descriptor_size, extra_size);
        let output_handle = encode_keypoints_to_new_texture(ctx, &decoded, &out_layout, fix_resolution)?;

        let mut outputs = HashMap::new();
        outputs.insert(
            "keypoints".to_string(),
            Message::Keypoint {
                encoded_keypoints: output_handle,
                descriptor_size,
                extra_size,
                encoder_length: out_layout.encoder_length,
            },
        );
        Ok(outputs)
    }
}

/// A one-run delay (`z^-1`): publishes the *previous* run's input, then
/// remembers the current input for next time. Used to feed a tracker the
/// prior frame's keypoints without the scheduler needing a notion of
/// multi-frame state anywhere else; a pipeline is invoked once per frame,
/// and a buffer node is the natural place to carry state across those
/// calls.
///
/// The previous run's input texture is released back to the pool by the
/// scheduler once this node has read it (this node is its sole consumer),
/// so the buffered list is decoded to the host and re-encoded into a fresh,
/// buffer-owned texture each run rather than held by handle.
pub struct KeypointBufferNode {
    last: Option<Vec<Keypoint>>,
    descriptor_size: usize,
    extra_size: usize,
}

impl KeypointBufferNode {
    pub fn new(descriptor_size: usize, extra_size: usize) -> Self {
        KeypointBufferNode {
            last: None,
            descriptor_size,
            extra_size,
        }
    }
}

impl NodeBehavior for KeypointBufferNode {
    fn declare_ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("keypoints", crate::port::MessageKind::Keypoint),
            PortSpec::output("keypoints", crate::port::MessageKind::Keypoint),
        ]
    }

    fn run(&mut self, ctx: &mut NodeContext<'_>) -> Result<HashMap<String, Message>, EngineError> {
        let input = ctx.input("keypoints").ok_or_else(|| IllegalOperationError::ReadBeforeWrite {
            node: "keypoint buffer".to_string(),
            port: "keypoints".to_string(),
        })?;
        let (handle, descriptor_size, extra_size, encoder_length) = require_keypoints(input, "keypoint buffer", "keypoints")?;
        let in_layout = KeypointLayout {
            descriptor_size,
            extra_size,
            encoder_length,
        };
        let fix_resolution = keypoint::fix_resolution_for(encoder_length);
        let decoded = decode_keypoints_blocking(ctx, handle, &in_layout, fix_resolution)?;

        let previous = self.last.take().unwrap_or_default();
        let out_layout = KeypointLayout::for_capacity(previous.len().max(1), self.descriptor_size, self.extra_size);
        let out_fix_resolution = keypoint::fix_resolution_for(out_layout.encoder_length);
        let output_handle = encode_keypoints_to_new_texture(ctx, &previous, &out_layout, out_fix_resolution)?;

        self.last = Some(decoded);

        let mut outputs = HashMap::new();
        outputs.insert(
            "keypoints".to_string(),
            Message::Keypoint {
                encoded_keypoints: output_handle,
                descriptor_size: self.descriptor_size,
                extra_size: self.extra_size,
                encoder_length: out_layout.encoder_length,
            },
        );
        Ok(outputs)
    }
}

/// Score-weighted merge of two keypoint lists (`alpha`/`beta`/`gamma`
/// applied to the scores of matched keypoints, unmatched keypoints from
/// either side passed through). The same `Mixer` config knob used for
/// images applies here too; only what "blend" means for the value being
/// mixed changes.
pub struct KeypointMixerNode {
    config: MixerConfig,
    position_tolerance: f32,
}

impl KeypointMixerNode {
    pub fn new(config: MixerConfig, position_tolerance: f32) -> Self {
        KeypointMixerNode {
            config,
            position_tolerance,
        }
    }
}

impl NodeBehavior for KeypointMixerNode {
    fn declare_ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("a", crate::port::MessageKind::Keypoint),
            PortSpec::input("b", crate::port::MessageKind::Keypoint),
            PortSpec::output("out", crate::port::MessageKind::Keypoint),
        ]
    }

    fn run(&mut self, ctx: &mut NodeContext<'_>) -> Result<HashMap<String, Message>, EngineError> {
        let a = ctx.input("a").ok_or_else(|| IllegalOperationError::ReadBeforeWrite {
            node: "keypoint mixer".to_string(),
            port: "a".to_string(),
        })?;
        let b = ctx.input("b").ok_or_else(|| IllegalOperationError::ReadBeforeWrite {
            node: "keypoint mixer".to_string(),
            port: "b".to_string(),
        })?;
        let (handle_a, descriptor_size, extra_size, encoder_length_a) = require_keypoints(a, "keypoint mixer", "a")?;
        let (handle_b, _, _, encoder_length_b) = require_keypoints(b, "keypoint mixer", "b")?;

        let fix_resolution = keypoint::fix_resolution_for(encoder_length_a.max(encoder_length_b));
        let layout_a = KeypointLayout {
            descriptor_size,
            extra_size,
            encoder_length: encoder_length_a,
        };
        let layout_b = KeypointLayout {
            descriptor_size,
            extra_size,
            encoder_length: encoder_length_b,
        };

        let list_a = decode_keypoints_blocking(ctx, handle_a, &layout_a, fix_resolution)?;
        let list_b = decode_keypoints_blocking(ctx, handle_b, &layout_b, fix_resolution)?;

        let mut merged: Vec<Keypoint> = Vec::with_capacity(list_a.len() + list_b.len());
        let mut used_b = vec![false; list_b.len()];
        for ka in &list_a {
            if let Some((j, kb)) = list_b
                .iter()
                .enumerate()
                .find(|(j, kb)| !used_b[*j] && ka.position.approx_eq(&kb.position, self.position_tolerance))
            {
                used_b[j] = true;
                let mut blended = ka.clone();
                blended.score = (self.config.alpha * ka.score as f32
                    + self.config.beta * kb.score as f32
                    + self.config.gamma)
                    .round()
                    .clamp(0.0, u16::MAX as f32) as u16;
                merged.push(blended);
            } else {
                merged.push(ka.clone());
            }
        }
        for (j, kb) in list_b.into_iter().enumerate() {
            if !used_b[j] {
                merged.push(kb);
            }
        }

        let out_layout = KeypointLayout::for_capacity(merged.len(), descriptor_size, extra_size);
        let output_handle = encode_keypoints_to_new_texture(ctx, &merged, &out_layout, fix_resolution)?;

        let mut outputs = HashMap::new();
        outputs.insert(
            "out".to_string(),
            Message::Keypoint {
                encoded_keypoints: output_handle,
                descriptor_size,
                extra_size,
                encoder_length: out_layout.encoder_length,
            },
        );
        Ok(outputs)
    }
}

/// Concatenates `input_count` keypoint lists into one.
pub struct KeypointMultiplexerNode {
    input_count: usize,
}

impl KeypointMultiplexerNode {
    pub fn new(input_count: usize) -> Self {
        assert!(input_count >= 2, "a multiplexer needs at least two inputs");
        KeypointMultiplexerNode { input_count }
    }

    fn port_name(index: usize) -> String {
        format!("in{index}")
    }
}

impl NodeBehavior for KeypointMultiplexerNode {
    fn declare_ports(&self) -> Vec<PortSpec> {
        let mut ports: Vec<PortSpec> = (0..self.input_count)
            .map(|i| PortSpec::input(&Self::port_name(i), crate::port::MessageKind::Keypoint))
            .collect();
        ports.push(PortSpec::output("out", crate::port::MessageKind::Keypoint));
        ports
    }

    fn run(&mut self, ctx: &mut NodeContext<'_>) -> Result<HashMap<String, Message>, EngineError> {
        let mut merged = Vec::new();
        let mut descriptor_size = 0;
        let mut extra_size = 0;
        let mut max_encoder_length = 0;

        for i in 0..self.input_count {
            let name = Self::port_name(i);
            let message = ctx.input(&name).ok_or_else(|| IllegalOperationError::ReadBeforeWrite {
                node: "keypoint multiplexer".to_string(),
                port: name.clone(),
            })?;
            let (handle, d, e, encoder_length) = require_keypoints(message, "keypoint multiplexer", &name)?;
            descriptor_size = d;
            extra_size = e;
            max_encoder_length = max_encoder_length.max(encoder_length);
            let layout = KeypointLayout {
                descriptor_size: d,
                extra_size: e,
                encoder_length,
            };
            let fix_resolution = keypoint::fix_resolution_for(encoder_length);
            merged.extend(decode_keypoints_blocking(ctx, handle, &layout, fix_resolution)?);
        }

        let fix_resolution = keypoint::fix_resolution_for(max_encoder_length);
        let out_layout = KeypointLayout::for_capacity(merged.len(), descriptor_size, extra_size);
        let output_handle = encode_keypoints_to_new_texture(ctx, &merged, &out_layout, fix_resolution)?;

        let mut outputs = HashMap::new();
        outputs.insert(
            "out".to_string(),
            Message::Keypoint {
                encoded_keypoints: output_handle,
                descriptor_size,
                extra_size,
                encoder_length: out_layout.encoder_length,
            },
        );
        Ok(outputs)
    }
}

/// Applies a caller-supplied pure function to every keypoint in the list
/// (e.g. an affine coordinate remap). The transform itself is, like
/// FAST/Harris/ORB/LK, a per-algorithm detail outside this crate's scope;
/// only the "map this function over the decoded list" contract is engine
/// code.
pub struct KeypointTransformerNode {
    transform: Box<dyn Fn(&Keypoint) -> Keypoint>,
}

impl KeypointTransformerNode {
    pub fn new(transform: Box<dyn Fn(&Keypoint) -> Keypoint>) -> Self {
        KeypointTransformerNode { transform }
    }
}

impl NodeBehavior for KeypointTransformerNode {
    fn declare_ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("keypoints", crate::port::MessageKind::Keypoint),
            PortSpec::output("keypoints", crate::port::MessageKind::Keypoint),
        ]
    }

    fn run(&mut self, ctx: &mut NodeContext<'_>) -> Result<HashMap<String, Message>, EngineError> {
        let input = ctx.input("keypoints").ok_or_else(|| IllegalOperationError::ReadBeforeWrite {
            node: "keypoint transformer".to_string(),
            port: "keypoints".to_string(),
        })?;
        let (handle, descriptor_size, extra_size, encoder_length) = require_keypoints(input, "keypoint transformer", "keypoints")?;
        let layout = KeypointLayout {
            descriptor_size,
            extra_size,
            encoder_length,
        };
        let fix_resolution = keypoint::fix_resolution_for(encoder_length);
        let decoded = decode_keypoints_blocking(ctx, handle, &layout, fix_resolution)?;
        let transformed: Vec<Keypoint> = decoded.iter().map(|k| (self.transform)(k)).collect();

        let output_handle = encode_keypoints_to_new_texture(ctx, &transformed, &layout, fix_resolution)?;

        let mut outputs = HashMap::new();
        outputs.insert(
            "keypoints".to_string(),
            Message::Keypoint {
                encoded_keypoints: output_handle,
                descriptor_size,
                extra_size,
                encoder_length,
            },
        );
        Ok(outputs)
    }
}

/// Refines each keypoint's position via a caller-supplied closure. Same
/// host-side shape as [`KeypointTransformerNode`]; kept as a distinct node
/// kind because the pipeline's port-typing rules and `NodeKind` diagnostics
/// treat "refine position" and "apply an arbitrary map" as different roles,
/// even though today's implementation of both is "apply a closure."
pub struct SubpixelRefinerNode {
    refine: Box<dyn Fn(&Keypoint) -> Keypoint>,
}

impl SubpixelRefinerNode {
    pub fn new(refine: Box<dyn Fn(&Keypoint) -> Keypoint>) -> Self {
        SubpixelRefinerNode { refine }
    }
}

impl NodeBehavior for SubpixelRefinerNode {
    fn declare_ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::input("keypoints", crate::port::MessageKind::Keypoint),
            PortSpec::output("keypoints", crate::port::MessageKind::Keypoint),
        ]
    }

    fn run(&mut self, ctx: &mut NodeContext<'_>) -> Result<HashMap<String, Message>, EngineError> {
        let input = ctx.input("keypoints").ok_or_else(|| IllegalOperationError::ReadBeforeWrite {
            node: "subpixel refiner".to_string(),
            port: "keypoints".to_string(),
        })?;
        let (handle, descriptor_size, extra_size, encoder_length) = require_keypoints(input, "subpixel refiner", "keypoints")?;
        let layout = KeypointLayout {
            descriptor_size,
            extra_size,
            encoder_length,
        };
        let fix_resolution = keypoint::fix_resolution_for(encoder_length);
        let decoded = decode_keypoints_blocking(ctx, handle, &layout, fix_resolution)?;
        let refined: Vec<Keypoint> = decoded.iter().map(|k| (self.refine)(k)).collect();

        let output_handle = encode_keypoints_to_new_texture(ctx, &refined, &layout, fix_resolution)?;

        let mut outputs = HashMap::new();
        outputs.insert(
            "keypoints".to_string(),
            Message::Keypoint {
                encoded_keypoints: output_handle,
                descriptor_size,
                extra_size,
                encoder_length,
            },
        );
        Ok(outputs)
    }
}

/// A shared registry portal nodes publish to and read from. A portal
/// source/sink pair is a weak reference, not an ownership link: looking a
/// name up and validating its type happens on every run rather than once
/// at wiring time.
#[derive(Clone, Default)]
pub struct PortalRegistry {
    inner: Rc<RefCell<HashMap<String, Message>>>,
}

impl PortalRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct ImagePortalSourceNode {
    registry: PortalRegistry,
    name: String,
}

impl ImagePortalSourceNode {
    pub fn new(registry: PortalRegistry, name: impl Into<String>) -> Self {
        ImagePortalSourceNode {
            registry,
            name: name.into(),
        }
    }
}

impl NodeBehavior for ImagePortalSourceNode {
    fn declare_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::output("image", crate::port::MessageKind::Image)]
    }

    fn run(&mut self, _ctx: &mut NodeContext<'_>) -> Result<HashMap<String, Message>, EngineError> {
        let message = self
            .registry
            .inner
            .borrow()
            .get(&self.name)
            .cloned()
            .ok_or_else(|| IllegalOperationError::PortalNotReady(self.name.clone()))?;
        let mut outputs = HashMap::new();
        outputs.insert("image".to_string(), message);
        Ok(outputs)
    }
}

pub struct ImagePortalSinkNode {
    registry: PortalRegistry,
    name: String,
}

impl ImagePortalSinkNode {
    pub fn new(registry: PortalRegistry, name: impl Into<String>) -> Self {
        ImagePortalSinkNode {
            registry,
            name: name.into(),
        }
    }
}

impl NodeBehavior for ImagePortalSinkNode {
    fn declare_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::input("image", crate::port::MessageKind::Image)]
    }

    fn run(&mut self, ctx: &mut NodeContext<'_>) -> Result<HashMap<String, Message>, EngineError> {
        let message = ctx.input("image").ok_or_else(|| IllegalOperationError::ReadBeforeWrite {
            node: "image portal sink".to_string(),
            port: "image".to_string(),
        })?;
        require_image(message, "image portal sink", "image")?;
        self.registry.inner.borrow_mut().insert(self.name.clone(), message.clone());
        Ok(HashMap::new())
    }
}

pub struct KeypointPortalSourceNode {
    registry: PortalRegistry,
    name: String,
}

impl KeypointPortalSourceNode {
    pub fn new(registry: PortalRegistry, name: impl Into<String>) -> Self {
        KeypointPortalSourceNode {
            registry,
            name: name.into(),
        }
    }
}

impl NodeBehavior for KeypointPortalSourceNode {
    fn declare_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::output("keypoints", crate::port::MessageKind::Keypoint)]
    }

    fn run(&mut self, _ctx: &mut NodeContext<'_>) -> Result<HashMap<String, Message>, EngineError> {
        let message = self
            .registry
            .inner
            .borrow()
            .get(&self.name)
            .cloned()
            .ok_or_else(|| IllegalOperationError::PortalNotReady(self.name.clone()))?;
        let mut outputs = HashMap::new();
        outputs.insert("keypoints".to_string(), message);
        Ok(outputs)
    }
}

pub struct KeypointPortalSinkNode {
    registry: PortalRegistry,
    name: String,
}

impl KeypointPortalSinkNode {
    pub fn new(registry: PortalRegistry, name: impl Into<String>) -> Self {
        KeypointPortalSinkNode {
            registry,
            name: name.into(),
        }
    }
}

impl NodeBehavior for KeypointPortalSinkNode {
    fn declare_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::input("keypoints", crate::port::MessageKind::Keypoint)]
    }

    fn run(&mut self, ctx: &mut NodeContext<'_>) -> Result<HashMap<String, Message>, EngineError> {
        let message = ctx.input("keypoints").ok_or_else(|| IllegalOperationError::ReadBeforeWrite {
            node: "keypoint portal sink".to_string(),
            port: "keypoints".to_string(),
        })?;
        require_keypoints(message, "keypoint portal sink", "keypoints")?;
        self.registry.inner.borrow_mut().insert(self.name.clone(), message.clone());
        Ok(HashMap::new())
    }
}

/// Factory namespaces under `Image.*`/`Keypoint.*` naming.
pub mod nodes {
    pub mod image {
        use std::rc::Rc;

        use crate::config::MixerConfig;
        use crate::device::KernelProgram;
        use crate::media::Media;
        use crate::node::{ImageMixerNode, ImagePortalSinkNode, ImagePortalSourceNode, ImageSinkNode, ImageSourceNode, PortalRegistry};

        pub fn source(media: Box<dyn Media>, greyscale: bool) -> ImageSourceNode {
            ImageSourceNode::new(media, greyscale)
        }

        pub fn sink() -> ImageSinkNode {
            ImageSinkNode
        }

        pub fn mixer(config: MixerConfig) -> ImageMixerNode {
            ImageMixerNode::new(config)
        }

        pub mod portal {
            use super::*;

            pub fn source(registry: PortalRegistry, name: impl Into<String>) -> ImagePortalSourceNode {
                ImagePortalSourceNode::new(registry, name)
            }

            pub fn sink(registry: PortalRegistry, name: impl Into<String>) -> ImagePortalSinkNode {
                ImagePortalSinkNode::new(registry, name)
            }
        }

        #[allow(unused_imports)]
        use KernelProgram as _;
        #[allow(unused_imports)]
        use Rc as _;
    }

    pub mod keypoint {
        use crate::config::{ClipperConfig, MixerConfig};
        use crate::value::Keypoint;
        use crate::node::{
            KeypointBufferNode, KeypointClipperNode, KeypointMixerNode, KeypointMultiplexerNode, KeypointPortalSinkNode,
            KeypointPortalSourceNode, KeypointSinkNode, KeypointTransformerNode, PortalRegistry, SubpixelRefinerNode,
        };

        pub fn sink() -> KeypointSinkNode {
            KeypointSinkNode
        }

        pub fn clipper(config: ClipperConfig) -> KeypointClipperNode {
            KeypointClipperNode::new(config)
        }

        pub fn buffer(descriptor_size: usize, extra_size: usize) -> KeypointBufferNode {
            KeypointBufferNode::new(descriptor_size, extra_size)
        }

        pub fn mixer(config: MixerConfig, position_tolerance: f32) -> KeypointMixerNode {
            KeypointMixerNode::new(config, position_tolerance)
        }

        pub fn multiplexer(input_count: usize) -> KeypointMultiplexerNode {
            KeypointMultiplexerNode::new(input_count)
        }

        pub fn transformer(transform: Box<dyn Fn(&Keypoint) -> Keypoint>) -> KeypointTransformerNode {
            KeypointTransformerNode::new(transform)
        }

        pub fn subpixel_refiner(refine: Box<dyn Fn(&Keypoint) -> Keypoint>) -> SubpixelRefinerNode {
            SubpixelRefinerNode::new(refine)
        }

        pub mod detector {
            use std::rc::Rc;

            use crate::config::DetectorConfig;
            use crate::device::KernelProgram;
            use crate::node::DetectorNode;

            pub fn fast(config: DetectorConfig, program: Rc<KernelProgram>) -> DetectorNode {
                DetectorNode::new(config, program)
            }

            pub fn harris(config: DetectorConfig, program: Rc<KernelProgram>) -> DetectorNode {
                DetectorNode::new(config, program)
            }
        }

        pub mod descriptor {
            use std::rc::Rc;

            use crate::device::KernelProgram;
            use crate::node::DescriptorNode;

            pub fn orb(descriptor_size: usize, program: Rc<KernelProgram>) -> DescriptorNode {
                DescriptorNode::new(descriptor_size, program)
            }
        }

        pub mod tracker {
            use std::rc::Rc;

            use crate::config::TrackerConfig;
            use crate::device::KernelProgram;
            use crate::node::TrackerNode;

            pub fn lk(config: TrackerConfig, program: Rc<KernelProgram>) -> TrackerNode {
                TrackerNode::new(config, program)
            }
        }

        pub mod portal {
            use super::*;

            pub fn source(registry: PortalRegistry, name: impl Into<String>) -> KeypointPortalSourceNode {
                KeypointPortalSourceNode::new(registry, name)
            }

            pub fn sink(registry: PortalRegistry, name: impl Into<String>) -> KeypointPortalSinkNode {
                KeypointPortalSinkNode::new(registry, name)
            }
        }
    }
}
