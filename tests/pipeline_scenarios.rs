//! Integration tests exercising the engine end to end against a real
//! `wgpu` adapter, mirroring the teacher's `tests/blend.rs` shape (pick an
//! adapter, build a pipeline, drive it to completion, inspect the result).
//!
//! These need a GPU-capable adapter to run, same as the teacher's own
//! integration test; skip locally if none is available rather than fail the
//! whole suite.

use kinegraph::config::{ClipperConfig, EngineConfig, MixerConfig};
use kinegraph::device::DeviceContext;
use kinegraph::keypoint::{self, CandidateKeypoint, KeypointLayout};
use kinegraph::media::ImageMedia;
use kinegraph::node::{self, NodeBehavior, NodeContext, NodeKind};
use kinegraph::pipeline::{Pipeline, PipelineOutput};
use kinegraph::port::{Message, MessageKind, PortSpec};
use kinegraph::reader::StagingRing;
use kinegraph::texture::{TextureDescriptor, TextureFormat};
use kinegraph::value::Size;

use std::collections::HashMap;
use std::future::Future;

fn device() -> Option<DeviceContext> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
    let adapters = instance.enumerate_adapters(wgpu::Backends::all());
    let adapter = DeviceContext::choose_adapter(adapters.into_iter()).ok()?;
    DeviceContext::request(&adapter).ok()
}

fn solid_media(width: u32, height: u32, rgba: [u8; 4]) -> ImageMedia {
    let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);
    for _ in 0..(width * height) {
        pixels.extend_from_slice(&rgba);
    }
    ImageMedia::from_rgba8(width, height, pixels).unwrap()
}

/// Two 4x4 solid-color textures blended 50/50 produce a uniform mid-gray
/// image.
#[test]
fn s1_alpha_blend_produces_uniform_mid_gray() {
    let Some(device) = device() else { return };

    let mut pipeline = Pipeline::new(EngineConfig::default());
    let a = pipeline
        .add_node(
            "a",
            NodeKind::ImageSource,
            Box::new(node::ImageSourceNode::new(
                Box::new(solid_media(4, 4, [128, 128, 128, 255])),
                false,
            )),
        )
        .unwrap();
    let b = pipeline
        .add_node(
            "b",
            NodeKind::ImageSource,
            Box::new(node::ImageSourceNode::new(
                Box::new(solid_media(4, 4, [64, 64, 64, 255])),
                false,
            )),
        )
        .unwrap();
    let mixer = pipeline
        .add_node(
            "mix",
            NodeKind::ImageMixer,
            Box::new(node::nodes::image::mixer(MixerConfig {
                alpha: 0.5,
                beta: 0.5,
                gamma: 0.0,
            })),
        )
        .unwrap();
    let sink = pipeline
        .add_node("sink", NodeKind::ImageSink, Box::new(node::nodes::image::sink()))
        .unwrap();

    pipeline.connect(a.output("image"), mixer.input("a")).unwrap();
    pipeline.connect(b.output("image"), mixer.input("b")).unwrap();
    pipeline.connect(mixer.output("out"), sink.input("in")).unwrap();

    pipeline.init(&device).unwrap();

    let free_before = pipeline.pool().free_count();
    let in_use_before = pipeline.pool().in_use_count();

    let output = pipeline.run(&device).unwrap();
    match output {
        PipelineOutput::Image { width, height, pixels } => {
            assert_eq!(width, 4);
            assert_eq!(height, 4);
            assert_eq!(pixels.len(), 4 * 4 * 4);
            for pixel in pixels.chunks_exact(4) {
                assert_eq!(pixel, &[96, 96, 96, 255]);
            }
        }
        PipelineOutput::Keypoints(_) => panic!("expected an image output"),
    }

    // The pool's free/in-use accounting returns to its pre-run state once
    // the run has fully retired, for both successful and (elsewhere)
    // failing runs.
    assert_eq!(pipeline.pool().in_use_count(), in_use_before);
    assert_eq!(pipeline.pool().free_count(), free_before + 3, "three scratch textures (two sources, one mixer) should have been returned to the free list");
}

/// Stub node that publishes a fixed set of synthetic keypoints, pre-encoded
/// into the dense wire format via the same codec the real detector nodes
/// use, without needing a caller-supplied detector kernel.
struct SyntheticKeypointsNode {
    candidates: Vec<CandidateKeypoint>,
    source_width: u32,
    source_height: u32,
    layout: KeypointLayout,
}

impl NodeBehavior for SyntheticKeypointsNode {
    fn declare_ports(&self) -> Vec<PortSpec> {
        vec![PortSpec::output("keypoints", MessageKind::Keypoint)]
    }

    fn run(&mut self, ctx: &mut NodeContext<'_>) -> Result<HashMap<String, Message>, kinegraph::error::EngineError> {
        let fix_resolution = keypoint::fix_resolution_for(self.source_width.max(self.source_height));
        let bytes = keypoint::encode_sparse_to_dense(
            &self.candidates,
            self.source_width,
            self.source_height,
            &self.layout,
            fix_resolution,
        );
        let descriptor = TextureDescriptor::new(
            Size::new(self.layout.encoder_length, self.layout.encoder_length),
            TextureFormat::Rgba8Unorm,
        );
        let handle = ctx.pool.alloc_scratch(ctx.device.device(), descriptor)?;
        let texture = ctx.pool.get(handle).expect("just allocated");
        ctx.device.write_texture(texture, &bytes);

        let mut outputs = HashMap::new();
        outputs.insert(
            "keypoints".to_string(),
            Message::Keypoint {
                encoded_keypoints: handle,
                descriptor_size: self.layout.descriptor_size,
                extra_size: self.layout.extra_size,
                encoder_length: self.layout.encoder_length,
            },
        );
        Ok(outputs)
    }
}

/// A detector producing 300 candidates feeding a clipper with `size=100`
/// yields exactly 100 keypoints, ordered by descending score.
#[test]
fn s4_clipper_retains_capacity_highest_scores_first() {
    let Some(device) = device() else { return };

    // Candidate positions live in the same grid the host-side re-encoder
    // addresses: the cell-grid texture's own width/height, matching the
    // convention the crate's own re-encoding nodes (clipper/buffer/mixer)
    // use.
    let in_layout = KeypointLayout::for_capacity(300, 0, 0);
    let grid = in_layout.encoder_length;
    let mut candidates = Vec::new();
    for i in 0..300u32 {
        candidates.push(CandidateKeypoint {
            x: i % grid,
            y: i / grid,
            corner_score: 255,
            intensity: 0,
            scale_byte: 0,
            lod: 0.0,
            orientation: 0.0,
            score: (i * 37 % 1000) as u16,
            descriptor: Vec::new(),
            extra: Vec::new(),
        });
    }

    let mut pipeline = Pipeline::new(EngineConfig::default());
    let source = pipeline
        .add_node(
            "detections",
            NodeKind::FastDetector,
            Box::new(SyntheticKeypointsNode {
                candidates,
                source_width: grid,
                source_height: grid,
                layout: in_layout,
            }),
        )
        .unwrap();
    let clipper = pipeline
        .add_node(
            "clip",
            NodeKind::KeypointClipper,
            Box::new(node::nodes::keypoint::clipper(ClipperConfig { size: 100 })),
        )
        .unwrap();
    let sink = pipeline
        .add_node("sink", NodeKind::KeypointSink, Box::new(node::nodes::keypoint::sink()))
        .unwrap();

    pipeline.connect(source.output("keypoints"), clipper.input("keypoints")).unwrap();
    pipeline.connect(clipper.output("keypoints"), sink.input("keypoints")).unwrap();

    pipeline.init(&device).unwrap();
    let output = pipeline.run(&device).unwrap();

    match output {
        PipelineOutput::Keypoints(keypoints) => {
            assert_eq!(keypoints.len(), 100);
            for pair in keypoints.windows(2) {
                assert!(pair[0].score >= pair[1].score, "expected descending score order");
            }
        }
        PipelineOutput::Image { .. } => panic!("expected a keypoint output"),
    }
}

/// Releasing a pipeline while a read-back is pending rejects that read
/// with `Cancelled`, without needing an executor to drive it: polling once
/// by hand is enough to observe the resolved state.
#[test]
fn cancelling_a_pending_read_resolves_it_as_cancelled() {
    let Some(device) = device() else { return };

    let descriptor = TextureDescriptor::new(Size::new(4, 4), TextureFormat::Rgba8Unorm);
    let mut pool = kinegraph::texture::TexturePool::new();
    let handle = pool.alloc_scratch(device.device(), descriptor).unwrap();
    let texture = pool.get(handle).unwrap();

    let mut ring = StagingRing::new(1);
    let mut future = Box::pin(ring.read_pixels(&device, texture));

    ring.cancel_all();

    let waker = waker_fn::waker_fn(|| {});
    let mut cx = std::task::Context::from_waker(&waker);
    match future.as_mut().poll(&mut cx) {
        std::task::Poll::Ready(Err(kinegraph::error::EngineError::Cancelled)) => {}
        other => panic!("expected a resolved Cancelled read, got {other:?}"),
    }
}
