//! The pipeline scheduler: graph validation, topological scheduling,
//! message routing between nodes, and resource discipline.
//!
//! Mirrors the teacher's `Program`/`Launcher`/`Encoder` three-phase shape
//! (build a plan, launch it against a device, encode/step it to
//! completion) and its test suite's `execution.step()`/`is_running()`/
//! `retire_gracefully()` control flow (`tests/blend.rs`). Node identity uses
//! `slotmap` rather than raw indices so a released node's id can never alias
//! a later one, the same reason the teacher keys its `Pool`/`Cache` free
//! lists by generational key.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use slotmap::SlotMap;
use waker_fn::waker_fn;

use crate::config::EngineConfig;
use crate::device::DeviceContext;
use crate::error::{EngineError, IllegalOperationError, ValidationError};
use crate::keypoint::{self, KeypointLayout};
use crate::node::{NodeBehavior, NodeContext, NodeKind};
use crate::port::{Message, MessageKind, PortDirection, PortSpec};
use crate::reader::StagingRing;
use crate::texture::TexturePool;
use crate::value::Keypoint;

slotmap::new_key_type! {
    /// Identifies a node within one [`Pipeline`]. Stable for the node's
    /// lifetime in the pipeline; never reused after `remove`.
    pub struct NodeId;
}

/// A reference to one named port on one node, as returned by
/// [`NodeId::output`]/[`NodeId::input`]. Expressed as two plain values
/// passed to [`Pipeline::connect`] rather than a method chain that would
/// need to borrow the pipeline from inside the node handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub node: NodeId,
    pub port: String,
}

impl NodeId {
    pub fn output(self, port: &str) -> PortRef {
        PortRef {
            node: self,
            port: port.to_string(),
        }
    }

    pub fn input(self, port: &str) -> PortRef {
        PortRef {
            node: self,
            port: port.to_string(),
        }
    }
}

struct NodeEntry {
    name: String,
    kind: NodeKind,
    ports: Vec<PortSpec>,
    behavior: Box<dyn NodeBehavior>,
}

fn is_designated_sink_kind(kind: NodeKind) -> bool {
    matches!(kind, NodeKind::ImageSink | NodeKind::KeypointSink)
}

/// The user-visible result of one `run()`, assembled by the designated
/// sink's export step.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutput {
    /// Row-major RGBA8 pixels.
    Image { width: u32, height: u32, pixels: Vec<u8> },
    Keypoints(Vec<Keypoint>),
}

/// A set of nodes plus connections. Owns every node and every connection
/// record; nodes hold no back-pointer to the pipeline, so there is no cycle
/// in the ownership graph even though the dataflow graph it describes may
/// (illegally) contain one.
pub struct Pipeline {
    nodes: SlotMap<NodeId, NodeEntry>,
    insertion_order: Vec<NodeId>,
    /// downstream (node, input port) -> upstream (node, output port).
    connections: HashMap<(NodeId, String), (NodeId, String)>,
    config: EngineConfig,
    pool: TexturePool,
    reader: StagingRing,
    sink: Option<NodeId>,
    topo: Option<Vec<NodeId>>,
    initialized: bool,
    run_in_progress: bool,
}

impl Pipeline {
    pub fn new(config: EngineConfig) -> Self {
        Pipeline {
            nodes: SlotMap::with_key(),
            insertion_order: Vec::new(),
            connections: HashMap::new(),
            config,
            pool: TexturePool::new(),
            reader: StagingRing::default(),
            sink: None,
            topo: None,
            initialized: false,
            run_in_progress: false,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &TexturePool {
        &self.pool
    }

    /// Construct a node, declare its ports, and take ownership of it. A
    /// node moves through "constructed -> added to pipeline -> init -> run
    /// per frame -> released"; this call is the "added" step.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        kind: NodeKind,
        behavior: Box<dyn NodeBehavior>,
    ) -> Result<NodeId, ValidationError> {
        let name = name.into();
        if self.insertion_order.iter().any(|id| self.nodes[*id].name == name) {
            return Err(ValidationError::DuplicateNodeName(name));
        }

        let ports = behavior.declare_ports();
        let id = self.nodes.insert(NodeEntry {
            name,
            kind,
            ports,
            behavior,
        });
        self.insertion_order.push(id);
        self.topo = None;
        self.initialized = false;
        Ok(id)
    }

    fn port_spec(&self, node: NodeId, port: &str, direction: PortDirection) -> Option<&PortSpec> {
        self.nodes
            .get(node)?
            .ports
            .iter()
            .find(|spec| spec.name == port && spec.direction == direction)
    }

    /// Wire an output port to an input port. Rejects a type-mismatched
    /// connection synchronously, at the wiring call itself, not at run
    /// time. Connecting to an input that already has a connection replaces
    /// it.
    pub fn connect(&mut self, output: PortRef, input: PortRef) -> Result<(), EngineError> {
        let out_spec = self
            .port_spec(output.node, &output.port, PortDirection::Output)
            .ok_or(ValidationError::TypeMismatch)?
            .clone();
        let in_spec = self
            .port_spec(input.node, &input.port, PortDirection::Input)
            .ok_or(ValidationError::TypeMismatch)?
            .clone();

        if !in_spec.accepts(&out_spec) {
            return Err(ValidationError::TypeMismatch.into());
        }

        self.connections
            .insert((input.node, input.port), (output.node, output.port));
        self.topo = None;
        self.initialized = false;
        Ok(())
    }

    /// Validate the graph and compute a topological execution order. Must
    /// be called, and succeed, before [`Pipeline::run`].
    pub fn init(&mut self, device: &DeviceContext) -> Result<(), EngineError> {
        self.validate_wiring()?;
        self.topo = Some(self.topological_order()?);

        for id in &self.insertion_order {
            self.nodes[*id].behavior.init(device)?;
        }

        self.initialized = true;
        Ok(())
    }

    fn validate_wiring(&mut self) -> Result<(), ValidationError> {
        for id in &self.insertion_order {
            let entry = &self.nodes[*id];
            for port in entry.ports.iter().filter(|p| p.direction == PortDirection::Input) {
                if !self.connections.contains_key(&(*id, port.name.clone())) {
                    return Err(ValidationError::UnconnectedInput {
                        node: entry.name.clone(),
                        port: port.name.clone(),
                    });
                }
            }
        }

        let sinks: Vec<NodeId> = self
            .insertion_order
            .iter()
            .copied()
            .filter(|id| is_designated_sink_kind(self.nodes[*id].kind))
            .collect();

        match sinks.len() {
            0 => return Err(ValidationError::NoSink),
            1 => self.sink = Some(sinks[0]),
            count => return Err(ValidationError::MultipleSinks { count }),
        }

        Ok(())
    }

    /// Kahn's algorithm with explicit tie-breaking: (a) nodes with no
    /// inputs first, which falls out naturally since they start at
    /// in-degree zero; (b) among ready nodes, insertion order; (c) the
    /// designated sink is always scheduled last, held back even if its
    /// in-degree reaches zero early.
    fn topological_order(&self) -> Result<Vec<NodeId>, ValidationError> {
        let total = self.insertion_order.len();
        let sink = self.sink;

        let mut in_degree: HashMap<NodeId, usize> = self.insertion_order.iter().map(|id| (*id, 0)).collect();
        let mut successors: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for (downstream, upstream) in &self.connections {
            *in_degree.entry(downstream.0).or_insert(0) += 1;
            successors.entry(upstream.0).or_default().push(downstream.0);
        }

        let mut scheduled: std::collections::HashSet<NodeId> = std::collections::HashSet::new();
        let mut order = Vec::with_capacity(total);

        while order.len() < total {
            let remaining_non_sink = self
                .insertion_order
                .iter()
                .filter(|id| !scheduled.contains(*id) && Some(**id) != sink)
                .count();

            let next = self.insertion_order.iter().find(|id| {
                !scheduled.contains(*id)
                    && in_degree.get(*id).copied().unwrap_or(0) == 0
                    && (Some(**id) != sink || remaining_non_sink == 0)
            });

            let Some(&id) = next else {
                return Err(ValidationError::Cycle);
            };

            scheduled.insert(id);
            order.push(id);
            if let Some(succs) = successors.get(&id) {
                for succ in succs {
                    if let Some(degree) = in_degree.get_mut(succ) {
                        *degree = degree.saturating_sub(1);
                    }
                }
            }
        }

        Ok(order)
    }

    /// Run one pass to completion, blocking on any required read-back.
    /// Equivalent to `begin_run(device)?.retire_gracefully()`; most callers
    /// want this rather than driving [`Execution`] by hand.
    pub fn run(&mut self, device: &DeviceContext) -> Result<PipelineOutput, EngineError> {
        self.begin_run(device)?.retire_gracefully()
    }

    /// Start one run. The returned [`Execution`] borrows `self` mutably, so
    /// the borrow checker alone enforces "at most one run in flight": a
    /// second `begin_run` cannot be called until the first `Execution` is
    /// dropped or retired. [`crate::config::SchedulerPolicy`] records
    /// whether a caller wants runs queued (FIFO) or rejected while one is
    /// busy, for any queueing it builds on top of this guarantee.
    pub fn begin_run<'p>(&'p mut self, device: &'p DeviceContext) -> Result<Execution<'p>, EngineError> {
        if !self.initialized {
            return Err(IllegalOperationError::Uninitialized.into());
        }
        if self.run_in_progress && self.config.scheduler_policy == crate::config::SchedulerPolicy::RejectBusy {
            return Err(EngineError::Busy);
        }
        self.run_in_progress = true;

        let order = self
            .topo
            .clone()
            .expect("init() computed a topological order")
            .into_iter();

        Ok(Execution {
            pipeline: self,
            device,
            order,
            published: HashMap::new(),
            remaining_consumers: HashMap::new(),
            read: None,
            finished: false,
        })
    }

    /// Cancel any outstanding asynchronous reads and return every scratch
    /// texture to the pool. Called on pipeline teardown; pending
    /// [`crate::reader::ReadPixelsFuture`]s resolve with
    /// [`EngineError::Cancelled`] rather than completing.
    pub fn release(&mut self) {
        self.reader.cancel_all();
        self.pool.release_all();
        for id in &self.insertion_order {
            self.nodes[*id].behavior.release(&mut self.pool);
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.release();
    }
}

enum PendingRead {
    Image {
        width: u32,
        height: u32,
        future: Pin<Box<crate::reader::ReadPixelsFuture>>,
    },
    Keypoint {
        layout: KeypointLayout,
        fix_resolution: u32,
        future: Pin<Box<crate::reader::ReadPixelsFuture>>,
    },
}

/// One `run()` in progress: a state machine stepping through the
/// topological order one node at a time, modeled on the teacher's
/// `Execution::step`/`is_running`/`retire_gracefully` (see
/// `tests/blend.rs`). The borrow on `pipeline` is what enforces "at most one
/// run in flight"; suspension happens only at the final read-back the
/// designated sink needs to assemble its [`PipelineOutput`].
pub struct Execution<'p> {
    pipeline: &'p mut Pipeline,
    device: &'p DeviceContext,
    order: std::vec::IntoIter<NodeId>,
    published: HashMap<(NodeId, String), Message>,
    remaining_consumers: HashMap<(NodeId, String), usize>,
    read: Option<PendingRead>,
    finished: bool,
}

impl<'p> Execution<'p> {
    pub fn is_running(&self) -> bool {
        !self.finished
    }

    /// Consume one reference to `key`'s published message, releasing its
    /// texture back to the pool once every downstream consumer declared at
    /// wiring time has read it.
    fn release_if_exhausted(&mut self, key: (NodeId, String)) {
        let Some(handle) = self.published.get(&key).and_then(Message::texture_handle) else {
            return;
        };

        let total = self.pipeline.connections.values().filter(|upstream| **upstream == key).count();
        let remaining = self.remaining_consumers.entry(key).or_insert(total);
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.pipeline.pool.release_scratch(handle);
        }
    }

    /// Run the next node in topological order. Returns `Ok(true)` while more
    /// work remains, `Ok(false)` once this was the pipeline's last node (the
    /// designated sink).
    pub fn step(&mut self) -> Result<bool, EngineError> {
        if self.finished {
            return Ok(false);
        }

        let Some(id) = self.order.next() else {
            self.finished = true;
            return Ok(false);
        };

        let result = self.run_one(id);
        if result.is_err() {
            self.finished = true;
        }
        result?;

        let has_more = !self.finished;
        Ok(has_more)
    }

    fn run_one(&mut self, id: NodeId) -> Result<(), EngineError> {
        let is_sink = self.pipeline.sink == Some(id);

        let input_ports: Vec<String> = self.pipeline.nodes[id]
            .ports
            .iter()
            .filter(|p| p.direction == PortDirection::Input)
            .map(|p| p.name.clone())
            .collect();

        let mut inputs = HashMap::new();
        let mut upstream_keys = Vec::new();
        for port in &input_ports {
            let upstream = self
                .pipeline
                .connections
                .get(&(id, port.clone()))
                .cloned()
                .expect("init() validated every input is connected");
            let message = self
                .published
                .get(&upstream)
                .cloned()
                .ok_or_else(|| IllegalOperationError::ReadBeforeWrite {
                    node: self.pipeline.nodes[id].name.clone(),
                    port: port.clone(),
                })?;
            upstream_keys.push(upstream);
            inputs.insert(port.clone(), message);
        }

        if is_sink {
            self.schedule_sink_export(&inputs)?;
        }

        let outputs = {
            let mut ctx = NodeContext {
                device: self.device,
                pool: &mut self.pipeline.pool,
                inputs: &inputs,
            };
            self.pipeline.nodes[id].behavior.run(&mut ctx)?
        };

        for (port, message) in outputs {
            self.published.insert((id, port), message);
        }

        for key in upstream_keys {
            self.release_if_exhausted(key);
        }

        if self.order.as_slice().is_empty() {
            self.finished = true;
        }

        Ok(())
    }

    fn schedule_sink_export(&mut self, inputs: &HashMap<String, Message>) -> Result<(), EngineError> {
        match inputs.values().next() {
            Some(Message::Image { texture, .. }) => {
                let tex = self
                    .pipeline
                    .pool
                    .get(*texture)
                    .ok_or_else(|| EngineError::Resource(crate::error::ResourceError::Allocation(
                        "stale scratch handle".to_string(),
                    )))?;
                let size = tex.size();
                let future = Box::pin(self.pipeline.reader.read_pixels(self.device, tex));
                self.read = Some(PendingRead::Image {
                    width: size.width,
                    height: size.height,
                    future,
                });
                Ok(())
            }
            Some(Message::Keypoint {
                encoded_keypoints,
                descriptor_size,
                extra_size,
                encoder_length,
            }) => {
                let tex = self
                    .pipeline
                    .pool
                    .get(*encoded_keypoints)
                    .ok_or_else(|| EngineError::Resource(crate::error::ResourceError::Allocation(
                        "stale scratch handle".to_string(),
                    )))?;
                let layout = KeypointLayout {
                    descriptor_size: *descriptor_size,
                    extra_size: *extra_size,
                    encoder_length: *encoder_length,
                };
                let fix_resolution = keypoint::fix_resolution_for(*encoder_length);
                let future = Box::pin(self.pipeline.reader.read_pixels(self.device, tex));
                self.read = Some(PendingRead::Keypoint {
                    layout,
                    fix_resolution,
                    future,
                });
                Ok(())
            }
            Some(Message::Matrix2D(_)) | Some(Message::Vector2D(_)) => Err(IllegalOperationError::WrongMessageKind {
                node: "sink".to_string(),
                port: "input".to_string(),
            }
            .into()),
            None => Err(IllegalOperationError::ReadBeforeWrite {
                node: "sink".to_string(),
                port: "input".to_string(),
            }
            .into()),
        }
    }

    /// Poll the scheduled read-back once without blocking. `Ok(None)` means
    /// the export is still pending; a caller driving `step`/`poll_export` by
    /// hand (instead of `retire_gracefully`) can interleave this with other
    /// work. Polling before `step` has produced a sink export is a logic
    /// error and panics.
    pub fn poll_export(&mut self) -> Result<Option<PipelineOutput>, EngineError> {
        let waker = waker_fn(|| {});
        let mut cx = Context::from_waker(&waker);

        let pending = self.read.as_mut().expect("sink export not scheduled yet");
        let poll = match pending {
            PendingRead::Image { width, height, future } => future.as_mut().poll(&mut cx).map(|result| {
                result.map(|pixels| PipelineOutput::Image {
                    width: *width,
                    height: *height,
                    pixels,
                })
            }),
            PendingRead::Keypoint {
                layout,
                fix_resolution,
                future,
            } => future
                .as_mut()
                .poll(&mut cx)
                .map(|result| result.map(|bytes| PipelineOutput::Keypoints(keypoint::decode_dense(&bytes, layout, *fix_resolution)))),
        };

        match poll {
            Poll::Ready(result) => {
                self.read = None;
                result.map(Some)
            }
            Poll::Pending => Ok(None),
        }
    }

    /// Drive this run to completion, blocking on the device queue between
    /// polls of the sink's read-back future.
    pub fn retire_gracefully(mut self) -> Result<PipelineOutput, EngineError> {
        while self.is_running() {
            self.step()?;
        }

        loop {
            if let Some(output) = self.poll_export()? {
                return Ok(output);
            }
            self.device.device().poll(wgpu::Maintain::Wait);
        }
    }
}

impl Drop for Execution<'_> {
    fn drop(&mut self) {
        self.pipeline.run_in_progress = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::{EngineError, ValidationError};

    struct StubNode {
        ports: Vec<PortSpec>,
    }

    impl NodeBehavior for StubNode {
        fn declare_ports(&self) -> Vec<PortSpec> {
            self.ports.clone()
        }

        fn run(&mut self, ctx: &mut NodeContext<'_>) -> Result<HashMap<String, Message>, EngineError> {
            let mut outputs = HashMap::new();
            for port in self.ports.iter().filter(|p| p.direction == PortDirection::Output) {
                outputs.insert(
                    port.name.clone(),
                    match port.kind {
                        MessageKind::Vector2D => Message::Vector2D(crate::value::Vector2::new(0.0, 0.0)),
                        _ => unreachable!("tests only use Vector2D stub ports"),
                    },
                );
            }
            let _ = ctx;
            Ok(outputs)
        }
    }

    fn source(name: &str, pipeline: &mut Pipeline) -> NodeId {
        pipeline
            .add_node(
                name,
                NodeKind::ImageSource,
                Box::new(StubNode {
                    ports: vec![PortSpec::output("out", MessageKind::Vector2D)],
                }),
            )
            .unwrap()
    }

    fn passthrough(name: &str, pipeline: &mut Pipeline) -> NodeId {
        pipeline
            .add_node(
                name,
                NodeKind::ImageMixer,
                Box::new(StubNode {
                    ports: vec![
                        PortSpec::input("in", MessageKind::Vector2D),
                        PortSpec::output("out", MessageKind::Vector2D),
                    ],
                }),
            )
            .unwrap()
    }

    fn sink(name: &str, pipeline: &mut Pipeline) -> NodeId {
        pipeline
            .add_node(
                name,
                NodeKind::ImageSink,
                Box::new(StubNode {
                    ports: vec![PortSpec::input("in", MessageKind::Vector2D)],
                }),
            )
            .unwrap()
    }

    #[test]
    fn duplicate_node_name_rejected() {
        let mut pipeline = Pipeline::new(EngineConfig::default());
        source("a", &mut pipeline);
        let err = pipeline.add_node(
            "a",
            NodeKind::ImageSource,
            Box::new(StubNode {
                ports: vec![PortSpec::output("out", MessageKind::Vector2D)],
            }),
        );
        assert_eq!(err.unwrap_err(), ValidationError::DuplicateNodeName("a".to_string()));
    }

    #[test]
    fn type_mismatch_rejected_at_wiring_time() {
        let mut pipeline = Pipeline::new(EngineConfig::default());
        let a = pipeline
            .add_node(
                "a",
                NodeKind::ImageSource,
                Box::new(StubNode {
                    ports: vec![PortSpec::output("out", MessageKind::Image)],
                }),
            )
            .unwrap();
        let b = pipeline
            .add_node(
                "b",
                NodeKind::ImageSink,
                Box::new(StubNode {
                    ports: vec![PortSpec::input("in", MessageKind::Keypoint)],
                }),
            )
            .unwrap();

        let err = pipeline.connect(a.output("out"), b.input("in"));
        assert!(matches!(err, Err(EngineError::Validation(ValidationError::TypeMismatch))));
    }

    #[test]
    fn missing_sink_fails_validation() {
        let mut pipeline = Pipeline::new(EngineConfig::default());
        source("a", &mut pipeline);
        let err = pipeline.validate_wiring();
        assert_eq!(err.unwrap_err(), ValidationError::NoSink);
    }

    #[test]
    fn multiple_sinks_fail_validation() {
        let mut pipeline = Pipeline::new(EngineConfig::default());
        let a = source("a", &mut pipeline);
        let s1 = sink("s1", &mut pipeline);
        let s2 = sink("s2", &mut pipeline);
        pipeline.connect(a.output("out"), s1.input("in")).unwrap();
        pipeline.connect(a.output("out"), s2.input("in")).unwrap();
        let err = pipeline.validate_wiring();
        assert_eq!(err.unwrap_err(), ValidationError::MultipleSinks { count: 2 });
    }

    #[test]
    fn unconnected_input_fails_validation() {
        let mut pipeline = Pipeline::new(EngineConfig::default());
        source("a", &mut pipeline);
        sink("s", &mut pipeline);
        let err = pipeline.validate_wiring();
        assert!(matches!(err, Err(ValidationError::UnconnectedInput { .. })));
    }

    #[test]
    fn cycle_is_detected() {
        let mut pipeline = Pipeline::new(EngineConfig::default());
        let a = pipeline
            .add_node(
                "a",
                NodeKind::ImageMixer,
                Box::new(StubNode {
                    ports: vec![
                        PortSpec::input("in", MessageKind::Vector2D),
                        PortSpec::output("out", MessageKind::Vector2D),
                    ],
                }),
            )
            .unwrap();
        let b = pipeline
            .add_node(
                "b",
                NodeKind::ImageMixer,
                Box::new(StubNode {
                    ports: vec![
                        PortSpec::input("in", MessageKind::Vector2D),
                        PortSpec::output("out", MessageKind::Vector2D),
                    ],
                }),
            )
            .unwrap();
        pipeline.connect(a.output("out"), b.input("in")).unwrap();
        pipeline.connect(b.output("out"), a.input("in")).unwrap();

        let err = pipeline.validate_wiring();
        // A cycle passes the "every input connected" and "exactly one sink"
        // checks (there is no sink here at all, so NoSink fires first); wire
        // in a sink-bearing variant of this graph to exercise the scheduler
        // itself, done in `sink_is_scheduled_last`'s sibling below.
        assert_eq!(err.unwrap_err(), ValidationError::NoSink);
    }

    #[test]
    fn cycle_with_sink_is_detected_by_topological_order() {
        let mut pipeline = Pipeline::new(EngineConfig::default());
        let a = pipeline
            .add_node(
                "a",
                NodeKind::ImageMixer,
                Box::new(StubNode {
                    ports: vec![
                        PortSpec::input("in", MessageKind::Vector2D),
                        PortSpec::output("out", MessageKind::Vector2D),
                    ],
                }),
            )
            .unwrap();
        let b = pipeline
            .add_node(
                "b",
                NodeKind::ImageMixer,
                Box::new(StubNode {
                    ports: vec![
                        PortSpec::input("in", MessageKind::Vector2D),
                        PortSpec::output("out", MessageKind::Vector2D),
                    ],
                }),
            )
            .unwrap();
        let s = sink("s", &mut pipeline);
        pipeline.connect(a.output("out"), b.input("in")).unwrap();
        pipeline.connect(b.output("out"), a.input("in")).unwrap();
        // `s` needs an input to pass the unconnected-input check; wire it to
        // `b`'s output even though `b` never actually becomes ready.
        pipeline.connect(b.output("out"), s.input("in")).unwrap();

        pipeline.validate_wiring().unwrap();
        let err = pipeline.topological_order();
        assert_eq!(err.unwrap_err(), ValidationError::Cycle);
    }

    #[test]
    fn sink_is_scheduled_last_and_order_respects_insertion() {
        let mut pipeline = Pipeline::new(EngineConfig::default());
        let a = source("a", &mut pipeline);
        let b = passthrough("b", &mut pipeline);
        let c = passthrough("c", &mut pipeline);
        let s = sink("s", &mut pipeline);

        // `c` is wired to run independently of `b` (both read from `a`), so
        // insertion order alone should break the tie between them.
        pipeline.connect(a.output("out"), b.input("in")).unwrap();
        pipeline.connect(a.output("out"), c.input("in")).unwrap();
        pipeline.connect(c.output("out"), s.input("in")).unwrap();

        // `s` only declares one input port; reconnecting it below replaces
        // this first wiring, which is fine for this test (only order
        // matters, not final wiring correctness).
        pipeline.validate_wiring().unwrap();
        let order = pipeline.topological_order().unwrap();

        assert_eq!(order[0], a);
        assert_eq!(order[1], b);
        assert_eq!(order[2], c);
        assert_eq!(*order.last().unwrap(), s);
    }
}
