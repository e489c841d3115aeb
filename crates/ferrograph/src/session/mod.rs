//! Training and inference sessions.
//!
//! A session imports a model, attaches losses, synthesizes the backward pass
//! and runs the pattern pipeline at construction. `prepare_device` partitions
//! the graph and compiles it (or loads it from the engine cache), after which
//! weights are transferred and steps of `batchesPerStep` micro-batches are run
//! against a [`StepIo`].
//!
//! ```text
//! Constructed --prepare_device--> Prepared --weights_from_host--> Ready --run--> Running
//! ```

mod anchors;
pub mod cache;
mod dataflow;
pub mod executable;
mod options;
pub mod report;
mod runtime;
mod stepio;

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::autodiff;
use crate::backend::{create_backend, list_backends, BackendError, ErasedBackend};
use crate::device::{DeviceInfo, DeviceLease};
use crate::error::{Error, Result};
use crate::ir::{Graph, TensorId, TensorType};
use crate::logging::{Diagnostic, DiagnosticSink, TracingSink};
use crate::partition::{self, PartitionMode};
use crate::proto::ModelProto;
use crate::tensor::{HostTensor, InputShapeInfo, TensorData, TensorInfo};
use crate::train::{Loss, Sgd};
use crate::transform::{PassContext, PatternPipeline, Patterns};

pub use anchors::Anchors;
pub use dataflow::{AnchorReturnType, DataFlow};
pub use executable::{CompiledOp, Executable, RunMode};
pub use options::{SessionOptions, SyntheticDataMode};
pub use report::{ExecutionReport, GraphReport, TensorTileMap};
pub use stepio::{ArrayStepIo, CallbackStepIo, StepIo, WeightsIo};

use runtime::Runtime;

const REPORT_BEFORE_PREPARE: &str =
    "Session must have been prepared before a report can be fetched";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Constructed,
    Prepared,
    Ready,
    Running,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Constructed => "Constructed",
            SessionState::Prepared => "Prepared",
            SessionState::Ready => "Ready",
            SessionState::Running => "Running",
        };
        f.write_str(name)
    }
}

/// Collects the construction arguments of a [`Session`].
pub struct SessionBuilder<'m> {
    model: &'m [u8],
    dataflow: DataFlow,
    device: Arc<DeviceInfo>,
    losses: Vec<Box<dyn Loss>>,
    optimizer: Option<Sgd>,
    options: SessionOptions,
    patterns: Patterns,
    input_shape_info: InputShapeInfo,
    sink: Arc<dyn DiagnosticSink>,
}

impl<'m> SessionBuilder<'m> {
    pub fn losses(mut self, losses: Vec<Box<dyn Loss>>) -> Self {
        self.losses = losses;
        self
    }

    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn patterns(mut self, patterns: Patterns) -> Self {
        self.patterns = patterns;
        self
    }

    pub fn input_shape_info(mut self, info: InputShapeInfo) -> Self {
        self.input_shape_info = info;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> Result<Session> {
        Session::construct(self)
    }
}

struct HostStep<'a> {
    mode: RunMode,
    stepio: &'a mut dyn StepIo,
}

pub struct Session {
    model: ModelProto,
    graph: Graph,
    dataflow: DataFlow,
    options: SessionOptions,
    device: Arc<DeviceInfo>,
    lease: Option<DeviceLease>,
    backend: Box<dyn ErasedBackend>,
    optimizer: Option<Sgd>,
    has_losses: bool,
    host_weights: BTreeMap<TensorId, HostTensor>,
    state: SessionState,
    prepared: bool,
    engine: Option<Runtime>,
    graph_hash: u64,
    cache_key: u64,
    cache_hit: bool,
    weights_uploaded: bool,
    optimizer_uploaded: bool,
    steps_run: u64,
    rng: StdRng,
    sink: Arc<dyn DiagnosticSink>,
}

impl Session {
    /// An inference session. Losses are optional and enable `evaluate`.
    pub fn inference(model: &[u8], dataflow: DataFlow, device: Arc<DeviceInfo>) -> SessionBuilder<'_> {
        SessionBuilder {
            model,
            dataflow,
            device,
            losses: Vec::new(),
            optimizer: None,
            options: SessionOptions::default(),
            patterns: Patterns::default(),
            input_shape_info: InputShapeInfo::new(),
            sink: Arc::new(TracingSink),
        }
    }

    pub fn training(
        model: &[u8],
        dataflow: DataFlow,
        losses: Vec<Box<dyn Loss>>,
        optimizer: Sgd,
        device: Arc<DeviceInfo>,
    ) -> SessionBuilder<'_> {
        SessionBuilder {
            losses,
            optimizer: Some(optimizer),
            ..Self::inference(model, dataflow, device)
        }
    }

    fn construct(args: SessionBuilder<'_>) -> Result<Self> {
        let SessionBuilder {
            model,
            dataflow,
            device,
            losses,
            optimizer,
            options,
            patterns,
            input_shape_info,
            sink,
        } = args;

        let model = ModelProto::from_bytes(model)?;
        let mut graph = Graph::from_model(&model, input_shape_info.as_map())?;
        let backend_name = device.device_type().backend_name();
        let backend =
            create_backend(backend_name).ok_or_else(|| BackendError::UnknownBackend {
                name: backend_name.to_string(),
                registered: list_backends(),
            })?;

        if !losses.is_empty() {
            autodiff::attach_losses(&mut graph, &losses)?;
        }
        if let Some(optimizer) = &optimizer {
            if losses.is_empty() {
                return Err(Error::config("A training session requires at least one loss"));
            }
            autodiff::add_optimizer_tensors(&mut graph, optimizer)?;
            autodiff::synthesize_gradients(&mut graph, &losses, sink.as_ref())?;
        }

        for id in dataflow.anchor_ids() {
            if !graph.contains_tensor(id) {
                return Err(Error::config(format!(
                    "Anchor tensor '{id}' is not in the graph"
                )));
            }
            graph.protect(id);
        }

        let pipeline = PatternPipeline::new(
            &patterns,
            Some(backend.clone_backend()),
            options.pattern_max_iterations,
        );
        pipeline.run(&mut graph, &mut PassContext::new(sink.as_ref()))?;

        let host_weights = graph
            .tensors()
            .filter(|t| t.tensor_type == TensorType::Variable)
            .filter_map(|t| t.data.clone().map(|d| (t.id.clone(), d)))
            .collect();
        let graph_hash = graph.fingerprint()?;
        let cache_key = cache::cache_key(graph_hash, &options, &device)?;

        let lease = device.lease()?;
        sink.emit(Diagnostic::DeviceAttached { id: device.id() });
        tracing::info!(
            target: "ferrograph::session",
            ops = graph.num_ops(),
            training = optimizer.is_some(),
            "session constructed for {device}"
        );

        let rng = StdRng::seed_from_u64(options.random_seed);
        Ok(Self {
            model,
            graph,
            dataflow,
            options,
            device,
            lease,
            backend,
            optimizer,
            has_losses: !losses.is_empty(),
            host_weights,
            state: SessionState::Constructed,
            prepared: false,
            engine: None,
            graph_hash,
            cache_key,
            cache_hit: false,
            weights_uploaded: false,
            optimizer_uploaded: false,
            steps_run: 0,
            rng,
            sink,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_training(&self) -> bool {
        self.optimizer.is_some()
    }

    /// The graph after autodiff and patterns, and after partitioning once
    /// the device is prepared.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn device(&self) -> &Arc<DeviceInfo> {
        &self.device
    }

    pub fn dataflow(&self) -> &DataFlow {
        &self.dataflow
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn executable(&self) -> Option<&Executable> {
        self.engine.as_ref().map(|e| e.executable().as_ref())
    }

    /// Whether `id` currently owns a buffer on the device. Inputs consumed by
    /// an in-place op do not.
    pub fn has_device_value(&self, id: &str) -> bool {
        self.engine.as_ref().map_or(false, |e| e.has_value(id))
    }

    pub fn engine_cache_key(&self) -> u64 {
        self.cache_key
    }

    /// Whether `prepare_device` reused a cached executable.
    pub fn engine_cache_hit(&self) -> bool {
        self.cache_hit
    }

    pub fn steps_run(&self) -> u64 {
        self.steps_run
    }

    fn set_state(&mut self, to: SessionState) {
        if self.state != to {
            self.sink.emit(Diagnostic::StateChanged {
                from: self.state.to_string(),
                to: to.to_string(),
            });
            self.state = to;
        }
    }

    fn virtual_graph_mode(&self) -> Result<Option<PartitionMode>> {
        if !self.options.enable_virtual_graphs {
            return Ok(None);
        }
        let available = self.device.num_ipus() as usize;
        if !self.options.auto_virtual_graph {
            return Ok(Some(PartitionMode::Manual {
                virtual_graphs: available,
            }));
        }
        let wanted = self.options.minimum_virtual_graph_count.max(1);
        if wanted > available {
            return Err(Error::config(format!(
                "{wanted} virtual graphs were requested but the device has {available} IPUs"
            )));
        }
        Ok(Some(PartitionMode::Auto {
            virtual_graphs: wanted,
        }))
    }

    fn compile(&mut self) -> Result<Arc<Executable>> {
        let mode = self.virtual_graph_mode()?;
        let training = self.is_training();
        let num_virtual_graphs = match mode {
            Some(mode) => {
                partition::partition(&mut self.graph, mode, training, self.sink.as_ref())?
                    .virtual_graphs
            }
            None => 1,
        };
        let executable = Executable::compile(&self.graph, num_virtual_graphs, self.graph_hash)?;
        tracing::debug!(
            target: "ferrograph::session",
            ops = executable.num_ops(),
            virtual_graphs = num_virtual_graphs,
            "compiled executable"
        );
        Ok(Arc::new(executable))
    }

    /// Partitions and compiles the graph, or loads a cached executable, and
    /// binds it to the device.
    pub fn prepare_device(&mut self) -> Result<()> {
        if self.prepared {
            return Err(Error::state("prepareDevice has already been called"));
        }
        self.options.validate_opaque()?;

        if !self.options.compile_engine {
            if let Some(mode) = self.virtual_graph_mode()? {
                let training = self.is_training();
                partition::partition(&mut self.graph, mode, training, self.sink.as_ref())?;
            }
            self.prepared = true;
            self.set_state(SessionState::Prepared);
            return Ok(());
        }

        let caching = self.options.enable_engine_caching && self.device.supports_engine_caching();
        let stream_names = self.graph.stream_ids().to_vec();
        let cached = if caching {
            cache::lookup(
                &self.options.cache_path,
                self.cache_key,
                self.graph_hash,
                &stream_names,
                self.sink.as_ref(),
            )?
        } else {
            None
        };
        self.cache_hit = cached.is_some();
        let executable = match cached {
            Some(executable) => executable,
            None => {
                let executable = self.compile()?;
                if caching {
                    cache::store(
                        &self.options.cache_path,
                        self.cache_key,
                        &executable,
                        self.sink.as_ref(),
                    )?;
                }
                executable
            }
        };

        if self.options.export_dot {
            self.export_dot(&executable)?;
        }
        self.engine = Some(Runtime::load(self.backend.clone_backend(), executable)?);
        self.prepared = true;
        self.set_state(SessionState::Prepared);
        Ok(())
    }

    fn export_dot(&self, executable: &Executable) -> Result<()> {
        let mut producers: BTreeMap<&str, &str> = BTreeMap::new();
        for op in executable.ops() {
            for output in &op.outputs {
                producers.insert(output, &op.name);
            }
        }
        let mut dot = String::from("digraph ferrograph {\n");
        for op in executable.ops() {
            let _ = writeln!(
                dot,
                "  \"{}\" [shape=box, label=\"{}\\n{}\\nvg {}\"];",
                op.name,
                op.display_type(),
                op.name,
                op.virtual_graph
            );
            for input in &op.inputs {
                if let Some(producer) = producers.get(input.as_str()) {
                    let _ = writeln!(dot, "  \"{producer}\" -> \"{}\" [label=\"{input}\"];", op.name);
                }
            }
        }
        dot.push_str("}\n");
        fs::create_dir_all(&self.options.log_dir)?;
        let path = self.options.log_dir.join("ferrograph.dot");
        fs::write(&path, dot)?;
        tracing::info!(target: "ferrograph::session", "wrote {}", path.display());
        Ok(())
    }

    /// Fresh zeroed buffers for every anchor, shaped per return type.
    pub fn init_anchor_arrays(&self) -> Result<Anchors> {
        let bps = self.dataflow.batches_per_step();
        let mut buffers = BTreeMap::new();
        for (id, art) in self.dataflow.anchors() {
            let info = self.graph.info(id)?;
            buffers.insert(id.clone(), HostTensor::zeros(art.buffer_info(bps, info)));
        }
        Ok(Anchors::new(buffers))
    }

    fn engine_for(&mut self, op: &str) -> Result<&mut Runtime> {
        if !self.prepared {
            return Err(Error::state(format!("Must call prepareDevice before {op}")));
        }
        self.engine.as_mut().ok_or_else(|| {
            Error::state(format!(
                "Cannot call {op}: no engine was compiled (compileEngine is false)"
            ))
        })
    }

    pub fn weights_from_host(&mut self) -> Result<()> {
        let weights = self.host_weights.clone();
        let engine = self.engine_for("weightsFromHost")?;
        for (id, value) in &weights {
            engine.upload(id, value)?;
        }
        self.weights_uploaded = true;
        if self.state == SessionState::Prepared {
            self.set_state(SessionState::Ready);
        }
        Ok(())
    }

    pub fn optimizer_from_host(&mut self) -> Result<()> {
        let Some(optimizer) = self.optimizer else {
            return Err(Error::state(
                "optimizerFromHost is only valid for training sessions",
            ));
        };
        let engine = self.engine_for("optimizerFromHost")?;
        let streams = engine.executable().optimizer_streams.clone();
        for (id, _) in &streams {
            if let Some((_, value)) = optimizer.values().iter().find(|(name, _)| *name == id.as_str()) {
                engine.upload(id, &value.as_host_tensor())?;
            }
        }
        self.optimizer_uploaded = true;
        Ok(())
    }

    /// Swaps in `optimizer` for later `optimizer_from_host` calls.
    pub fn update_optimizer(&mut self, optimizer: Sgd) -> Result<()> {
        let Some(current) = &self.optimizer else {
            return Err(Error::state("updateOptimizer is only valid for training sessions"));
        };
        if !current.valid_replacement(&optimizer) {
            return Err(Error::config(
                "This Optimizer is not a valid replacement: const values must be unchanged and the set of streamed values must match",
            ));
        }
        self.optimizer = Some(optimizer);
        self.optimizer_uploaded = false;
        Ok(())
    }

    /// Runs one step: training in a training session, evaluation when an
    /// inference session has losses, plain inference otherwise.
    pub fn run(&mut self, stepio: &mut dyn StepIo) -> Result<()> {
        let mode = if self.is_training() {
            RunMode::Train
        } else if self.has_losses {
            RunMode::Evaluate
        } else {
            RunMode::Infer
        };
        self.run_step(HostStep { mode, stepio })
    }

    pub fn train(&mut self, stepio: &mut dyn StepIo) -> Result<()> {
        self.run_step(HostStep {
            mode: RunMode::Train,
            stepio,
        })
    }

    pub fn evaluate(&mut self, stepio: &mut dyn StepIo) -> Result<()> {
        self.run_step(HostStep {
            mode: RunMode::Evaluate,
            stepio,
        })
    }

    pub fn infer(&mut self, stepio: &mut dyn StepIo) -> Result<()> {
        self.run_step(HostStep {
            mode: RunMode::Infer,
            stepio,
        })
    }

    fn check_can_run(&mut self, mode: RunMode) -> Result<()> {
        let op = mode.name();
        let training = self.is_training();
        let has_losses = self.has_losses;
        let needs_weights = !self.weights_uploaded && !self.host_weights.is_empty();
        let needs_optimizer = training && !self.optimizer_uploaded;
        let engine = self.engine_for(op)?;
        if mode == RunMode::Train && !training {
            return Err(Error::state("Trying to train when not in training mode"));
        }
        if mode == RunMode::Evaluate && !has_losses {
            return Err(Error::state("Trying to evaluate without a loss"));
        }
        if needs_weights {
            return Err(Error::state(format!(
                "Must call weightsFromHost before {op} as the model has initializers"
            )));
        }
        if mode == RunMode::Train
            && needs_optimizer
            && !engine.executable().optimizer_streams.is_empty()
        {
            return Err(Error::state(
                "Must call optimizerFromHost before train as the optimizer has streamed values",
            ));
        }
        Ok(())
    }

    fn run_step(&mut self, step: HostStep<'_>) -> Result<()> {
        let HostStep { mode, stepio } = step;
        self.check_can_run(mode)?;
        let bps = self.dataflow.batches_per_step();
        let synthetic = self.options.effective_synthetic_mode();
        let Some(engine) = self.engine.as_mut() else {
            return Err(Error::state(format!("Must call prepareDevice before {}", mode.name())));
        };
        let executable = Arc::clone(engine.executable());

        let available = executable.available_after(mode);
        let mut anchors = Vec::new();
        for (id, art) in self.dataflow.anchors() {
            if !available.contains(&id) {
                return Err(Error::config(format!(
                    "Anchor '{id}' is not computed when running {}",
                    mode.name()
                )));
            }
            let info = executable
                .tensor_infos
                .get(id)
                .cloned()
                .ok_or_else(|| Error::config(format!("Anchor tensor '{id}' is not in the graph")))?;
            anchors.push((id.clone(), *art, info));
        }
        let streams = executable
            .streams_for(mode)
            .into_iter()
            .cloned()
            .collect::<Vec<_>>();

        let host_data = synthetic == SyntheticDataMode::Off;
        if host_data {
            let inputs = streams
                .iter()
                .map(|(id, info)| (id.clone(), info.nelms() * bps))
                .collect();
            let outputs = anchors
                .iter()
                .map(|(id, art, info)| (id.clone(), art.buffer_info(bps, info).nelms()))
                .collect();
            stepio.assert_num_elements(&inputs, &outputs)?;
        }

        let mut sums: BTreeMap<TensorId, TensorData> = BTreeMap::new();
        for batch in 0..bps {
            for (id, info) in &streams {
                let data = match synthetic {
                    SyntheticDataMode::Off => {
                        let data = stepio.input(id, info)?;
                        stepio.input_complete(id)?;
                        data
                    }
                    SyntheticDataMode::Zeros => TensorData::zeros(info.dtype, info.nelms()),
                    SyntheticDataMode::RandomNormal => random_normal(&mut self.rng, info),
                };
                engine.upload(id, &HostTensor::new(info.clone(), data)?)?;
            }
            engine.run_batch(mode)?;

            if !host_data {
                continue;
            }
            for (id, art, _) in &anchors {
                let written = art.writes_batch(batch, bps);
                if *art == AnchorReturnType::Sum {
                    let value = engine.download(id)?.data;
                    match sums.get_mut(id) {
                        Some(total) => {
                            total.accumulate(&value);
                        }
                        None => {
                            sums.insert(id.clone(), value);
                        }
                    }
                    if written {
                        if let Some(total) = sums.get(id) {
                            stepio.output(id, total)?;
                        }
                    }
                } else if written {
                    stepio.output(id, &engine.download(id)?.data)?;
                }
            }
        }

        engine.counters.steps += 1;
        self.steps_run += 1;
        self.set_state(SessionState::Running);
        Ok(())
    }

    fn current_weight(&self, id: &str) -> Result<HostTensor> {
        if self.weights_uploaded {
            if let Some(engine) = &self.engine {
                return engine.download(id);
            }
        }
        self.host_weights
            .get(id)
            .cloned()
            .ok_or_else(|| Error::config(format!("No weight '{id}' in the session")))
    }

    /// The original model with initializers replaced by the current weights.
    pub fn model_to_host_bytes(&self) -> Result<Vec<u8>> {
        if !self.prepared {
            return Err(Error::state("Must call prepareDevice before modelToHost"));
        }
        if self.engine.is_none() {
            return Err(Error::state(
                "Cannot call modelToHost: no engine was compiled (compileEngine is false)",
            ));
        }
        let mut model = self.model.clone();
        for id in self.host_weights.keys() {
            let value = self.current_weight(id)?;
            if let Some(init) = model.initializer_mut(id) {
                init.data = value.data;
            }
        }
        Ok(model.to_bytes()?)
    }

    pub fn model_to_host(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.model_to_host_bytes()?)?;
        Ok(())
    }

    /// Replaces host weight values with the initializers of `model`. Uploaded
    /// by the next `weights_from_host`.
    pub fn reset_host_weights(&mut self, model: &[u8]) -> Result<()> {
        let model = ModelProto::from_bytes(model)?;
        for init in &model.graph.initializers {
            let current = self.host_weights.get(&init.name).ok_or_else(|| {
                Error::config(format!("resetHostWeights: no weight '{}' in the session", init.name))
            })?;
            if current.info != init.info {
                return Err(Error::shape(format!(
                    "resetHostWeights: '{}' is {} in the session but {} in the model",
                    init.name, current.info, init.info
                )));
            }
            let value = HostTensor::new(init.info.clone(), init.data.clone())?;
            self.host_weights.insert(init.name.clone(), value);
        }
        Ok(())
    }

    /// Copies current weight values into the buffers of `weights`.
    pub fn read_weights(&self, weights: &mut WeightsIo) -> Result<()> {
        let ids = weights.ids().cloned().collect::<Vec<_>>();
        for id in ids {
            let value = self.current_weight(&id)?;
            let buffer = weights.buffer_mut(&id)?;
            if buffer.info != value.info {
                return Err(Error::StepIo(format!(
                    "WeightsIO buffer for {id} is {} but the weight is {}",
                    buffer.info, value.info
                )));
            }
            buffer.data = value.data;
        }
        Ok(())
    }

    /// Replaces weights on the host and, once uploaded, on the device.
    pub fn write_weights(&mut self, weights: &WeightsIo) -> Result<()> {
        for (id, value) in weights.iter() {
            let current = self
                .host_weights
                .get(id)
                .ok_or_else(|| Error::config(format!("No weight '{id}' in the session")))?;
            if current.info != value.info {
                return Err(Error::StepIo(format!(
                    "WeightsIO buffer for {id} is {} but the weight is {}",
                    value.info, current.info
                )));
            }
            self.host_weights.insert(id.clone(), value.clone());
            if self.weights_uploaded {
                if let Some(engine) = self.engine.as_mut() {
                    engine.upload(id, value)?;
                }
            }
        }
        Ok(())
    }

    fn report_engine(&self) -> Result<&Runtime> {
        let engine = self
            .engine
            .as_ref()
            .ok_or_else(|| Error::state(REPORT_BEFORE_PREPARE))?;
        if !self.device.supports_profiling() {
            return Err(Error::DeviceCapability(
                "Profiling is disabled for current device type.".into(),
            ));
        }
        Ok(engine)
    }

    pub fn summary_report(&self) -> Result<String> {
        let engine = self.report_engine()?;
        Ok(report::summary_report(engine.executable(), &self.device))
    }

    pub fn graph_report(&self, binary: bool) -> Result<Vec<u8>> {
        let engine = self.report_engine()?;
        report::encode(&report::graph_report(engine.executable(), &self.device), binary)
    }

    pub fn execution_report(&self, binary: bool) -> Result<Vec<u8>> {
        let engine = self.report_engine()?;
        let report = report::execution_report(engine.executable(), &self.device, &engine.counters);
        report::encode(&report, binary)
    }

    pub fn tensor_tile_map(&self) -> Result<TensorTileMap> {
        let engine = self.report_engine()?;
        Ok(report::tensor_tile_map(engine.executable(), &self.device))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.lease.take().is_some() {
            self.sink.emit(Diagnostic::DeviceDetached {
                id: self.device.id(),
            });
        }
    }
}

/// Standard normal samples for float streams, zeros otherwise.
fn random_normal(rng: &mut StdRng, info: &TensorInfo) -> TensorData {
    if !info.dtype.is_float() {
        return TensorData::zeros(info.dtype, info.nelms());
    }
    let values = (0..info.nelms())
        .map(|_| {
            let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
            let u2: f32 = rng.gen();
            (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
        })
        .collect();
    TensorData::F32(values)
}
