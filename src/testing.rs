//! Fake stages and observers shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::config::{BoundParameters, ParameterKind, ParameterSpec, ParameterValue};
use crate::dataset::{BandInfo, DataType, Dataset, OutputSchema, Rect, TileData};
use crate::engine::GraphContext;
use crate::observer::GraphObserver;
use crate::stage::{ResolvedSources, Stage, StageContext, StageDescriptor, StageRegistry};

const SIZE: i64 = 8;
const TILE: u32 = 4;

/// Counts what the fake stages did.
#[derive(Default)]
pub struct Probe {
    creations: AtomicUsize,
    computations: AtomicUsize,
    disposals: AtomicUsize,
    written: AtomicUsize,
    started: Mutex<bool>,
    started_cv: Condvar,
}

impl Probe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn creations(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    /// Tile computations that ran to completion.
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::SeqCst)
    }

    pub fn disposals(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }

    /// Tiles computed by writer stages.
    pub fn written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }

    /// Blocks until some stage has begun computing a tile.
    pub fn wait_for_computation_start(&self) {
        let mut started = self.started.lock().unwrap();
        while !*started {
            started = self.started_cv.wait(started).unwrap();
        }
    }

    fn computation_started(&self) {
        *self.started.lock().unwrap() = true;
        self.started_cv.notify_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Source,
    Process,
    Write,
    Failing,
    BadInit,
}

/// Outputs `value` plus the sum of all of its inputs, pixel by pixel.
struct FakeStage {
    kind: Kind,
    probe: Arc<Probe>,
    inputs: Vec<Dataset>,
    value: f64,
    delay: Duration,
}

impl Stage for FakeStage {
    fn initialize(
        &mut self,
        _ctx: &StageContext,
        sources: &ResolvedSources,
        parameters: &BoundParameters,
    ) -> anyhow::Result<OutputSchema> {
        if self.kind == Kind::BadInit {
            anyhow::bail!("refusing to initialize");
        }

        self.inputs = sources.datasets().cloned().collect();
        self.value = parameters.get_f64("value").unwrap_or(0.0);
        self.delay = Duration::from_millis(parameters.get_i64("delayMs").unwrap_or(0) as u64);

        if let Some(first) = self.inputs.first() {
            return Ok(first.schema().clone());
        }

        let width = parameters.get_i64("width").unwrap_or(SIZE) as u32;
        let height = parameters.get_i64("height").unwrap_or(SIZE) as u32;

        Ok(OutputSchema::new(width, height)
            .with_tile_size(TILE, TILE)
            .with_band(BandInfo::new("value", DataType::Float64)))
    }

    fn compute_tile(&self, rect: Rect, _schema: &OutputSchema) -> anyhow::Result<TileData> {
        if self.kind == Kind::Failing {
            anyhow::bail!("synthetic failure");
        }

        self.probe.computation_started();
        std::thread::sleep(self.delay);

        let mut samples = vec![self.value; rect.area()];
        for input in &self.inputs {
            let tile = input.tile(rect)?;
            for (sample, upstream) in samples.iter_mut().zip(&tile.bands[0]) {
                *sample += upstream;
            }
        }

        self.probe.computations.fetch_add(1, Ordering::SeqCst);
        if self.kind == Kind::Write {
            self.probe.written.fetch_add(1, Ordering::SeqCst);
        }

        Ok(TileData::new(rect, vec![samples]))
    }

    fn dispose(&mut self) {
        self.inputs.clear();
        self.probe.disposals.fetch_add(1, Ordering::SeqCst);
    }
}

/// A source stage producing a constant 8x8 raster.
pub struct ConstantStage {
    value: f64,
}

impl ConstantStage {
    pub fn new(value: f64) -> Self {
        Self { value }
    }
}

impl Stage for ConstantStage {
    fn initialize(
        &mut self,
        _ctx: &StageContext,
        _sources: &ResolvedSources,
        _parameters: &BoundParameters,
    ) -> anyhow::Result<OutputSchema> {
        Ok(OutputSchema::new(SIZE as u32, SIZE as u32).with_tile_size(TILE, TILE))
    }

    fn compute_tile(&self, rect: Rect, _schema: &OutputSchema) -> anyhow::Result<TileData> {
        Ok(TileData::filled(rect, 1, self.value))
    }
}

fn register(registry: &mut StageRegistry, probe: &Arc<Probe>, descriptor: StageDescriptor, kind: Kind) {
    let probe = probe.clone();
    registry.register_fn(descriptor, move || {
        probe.creations.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeStage {
            kind,
            probe: probe.clone(),
            inputs: Vec::new(),
            value: 0.0,
            delay: Duration::ZERO,
        }))
    });
}

fn double(name: &str, default: f64) -> ParameterSpec {
    ParameterSpec::new(name, ParameterKind::Double).default_value(ParameterValue::Double(default))
}

fn integer(name: &str, default: i64) -> ParameterSpec {
    ParameterSpec::new(name, ParameterKind::Integer).default_value(ParameterValue::Integer(default))
}

/// A registry of fake stages reporting to `probe`:
///
/// - `Read`: source of `value` (1 by default), `width` x `height` in 4x4 tiles
/// - `Threshold`, `Expression`, `Sum`: add up their inputs
/// - `Write`: an output stage, also adding up its inputs
/// - `Failing`: fails every tile
/// - `BadInit`: fails to initialize
pub fn fake_registry(probe: &Arc<Probe>) -> StageRegistry {
    let mut registry = StageRegistry::new();

    register(
        &mut registry,
        probe,
        StageDescriptor::new("Read")
            .with_parameter(ParameterSpec::new("file", ParameterKind::String))
            .with_parameter(integer("width", SIZE))
            .with_parameter(integer("height", SIZE))
            .with_parameter(double("value", 1.0))
            .with_parameter(integer("delayMs", 0)),
        Kind::Source,
    );

    register(
        &mut registry,
        probe,
        StageDescriptor::new("Threshold")
            .with_parameter(double("threshold", 1.0))
            .with_parameter(double("value", 0.0)),
        Kind::Process,
    );

    register(
        &mut registry,
        probe,
        StageDescriptor::new("Expression")
            .with_parameter(ParameterSpec::new("expression", ParameterKind::String))
            .with_parameter(double("value", 0.0)),
        Kind::Process,
    );

    register(
        &mut registry,
        probe,
        StageDescriptor::new("Sum")
            .with_parameter(double("value", 0.0))
            .with_parameter(integer("delayMs", 0)),
        Kind::Process,
    );

    register(
        &mut registry,
        probe,
        StageDescriptor::new("Write")
            .output()
            .with_parameter(ParameterSpec::new("file", ParameterKind::String))
            .with_parameter(ParameterSpec::new("formatName", ParameterKind::String))
            .with_parameter(
                ParameterSpec::new("clearCacheAfterRowWrite", ParameterKind::Boolean)
                    .default_value(ParameterValue::Boolean(false)),
            ),
        Kind::Write,
    );

    register(&mut registry, probe, StageDescriptor::new("Failing"), Kind::Failing);
    register(&mut registry, probe, StageDescriptor::new("BadInit"), Kind::BadInit);

    registry
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Started,
    Stopped(usize),
    TileStarted(String, Rect),
    TileStopped(String, Rect),
}

/// Remembers every notification in arrival order.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Event>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl GraphObserver for RecordingObserver {
    fn started(&self, _context: &GraphContext) {
        self.push(Event::Started);
    }

    fn stopped(&self, _context: &GraphContext, outputs: &[Dataset]) {
        self.push(Event::Stopped(outputs.len()));
    }

    fn tile_started(&self, dataset: &Dataset, rect: Rect) {
        self.push(Event::TileStarted(dataset.node_id().to_string(), rect));
    }

    fn tile_stopped(&self, dataset: &Dataset, rect: Rect) {
        self.push(Event::TileStopped(dataset.node_id().to_string(), rect));
    }
}
