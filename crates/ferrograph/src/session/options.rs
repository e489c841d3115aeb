use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::env;
use crate::error::{Error, Result};
use crate::hashing::Fingerprint;

pub const ENGINE_OPTION_KEYS: [&str; 5] = [
    "debug.instrument",
    "debug.allowOutOfMemory",
    "debug.outputAllSymbols",
    "target.workerStackSizeInBytes",
    "opt.maxCopyMergeSize",
];

pub const CONVOLUTION_OPTION_KEYS: [&str; 3] = [
    "partialsType",
    "availableMemoryProportion",
    "startTileMultiplier",
];

pub const REPORT_OPTION_KEYS: [&str; 3] = [
    "showVarStorage",
    "showExecutionSteps",
    "doLayerWiseBreakdown",
];

/// Source of stream data when host data is not used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyntheticDataMode {
    #[default]
    Off,
    Zeros,
    RandomNormal,
}

impl SyntheticDataMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Off" | "off" => Some(SyntheticDataMode::Off),
            "Zeros" | "zeros" => Some(SyntheticDataMode::Zeros),
            "RandomNormal" | "randomnormal" | "random_normal" => {
                Some(SyntheticDataMode::RandomNormal)
            }
            _ => None,
        }
    }
}

/// Session configuration. Known keys are typed fields; the three option maps
/// are passed through to the engine and validated when the device is prepared.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub log_dir: PathBuf,
    pub export_dot: bool,
    pub ignore_data: bool,
    pub synthetic_data_mode: SyntheticDataMode,
    pub random_seed: u64,
    pub enable_virtual_graphs: bool,
    pub auto_virtual_graph: bool,
    pub minimum_virtual_graph_count: usize,
    pub enable_engine_caching: bool,
    pub cache_path: PathBuf,
    pub compile_engine: bool,
    pub pattern_max_iterations: usize,
    pub engine_options: BTreeMap<String, String>,
    pub convolution_options: BTreeMap<String, String>,
    pub report_options: BTreeMap<String, String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("."),
            export_dot: false,
            ignore_data: false,
            synthetic_data_mode: SyntheticDataMode::Off,
            random_seed: 0,
            enable_virtual_graphs: false,
            auto_virtual_graph: false,
            minimum_virtual_graph_count: 1,
            enable_engine_caching: false,
            cache_path: PathBuf::from("session_cache"),
            compile_engine: true,
            pattern_max_iterations: env::pattern_max_iters(),
            engine_options: BTreeMap::new(),
            convolution_options: BTreeMap::new(),
            report_options: BTreeMap::new(),
        }
    }
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a typed option by its key. Unknown keys and unparsable values fail.
    pub fn set(&mut self, key: &str, value: &str) -> Result<&mut Self> {
        match key {
            "logDir" => self.log_dir = PathBuf::from(value),
            "exportDot" => self.export_dot = parse(key, value)?,
            "ignoreData" => self.ignore_data = parse(key, value)?,
            "syntheticDataMode" => {
                self.synthetic_data_mode = SyntheticDataMode::from_name(value)
                    .ok_or_else(|| invalid_value(key, value))?
            }
            "randomSeed" => self.random_seed = parse(key, value)?,
            "enableVirtualGraphs" => self.enable_virtual_graphs = parse(key, value)?,
            "autoVirtualGraph" => self.auto_virtual_graph = parse(key, value)?,
            "minimumVirtualGraphCount" => self.minimum_virtual_graph_count = parse(key, value)?,
            "enableEngineCaching" => self.enable_engine_caching = parse(key, value)?,
            "cachePath" => self.cache_path = PathBuf::from(value),
            "compileEngine" => self.compile_engine = parse(key, value)?,
            "patternMaxIterations" => self.pattern_max_iterations = parse(key, value)?,
            _ => return Err(unrecognised(key)),
        }
        Ok(self)
    }

    pub fn engine_option(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.engine_options.insert(key.into(), value.into());
        self
    }

    pub fn convolution_option(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.convolution_options.insert(key.into(), value.into());
        self
    }

    pub fn report_option(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.report_options.insert(key.into(), value.into());
        self
    }

    /// Fails on the first key of the option maps that the engine does not know.
    pub fn validate_opaque(&self) -> Result<()> {
        let maps: [(&BTreeMap<String, String>, &[&str]); 3] = [
            (&self.engine_options, &ENGINE_OPTION_KEYS),
            (&self.convolution_options, &CONVOLUTION_OPTION_KEYS),
            (&self.report_options, &REPORT_OPTION_KEYS),
        ];
        for (map, known) in maps {
            if let Some(key) = map.keys().find(|k| !known.contains(&k.as_str())) {
                return Err(unrecognised(key));
            }
        }
        Ok(())
    }

    /// `ignoreData` without an explicit mode means zeros.
    pub fn effective_synthetic_mode(&self) -> SyntheticDataMode {
        match self.synthetic_data_mode {
            SyntheticDataMode::Off if self.ignore_data => SyntheticDataMode::Zeros,
            mode => mode,
        }
    }

    /// Hashes the options that change the compiled executable.
    pub(crate) fn write_cache_fingerprint(&self, fp: &mut Fingerprint) -> Result<()> {
        fp.write_serialized(&(
            self.enable_virtual_graphs,
            self.auto_virtual_graph,
            self.minimum_virtual_graph_count,
            self.pattern_max_iterations,
        ))?;
        fp.write_serialized(&self.engine_options)?;
        fp.write_serialized(&self.convolution_options)?;
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| invalid_value(key, value))
}

fn invalid_value(key: &str, value: &str) -> Error {
    Error::config(format!("Invalid value '{value}' for option '{key}'"))
}

fn unrecognised(key: &str) -> Error {
    Error::config(format!("Unrecognised option '{key}'"))
}
