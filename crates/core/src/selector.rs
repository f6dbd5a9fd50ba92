//! Runtime selection: integer mode codes to execution targets.
//!
//! The calling side speaks in bare integer codes. [`RuntimeMode::from_code`]
//! turns a code into a closed enumeration once, at the boundary; everything
//! downstream matches on [`RuntimeMode`] and [`RuntimeTarget`].

use std::fmt;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};

pub const DEFAULT_CPU_THREADS: usize = 4;

/// Mode codes as the calling environment sends them.
pub mod codes {
    pub const GPU_DELEGATE: i32 = 7;
    pub const NNAPI: i32 = 8;
    pub const PROCESSOR_GPU: i32 = 9;
    pub const PROCESSOR_NNAPI: i32 = 10;
    pub const PROCESSOR_DSP: i32 = 11;
}

/// Which runtime backend builds the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Delegate-style runtime: CPU thread pools, GPU delegate, NNAPI delegate.
    Delegate,
    /// Processor-style runtime: GPU and DSP processors via QNN.
    Processor,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delegate => write!(f, "delegate"),
            Self::Processor => write!(f, "processor"),
        }
    }
}

/// Hardware the session executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum RuntimeTarget {
    Cpu { threads: usize },
    Gpu,
    /// Vendor neural-network accelerator (NNAPI).
    Accelerator,
    Dsp,
}

impl RuntimeTarget {
    pub fn default_cpu() -> Self {
        Self::Cpu {
            threads: DEFAULT_CPU_THREADS,
        }
    }

    pub fn is_cpu(self) -> bool {
        matches!(self, Self::Cpu { .. })
    }
}

impl fmt::Display for RuntimeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu { threads } => write!(f, "cpu({threads} threads)"),
            Self::Gpu => write!(f, "gpu"),
            Self::Accelerator => write!(f, "accelerator"),
            Self::Dsp => write!(f, "dsp"),
        }
    }
}

/// Validated runtime mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeMode {
    /// Codes 1..=6, or the 4-thread default for codes outside 1..=11.
    Cpu { threads: usize },
    /// Code 7: GPU delegate with FP16 arithmetic.
    GpuDelegate,
    /// Code 8: NNAPI delegate.
    Nnapi,
    /// Code 9: GPU through the processor backend.
    ProcessorGpu,
    /// Code 11: DSP through the processor backend.
    ProcessorDsp,
}

impl RuntimeMode {
    /// Map a mode code to a runtime mode.
    ///
    /// Code 10 (NNAPI through the processor backend) is rejected. Codes
    /// outside 1..=11 select CPU with [`DEFAULT_CPU_THREADS`].
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            1..=6 => Ok(Self::Cpu {
                threads: code as usize,
            }),
            codes::GPU_DELEGATE => Ok(Self::GpuDelegate),
            codes::NNAPI => Ok(Self::Nnapi),
            codes::PROCESSOR_GPU => Ok(Self::ProcessorGpu),
            codes::PROCESSOR_NNAPI => Err(Error::UnsupportedMode {
                code,
                reason: "NNAPI cannot run through the processor backend",
            }),
            codes::PROCESSOR_DSP => Ok(Self::ProcessorDsp),
            other => {
                warn!(
                    code = other,
                    threads = DEFAULT_CPU_THREADS,
                    "Unknown runtime mode, using CPU with default thread count"
                );
                Ok(Self::Cpu {
                    threads: DEFAULT_CPU_THREADS,
                })
            }
        }
    }

    pub fn backend(self) -> BackendKind {
        match self {
            Self::Cpu { .. } | Self::GpuDelegate | Self::Nnapi => BackendKind::Delegate,
            Self::ProcessorGpu | Self::ProcessorDsp => BackendKind::Processor,
        }
    }

    /// Target requested by this mode before availability is considered.
    pub fn requested_target(self) -> RuntimeTarget {
        match self {
            Self::Cpu { threads } => RuntimeTarget::Cpu { threads },
            Self::GpuDelegate | Self::ProcessorGpu => RuntimeTarget::Gpu,
            Self::Nnapi => RuntimeTarget::Accelerator,
            Self::ProcessorDsp => RuntimeTarget::Dsp,
        }
    }
}

/// Outcome of runtime selection, fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RuntimeSelection {
    pub backend: BackendKind,
    pub requested: RuntimeTarget,
    pub target: RuntimeTarget,
    pub fell_back: bool,
}

/// Resolve a mode against the runtime's availability query.
///
/// CPU is assumed always available. Any other target the query reports as
/// missing falls back to CPU with the default thread count.
pub fn select_runtime(
    mode: RuntimeMode,
    is_available: impl Fn(RuntimeTarget) -> bool,
) -> RuntimeSelection {
    let backend = mode.backend();
    let requested = mode.requested_target();

    if requested.is_cpu() || is_available(requested) {
        info!(%backend, target = %requested, "Selected runtime");
        return RuntimeSelection {
            backend,
            requested,
            target: requested,
            fell_back: false,
        };
    }

    let target = RuntimeTarget::default_cpu();
    warn!(
        %backend,
        requested = %requested,
        fallback = %target,
        "Selected runtime not present, falling back to CPU"
    );
    RuntimeSelection {
        backend,
        requested,
        target,
        fell_back: true,
    }
}
