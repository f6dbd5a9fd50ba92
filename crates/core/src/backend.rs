//! Runtime backends: execution provider wiring for each [`RuntimeTarget`].
//!
//! Two backends exist. The delegate backend covers CPU thread pools, the
//! GPU delegate (TensorRT with FP16, CUDA behind it) and the NNAPI delegate.
//! The processor backend reaches GPU and DSP processors through QNN.
//! [`build_session`] turns a [`RuntimeSelection`] into an `ort::Session`.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider,
        ExecutionProviderDispatch, NNAPIExecutionProvider, QNNExecutionProvider,
        TensorRTExecutionProvider,
    },
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
};
use tracing::{debug, info};

use crate::selector::{BackendKind, RuntimeSelection, RuntimeTarget};

#[cfg(windows)]
const QNN_HTP_LIBRARY: &str = "QnnHtp.dll";
#[cfg(not(windows))]
const QNN_HTP_LIBRARY: &str = "libQnnHtp.so";

#[cfg(windows)]
const QNN_GPU_LIBRARY: &str = "QnnGpu.dll";
#[cfg(not(windows))]
const QNN_GPU_LIBRARY: &str = "libQnnGpu.so";

/// Execution provider wiring for one runtime family.
pub trait RuntimeBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether `target` can be served by this backend on this machine.
    fn is_available(&self, target: RuntimeTarget) -> bool;

    /// Providers to register, in priority order. Empty means the default CPU
    /// provider only.
    fn execution_providers(&self, target: RuntimeTarget) -> Vec<ExecutionProviderDispatch>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DelegateBackend;

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessorBackend;

fn provider_available(name: &str, ep: &impl ExecutionProvider) -> bool {
    match ep.is_available() {
        Ok(available) => available,
        Err(e) => {
            debug!(provider = name, error = %e, "Execution provider availability query failed");
            false
        }
    }
}

impl RuntimeBackend for DelegateBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Delegate
    }

    fn is_available(&self, target: RuntimeTarget) -> bool {
        match target {
            RuntimeTarget::Cpu { .. } => true,
            RuntimeTarget::Gpu => {
                provider_available("tensorrt", &TensorRTExecutionProvider::default())
                    || provider_available("cuda", &CUDAExecutionProvider::default())
            }
            RuntimeTarget::Accelerator => {
                provider_available("nnapi", &NNAPIExecutionProvider::default())
            }
            RuntimeTarget::Dsp => false,
        }
    }

    fn execution_providers(&self, target: RuntimeTarget) -> Vec<ExecutionProviderDispatch> {
        match target {
            RuntimeTarget::Cpu { .. } | RuntimeTarget::Dsp => {
                vec![CPUExecutionProvider::default().build()]
            }
            // TRT may still fail at session creation if libnvinfer is missing;
            // CUDA behind it keeps the session on the GPU.
            RuntimeTarget::Gpu => vec![
                TensorRTExecutionProvider::default()
                    .with_fp16(true)
                    .with_device_id(0)
                    .build(),
                CUDAExecutionProvider::default().build(),
            ],
            RuntimeTarget::Accelerator => vec![NNAPIExecutionProvider::default().build()],
        }
    }
}

impl ProcessorBackend {
    fn qnn(target: RuntimeTarget) -> Option<QNNExecutionProvider> {
        let library = match target {
            RuntimeTarget::Gpu => QNN_GPU_LIBRARY,
            RuntimeTarget::Dsp => QNN_HTP_LIBRARY,
            _ => return None,
        };
        Some(QNNExecutionProvider::default().with_backend_path(library))
    }
}

impl RuntimeBackend for ProcessorBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Processor
    }

    fn is_available(&self, target: RuntimeTarget) -> bool {
        match target {
            RuntimeTarget::Cpu { .. } => true,
            _ => Self::qnn(target).is_some_and(|qnn| provider_available("qnn", &qnn)),
        }
    }

    fn execution_providers(&self, target: RuntimeTarget) -> Vec<ExecutionProviderDispatch> {
        match Self::qnn(target) {
            Some(qnn) => vec![qnn.build()],
            None => vec![CPUExecutionProvider::default().build()],
        }
    }
}

static DELEGATE: DelegateBackend = DelegateBackend;
static PROCESSOR: ProcessorBackend = ProcessorBackend;

pub fn backend_for(kind: BackendKind) -> &'static dyn RuntimeBackend {
    match kind {
        BackendKind::Delegate => &DELEGATE,
        BackendKind::Processor => &PROCESSOR,
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub selection: RuntimeSelection,
    /// Prefix for the runtime's JSON trace file; `None` disables profiling.
    pub profile_prefix: Option<&'a Path>,
}

fn configure(builder: SessionBuilder, selection: &RuntimeSelection) -> Result<SessionBuilder> {
    let mut builder = builder.with_optimization_level(GraphOptimizationLevel::Level3)?;

    if let RuntimeTarget::Cpu { threads } = selection.target {
        builder = builder.with_intra_threads(threads)?;
    }

    let providers = backend_for(selection.backend).execution_providers(selection.target);
    Ok(builder.with_execution_providers(providers)?)
}

/// Build an `ort::Session` for the selected backend and target.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let selection = &config.selection;
    let mut builder = configure(Session::builder()?, selection)?;

    if let Some(prefix) = config.profile_prefix {
        builder = builder.with_profiling(prefix)?;
    }

    debug!(
        backend = %selection.backend,
        target = %selection.target,
        model = %config.model_path.display(),
        "Building inference session"
    );

    let started = Instant::now();
    let session = builder
        .commit_from_file(config.model_path)
        .with_context(|| format!("Failed to load ONNX model: {}", config.model_path.display()))?;

    info!(
        backend = %selection.backend,
        target = %selection.target,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Inference session ready"
    );

    Ok(session)
}

/// Build a CPU session for a graph held in memory.
pub fn build_session_from_memory(model: &[u8], threads: usize) -> Result<Session> {
    let selection = RuntimeSelection {
        backend: BackendKind::Delegate,
        requested: RuntimeTarget::Cpu { threads },
        target: RuntimeTarget::Cpu { threads },
        fell_back: false,
    };
    let session = configure(Session::builder()?, &selection)?
        .commit_from_memory(model)
        .context("Failed to load in-memory ONNX graph")?;
    Ok(session)
}

/// Log which accelerated targets each backend can serve.
pub fn log_target_availability() {
    for kind in [BackendKind::Delegate, BackendKind::Processor] {
        let backend = backend_for(kind);
        for target in [
            RuntimeTarget::Gpu,
            RuntimeTarget::Accelerator,
            RuntimeTarget::Dsp,
        ] {
            let available = backend.is_available(target);
            if available {
                info!(backend = %kind, %target, "Runtime target available");
            } else {
                debug!(backend = %kind, %target, "Runtime target not available");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_for_matches_kind() {
        assert_eq!(backend_for(BackendKind::Delegate).kind(), BackendKind::Delegate);
        assert_eq!(
            backend_for(BackendKind::Processor).kind(),
            BackendKind::Processor
        );
    }

    #[test]
    fn cpu_is_always_available() {
        let target = RuntimeTarget::Cpu { threads: 2 };
        assert!(DelegateBackend.is_available(target));
        assert!(ProcessorBackend.is_available(target));
    }

    #[test]
    fn delegate_backend_cannot_serve_dsp() {
        assert!(!DelegateBackend.is_available(RuntimeTarget::Dsp));
    }

    #[test]
    fn processor_backend_has_no_accelerator_provider() {
        assert!(ProcessorBackend::qnn(RuntimeTarget::Accelerator).is_none());
        assert!(ProcessorBackend::qnn(RuntimeTarget::Cpu { threads: 4 }).is_none());
        assert!(ProcessorBackend::qnn(RuntimeTarget::Gpu).is_some());
        assert!(ProcessorBackend::qnn(RuntimeTarget::Dsp).is_some());
    }

    #[test]
    fn provider_lists_are_never_empty() {
        for target in [
            RuntimeTarget::Cpu { threads: 1 },
            RuntimeTarget::Gpu,
            RuntimeTarget::Accelerator,
            RuntimeTarget::Dsp,
        ] {
            assert!(!DelegateBackend.execution_providers(target).is_empty());
            assert!(!ProcessorBackend.execution_providers(target).is_empty());
        }
        assert_eq!(DelegateBackend.execution_providers(RuntimeTarget::Gpu).len(), 2);
    }
}
