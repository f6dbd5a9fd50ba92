//! Locating the ONNX Runtime shared library and its accelerator dependencies.
//!
//! `ort` is built with `load-dynamic`, so the runtime library is found at
//! first use through `ORT_DYLIB_PATH`. [`setup_runtime_libs`] fills that in
//! and preloads accelerator libraries before any session is built.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

pub const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// What [`setup_runtime_libs`] found and loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLibStatus {
    /// Runtime library exported through `ORT_DYLIB_PATH` by this call.
    pub discovered_ort: Option<PathBuf>,
    pub preloaded: Vec<PathBuf>,
}

/// Directories searched for runtime libraries, in priority order:
/// `<exe_dir>/lib`, `<exe_dir>/../lib`, `<cwd>/lib`, then system paths.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(target_os = "android")]
    {
        dirs.push(PathBuf::from("/vendor/lib64"));
        dirs.push(PathBuf::from("/system/lib64"));
    }
    #[cfg(all(unix, not(target_os = "android")))]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Load tier for accelerator libraries; `None` means never preload.
///
/// ORT provider libraries are excluded because they resolve symbols from
/// the runtime library, which `ort` loads later.
///
///   0: CUDA runtime
///   1: cuDNN
///   2: TensorRT
///   3: QNN backends
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    let name = name.strip_prefix("lib").unwrap_or(&name);
    if ["cudart", "cublas", "cufft", "curand"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("cudnn") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else if name.starts_with("qnn") {
        Some(3)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_candidate_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_candidate_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// Accelerator libraries in `dirs`, ordered so dependencies load first.
/// The first directory holding a given file name wins.
fn plan_preload(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_candidate_lib(&name, &path) || !seen.insert(name.clone()) {
                continue;
            }
            if let Some(priority) = load_priority(&name) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    libs.into_iter().map(|(_, _, path)| path).collect()
}

/// Load with `RTLD_GLOBAL` so later `dlopen` calls by the runtime resolve
/// against it; the handle is leaked on purpose.
#[cfg(unix)]
fn load_library(path: &Path) -> bool {
    // SAFETY: loading a shared library runs its initializers; the candidates
    // are vendor GPU/DSP runtimes picked by file name.
    let lib = unsafe {
        libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL)
    };
    match lib {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
fn load_library(path: &Path) -> bool {
    // SAFETY: see the unix variant.
    match unsafe { libloading::Library::new(path) } {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// Export `ORT_DYLIB_PATH` if unset and preload accelerator libraries.
///
/// Call at the start of `main()`, before any session is built.
pub fn setup_runtime_libs() -> RuntimeLibStatus {
    let dirs = candidate_lib_dirs();
    let mut status = RuntimeLibStatus::default();

    if env::var_os(ORT_DYLIB_ENV).is_none() {
        if let Some(path) = find_ort_dylib_in_dirs(&dirs) {
            env::set_var(ORT_DYLIB_ENV, &path);
            status.discovered_ort = Some(path);
        }
    }

    status.preloaded = plan_preload(&dirs)
        .into_iter()
        .filter(|path| load_library(path))
        .collect();
    status
}

/// Log which runtime libraries were resolved. Call after tracing is set up.
pub fn log_runtime_lib_status(status: &RuntimeLibStatus) {
    match env::var(ORT_DYLIB_ENV) {
        Ok(ort) if Path::new(&ort).is_file() => info!(library = %ort, "ONNX Runtime library"),
        Ok(ort) => warn!(library = %ort, "ORT_DYLIB_PATH points to a missing file"),
        Err(_) => warn!("ORT_DYLIB_PATH not set; ONNX Runtime will use the default search path"),
    }
    for lib in &status.preloaded {
        debug!(library = %lib.display(), "Preloaded accelerator library");
    }
}
