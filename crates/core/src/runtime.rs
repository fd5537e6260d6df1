use std::env;
#[cfg(windows)]
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

pub const ENV_ORT_DIR: &str = "TILEFUSE_ORT_DIR";

#[cfg(all(unix, not(target_os = "macos")))]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(target_os = "macos")]
const ORT_LIB_NAME: &str = "libonnxruntime.dylib";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// Directories probed for the ONNX Runtime library, in order:
///   1. `$TILEFUSE_ORT_DIR`
///   2. `<exe_dir>/` (Windows only)
///   3. `<exe_dir>/lib/`
///   4. `<exe_dir>/../lib/`
///   5. `<cwd>/lib/`
///   6. `/usr/local/lib/`, `/usr/lib/` (Unix only)
fn candidate_lib_dirs(ort_dir: Option<PathBuf>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(dir) = ort_dir {
        dirs.push(dir);
    }
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            {
                dirs.push(exe_dir.to_path_buf());
            }
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
    #[cfg(unix)]
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

#[cfg(windows)]
fn normalize_windows_path_key(path: &Path) -> String {
    path.to_string_lossy()
        .replace('/', "\\")
        .to_ascii_lowercase()
}

/// Provider DLLs (CUDA, TensorRT) are resolved through `PATH` on Windows.
#[cfg(windows)]
fn build_path_with_prepended_dirs(current: Option<OsString>, dirs: &[PathBuf]) -> OsString {
    use std::collections::HashSet;

    let fallback = current.clone().unwrap_or_default();
    let mut merged = Vec::new();
    let mut seen = HashSet::<String>::new();

    for dir in dirs {
        if !dir.is_dir() {
            continue;
        }
        if seen.insert(normalize_windows_path_key(dir)) {
            merged.push(dir.clone());
        }
    }

    if let Some(path) = current {
        for dir in env::split_paths(&path) {
            if dir.as_os_str().is_empty() {
                continue;
            }
            if seen.insert(normalize_windows_path_key(&dir)) {
                merged.push(dir);
            }
        }
    }

    env::join_paths(merged).unwrap_or(fallback)
}

/// Point `ORT_DYLIB_PATH` at a bundled ONNX Runtime when the user has not set it.
///
/// Call at the very start of `main()`, before any ORT or tracing init.
pub fn setup_runtime_libs() {
    if env::var_os("ORT_DYLIB_PATH").is_some() {
        return;
    }

    let dirs = candidate_lib_dirs(env::var_os(ENV_ORT_DIR).map(PathBuf::from));
    if let Some(path) = find_ort_dylib_in_dirs(&dirs) {
        env::set_var("ORT_DYLIB_PATH", &path);
    }

    #[cfg(windows)]
    {
        let merged = build_path_with_prepended_dirs(env::var_os("PATH"), &dirs);
        env::set_var("PATH", merged);
    }
}

/// Log which ONNX Runtime library was resolved. Call after tracing is initialized.
pub fn log_runtime_lib_status() {
    if let Ok(ort) = env::var("ORT_DYLIB_PATH") {
        if Path::new(&ort).is_file() {
            info!("ORT library: {ort}");
        } else {
            warn!("ORT_DYLIB_PATH set to {ort} but file not found");
        }
    } else {
        warn!("ORT_DYLIB_PATH not set; ORT will try default search paths");
    }
}
