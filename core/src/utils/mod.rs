use std::path::{Path, PathBuf};
use which::which;

/// Resolves the full path to an external tool binary.
/// Search order: explicit path → ./tools/{name} → ./{name} → System PATH
pub fn get_binary_path(tool_name: &str) -> Option<String> {
    let explicit = Path::new(tool_name);
    if explicit.components().count() > 1 && explicit.is_file() {
        return Some(tool_name.to_string());
    }

    let binary_name = if cfg!(target_os = "windows") && !tool_name.ends_with(".exe") {
        format!("{}.exe", tool_name)
    } else {
        tool_name.to_string()
    };

    // 1. Check ./tools/ directory
    let tools_path = PathBuf::from("./tools").join(&binary_name);
    if tools_path.is_file() {
        return Some(tools_path.to_string_lossy().to_string());
    }

    // 2. Check current directory
    let local_path = PathBuf::from("./").join(&binary_name);
    if local_path.is_file() {
        return Some(local_path.to_string_lossy().to_string());
    }

    // 3. Check system PATH
    if let Ok(path) = which(&binary_name) {
        return Some(path.to_string_lossy().to_string());
    }

    None
}
