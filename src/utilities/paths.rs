//! Storage locations for durable memory.

use std::env;
use std::path::PathBuf;

const APP_AUTHOR: &str = "TargetAcquisition";

/// Returns the directory used for SQLite database storage.
///
/// Uses the platform-specific data directory for the current project,
/// creating it if necessary.
pub fn db_storage_path() -> PathBuf {
    let app_name = project_directory_name();

    let data_dir = if cfg!(target_os = "macos") {
        let home = env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home)
            .join("Library")
            .join("Application Support")
            .join(APP_AUTHOR)
            .join(&app_name)
    } else if cfg!(target_os = "windows") {
        let local_app_data = env::var("LOCALAPPDATA")
            .unwrap_or_else(|_| env::var("APPDATA").unwrap_or_else(|_| "C:\\tmp".to_string()));
        PathBuf::from(local_app_data).join(APP_AUTHOR).join(&app_name)
    } else {
        let home = env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home)
            .join(".local")
            .join("share")
            .join(APP_AUTHOR)
            .join(&app_name)
    };

    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        log::warn!("could not create storage dir {}: {}", data_dir.display(), e);
    }
    data_dir
}

/// Project directory name, from `CREW_STORAGE_DIR` or the working directory.
pub fn project_directory_name() -> String {
    env::var("CREW_STORAGE_DIR").unwrap_or_else(|_| {
        env::current_dir()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_else(|| "target_acquisition".to_string())
    })
}
