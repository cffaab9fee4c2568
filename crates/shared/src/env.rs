use std::path::PathBuf;

use tracing::{debug, trace, warn};

const ENV_FILES: [&str; 2] = [".env", ".env.secrets"];

fn traverse_up_for_env_file(file_name: &str) -> Option<PathBuf> {
    let relative_workspace_root = PathBuf::from("./../../").join(file_name);

    if PathBuf::from(file_name).exists() {
        trace!("Loading environment variables from: {file_name}");
        Some(PathBuf::from(file_name))
    } else if relative_workspace_root.exists() {
        trace!(
            "Loading environment variables from: {}",
            relative_workspace_root.display()
        );
        Some(relative_workspace_root)
    } else {
        trace!("No environment variables file found with name: {file_name:?}");
        None
    }
}

fn load_optional_env_file(path: PathBuf) {
    match dotenv::from_filename(&path) {
        Ok(_) => debug!("Loaded environment variables from: {}", path.display()),
        Err(e) => warn!(
            "Failed to load environment variables from {}: {e}",
            path.display()
        ),
    }
}

/// Loads `.env` and `.env.secrets` from the working directory or the workspace
/// root. Variables already present in the process environment win.
pub fn load_optional_env_files() {
    for file_name in ENV_FILES {
        if let Some(path) = traverse_up_for_env_file(file_name) {
            load_optional_env_file(path);
        }
    }
}

pub fn configure_env() -> Result<(), anyhow::Error> {
    load_optional_env_files();
    Ok(())
}
