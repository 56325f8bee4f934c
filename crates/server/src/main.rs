mod app;
mod config;
mod metrics;
mod presence;
mod registry;
mod util;

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let config_path = env::var("CATLINE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("catline.toml"));
    let config = match config::load_configuration(&config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(path = %config_path.display(), error = %err, "configuration load failed");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "runtime start failed");
            return ExitCode::FAILURE;
        }
    };

    let state = app::AppState::new(config);
    match runtime.block_on(app::run(state)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "server terminated");
            ExitCode::FAILURE
        }
    }
}
