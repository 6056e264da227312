use dotenvy::dotenv;
use std::{path::PathBuf, sync::Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_DIRECTIVES: &str =
    "info,ai=info,captioning=info,api_server=info,caption_batch=info,tower_http=debug";

fn init_env_layer() -> tracing_subscriber::EnvFilter {
    match dotenv() {
        Ok(path) => eprintln!(".env read successfully from {}", path.display()),
        Err(e) => eprintln!("Could not load .env file: {e}"),
    };

    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_DIRECTIVES.into())
}

pub fn init_tracing_to_stdout() {
    let env_layer = init_env_layer();

    let stdout_layer = tracing_subscriber::fmt::layer().with_ansi(true);

    tracing_subscriber::registry()
        .with(env_layer)
        .with(stdout_layer)
        .init();
}

pub fn init_tracing_to_file(log_dir: PathBuf) {
    let env_layer = init_env_layer();

    let file_log_layer = {
        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            eprintln!("Failed to create log dir: {}", e);
            init_tracing_to_stdout(); // fallback to stdout tracing
            return;
        }
        let file = match std::fs::File::create(log_dir.join("app.log")) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("Failed to create log file: {}", e);
                init_tracing_to_stdout(); // fallback to stdout tracing
                return;
            }
        };
        tracing_subscriber::fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
    };

    tracing_subscriber::registry()
        .with(env_layer)
        .with(file_log_layer)
        .init();
}

/// Log to `$LOCAL_LOG_DIR/app.log` when the variable is set, to stdout otherwise.
/// `.env` is loaded before the variable is read.
pub fn init_tracing() {
    dotenv().ok();
    match std::env::var("LOCAL_LOG_DIR") {
        Ok(log_dir) if !log_dir.is_empty() => init_tracing_to_file(PathBuf::from(log_dir)),
        _ => init_tracing_to_stdout(),
    }
}
