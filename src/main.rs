use std::sync::Arc;

use tokio::sync::mpsc;

use loopcast::config::Config;
use loopcast::http::{self, AppState};
use loopcast::merge::MergeCoordinator;
use loopcast::registry::StreamRegistry;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Arc::new(Config::from_env());

    std::fs::create_dir_all(&config.upload_dir).expect("Failed to create upload directory");
    std::fs::create_dir_all(&config.output_dir).expect("Failed to create output directory");

    let registry = Arc::new(StreamRegistry::new(config.max_concurrent_streams));
    let merges = Arc::new(MergeCoordinator::new(config.merge_ttl));

    // Transcoder exits flow back to the registry through this channel.
    let (exit_tx, exit_rx) = mpsc::unbounded_channel();
    tokio::spawn(registry.clone().run_reconciler(exit_rx));

    let state = AppState {
        config: config.clone(),
        registry,
        merges,
        exit_tx,
    };
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", config.addr, config.port))
        .await
        .expect("Failed to bind TCP listener");
    println!("Listening at {}:{}", config.addr, config.port);
    axum::serve(listener, app)
        .await
        .expect("Server failed to start");
}
