#[tokio::main]
async fn main() {
    ventusflow_lib::init_logging();

    if let Err(e) = ventusflow_lib::run().await {
        tracing::error!("VentusFlow orchestrator failed: {}", e);
        std::process::exit(1);
    }
}
