#[tokio::main]
async fn main() -> eyre::Result<()> {
    let config = iskndr_server::Config::from_env()?;

    if config.logging {
        // run with RUST_LOG="iskndr_server=trace,iskndr_utils=trace" for details
        tracing_subscriber::fmt::init();
    }

    let graceful = iskndr_utils::Graceful::default();
    let graceful_for_listen = graceful.clone();
    graceful.spawn(async move {
        if let Err(e) = iskndr_server::listen(config, graceful_for_listen, |_| Ok(())).await {
            tracing::error!("server failed: {e:?}");
            eprintln!("Server failed: {e}");
            std::process::exit(1);
        }
    });

    graceful.shutdown().await
}
