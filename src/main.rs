use kestrel::config::Config;
use kestrel::dispatch::Service;
use kestrel::error::KestrelResult;
use kestrel::server;

#[tokio::main]
async fn main() -> KestrelResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = Config::from_args(&args);

    let service = Service::new(config);
    server::run_server(service).await
}
