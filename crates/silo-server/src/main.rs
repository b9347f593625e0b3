use clap::Parser;

/// Storage server speaking the silo wire protocol, backed by the in-memory
/// reference backends.
#[derive(Parser)]
#[command(name = "silo-server", version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:4711")]
    listen: std::net::SocketAddr,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    tracing::info!(listen = %args.listen, "serving");

    silo_server::Server::memory().serve(listener).await
}
