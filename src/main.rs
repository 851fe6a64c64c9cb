use std::io::Write as _;

use clap::Parser;
use rproxy::dispatcher::Dispatcher;

/// Concurrent HTTP/1.0 forward proxy with a shared LRU response cache.
#[derive(Parser, Debug)]
#[command(name = "rproxy", about = "HTTP/1.0 forward proxy")]
struct Cli {
    /// Port to listen on (0-65535).
    port: u16,
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stdout)
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    let dispatcher = Dispatcher::new();
    if let Err(e) = dispatcher.run(cli.port).await {
        eprintln!("failed to listen on port {}: {e}", cli.port);
        std::process::exit(1);
    }
}
