use clap::Parser;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let cli = cfshare_cli::Cli::parse();
    let code = cfshare_cli::run(cli).await;
    std::process::exit(code);
}
