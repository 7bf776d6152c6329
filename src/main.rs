use clap::Parser;

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = swr::api::Cli::parse();
    if let Err(e) = swr::api::run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
