use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod error;
mod queue;
mod server;
mod state;
mod types;

use state::SqsState;

#[derive(Parser)]
#[command(name = "aws-sqs-local", about = "Local Amazon SQS service")]
struct Args {
    #[arg(long, default_value = "9324")]
    port: u16,
    #[arg(long, default_value = "us-east-1")]
    region: String,
    #[arg(long, default_value = "000000000000")]
    account_id: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let state = Arc::new(SqsState::new(args.account_id, args.region, args.port));
    let app = server::create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port))
        .await
        .unwrap();
    tracing::info!(port = args.port, "aws-sqs-local listening");
    axum::serve(listener, app).await.unwrap();
}
