use pulp_cli::exec;
use pulp_common::error;

#[tokio::main]
async fn main() {
    if let Err(e) = exec().await {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}
