#[tokio::main]
async fn main() -> anyhow::Result<()> {
    snet_cli::run().await
}
