#[tokio::main]
async fn main() -> anyhow::Result<()> {
    node_dashboard::server::run().await
}
