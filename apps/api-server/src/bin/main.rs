#[tokio::main]
async fn main() -> anyhow::Result<()> {
    api_server::start_server().await
}
