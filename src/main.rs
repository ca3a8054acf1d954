#[tokio::main]
async fn main() -> anyhow::Result<()> {
    peercall_lib::run().await
}
