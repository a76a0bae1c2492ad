use netplane::cli::initialize_from_arguments;
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("netplane v{}", env!("CARGO_PKG_VERSION"));
    initialize_from_arguments().await?;
    println!("Done");
    Ok(())
}
