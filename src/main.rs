#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = answer_grading::run().await {
        eprintln!("grading-api fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
