#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = answer_grading::run_worker().await {
        eprintln!("grading-worker fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
