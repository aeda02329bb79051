#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    let code = kiln::cli::run().await?;
    std::process::exit(code);
}
