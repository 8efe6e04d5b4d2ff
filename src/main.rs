use anyhow::Result;
use clap::Parser;
use folio_ocr::cli;
use tracing::error;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    if let Err(err) = cli::dispatch(args) {
        error!("{:#}", err);
        eprintln!("folio-ocr: {:#}", err);
        std::process::exit(1);
    }
    Ok(())
}
