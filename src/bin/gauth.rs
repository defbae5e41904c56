//! One-off interactive authorization: runs the browser consent flow against
//! the given client secrets and writes the token cache used by the scheduler.

use anyhow::{Context, Result};
use clap::Parser;
use notebook_scheduler::config::TOKEN_FILE;
use notebook_scheduler::google::{auth::run_interactive_flow, ClientSecrets, SCOPES};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(name = "gauth", version, about = "Authorize Google Drive and Sheets access")]
struct Args {
    /// OAuth client secrets JSON downloaded from the Google console
    credentials: PathBuf,

    /// Directory the token cache is written to
    #[clap(long, default_value = "credentials")]
    credentials_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let args = Args::parse();
    println!(
        "Opening browser and using {} as credentials",
        args.credentials.display()
    );

    let secrets = ClientSecrets::load(&args.credentials)?;
    let http = reqwest::Client::new();
    let token = run_interactive_flow(&http, &secrets, &SCOPES)
        .await
        .context("Authorization flow failed")?;

    let token_path = args.credentials_dir.join(TOKEN_FILE);
    token.save(&token_path)?;
    println!("Token written to {}", token_path.display());
    Ok(())
}
