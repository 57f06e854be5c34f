//! `snapsync` - snapshot-guarded one-way sync of machine state.

use anyhow::Result;
use clap::Parser;

use snapsync::cli::{Cli, Command};
use snapsync::exit_codes::exit;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let exit_code = match cli.command {
        Command::Schema(args) => {
            println!("{}", snapsync::commands::schema(&args)?);
            exit::SUCCESS
        }
        command => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(snapsync::commands::run(command))?
        }
    };
    std::process::exit(exit_code);
}
