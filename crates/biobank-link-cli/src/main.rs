use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

fn main() -> Result<ExitCode> {
    // Usage errors exit 1 so that 2 stays reserved for "changes applied".
    let cli = match biobank_link_cli::Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if err.use_stderr() => {
            let _ = err.print();
            return Ok(ExitCode::FAILURE);
        }
        Err(err) => err.exit(),
    };

    let status = biobank_link_cli::run_cli(cli)?;
    Ok(ExitCode::from(status))
}
