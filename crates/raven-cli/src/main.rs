use clap::Parser;
use raven_cli::Cli;

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let cli = Cli::parse();
    let code = raven_cli::run(&cli)?;
    std::process::exit(code);
}
