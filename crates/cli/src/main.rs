use anyhow::Result;
use clap::{Parser, Subcommand};
use drover::{config::get_settings, logger::init_logger, run::{print_status, run_cycles, run_daemon}};

#[derive(Parser)]
#[command(author, version, about = "Drover block uploader", long_about = None)]
struct Cli {
    /// A command to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run the upload daemon until stopped
  Run,
  /// Run a fixed number of polling cycles, then exit
  Cycle {
    /// Number of cycles to run
    #[arg(short = 'n', long, default_value_t = 1)]
    count: u32,
  },
  /// Print a summary of the staging store
  Status,
}

fn print_banner() {
  println!("\n");
  println!("#############################################");
  println!("########       Drover Uploader       ########");
  println!("#############################################");
  println!("\n\n");
}

async fn handle_run(settings: &drover::config::Settings) -> Result<()> {
  println!("Running upload daemon against {}", settings.catalog.url);
  run_daemon(settings).await?;
  Ok(())
}

async fn handle_cycle(settings: &drover::config::Settings, count: u32) -> Result<()> {
  println!("Running {} polling cycle(s)", count);
  run_cycles(settings, count).await?;
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    print_banner();

    let settings = get_settings()?;
    let cli = Cli::parse();

    match cli.command {
      Commands::Run => {
        init_logger()?;
        handle_run(&settings).await?
      },
      Commands::Cycle { count } => {
        init_logger()?;
        handle_cycle(&settings, count).await?
      },
      Commands::Status => print_status(&settings)?,
    };

    Ok(())
}
