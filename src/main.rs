//! Modforge - Linux Modlist Installation Orchestrator
//!
//! CLI front end: parses a workflow request, runs it, and renders the
//! progress stream to the terminal.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};

use modforge::logging::{init_logger, log_error, log_info};
use modforge::settings::AppSettings;
use modforge::workflow::{
    self, GameKind, WorkflowKind, WorkflowProgressEvent, WorkflowRequest, WorkflowStatus,
};

#[derive(Parser)]
#[command(name = "modforge", version, about = "Linux modlist installation orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Install a modlist, then configure its shortcut and prefix
    Install(RunArgs),
    /// Configure a freshly installed modlist (no engine run)
    ConfigureNew(RunArgs),
    /// Re-configure an existing install, including path rewriting
    ConfigureExisting(RunArgs),
    /// Guided automated install with post-install configuration
    Auto(RunArgs),
}

impl Command {
    fn kind(&self) -> WorkflowKind {
        match self {
            Command::Install(_) => WorkflowKind::InstallModlist,
            Command::ConfigureNew(_) => WorkflowKind::ConfigureNew,
            Command::ConfigureExisting(_) => WorkflowKind::ConfigureExisting,
            Command::Auto(_) => WorkflowKind::GuidedAuto,
        }
    }

    fn args(&self) -> &RunArgs {
        match self {
            Command::Install(args)
            | Command::ConfigureNew(args)
            | Command::ConfigureExisting(args)
            | Command::Auto(args) => args,
        }
    }
}

#[derive(Args)]
struct RunArgs {
    /// Modlist identifier (also used as the shortcut name)
    modlist: String,
    /// Where the modlist is (or will be) installed
    #[arg(long)]
    install_dir: PathBuf,
    /// Where downloaded archives live
    #[arg(long)]
    download_dir: PathBuf,
    /// Game family override (skyrimse, falloutnv, enderal, ...); inferred
    /// from the modlist name when omitted
    #[arg(long)]
    game: Option<String>,
    /// Reuse an install directory even if its marker is incompatible
    #[arg(long)]
    force: bool,
}

fn main() -> ExitCode {
    init_logger();
    log_info("Modforge starting up...");

    let cli = Cli::parse();
    let kind = cli.command.kind();
    let args = cli.command.args();

    let game = match &args.game {
        Some(name) => match GameKind::infer_from_name(name) {
            Some(kind) => Some(kind),
            None => {
                log_error(&format!("Unknown game family: {}", name));
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    let request = WorkflowRequest {
        kind,
        modlist_name: args.modlist.clone(),
        game,
        install_dir: args.install_dir.clone(),
        download_dir: args.download_dir.clone(),
        force_reuse: args.force,
    };

    let settings = AppSettings::load();
    let deps = match workflow::OrchestratorDeps::detect(settings) {
        Ok(deps) => deps,
        Err(e) => {
            log_error(&e.to_string());
            return ExitCode::FAILURE;
        }
    };

    let handle = match workflow::start_workflow(request, deps) {
        Ok(handle) => handle,
        Err(e) => {
            log_error(&e.to_string());
            return ExitCode::FAILURE;
        }
    };

    // Ctrl-C cancels the run; the engine process group is torn down on
    // the way out.
    let canceller = handle.canceller();
    if let Err(e) = ctrlc::set_handler(move || {
        println!("\nCancelling...");
        canceller.cancel();
    }) {
        log_error(&format!("Could not install Ctrl-C handler: {}", e));
    }

    for event in handle.events().iter() {
        match event {
            WorkflowProgressEvent::PhaseChanged(state) => {
                println!("==> {:?}", state);
            }
            WorkflowProgressEvent::EngineProgress {
                phase,
                current,
                total,
                item,
            } => {
                // One status line per phase, overwritten in place.
                print!("\r{}: [{}/{}] {}\x1b[K", phase, current, total, item);
                use std::io::Write;
                let _ = std::io::stdout().flush();
            }
            WorkflowProgressEvent::ManualStepsRequired(list) => {
                println!("\nThe following files must be downloaded manually:");
                for download in &list {
                    println!("  {} -> {}", download.url, download.target.display());
                    if !download.reason.is_empty() {
                        println!("     ({})", download.reason);
                    }
                }
                println!("Place them in the download directory, then press Enter to resume.");
                let mut line = String::new();
                if std::io::stdin().read_line(&mut line).is_err() {
                    handle.cancel();
                } else if let Err(e) = handle.resume_after_manual_steps() {
                    log_error(&e.to_string());
                }
            }
            WorkflowProgressEvent::ArtifactRemoved(path) => {
                println!("\nRemoved corrupted file {}", path.display());
            }
            WorkflowProgressEvent::Info(message) => println!("\n{}", message),
            WorkflowProgressEvent::EngineLog(_) => {}
        }
    }

    let result = handle.wait();
    match result.status {
        WorkflowStatus::Completed => {
            println!("\n{}", result.detail);
            ExitCode::SUCCESS
        }
        WorkflowStatus::Cancelled => {
            println!("\nCancelled.");
            ExitCode::FAILURE
        }
        WorkflowStatus::Failed => {
            log_error(&result.detail);
            ExitCode::FAILURE
        }
    }
}
