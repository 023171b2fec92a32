pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

use commands::ask::DEFAULT_WEBHOOK_URL;

#[derive(Debug, Parser)]
#[command(
    name = "cbag",
    about = "CBAM assistant operator CLI",
    long_about = "Inspect configuration, check readiness, migrate the session store, and query a running CBAM assistant webhook.",
    after_help = "Examples:\n  cbag doctor --json\n  cbag config\n  cbag ask \"When is the next CBAM reporting deadline?\"\n  cbag probe --url https://cbam-agent.example.com/webhook"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending session store migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, credential readiness, and session store connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Send one question to a webhook and print the answer")]
    Ask {
        question: String,
        #[arg(long, default_value = DEFAULT_WEBHOOK_URL, help = "Webhook endpoint")]
        url: String,
        #[arg(long, help = "Session id to continue; a fresh `cli-<uuid>` session is used when omitted")]
        session: Option<String>,
    },
    #[command(about = "Run the calculation-safety and table-comparison protocol questions")]
    Probe {
        #[arg(long, default_value = DEFAULT_WEBHOOK_URL, help = "Webhook endpoint")]
        url: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => commands::CommandResult::plain(commands::config::run()),
        Command::Doctor { json } => commands::CommandResult::plain(commands::doctor::run(json)),
        Command::Ask { question, url, session } => commands::ask::run(&question, &url, session),
        Command::Probe { url } => commands::probe::run(&url),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
