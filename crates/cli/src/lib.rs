pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "parley",
    about = "Parley operator CLI",
    long_about = "Inspect configuration, check readiness, apply migrations, and drive conversations locally.",
    after_help = "Examples:\n  parley doctor --json\n  parley send --key cli:demo \"hello\"\n  parley history --key cli:demo"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Validate config, LLM provider selection, and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Send one message through a conversation and print the agent result")]
    Send {
        #[arg(long, help = "Conversation key, e.g. `cli:demo`")]
        key: String,
        #[arg(long, default_value = "operator", help = "User id recorded on the message")]
        user: String,
        #[arg(help = "Message text")]
        text: String,
    },
    #[command(about = "Print the stored history of a conversation")]
    History {
        #[arg(long, help = "Conversation key")]
        key: String,
    },
    #[command(about = "Clear the stored history of a conversation")]
    Clear {
        #[arg(long, help = "Conversation key")]
        key: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Migrate => commands::migrate::run(),
        Command::Send { key, user, text } => commands::conversation::send(&key, &user, &text),
        Command::History { key } => commands::conversation::history(&key),
        Command::Clear { key } => commands::conversation::clear(&key),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
