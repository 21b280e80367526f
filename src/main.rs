mod app;
mod commands;
mod config;
mod dispatch;
mod session;
mod utils;

use anyhow::Result;
use app::App;
use clap::{Parser, Subcommand};
use commands::account::{AccountKind, NewAccount};
use tasksync_core::model::TaskId;

#[derive(Parser)]
#[command(name = "tasksync")]
#[command(about = "Sync your task lists with CalDAV servers and encrypted journals")]
struct Cli {
    /// Log sync progress in detail
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage sync accounts
    Account {
        #[command(subcommand)]
        command: AccountCommand,
    },
    /// Sync one account, or all of them
    Sync {
        /// Only sync this account (by id)
        #[arg(short, long)]
        account: Option<String>,
    },
    /// Move tasks, with their subtasks, into another list
    Mv {
        /// Target list (id or name)
        list: String,

        /// Local ids of the tasks to move
        #[arg(required = true)]
        tasks: Vec<TaskId>,

        /// Leave the affected accounts unsynced
        #[arg(long)]
        no_sync: bool,
    },
    /// Show pending local changes and account errors
    Status,
    /// Show every known task list
    Lists,
}

#[derive(Subcommand)]
enum AccountCommand {
    Add {
        kind: AccountKind,

        /// Server URL
        url: String,

        #[arg(short, long)]
        username: Option<String>,

        /// Display name (defaults to the username)
        #[arg(short, long)]
        name: Option<String>,

        /// Write the tasks.org extensions when pushing
        #[arg(long)]
        tasks_org: bool,
    },
    Remove {
        account: String,
    },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let app = App::load()?;

    match cli.command {
        Commands::Account { command } => match command {
            AccountCommand::Add {
                kind,
                url,
                username,
                name,
                tasks_org,
            } => {
                commands::account::add(
                    &app,
                    NewAccount {
                        kind,
                        url,
                        username,
                        name,
                        tasks_org,
                    },
                )
                .await
            }
            AccountCommand::Remove { account } => commands::account::remove(&app, &account),
            AccountCommand::List => commands::account::list(&app),
        },
        Commands::Sync { account } => commands::sync::run(&app, account.as_deref()).await,
        Commands::Mv {
            list,
            tasks,
            no_sync,
        } => commands::mv::run(&app, &list, &tasks, !no_sync).await,
        Commands::Status => commands::status::run(&app),
        Commands::Lists => commands::lists::run(&app),
    }
}
