pub mod account;
pub mod lists;
pub mod mv;
pub mod status;
pub mod sync;

use owo_colors::OwoColorize;
use tasksync_core::model::{Account, Backend, TaskList};
use tasksync_core::sync::SyncOutcome;

/// One-line description of an account, as shown by every command.
pub fn render_account(account: &Account) -> String {
    let location = match &account.backend {
        Backend::CalDav { url, username, .. } | Backend::Journal { url, username } => {
            format!("{} @ {}", username, url)
        }
        Backend::ListOnly { provider } => provider.clone(),
    };
    format!(
        "{} {}",
        account.name.bold(),
        format!("({}, {})", account.backend.kind_name(), location).dimmed()
    )
}

pub fn render_list(list: &TaskList) -> String {
    let mut line = list.name.clone();
    if list.is_read_only() {
        line.push_str(&format!(" {}", "(read-only)".dimmed()));
    }
    line
}

pub fn render_outcome(outcome: &SyncOutcome) -> String {
    match outcome {
        SyncOutcome::Synced => "synced".green().to_string(),
        SyncOutcome::Failed(e) => e.red().to_string(),
        SyncOutcome::Coalesced => "already syncing".yellow().to_string(),
        SyncOutcome::Cancelled => "cancelled".yellow().to_string(),
        SyncOutcome::Skipped => "account removed".dimmed().to_string(),
    }
}
