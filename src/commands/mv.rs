use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use owo_colors::OwoColorize;
use tasksync_core::model::{TaskId, TaskList};
use tasksync_core::store::TaskStore;
use tasksync_core::sync::SyncRequester;
use tasksync_core::TaskMover;

use super::{render_list, render_outcome};
use crate::app::App;
use crate::utils::tui;

/// Collects the accounts a move wants synced so they can run before exit.
#[derive(Default)]
struct PendingSyncs(Mutex<BTreeSet<String>>);

impl PendingSyncs {
    fn take(&self) -> Vec<String> {
        let mut pending = self.0.lock().unwrap_or_else(|e| e.into_inner());
        let taken = std::mem::take(&mut *pending);
        taken.into_iter().collect()
    }
}

impl SyncRequester for PendingSyncs {
    fn request_sync(&self, account: &str) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(account.to_string());
    }
}

/// Find a list by id, or by a name that matches exactly one list.
fn resolve_list(store: &dyn TaskStore, query: &str) -> Result<TaskList> {
    if let Some(list) = store.fetch_list(query)? {
        return Ok(list);
    }

    let mut matches = Vec::new();
    for account in store.accounts()? {
        matches.extend(
            store
                .lists_for_account(&account.id)?
                .into_iter()
                .filter(|l| l.name.eq_ignore_ascii_case(query)),
        );
    }

    match matches.len() {
        1 => Ok(matches.remove(0)),
        0 => anyhow::bail!("List '{}' not found. See `tasksync lists`.", query),
        n => anyhow::bail!(
            "{} lists are named '{}'. Use the list id from `tasksync lists`.",
            n,
            query
        ),
    }
}

pub async fn run(app: &App, target: &str, tasks: &[TaskId], sync: bool) -> Result<()> {
    let list = resolve_list(app.store.as_ref(), target)?;
    let pending = Arc::new(PendingSyncs::default());
    let mover = TaskMover::new(app.store(), pending.clone());

    let report = mover.move_tasks(tasks, &list.id)?;

    println!("{}", render_list(&list));
    for id in &report.moved {
        println!("   {} task {}", "moved".green(), id);
    }
    for id in &report.skipped {
        println!("   {} task {}", "skipped".dimmed(), id);
    }

    let accounts = pending.take();
    if !sync || accounts.is_empty() {
        return Ok(());
    }

    let orchestrator = app.orchestrator()?;
    println!();
    for account in accounts {
        let spinner = tui::create_spinner(format!("Syncing {}", account));
        let outcome = orchestrator.sync_account(&account).await;
        spinner.finish_and_clear();
        println!("{}  {}", account, render_outcome(&outcome));
    }
    Ok(())
}
