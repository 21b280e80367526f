use anyhow::Result;
use tasksync_core::store::TaskStore;
use tasksync_core::sync::SyncOutcome;

use super::{render_account, render_outcome};
use crate::app::App;
use crate::utils::tui;

pub async fn run(app: &App, account: Option<&str>) -> Result<()> {
    let orchestrator = app.orchestrator()?;

    let outcomes = match account {
        Some(id) => {
            if app.store.fetch_account(id)?.is_none() {
                anyhow::bail!("Account '{}' not found", id);
            }
            let spinner = tui::create_spinner(format!("Syncing {}", id));
            let outcome = orchestrator.sync_account(id).await;
            spinner.finish_and_clear();
            vec![(id.to_string(), outcome)]
        }
        None => {
            if app.store.accounts()?.is_empty() {
                anyhow::bail!(
                    "No accounts configured.\n\n\
                    Add one with:\n  \
                    tasksync account add caldav <url> --username <user>"
                );
            }
            let spinner = tui::create_spinner("Syncing all accounts".into());
            let outcomes = orchestrator.sync_all().await;
            spinner.finish_and_clear();
            outcomes
        }
    };

    let mut failed = 0;
    for (id, outcome) in &outcomes {
        match app.store.fetch_account(id)? {
            Some(account) => println!("{}", render_account(&account)),
            None => println!("{}", id),
        }
        println!("   {}", render_outcome(outcome));
        if matches!(outcome, SyncOutcome::Failed(_)) {
            failed += 1;
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} account(s) failed to sync", failed, outcomes.len());
    }
    Ok(())
}
