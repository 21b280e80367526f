use anyhow::Result;
use owo_colors::OwoColorize;
use tasksync_core::store::TaskStore;

use super::{render_account, render_list};
use crate::app::App;

pub fn run(app: &App) -> Result<()> {
    let accounts = app.store.accounts()?;
    if accounts.is_empty() {
        println!("No accounts yet. Add one with `tasksync account add`.");
        return Ok(());
    }

    for (i, account) in accounts.iter().enumerate() {
        println!("{}", render_account(account));
        if let Some(error) = &account.error {
            println!("   {}", error.red());
        }

        for list in app.store.lists_for_account(&account.id)? {
            let dirty = app.store.list_dirty_links(&list.id)?;
            let pending_deletes = dirty.iter().filter(|l| l.is_tombstone()).count();
            let changes = dirty.len() - pending_deletes;

            let state = if dirty.is_empty() {
                "up to date".green().to_string()
            } else {
                format!("{} to push, {} to delete", changes, pending_deletes)
                    .yellow()
                    .to_string()
            };
            println!("   {}  {}", render_list(&list), state);
        }

        if i < accounts.len() - 1 {
            println!();
        }
    }
    Ok(())
}
