use anyhow::Result;
use owo_colors::OwoColorize;
use tasksync_core::store::TaskStore;

use super::render_list;
use crate::app::App;

pub fn run(app: &App) -> Result<()> {
    let mut any = false;
    for account in app.store.accounts()? {
        for list in app.store.lists_for_account(&account.id)? {
            let tasks = app
                .store
                .links_for_list(&list.id)?
                .iter()
                .filter(|l| !l.is_tombstone())
                .count();
            println!(
                "{}  {}  {}",
                list.id.dimmed(),
                render_list(&list),
                format!("{} / {} task(s)", account.name, tasks).dimmed()
            );
            any = true;
        }
    }

    if !any {
        println!("No lists yet. Run `tasksync sync` after adding an account.");
    }
    Ok(())
}
