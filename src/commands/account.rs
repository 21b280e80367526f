use anyhow::{Context, Result};
use clap::ValueEnum;
use owo_colors::OwoColorize;
use tasksync_core::model::{Account, Backend, ServerFamily};
use tasksync_core::store::TaskStore;
use tasksync_provider_caldav::{CaldavTransport, LibdavTransport};
use tasksync_provider_journal::{DerivedKey, authenticate};

use super::render_account;
use crate::app::App;
use crate::session::{Credentials, Session};
use crate::utils::tui;

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum AccountKind {
    Caldav,
    Journal,
}

pub struct NewAccount {
    pub kind: AccountKind,
    pub url: String,
    pub username: Option<String>,
    pub name: Option<String>,
    pub tasks_org: bool,
}

pub async fn add(app: &App, new: NewAccount) -> Result<()> {
    let username = match new.username {
        Some(username) => username,
        None => tui::prompt_text("Username")?,
    };
    let name = new.name.unwrap_or_else(|| username.clone());
    let id = slug::slugify(&name);

    if app.store.fetch_account(&id)?.is_some() {
        anyhow::bail!(
            "Account '{}' already exists. Remove it first with `tasksync account remove {}`",
            id,
            id
        );
    }

    let (backend, credentials) = match new.kind {
        AccountKind::Caldav => {
            let password = tui::prompt_password("Password")?;

            let spinner = tui::create_spinner(format!("Connecting to {}", new.url));
            let discovered = match LibdavTransport::connect(&new.url, &username, &password) {
                Ok(transport) => transport.discover().await,
                Err(e) => Err(e),
            };
            spinner.finish_and_clear();
            let discovery = discovered.context("Could not connect to the CalDAV server")?;
            println!("Found {} task list(s)", discovery.collections.len());

            (
                Backend::CalDav {
                    url: new.url,
                    username,
                    family: ServerFamily::Unknown,
                    tasks_org: new.tasks_org,
                },
                Credentials::CalDav { password },
            )
        }
        AccountKind::Journal => {
            let password = tui::prompt_password("Password")?;

            let spinner = tui::create_spinner(format!("Signing in to {}", new.url));
            let token = authenticate(&new.url, &username, &password).await;
            spinner.finish_and_clear();
            let token = token.context("Could not sign in to the journal server")?;

            let encryption_password = tui::prompt_password("Encryption password")?;
            let derived = DerivedKey::derive(&username, &encryption_password);
            app.keys.init(&id, derived.clone());

            (
                Backend::Journal {
                    url: new.url,
                    username,
                },
                Credentials::Journal {
                    token,
                    encryption_key: derived.to_base64(),
                },
            )
        }
    };

    Session::new(&id, credentials).save()?;
    let account = Account::new(&id, name, backend);
    app.store.upsert_account(&account)?;

    println!("Added {}", render_account(&account));
    println!("\nRun `tasksync sync` to fetch its tasks.");
    Ok(())
}

pub fn remove(app: &App, id: &str) -> Result<()> {
    let Some(account) = app.store.fetch_account(id)? else {
        anyhow::bail!("Account '{}' not found", id);
    };

    app.store.remove_account(id)?;
    app.keys.clear(id);
    Session::remove(id)?;

    println!("Removed {} and its local tasks", account.name.bold());
    Ok(())
}

pub fn list(app: &App) -> Result<()> {
    let accounts = app.store.accounts()?;
    if accounts.is_empty() {
        println!("No accounts yet. Add one with `tasksync account add`.");
        return Ok(());
    }

    for account in accounts {
        let lists = app.store.lists_for_account(&account.id)?;
        println!("{}  {}", account.id, render_account(&account));
        println!("   {} list(s)", lists.len());
        if let Some(error) = &account.error {
            println!("   {}", error.red());
        }
    }
    Ok(())
}
