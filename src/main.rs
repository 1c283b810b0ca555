use anyhow::{bail, Context};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod app;
mod cli;
mod config;
mod embeddings;
mod ids;
mod items;
mod lock;
mod matching;
mod pipeline;
mod storage;
#[cfg(test)]
mod tests;
mod web;

use app::{AppBackend, AppFactory, BackfillRequest};
use items::ItemCreate;
use lock::{LockGuard, StoreLock};
use pipeline::updater::UpdateStatus;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries command output
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_logging();

    let args = cli::Args::parse();
    let paths = AppFactory::get_paths()?;

    match args.command {
        cli::Command::Daemon { listen } => {
            let _lock = StoreLock::try_acquire(&paths.base_path)
                .context("failed to lock item store; is another daemon running?")?;

            let app = AppFactory::create_local_app(&paths)?;
            web::start_daemon(app, &listen)
        }
        command => {
            let _lock =
                LockGuard::acquire_if_local(&paths.base_path, AppFactory::remote_addr().is_some())
                    .context(
                        "failed to lock item store; use ITEMMATCH_ADDR to talk to a running daemon",
                    )?;
            let app_mgr = AppFactory::create_backend(&paths)?;

            run_command(command, app_mgr.as_ref())
        }
    }
}

fn run_command(command: cli::Command, app_mgr: &dyn AppBackend) -> anyhow::Result<()> {
    match command {
        cli::Command::Daemon { .. } => bail!("daemon cannot run through a backend"),

        cli::Command::Embed { id } => {
            let report = app_mgr.generate_embedding(&id)?;
            print_json(&report)?;

            if report.status == UpdateStatus::Failed {
                bail!("embedding failed: {}", report.reason.unwrap_or_default());
            }
        }

        cli::Command::Backfill {
            concurrency,
            min_delay_ms,
            include_stale,
        } => {
            let report = app_mgr.backfill_embeddings(BackfillRequest {
                include_stale,
                concurrency,
                min_delay_ms,
            })?;
            print_json(&report)?;

            if let Some(reason) = report.aborted {
                bail!("backfill aborted: {reason}");
            }
        }

        cli::Command::Matches { id, k } => {
            print_json(&app_mgr.find_matches(&id, k)?)?;
        }

        cli::Command::Add {
            title,
            description,
            kind,
            category,
            location,
            owner,
        } => {
            let item = app_mgr.create_item(ItemCreate {
                title,
                description,
                kind: kind.map(Into::into),
                category,
                location,
                owner,
            })?;
            print_json(&item)?;
        }

        cli::Command::Show { id } => {
            print_json(&app_mgr.get_item(&id)?)?;
        }

        cli::Command::Delete { id } => {
            print_json(&app_mgr.delete_item(&id)?)?;
        }

        cli::Command::Status {} => {
            print_json(&app_mgr.status()?)?;
        }
    }

    Ok(())
}
