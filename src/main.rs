/*
 * FlashLaunch Core
 * Copyright (C) 2025 Akaere Networks
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use flashlaunch_core::Launcher;
use flashlaunch_core::config::{AppPaths, Cli, Command, PluginStateProvider};
use flashlaunch_core::core::logger::{
    init_from_args, log_init_failed, log_init_ok_with_details, log_init_start, log_init_warn,
};
use flashlaunch_core::plugins::api::{SearchResult, SearchResultView};
use flashlaunch_core::plugins::health::HealthCheckSummary;
use flashlaunch_core::plugins::registry::SourceKind;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    if init_from_args(args.debug, args.trace, args.journald).is_err() {
        eprintln!("Logger was already initialized");
    }

    let paths = AppPaths::discover(args.data_dir.clone()).context("Failed to resolve data directory")?;
    let launcher = Arc::new(Launcher::builder(paths).build());

    // Ctrl-C cancels whatever is running
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let outcome = match args.command {
        Command::List => list(&launcher).await,
        Command::Query { text, json } => query(&launcher, &text, json, &cancel).await,
        Command::Execute { text, index } => execute(&launcher, &text, index, &cancel).await,
        Command::Health { timeout_ms, json } => health(&launcher, timeout_ms, json, &cancel).await,
        Command::Repl => repl(&launcher, &cancel).await,
    };

    launcher.catalog().shutdown();
    outcome
}

async fn load_catalog(launcher: &Launcher) {
    log_init_start("plugin catalog");
    let roots = launcher.plugin_roots().len();
    let generation = launcher.get_plugins().await;

    if generation.is_empty() {
        log_init_warn("plugin catalog", &format!("no plugins found in {} root(s)", roots));
    } else {
        log_init_ok_with_details(
            "plugin catalog",
            &format!(
                "generation {}, {} plugin(s), {} external",
                generation.number(),
                generation.len(),
                generation.external_count()
            ),
        );
    }
}

async fn list(launcher: &Launcher) -> Result<()> {
    load_catalog(launcher).await;
    let generation = launcher.get_plugins().await;
    let state = launcher.config().snapshot();

    for record in generation.records() {
        let plugin = &record.instance;
        let source = match record.source {
            SourceKind::Builtin => "builtin",
            SourceKind::External => "external",
        };
        let status = if state.is_enabled(record.key(), Some(plugin.name())) {
            "enabled"
        } else {
            "disabled"
        };

        println!(
            "{:<32} {:<12} {:<9} {:<8} {}",
            record.key(),
            plugin.kind().as_str(),
            source,
            status,
            plugin.name()
        );
    }
    Ok(())
}

async fn dispatch(
    launcher: &Launcher,
    text: &str,
    cancel: &CancellationToken,
) -> Result<Vec<SearchResult>> {
    load_catalog(launcher).await;
    launcher
        .dispatch(text, cancel)
        .await
        .with_context(|| format!("Query {:?} failed", text))
}

async fn query(launcher: &Launcher, text: &str, json: bool, cancel: &CancellationToken) -> Result<()> {
    let results = dispatch(launcher, text, cancel).await?;
    print_results(&results, json)
}

async fn execute(
    launcher: &Launcher,
    text: &str,
    index: usize,
    cancel: &CancellationToken,
) -> Result<()> {
    let results = dispatch(launcher, text, cancel).await?;
    let Some(result) = results.get(index) else {
        bail!("Query {:?} produced {} result(s), no index {}", text, results.len(), index);
    };

    launcher.execute(result, cancel).await?;
    println!("Executed {:?} from {}", result.title, result.owner_plugin_id);
    Ok(())
}

async fn health(
    launcher: &Launcher,
    timeout_ms: Option<u64>,
    json: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let timeout = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| launcher.config().snapshot().health_check_timeout());

    log_init_start("health check");
    let summary = match launcher.run_health_check(timeout, cancel).await {
        Ok(summary) => summary,
        Err(e) => {
            log_init_failed("health check", &e.to_string());
            return Err(e.into());
        }
    };
    log_init_ok_with_details(
        "health check",
        &format!("{} passed, {} failed", summary.passed, summary.failed),
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

async fn repl(launcher: &Arc<Launcher>, cancel: &CancellationToken) -> Result<()> {
    load_catalog(launcher).await;
    let session = Arc::new(launcher.session());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };

        match line.trim() {
            ":quit" | ":q" => break,
            ":reload" => {
                session.cancel();
                let retired = launcher.reload().await;
                println!("Retired {} external plugin(s)", retired);
                load_catalog(launcher).await;
            }
            ":list" => list(launcher).await?,
            ":health" => {
                let timeout = launcher.config().snapshot().health_check_timeout();
                match launcher.run_health_check(timeout, cancel).await {
                    Ok(summary) => print_summary(&summary),
                    Err(e) => println!("{}", e),
                }
            }
            text => {
                // Each line supersedes the previous query's dispatch
                let session = Arc::clone(&session);
                let text = text.to_string();
                tokio::spawn(async move {
                    if let Some(update) = session.search(&text).await {
                        if let Err(e) = print_results(&update.results, false) {
                            eprintln!("{:#}", e);
                        }
                    }
                });
            }
        }
    }

    session.cancel();
    Ok(())
}

fn print_results(results: &[SearchResult], json: bool) -> Result<()> {
    if json {
        let views: Vec<SearchResultView> = results.iter().map(SearchResult::view).collect();
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }

    if results.is_empty() {
        println!("No results");
    }
    for (index, result) in results.iter().enumerate() {
        match &result.subtitle {
            Some(subtitle) => println!(
                "{:>3}  {:.3}  {}  ({}) - {}",
                index, result.score, result.title, result.owner_plugin_id, subtitle
            ),
            None => println!(
                "{:>3}  {:.3}  {}  ({})",
                index, result.score, result.title, result.owner_plugin_id
            ),
        }
    }
    Ok(())
}

fn print_summary(summary: &HealthCheckSummary) {
    for result in &summary.results {
        let status = if result.passed { "PASS" } else { "FAIL" };
        match &result.error {
            Some(error) => println!("[{}] {} {:?}: {}", status, result.id, result.directory, error),
            None => println!("[{}] {} {:?}", status, result.id, result.directory),
        }
    }
    println!(
        "{} checked, {} passed, {} failed",
        summary.total, summary.passed, summary.failed
    );
}
