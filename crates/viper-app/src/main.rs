#![warn(missing_docs)]
//! # viper-monitor
//!
//! Console entry point for the VIPER NDT monitor.
//!
//! ```text
//! viper-monitor [monitor]          poll feed, overlays and history until Ctrl-C
//! viper-monitor toggle <overlay>   flip ai|gas|thermal once
//! viper-monitor history [filter] [search]
//! viper-monitor missions [--watch] list (or follow) realtime database mission logs
//! viper-monitor login              sign in with VIPER_EMAIL / VIPER_PASSWORD
//! viper-monitor logout
//! viper-monitor version
//! ```
//!
//! `history` and `missions` need the session persisted by `login`.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::info;
use tracing_subscriber::EnvFilter;
use viper_app::{
    AppError, MonitorBackends, MonitorConfig, MonitorSession, app_version, render_status_line,
};
use viper_auth::Credentials;
use viper_core::OverlayName;
use viper_history::{MissionLogEntry, SeverityFilter, filter_rows};
use viper_overlay::ToggleOutcome;

const STATUS_PERIOD: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("monitor");

    match command {
        "version" => {
            println!("viper-monitor {}", app_version());
            Ok(())
        }
        "monitor" => run_monitor().await,
        "toggle" => {
            let name: OverlayName = args
                .get(1)
                .context("usage: viper-monitor toggle <ai|gas|thermal>")?
                .parse()?;
            run_toggle(name).await
        }
        "history" => {
            let filter: SeverityFilter = match args.get(1) {
                Some(raw) => raw.parse()?,
                None => SeverityFilter::All,
            };
            let search = args.get(2).map(String::as_str).unwrap_or_default();
            run_history(filter, search).await
        }
        "missions" => run_missions(args.get(1).is_some_and(|flag| flag == "--watch")).await,
        "login" => run_login().await,
        "logout" => run_logout().await,
        other => bail!(
            "unknown command {other:?}; expected monitor|toggle|history|missions|login|logout|version"
        ),
    }
}

async fn start_session() -> Result<MonitorSession> {
    let config = MonitorConfig::from_env().context("invalid configuration")?;
    info!(?config, version = app_version(), "starting viper monitor");
    let backends = MonitorBackends::http(&config).context("cannot build http clients")?;
    Ok(MonitorSession::start(config, backends).await?)
}

async fn run_monitor() -> Result<()> {
    let session = start_session().await?;
    let mut ticker = tokio::time::interval(STATUS_PERIOD);

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("cannot listen for ctrl-c")?;
                break;
            }
            _ = ticker.tick() => {
                println!("{}", render_status_line(&session.runtime_status()));
            }
        }
    }

    session.shutdown().await;
    Ok(())
}

async fn run_toggle(name: OverlayName) -> Result<()> {
    let session = start_session().await?;
    let before = session.overlays().state();
    let result = session.toggle_overlay(name).await;
    session.shutdown().await;

    match result? {
        ToggleOutcome::Applied(state) => {
            println!("{name}: {} -> {}", before.get(name), state.get(name));
        }
        ToggleOutcome::AlreadyInFlight => println!("{name}: toggle already in flight"),
        ToggleOutcome::Discarded => println!("{name}: response discarded"),
    }
    Ok(())
}

async fn run_history(filter: SeverityFilter, search: &str) -> Result<()> {
    let session = start_session().await?;
    let result = session.refresh_history().await;
    session.shutdown().await;

    let Some(summary) = result.map_err(sign_in_hint)? else {
        return Ok(());
    };
    for row in filter_rows(&summary.rows, search, filter) {
        println!(
            "#{:<4} {:<8} {:<6} {:>3}% {} {} {}",
            row.id,
            row.time,
            row.severity.as_str(),
            row.confidence,
            row.date,
            row.label,
            row.image.as_deref().unwrap_or("-"),
        );
    }
    println!("Last updated: {}", summary.last_updated_text());
    Ok(())
}

async fn run_missions(watch: bool) -> Result<()> {
    let session = start_session().await?;
    if !watch {
        let result = session.mission_logs().await;
        session.shutdown().await;
        print_missions(&result.map_err(sign_in_hint)?);
        return Ok(());
    }

    let mut subscription = match session.subscribe_missions() {
        Ok(subscription) => subscription,
        Err(error) => {
            session.shutdown().await;
            return Err(sign_in_hint(error));
        }
    };
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("cannot listen for ctrl-c")?;
                break;
            }
            update = subscription.next() => {
                let Some(entries) = update else { break };
                print_missions(&entries);
            }
        }
    }

    subscription.unsubscribe();
    session.shutdown().await;
    Ok(())
}

fn print_missions(entries: &[MissionLogEntry]) {
    for entry in entries {
        println!("{}/{} {}", entry.mission_id, entry.entry_id, entry.record);
    }
}

fn sign_in_hint(error: AppError) -> anyhow::Error {
    match error {
        AppError::SignInRequired => {
            anyhow::anyhow!("sign in required; run `viper-monitor login` first")
        }
        other => other.into(),
    }
}

async fn run_login() -> Result<()> {
    let email = std::env::var("VIPER_EMAIL").unwrap_or_default();
    let password = std::env::var("VIPER_PASSWORD").unwrap_or_default();
    let session = start_session().await?;

    let result = session.sign_in(&Credentials::new(email, password)).await;
    let dashboard = session.dashboard();
    session.shutdown().await;

    let signed_in = result?;
    println!(
        "signed in as {} (protected view: {})",
        signed_in.email,
        dashboard.can_view_protected()
    );
    Ok(())
}

async fn run_logout() -> Result<()> {
    let session = start_session().await?;
    session.sign_out().await;
    session.shutdown().await;
    println!("signed out");
    Ok(())
}
