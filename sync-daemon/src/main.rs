//! CLI entry point for the media sync daemon.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use sync_config::Settings;
use sync_core::engine::EngineConfig;
use sync_core::scheduler::Scheduler;
use sync_core::sink::HttpSink;
use sync_core::source::HttpSourceAdapter;
use sync_core::sink::SinkAdapter;
use sync_core::source::SourceAdapter;
use sync_core::state::StateStore;
use sync_core::SyncEngine;

const SOURCE_PRIMARY_HOST: &str = "https://x.com";
const SOURCE_ALTERNATE_HOST: &str = "https://api.twitter.com";
const SINK_BASE_URL: &str = "https://api.telegram.org/archive";

#[derive(Parser)]
#[command(name = "sync-daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    #[command(name = "sync:run")]
    SyncRun,
    #[command(name = "sync:daemon")]
    SyncDaemon,
    #[command(name = "auth:telegram")]
    AuthTelegram,
    #[command(name = "health:check")]
    HealthCheck,
    #[command(name = "cookies:check")]
    CookiesCheck,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let default_command = if std::env::var("APP_MODE").as_deref() == Ok("daemon") {
        Command::SyncDaemon
    } else {
        Command::SyncRun
    };

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(default_command);

    let exit_code = match command {
        Command::SyncRun => run_sync_once().await,
        Command::SyncDaemon => run_daemon().await,
        Command::AuthTelegram => {
            eprintln!("auth:telegram is an interactive credential bootstrap and is not implemented here");
            1
        }
        Command::HealthCheck => run_health_check().await,
        Command::CookiesCheck => run_cookies_check().await,
    };

    std::process::exit(exit_code);
}

async fn load_settings() -> Result<Settings, i32> {
    Settings::from_env().map_err(|e| {
        eprintln!("configuration error: {e}");
        1
    })
}

fn build_source(settings: &Settings) -> Result<Arc<dyn SourceAdapter>, i32> {
    let (cookies, report) = sync_config::parse_cookie_bundle(&settings.source_cookies_json)
        .map_err(|e| {
            eprintln!("failed to parse SOURCE_COOKIES_JSON: {e}");
            1
        })?;
    if report.domain_rewrites > 0 {
        tracing::info!(rewrites = report.domain_rewrites, "normalized cookie domains");
    }
    Ok(Arc::new(HttpSourceAdapter::new(
        &cookies,
        settings.source_web_bearer_token.clone(),
        SOURCE_PRIMARY_HOST,
        SOURCE_ALTERNATE_HOST,
    )))
}

fn build_sink(settings: &Settings) -> Arc<dyn SinkAdapter> {
    Arc::new(HttpSink::new(
        SINK_BASE_URL,
        settings.sink_api_id.clone(),
        settings.sink_api_hash.clone(),
        settings.sink_string_session.clone(),
        "archive",
    ))
}

async fn build_engine(settings: &Settings) -> Result<SyncEngine, i32> {
    let source = build_source(settings)?;
    let sink = build_sink(settings);
    let state = StateStore::connect(&settings.state_db_path).await.map_err(|e| {
        eprintln!("failed to open state store: {e}");
        1
    })?;

    Ok(SyncEngine::new(
        state,
        source,
        sink,
        EngineConfig {
            accounts: settings.source_users.clone(),
            backfill_pages_per_run: settings.backfill_pages_per_run,
            max_media_per_run: settings.max_media_per_run,
            download_tmp_dir: PathBuf::from(&settings.download_tmp_dir),
            job_lock_ttl_seconds: settings.job_lock_ttl_seconds,
            max_upload_video_bytes: settings.max_upload_video_bytes,
            source_rate_limit_cooldown_seconds: settings.source_rate_limit_cooldown_seconds,
        },
    ))
}

async fn run_sync_once() -> i32 {
    let settings = match load_settings().await {
        Ok(s) => s,
        Err(code) => return code,
    };
    let engine = match build_engine(&settings).await {
        Ok(e) => e,
        Err(code) => return code,
    };

    match engine.run().await {
        Ok(summary) if summary.skipped_by_lock => {
            tracing::info!("run skipped: job lock already held");
            0
        }
        Ok(summary) => {
            for account in &summary.accounts {
                tracing::info!(
                    handle = %account.handle,
                    uploaded = account.uploaded,
                    skipped = account.skipped,
                    failed = account.failed,
                    "account sync complete"
                );
            }
            0
        }
        Err(e) => {
            eprintln!("sync run failed: {e}");
            hint_if_auth_failure(&e.to_string());
            1
        }
    }
}

async fn run_daemon() -> i32 {
    let settings = match load_settings().await {
        Ok(s) => s,
        Err(code) => return code,
    };
    let engine = match build_engine(&settings).await {
        Ok(e) => e,
        Err(code) => return code,
    };

    let scheduler = Scheduler::new(
        engine,
        settings.timezone,
        settings.sync_daily_at,
        settings.scheduler_tick(),
        settings.scheduler_run_on_start,
    );

    scheduler.run_forever().await;
}

async fn run_health_check() -> i32 {
    let settings = match load_settings().await {
        Ok(s) => s,
        Err(code) => return code,
    };
    let Some(handle) = settings.source_users.first() else {
        eprintln!("no accounts configured in SOURCE_USERS");
        return 1;
    };

    let source = match build_source(&settings) {
        Ok(s) => s,
        Err(code) => return code,
    };
    let sink = build_sink(&settings);

    let mut ok = true;
    if let Err(e) = source.health_check(handle).await {
        eprintln!("source health check failed: {e}");
        ok = false;
    }
    if let Err(e) = sink.health_check().await {
        eprintln!("sink health check failed: {e}");
        ok = false;
    }

    if ok {
        println!("ok");
        0
    } else {
        1
    }
}

async fn run_cookies_check() -> i32 {
    let settings = match load_settings().await {
        Ok(s) => s,
        Err(code) => return code,
    };

    let (cookies, report) = match sync_config::parse_cookie_bundle(&settings.source_cookies_json) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("failed to parse SOURCE_COOKIES_JSON: {e}");
            return 1;
        }
    };
    println!("parsed {} cookie entries ({} domain rewrites)", cookies.len(), report.domain_rewrites);

    let adapter = HttpSourceAdapter::new(
        &cookies,
        settings.source_web_bearer_token.clone(),
        SOURCE_PRIMARY_HOST,
        SOURCE_ALTERNATE_HOST,
    );
    let check = adapter.check_session().await;
    if check.logged_in {
        println!("session ok (host: {})", check.host.unwrap_or_default());
        0
    } else {
        println!("session check failed: {}", check.reason.unwrap_or_default());
        1
    }
}

fn hint_if_auth_failure(message: &str) {
    if message.to_lowercase().contains("auth") {
        eprintln!("hint: this looks like an authentication failure — check SOURCE_COOKIES_JSON and SOURCE_WEB_BEARER_TOKEN");
    }
}
