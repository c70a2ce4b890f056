use anyhow::Context;
use storysyncd::config::SyncSettings;
use storysyncd::daemon::DaemonRuntime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Migrate,
    Resume,
    Status,
    PurgeFailed,
    ResetMigration,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--migrate" => mode = CliMode::Migrate,
            "--resume" => mode = CliMode::Resume,
            "--status" => mode = CliMode::Status,
            "--purge-failed" => mode = CliMode::PurgeFailed,
            "--reset-migration" => mode = CliMode::ResetMigration,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("storysyncd=info,storysync_core=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_help() {
    println!("Usage: storysyncd [--migrate | --resume | --status | --purge-failed | --reset-migration]");
    println!("  (no flag)          Run the sync scheduler until Ctrl-C");
    println!("  --migrate          Upload the local dataset to the server");
    println!("  --resume           Continue an interrupted migration");
    println!("  --status           Print session, queue and migration state");
    println!("  --purge-failed     Drop queued operations that ran out of retries");
    println!("  --reset-migration  Forget the saved migration state");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        print_help();
        return Ok(());
    }
    init_tracing();

    let settings = SyncSettings::from_env()?;
    let runtime = DaemonRuntime::bootstrap(settings).await?;
    match mode {
        CliMode::Run => runtime.run().await,
        CliMode::Migrate => {
            let state = runtime
                .migration()
                .start_migration()
                .await
                .context("migration failed")?;
            info!(progress = state.progress, "migration finished");
            Ok(())
        }
        CliMode::Resume => {
            let state = runtime
                .migration()
                .resume_migration()
                .await
                .context("migration resume failed")?;
            info!(progress = state.progress, "migration finished");
            Ok(())
        }
        CliMode::Status => {
            print!("{}", runtime.status().await?.render());
            Ok(())
        }
        CliMode::PurgeFailed => {
            let removed = runtime.engine().queue().clear_failed_operations().await?;
            println!("removed {removed} exhausted operation(s)");
            Ok(())
        }
        CliMode::ResetMigration => {
            runtime.migration().reset().await?;
            println!("migration state cleared");
            Ok(())
        }
        CliMode::Help => Ok(()),
    }
}
