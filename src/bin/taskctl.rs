use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ecron::config::Config;
use ecron::model::Task;
use ecron::storage::{PostgresDao, TaskDao};
use sqlx::postgres::PgPoolOptions;

/// Minimal operator CLI over the task registry. Not the admin surface
/// proper (out of scope) — a thin DAO-backed client for day-to-day use,
/// in the spirit of a one-off database utility binary.
#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Registers a new task.
    Add {
        name: String,
        executor: String,
        cron_expr: String,
        #[arg(default_value = "")]
        cfg: String,
    },
    /// Lists all known tasks.
    List,
    /// Pauses a task by id.
    Pause { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    let dao = PostgresDao::new(pool);

    match cli.command {
        Command::Add { name, executor, cron_expr, cfg } => {
            let task = Task::builder().name(name).executor(executor).cron_expr(cron_expr).cfg(cfg).build();
            let created = dao.add(&task).await?;
            println!("created task {}", created.id);
        }
        Command::List => {
            for task in dao.list().await? {
                println!(
                    "{:>6}  {:<20}  {:<10}  {:?}  next={:?}",
                    task.id, task.name, task.executor, task.status, task.next_exec_time
                );
            }
        }
        Command::Pause { id } => {
            dao.stop(id).await?;
            println!("paused task {id}");
        }
    }

    Ok(())
}
