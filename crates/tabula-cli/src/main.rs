use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use std::process::ExitCode;
use tabula::tabula_sql::Quoter;
use tabula::version::DEFAULT_VERSION_TABLE;
use tabula::{InitScript, Options, Outcome, Reconciler, Status, TracedDb, VersionTracker};
use tabula_config::ProjectConfig;
use tokio_postgres::{Client, NoTls};
use tracing_subscriber::EnvFilter;

/// Declarative Postgres schema reconciliation.
#[derive(Parser, Debug)]
#[command(name = "tabula", version)]
struct Cli {
    /// Database connection URL
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Directory to search for `.config/tabula.json` (defaults to the current directory)
    #[arg(long, global = true)]
    config: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bring the database schema in line with the table config
    Apply,
    /// Run the full reconciliation and roll it back, printing the patch
    Plan,
    /// Show the latest recorded schema version
    Status,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] tabula_config::ConfigError),
    #[error("no database URL: pass --database-url, set DATABASE_URL, or add databaseUrl to .config/tabula.json")]
    MissingDatabaseUrl,
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        source: tokio_postgres::Error,
    },
    #[error(transparent)]
    Reconcile(#[from] tabula::Error),
    #[error(transparent)]
    Sql(#[from] tabula::SqlError),
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env before clap reads DATABASE_URL
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tabula=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {}", "error:".red().bold(), err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let (project, config_path) = match &cli.config {
        Some(dir) => tabula_config::load_from(dir)?,
        None => tabula_config::load()?,
    };
    tracing::debug!(path = %config_path, "loaded project config");

    let url = cli
        .database_url
        .clone()
        .or_else(|| project.database_url.clone())
        .ok_or(CliError::MissingDatabaseUrl)?;
    println!("{} {}", "database:".dimmed(), mask_password(&url));
    let client = connect(&url).await?;

    match cli.command {
        Command::Apply => {
            let outcome = reconcile(&client, &project, true).await?;
            print_outcome(&outcome);
        }
        Command::Plan => {
            let outcome = reconcile(&client, &project, false).await?;
            print_outcome(&outcome);
        }
        Command::Status => status(&client, &project).await?,
    }
    Ok(())
}

async fn connect(url: &str) -> Result<Client, CliError> {
    let (client, connection) =
        tokio_postgres::connect(url, NoTls)
            .await
            .map_err(|source| CliError::Connect {
                url: mask_password(url),
                source,
            })?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "connection error");
        }
    });
    Ok(client)
}

fn options(project: &ProjectConfig, commit: bool) -> Options {
    let mut options = Options::new().commit(commit);
    if let Some(version) = project.version {
        options = options.version(version);
    }
    if let Some(name) = &project.version_table_name {
        options = options.version_table_name(name.clone());
    }
    if let Some(path) = project.init_script_path() {
        options = options.init_script(InitScript::Path(path));
    }
    if let Some(validator) = &project.jsonb_validator {
        options = options.jsonb_validator(validator.clone());
    }
    options
}

async fn reconcile(
    client: &Client,
    project: &ProjectConfig,
    commit: bool,
) -> Result<Outcome, CliError> {
    let tables = project.load_tables()?;
    let reconciler = Reconciler::new(tables, options(project, commit));
    Ok(reconciler.run(client).await?)
}

fn print_outcome(outcome: &Outcome) {
    for table in &outcome.dropped_tables {
        println!("{} {}", "dropped".red(), table);
    }
    for sql in outcome.statements.iter().chain(&outcome.deferred) {
        println!("  {}", sql.cyan());
    }
    for mismatch in &outcome.mismatches {
        println!("{} {}", "mismatch:".yellow().bold(), mismatch);
    }

    let version = outcome
        .version
        .map(|v| format!(" (version {v})"))
        .unwrap_or_default();
    let count = outcome.statements.len() + outcome.deferred.len();
    match outcome.status {
        Status::UpToDate => println!("{}{}", "up to date".green(), version),
        Status::NoChanges => println!("{}{}", "no changes".green(), version),
        Status::Applied => println!(
            "{} {} statement(s){}",
            "applied".green().bold(),
            count,
            version
        ),
        Status::DryRun => println!(
            "{} {} statement(s), rolled back",
            "plan:".yellow().bold(),
            count
        ),
        Status::Failed => println!(
            "{} {}",
            "failed:".red().bold(),
            outcome.error.as_deref().unwrap_or_default()
        ),
    }
}

async fn status(client: &Client, project: &ProjectConfig) -> Result<(), CliError> {
    let name = project
        .version_table_name
        .as_deref()
        .unwrap_or(DEFAULT_VERSION_TABLE);
    let tracker = VersionTracker::new(&Quoter::default(), name)
        .map_err(|e| tabula::Error::Configuration(e.into()))?;

    match tracker.latest(TracedDb::new(client)).await {
        Ok(Some(record)) => {
            let at = record
                .migrated_at
                .map(|t| t.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            println!(
                "version {} recorded at {}",
                record.id.to_string().bold(),
                at
            );
            if let Some(target) = project.version.filter(|v| *v != record.id) {
                println!("{} configured version is {}", "pending:".yellow(), target);
            }
        }
        Ok(None) => println!("no version recorded in {name}"),
        // undefined_table
        Err(err) if err.code.as_deref() == Some("42P01") => {
            println!("{name} does not exist yet");
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

/// Mask password in database URL for display
fn mask_password(url: &str) -> String {
    // Replace the password between :// and @
    if let Some(start) = url.find("://") {
        if let Some(at) = url.rfind('@').filter(|&at| at > start + 3) {
            let prefix = &url[..start + 3];
            let suffix = &url[at..];
            if let Some(colon) = url[start + 3..at].find(':') {
                let user = &url[start + 3..start + 3 + colon];
                return format!("{}{}:***{}", prefix, user, suffix);
            }
        }
    }
    url.to_string()
}
