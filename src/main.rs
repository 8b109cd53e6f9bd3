use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing::{warn, Level};

use sqlmend::candidate::clean_sql_query;
use sqlmend::correction::{
    CorrectionRequest, Corrector, EventSink, LoopEvent, QueryProcessor, TurnOutcome,
};
use sqlmend::dialect::Dialect;
use sqlmend::render::{render, OutputFormat};
use sqlmend::{Engine, Settings};

/// Validate, execute and correct SQL against a live database
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Config file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database engine: sqlite or postgresql
    #[arg(long, global = true)]
    dialect: Option<String>,

    /// Connection URI or SQLite file path
    #[arg(long, global = true)]
    uri: Option<String>,

    #[arg(long, global = true)]
    max_iterations: Option<usize>,

    /// Prompt for the PostgreSQL password
    #[arg(long, global = true)]
    ask_password: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the extracted DDL
    Schema {
        /// Print the parsed table/column map instead
        #[arg(long)]
        json: bool,
    },
    /// Check a query against the schema without running it
    Validate { sql: String },
    /// Validate a query and run it if it passes
    Execute {
        sql: String,
        #[arg(long, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Run the correction loop, reading corrected queries from stdin
    Run {
        sql: String,
        #[arg(long, default_value = "")]
        question: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();

    let settings = resolve_settings(&cli)?;
    let dialect = resolve_dialect(&settings, cli.ask_password)?;
    let engine = Engine::with_dialect(settings, dialect);

    match cli.command {
        Command::Schema { json } => {
            let entry = engine.load_schema().await.context("loading schema")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entry.schema)?);
            } else {
                println!("{}", entry.ddl);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate { sql } => {
            let result = engine.session().await.validate(&sql);
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(exit_code(result.is_success()))
        }
        Command::Execute { sql, format } => {
            let session = engine.session().await;
            let validation = session.validate(&sql);
            if !validation.is_success() {
                println!("{}", serde_json::to_string_pretty(&validation)?);
                return Ok(ExitCode::FAILURE);
            }
            match session.execute(&sql).await {
                Ok(rows) => {
                    print!("{}", render(&rows, format));
                    Ok(ExitCode::SUCCESS)
                }
                Err(message) => {
                    eprintln!("Error: {}", message);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Run { sql, question } => {
            let corrector = StdinCorrector::new();
            let candidate = clean_sql_query(&sql);
            let outcome = engine
                .run_turn(&question, &candidate, &corrector, &JsonLines)
                .await?;
            Ok(exit_code(matches!(outcome, TurnOutcome::Succeeded { .. })))
        }
    }
}

fn resolve_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(dialect) = &cli.dialect {
        settings.dialect = dialect.parse()?;
    }
    if let Some(uri) = &cli.uri {
        settings.db_uri = Some(uri.clone());
    }
    if let Some(n) = cli.max_iterations {
        settings.max_iterations = n;
    }
    settings.check()?;
    Ok(settings)
}

/// Password resolution: URI first, then PGPASSWORD, then an interactive
/// prompt when asked for.
fn resolve_dialect(settings: &Settings, ask_password: bool) -> Result<Dialect> {
    let mut dialect = Dialect::from_settings(settings);
    if let Dialect::Postgres(pg) = &mut dialect {
        if ask_password {
            let password = rpassword::read_password_from_tty(Some("Password: "))
                .context("reading password")?;
            pg.set_password(password);
        } else if let Ok(password) = std::env::var("PGPASSWORD") {
            pg.set_password(password);
        }
    }
    Ok(dialect)
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// One JSON object per event on stdout.
struct JsonLines;

impl EventSink for JsonLines {
    fn emit(&self, event: LoopEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "could not serialize event"),
        }
    }
}

/// Shows the failure on stderr and reads the replacement query, one line,
/// from stdin.
struct StdinCorrector {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl StdinCorrector {
    fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

impl Corrector for StdinCorrector {
    async fn correct(&self, request: CorrectionRequest<'_>) -> std::result::Result<String, String> {
        eprintln!("Query failed: {}", request.query);
        if let Some(validation) = request.validation {
            for error in validation.errors() {
                eprintln!("  validation: {}", error);
            }
        }
        if let Some(message) = request.execution.and_then(|e| e.error_message()) {
            eprintln!("  execution: {}", message);
        }
        eprint!("corrected query> ");

        let mut lines = self.lines.lock().await;
        match lines.next_line().await {
            Ok(Some(line)) if !line.trim().is_empty() => Ok(line),
            Ok(_) => Err("no corrected query on stdin".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }
}
