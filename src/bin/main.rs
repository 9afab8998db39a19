//! tally CLI - Compile AQL query descriptions to SQLite SQL and run them
//!
//! Usage:
//!   tally compile --schema <schema.json> --query <query.json> [--output verbose]
//!   tally run --schema <schema.json> --query <query.json> [--db <file>] [--param name=value]
//!             [--cell <sheet!name>]
//!
//! Examples:
//!   tally compile --schema budget.json --query spent.json
//!   tally run --schema budget.json --query spent.json --db budget.sqlite --param month=2024-01
//!   tally run --schema budget.json --query spent.json --cell budget!spent

use clap::{Parser, Subcommand, ValueEnum};
use rusqlite::Connection;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;
use std::sync::Arc;
use tally::aql::Query;
use tally::cache::CellCache;
use tally::compile::{compile_with_schema, parse_query, CompileOutput};
use tally::config::Settings;
use tally::exec::{run_compiled_query, SqliteExecutor};
use tally::schema::Schema;
use tally::sheet::{resolve_name, unresolve_name, Spreadsheet};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "tally - Compile schema-typed JSON queries to SQLite")]
#[command(version)]
struct Cli {
    /// Config file (defaults to $TALLY_CONFIG, ./tally.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a query description to SQL
    Compile {
        /// Path to the schema JSON
        #[arg(short, long)]
        schema: PathBuf,

        /// Path to the query description JSON
        #[arg(short, long)]
        query: PathBuf,

        /// Output format
        #[arg(short, long, default_value = "sql")]
        output: OutputFormat,
    },

    /// Compile a query and run it against a SQLite database
    Run {
        /// Path to the schema JSON
        #[arg(short, long)]
        schema: PathBuf,

        /// Path to the query description JSON
        #[arg(short, long)]
        query: PathBuf,

        /// SQLite database (defaults to [database] path in the config)
        #[arg(long)]
        db: Option<PathBuf>,

        /// Named parameter as name=value; value is parsed as JSON, else taken as a string
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,

        /// Run as the query cell sheet!name, reading and saving its value
        /// through the [cache] configured cell cache
        #[arg(long)]
        cell: Option<String>,
    },
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Output SQL only
    Sql,
    /// Output SQL with dependencies, output types and parameters
    Verbose,
}

fn parse_param(s: &str) -> Result<(String, Value), String> {
    let (name, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{}'", s))?;
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((name.trim_start_matches(':').to_string(), value))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::from_file(path),
        None => Settings::load(),
    };
    let settings = match settings {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Compile {
            schema,
            query,
            output,
        } => cmd_compile(&settings, &schema, &query, output),
        Commands::Run {
            schema,
            query,
            db,
            params,
            cell,
        } => cmd_run(&settings, &schema, &query, db, params, cell),
    }
}

fn load_inputs(schema: &Path, query: &Path) -> Result<(Arc<Schema>, Query), String> {
    let schema = Schema::from_file(schema)
        .map_err(|e| format!("Error reading schema '{}': {}", schema.display(), e))?;
    let source = fs::read_to_string(query)
        .map_err(|e| format!("Error reading file '{}': {}", query.display(), e))?;
    let query = parse_query(&source).map_err(|e| e.to_string())?;
    Ok((Arc::new(schema), query))
}

fn compile_files(settings: &Settings, schema: &Path, query: &Path) -> Result<CompileOutput, String> {
    let (schema, query) = load_inputs(schema, query)?;
    compile_with_schema(&schema, &query, settings)
        .map_err(|e| format!("Compilation error: {}", e))
}

fn cmd_compile(settings: &Settings, schema: &Path, query: &Path, output: OutputFormat) -> ExitCode {
    let compiled = match compile_files(settings, schema, query) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match output {
        OutputFormat::Sql => {
            println!("{}", compiled.sql);
        }
        OutputFormat::Verbose => {
            let c = &compiled.compiled;
            println!("-- tally compiled SQL");
            println!("-- Source: {}", query.display());
            println!("-- Dependencies: {}", c.dependencies().join(", "));
            for (alias, ty) in c.output_types() {
                println!("-- Output: {} {}", alias, ty);
            }
            for p in c.named_parameters() {
                match p.param_type {
                    Some(ty) => println!("-- Param: :{} {}", p.name, ty),
                    None => println!("-- Param: :{}", p.name),
                }
            }
            println!();
            println!("{}", compiled.sql);
        }
    }
    ExitCode::SUCCESS
}

fn cmd_run(
    settings: &Settings,
    schema: &Path,
    query: &Path,
    db: Option<PathBuf>,
    params: Vec<(String, Value)>,
    cell: Option<String>,
) -> ExitCode {
    let db = match db {
        Some(path) => path,
        None => match settings.database_path() {
            Ok(Some(path)) => path,
            Ok(None) => {
                eprintln!("No database given; pass --db or set [database] path in the config");
                return ExitCode::FAILURE;
            }
            Err(e) => {
                eprintln!("Error resolving database path: {}", e);
                return ExitCode::FAILURE;
            }
        },
    };

    let conn = match Connection::open(&db) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error opening database '{}': {}", db.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let params: Map<String, Value> = params.into_iter().collect();
    let result = match cell {
        Some(cell) => run_cell(settings, schema, query, conn, params, &cell),
        None => compile_files(settings, schema, query).and_then(|compiled| {
            run_compiled_query(&conn, &compiled.compiled, &params)
                .map_err(|e| format!("Query error: {}", e))
        }),
    };

    match result.and_then(|v| {
        serde_json::to_string_pretty(&v).map_err(|e| format!("Error encoding result: {}", e))
    }) {
        Ok(s) => {
            println!("{}", s);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Run the query as a query cell, prewarmed from and saved to the cell cache.
fn run_cell(
    settings: &Settings,
    schema: &Path,
    query: &Path,
    conn: Connection,
    params: Map<String, Value>,
    cell: &str,
) -> Result<Value, String> {
    let (schema, query) = load_inputs(schema, query)?;
    let executor = SqliteExecutor::new(conn).with_params(params);
    let mut sheet = Spreadsheet::new(schema, Arc::new(settings.clone())).with_executor(executor);

    let cache = CellCache::from_settings(settings)
        .map_err(|e| format!("Error opening cell cache: {}", e))?
        .map(Rc::new);
    if let Some(cache) = &cache {
        let cached = cache
            .load_cells()
            .map_err(|e| format!("Error reading cell cache: {}", e))?;
        sheet.load_cache(cached);
        let cache = Rc::clone(cache);
        sheet.on_save_cache(move |cells| {
            if let Err(e) = cache.save_cells(cells) {
                warn!(error = %e, "failed to save cell values");
            }
        });
    }

    let (sheet_name, name) = unresolve_name(cell);
    sheet
        .create_query(sheet_name, name, query)
        .map_err(|e| format!("Compilation error: {}", e))?;
    if let Some(e) = sheet.last_error() {
        return Err(format!("Query error: {}", e));
    }
    Ok(sheet.get_value(&resolve_name(sheet_name, name)))
}
