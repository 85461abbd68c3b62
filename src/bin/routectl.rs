//! routectl - operator command line for the route control plane
//!
//! Usage:
//!   routectl users list                    List operator accounts
//!   routectl users add <name> <password>   Create an account or change its password
//!   routectl users delete <name>           Delete an account
//!
//!   routectl routes list [--orphaned]      List routes with their orphan status
//!   routectl routes migrate                Rewrite legacy route keys to host:path form
//!
//! Reads the same TOML file as the server (`--config <path>`, `ROUTEKEEPER_CONFIG`,
//! or `config.toml`) and talks to Redis and Docker directly.

use anyhow::{bail, Context, Result};
use routekeeper::config::Config;
use routekeeper::docker::DockerDiscovery;
use routekeeper::keyspace::KeySpace;
use routekeeper::reconcile::{Route, RouteManager};
use routekeeper::redis_backend::RedisBackend;
use routekeeper::routes::RouteStore;
use routekeeper::users::{BcryptHasher, CredentialStore};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Users(UsersCommand),
    Routes(RoutesCommand),
    Help,
    Version,
}

#[derive(Debug, PartialEq, Eq)]
enum UsersCommand {
    List,
    Add { name: String, password: String },
    Delete { name: String },
}

#[derive(Debug, PartialEq, Eq)]
enum RoutesCommand {
    List { orphaned: bool },
    Migrate,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let (config_path, args) = split_config_flag(&args)?;

    match parse_command(&args)? {
        Command::Help => print_help(),
        Command::Version => print_version(),
        Command::Users(cmd) => handle_users(cmd, &load_config(config_path)?).await?,
        Command::Routes(cmd) => handle_routes(cmd, &load_config(config_path)?).await?,
    }

    Ok(())
}

/// Pull `--config <path>` out of the argument list
fn split_config_flag(args: &[String]) -> Result<(Option<PathBuf>, Vec<String>)> {
    let mut config = None;
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" || arg == "-c" {
            let path = iter.next().context("--config requires a path")?;
            config = Some(PathBuf::from(path));
        } else {
            rest.push(arg.clone());
        }
    }
    Ok((config, rest))
}

fn parse_command(args: &[String]) -> Result<Command> {
    let Some(first) = args.first() else {
        return Ok(Command::Help);
    };

    match first.as_str() {
        "help" | "--help" | "-h" => Ok(Command::Help),
        "version" | "--version" | "-V" => Ok(Command::Version),
        "users" | "user" => parse_users_command(&args[1..]),
        "routes" | "route" => parse_routes_command(&args[1..]),
        other => bail!("unknown command '{}'; see `routectl help`", other),
    }
}

fn parse_users_command(args: &[String]) -> Result<Command> {
    let cmd = match args.first().map(String::as_str) {
        None | Some("list") | Some("ls") => UsersCommand::List,
        Some("add") | Some("passwd") => match (args.get(1), args.get(2)) {
            (Some(name), Some(password)) => UsersCommand::Add {
                name: name.clone(),
                password: password.clone(),
            },
            _ => bail!("usage: routectl users add <name> <password>"),
        },
        Some("delete") | Some("rm") => match args.get(1) {
            Some(name) => UsersCommand::Delete { name: name.clone() },
            None => bail!("usage: routectl users delete <name>"),
        },
        Some(other) => bail!("unknown users subcommand '{}'", other),
    };
    Ok(Command::Users(cmd))
}

fn parse_routes_command(args: &[String]) -> Result<Command> {
    let cmd = match args.first().map(String::as_str) {
        None | Some("list") | Some("ls") => RoutesCommand::List {
            orphaned: args.iter().any(|a| a == "--orphaned"),
        },
        Some("migrate") => RoutesCommand::Migrate,
        Some(other) => bail!("unknown routes subcommand '{}'", other),
    };
    Ok(Command::Routes(cmd))
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let path = path
        .or_else(|| env::var("ROUTEKEEPER_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config.toml"));
    Config::load(&path).with_context(|| format!("Failed to load {}", path.display()))
}

async fn handle_users(cmd: UsersCommand, config: &Config) -> Result<()> {
    let kv = Arc::new(RedisBackend::connect(&config.store).await?);
    let users = CredentialStore::new(
        kv,
        KeySpace::new(config.store.prefix.clone()),
        Arc::new(BcryptHasher::new(config.auth.bcrypt_cost)),
    );

    match cmd {
        UsersCommand::List => {
            let names = users.lookup("").await?;
            if names.is_empty() {
                println!("No users. Create one with: routectl users add <name> <password>");
            }
            for name in names {
                println!("{}", name);
            }
        }
        UsersCommand::Add { name, password } => {
            let existed = users.get(&name).await?.is_found();
            users.insert(&name, &password).await?;
            if existed {
                println!("Password changed for {}", name);
            } else {
                println!("User {} created", name);
            }
        }
        UsersCommand::Delete { name } => {
            if users.delete(&name).await? {
                println!("User {} deleted", name);
            } else {
                bail!("user not found: {}", name);
            }
        }
    }

    Ok(())
}

async fn handle_routes(cmd: RoutesCommand, config: &Config) -> Result<()> {
    let kv = Arc::new(RedisBackend::connect(&config.store).await?);
    let store = RouteStore::new(kv, KeySpace::new(config.store.prefix.clone()));

    match cmd {
        RoutesCommand::Migrate => {
            let migrated = store.migrate_legacy_keys().await?;
            println!("Migrated {} legacy route key(s)", migrated);
        }
        RoutesCommand::List { orphaned } => {
            let discovery = Arc::new(DockerDiscovery::connect(&config.discovery).await?);
            let manager = RouteManager::new(store, discovery);
            let routes = if orphaned {
                manager.orphaned_routes().await?
            } else {
                manager.list_routes().await?
            };
            print_routes(&routes);
        }
    }

    Ok(())
}

fn print_routes(routes: &[Route]) {
    if routes.is_empty() {
        println!("No routes");
        return;
    }

    let width = routes
        .iter()
        .map(|r| r.host.len() + r.path.len())
        .max()
        .unwrap_or(0);
    for route in routes {
        let source = format!("{}{}", route.host, route.path);
        let status = if route.is_orphan { "  ORPHANED" } else { "" };
        println!(
            "{:<width$}  ->  {}:{}{}",
            source,
            route.target,
            route.port,
            status,
            width = width
        );
    }
}

fn print_help() {
    println!(r#"
routectl - manage reverse proxy routes and operator accounts

USAGE:
    routectl [--config <path>] <command>

COMMANDS:
    users list                    List operator accounts
    users add <name> <password>   Create an account or change its password
    users delete <name>           Delete an account

    routes list [--orphaned]      List routes and whether their service is gone
    routes migrate                Rewrite legacy route keys to host:path form

    help                          Show this help
    version                       Show version

ENVIRONMENT:
    ROUTEKEEPER_CONFIG            Config file (default: config.toml)
    RUST_LOG                      Log filter (default: warn)
"#);
}

fn print_version() {
    println!("routectl {}", env!("CARGO_PKG_VERSION"));
}
