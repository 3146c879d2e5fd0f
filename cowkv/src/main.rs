#![cfg_attr(test, allow(clippy::expect_used))]
use std::process::ExitCode;

use cowkv::config::AppConfig;
use cowkv::storage::{Comparator, SetMode, Store, StoreError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: cowkv <command> [args]

commands:
  get KEY
  set KEY VALUE
  insert KEY VALUE
  update KEY VALUE
  delete KEY
  scan [FROM [TO]]
  stats

The store file is COWKV_DATABASE_PATH (default ./data.cowkv).";

/// A parsed command line.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Get(String),
    Set(String, String, SetMode),
    Delete(String),
    Scan(Option<String>, Option<String>),
    Stats,
}

impl Command {
    fn parse(args: &[String]) -> Option<Self> {
        fn owned(s: &str) -> String {
            s.to_string()
        }

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["get", key] => Some(Self::Get(owned(key))),
            ["set", key, value] => Some(Self::Set(owned(key), owned(value), SetMode::Upsert)),
            ["insert", key, value] => Some(Self::Set(owned(key), owned(value), SetMode::Insert)),
            ["update", key, value] => Some(Self::Set(owned(key), owned(value), SetMode::Update)),
            ["delete", key] => Some(Self::Delete(owned(key))),
            ["scan"] => Some(Self::Scan(None, None)),
            ["scan", from] => Some(Self::Scan(Some(owned(from)), None)),
            ["scan", from, to] => Some(Self::Scan(Some(owned(from)), Some(owned(to)))),
            ["stats"] => Some(Self::Stats),
            _ => None,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cowkv=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = Command::parse(&args) else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };

    // Load configuration from environment variables
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    tracing::debug!(
        path = %config.database_path.display(),
        initial_mmap_mb = config.initial_mmap_mb,
        rehydrate = config.rehydrate_on_open,
        "loaded configuration"
    );

    let mut store = match Store::open_with(&config.database_path, &config.to_store_options()) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("Failed to open store: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = run(&mut store, command).and_then(|code| {
        store.close()?;
        Ok(code)
    });
    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(store: &mut Store, command: Command) -> Result<ExitCode, StoreError> {
    match command {
        Command::Get(key) => match store.get(key.as_bytes())? {
            Some(value) => println!("{}", String::from_utf8_lossy(value)),
            None => {
                eprintln!("not found");
                return Ok(ExitCode::from(1));
            }
        },
        Command::Set(key, value, mode) => store.set(key.as_bytes(), value.as_bytes(), mode)?,
        Command::Delete(key) => {
            if !store.delete(key.as_bytes())? {
                eprintln!("not found");
                return Ok(ExitCode::from(1));
            }
        }
        Command::Scan(from, to) => {
            let from = from.unwrap_or_default();
            let end = to.as_deref().map(|to| (to.as_bytes(), Comparator::LessOrEqual));
            for entry in store.scan((from.as_bytes(), Comparator::GreaterOrEqual), end)? {
                let (key, value) = entry?;
                println!(
                    "{}\t{}",
                    String::from_utf8_lossy(key),
                    String::from_utf8_lossy(value)
                );
            }
        }
        Command::Stats => println!("{:#?}", store.stats()?),
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse(&args(&["get", "k"])),
            Some(Command::Get("k".to_string()))
        );
        assert_eq!(
            Command::parse(&args(&["insert", "k", "v"])),
            Some(Command::Set("k".to_string(), "v".to_string(), SetMode::Insert))
        );
        assert_eq!(
            Command::parse(&args(&["scan", "a"])),
            Some(Command::Scan(Some("a".to_string()), None))
        );
        assert_eq!(Command::parse(&args(&["stats"])), Some(Command::Stats));
    }

    #[test]
    fn test_parse_rejects_bad_arity() {
        assert_eq!(Command::parse(&args(&[])), None);
        assert_eq!(Command::parse(&args(&["get"])), None);
        assert_eq!(Command::parse(&args(&["set", "k"])), None);
        assert_eq!(Command::parse(&args(&["scan", "a", "b", "c"])), None);
    }
}
