//! Command-line tool for inspecting and maintaining a partmap store.
#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::error::Error;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use partmap::{status, Store, StoreOptions};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "partmap",
    version,
    about = "Inspect and maintain a partitioned map store",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(long, env = "PARTMAP_DIR", help = "Store directory")]
    dir: PathBuf,

    #[arg(long, value_name = "FILE", help = "TOML file with store options")]
    config: Option<PathBuf>,

    #[arg(long, help = "Override the file name prefix")]
    basename: Option<String>,

    #[arg(long, help = "Keep an on-disk backup")]
    backup: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Print the status walk of the store")]
    Status {
        #[arg(long, default_value = "partmap", help = "Name prefix of every entry")]
        prefix: String,

        #[arg(long, help = "Only report the tile cache")]
        tiles: bool,
    },

    #[command(about = "Store a value; reads stdin when no value is given")]
    Put {
        id: u64,
        value: Option<String>,

        #[arg(long, help = "Append instead of replacing")]
        append: bool,
    },

    #[command(about = "Print the value stored under an id")]
    Get {
        id: u64,

        #[arg(long = "hex", help = "Print the value as hex")]
        as_hex: bool,
    },

    #[command(about = "Remove the value stored under an id")]
    Remove { id: u64 },

    #[command(about = "Add an id to the id set stored under another id")]
    Add {
        source: u64,
        dest: u64,

        #[arg(long, help = "Fail when the id is already in the set")]
        exclusive: bool,
    },

    #[command(about = "List the id set stored under an id")]
    Ids { id: u64 },

    #[command(about = "Run a complete checkpoint cycle")]
    Checkpoint {
        #[arg(long, help = "Skip fsyncs")]
        soft: bool,
    },

    #[command(about = "Return the store to its horizon")]
    Rollback,

    #[command(about = "Delete the on-disk backup")]
    RemoveBackup,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn load_options(args: &OpenArgs) -> Result<StoreOptions, Box<dyn Error>> {
    let mut options = match &args.config {
        Some(path) => StoreOptions::load(path)?,
        None => StoreOptions::default(),
    };
    if let Some(basename) = &args.basename {
        options.basename = basename.clone();
    }
    if args.backup {
        options.backup = true;
    }
    Ok(options)
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let options = load_options(&cli.open)?;
    let mut store = Store::open(&cli.open.dir, options)?;
    let mut missing = false;

    match cli.command {
        Command::Status { prefix, tiles } => {
            let entries = if tiles {
                status::collect(|cb| store.status_tiles(&prefix, cb))?
            } else {
                status::collect(|cb| store.status(&prefix, cb))?
            };
            match cli.format {
                OutputFormat::Json => {
                    let map: BTreeMap<_, _> = entries.into_iter().collect();
                    println!("{}", serde_json::to_string_pretty(&map)?);
                }
                OutputFormat::Text => {
                    for (name, value) in entries {
                        println!("{name} = {value}");
                    }
                }
            }
        }
        Command::Put { id, value, append } => {
            let bytes = match value {
                Some(value) => value.into_bytes(),
                None => {
                    let mut buf = Vec::new();
                    io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            if append {
                store.append(id, &bytes)?;
            } else {
                store.put(id, &bytes)?;
            }
        }
        Command::Get { id, as_hex } => match store.get(id)? {
            Some(bytes) => match (cli.format, as_hex) {
                (OutputFormat::Json, _) => {
                    let value = serde_json::json!({ "id": id, "hex": hex::encode(&bytes) });
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
                (OutputFormat::Text, true) => println!("{}", hex::encode(&bytes)),
                (OutputFormat::Text, false) => {
                    let mut out = io::stdout().lock();
                    out.write_all(&bytes)?;
                    out.flush()?;
                }
            },
            None => {
                eprintln!("id {id} has no value");
                missing = true;
            }
        },
        Command::Remove { id } => {
            if !store.remove(id)? {
                eprintln!("id {id} has no value");
            }
        }
        Command::Add {
            source,
            dest,
            exclusive,
        } => store.add(source, dest, exclusive)?,
        Command::Ids { id } => {
            let ids = store.ids(id)?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string(&ids)?),
                OutputFormat::Text => {
                    for id in ids {
                        println!("{id}");
                    }
                }
            }
        }
        Command::Checkpoint { soft } => {
            store.checkpoint(!soft)?;
            println!("horizon {}", store.horizon());
        }
        Command::Rollback => {
            store.rollback()?;
            println!("horizon {}", store.horizon());
        }
        Command::RemoveBackup => store.remove_backup()?,
    }
    store.close()?;
    if missing {
        std::process::exit(2);
    }
    Ok(())
}
