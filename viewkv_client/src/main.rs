//! Viewkv client utility executable: one-shot operations or an interactive
//! REPL against the replicated key-value service.

use std::io::{self, Write};
use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use tokio::runtime::Builder;
use viewkv::{logger_init, pf_error, KvClient, ViewKvError};

/// Prompt string at the start of line.
const PROMPT: &str = ">>> ";

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// View authority's address.
    #[arg(short, long)]
    authority: SocketAddr,

    /// One-shot operation: get|put|view|dump. Starts the interactive REPL
    /// if not given.
    #[arg(short, long, default_value_t = String::from(""))]
    op: String,

    /// Key for get/put operations.
    #[arg(short, long, default_value_t = String::from(""))]
    key: String,

    /// Value for the put operation.
    #[arg(short, long, default_value_t = String::from(""))]
    value: String,

    /// Client configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments.
    fn sanitize(&self) -> Result<(), ViewKvError> {
        match self.op.as_str() {
            "" | "view" | "dump" => Ok(()),
            "get" => {
                if self.key.is_empty() {
                    Err(ViewKvError::msg("get operation requires --key"))
                } else {
                    Ok(())
                }
            }
            "put" => {
                if self.key.is_empty() || self.value.is_empty() {
                    Err(ViewKvError::msg(
                        "put operation requires --key and --value",
                    ))
                } else {
                    Ok(())
                }
            }
            op => Err(ViewKvError::msg(format!("operation '{}' unrecognized", op))),
        }
        .and(if self.threads < 2 {
            Err(ViewKvError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        })
    }
}

/// Runs a single operation, printing its outcome.
async fn run_op(
    client: &mut KvClient,
    op: &str,
    key: &str,
    value: &str,
) -> Result<(), ViewKvError> {
    match op {
        "get" => {
            let result = client.get(key).await?;
            println!("{}", result.unwrap_or_default());
        }
        "put" => {
            client.put(key, value).await?;
            println!("OK");
        }
        "view" => {
            let view = client.view().await?;
            println!("{}", view);
        }
        "dump" => {
            let dump = client.dump().await?;
            println!(
                "view {} role {} syncing {}",
                dump.view, dump.role, dump.syncing
            );
            let mut keys: Vec<&String> = dump.store.keys().collect();
            keys.sort();
            for key in keys {
                println!("  {} = {}", key, dump.store[key]);
            }
        }
        _ => return Err(ViewKvError::msg(format!("operation '{}' unrecognized", op))),
    }
    Ok(())
}

/// Interactive REPL loop: one `get`/`put`/`view`/`dump` command per line.
async fn run_repl(client: &mut KvClient) -> Result<(), ViewKvError> {
    let mut input = String::new();
    loop {
        print!("{}", PROMPT);
        io::stdout().flush()?;

        input.clear();
        if io::stdin().read_line(&mut input)? == 0 {
            return Ok(()); // EOF
        }
        let mut tokens = input.split_whitespace();

        let result = match tokens.next() {
            Some("get") => match tokens.next() {
                Some(key) => run_op(client, "get", key, "").await,
                None => Err(ViewKvError::msg("usage: get <key>")),
            },
            Some("put") => match (tokens.next(), tokens.next()) {
                (Some(key), Some(value)) => {
                    run_op(client, "put", key, value).await
                }
                _ => Err(ViewKvError::msg("usage: put <key> <value>")),
            },
            Some("view") => run_op(client, "view", "", "").await,
            Some("dump") => run_op(client, "dump", "", "").await,
            Some("help") => {
                println!("commands: get <k> | put <k> <v> | view | dump | exit");
                Ok(())
            }
            Some("exit") => return Ok(()),
            Some(cmd) => {
                Err(ViewKvError::msg(format!("command '{}' unrecognized", cmd)))
            }
            None => Ok(()),
        };

        if let Err(e) = result {
            println!("error: {}", e);
        }
    }
}

/// Actual main function of the client utility.
fn client_main() -> Result<(), ViewKvError> {
    // read in and parse command line arguments
    let mut args = CliArgs::parse();
    args.sanitize()?;

    // parse optional config string if given
    let config_str = if args.config.is_empty() {
        None
    } else {
        args.config = args.config.replace('+', "\n");
        Some(&args.config[..])
    };

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-client")
        .build()?;

    // enter tokio runtime, connect to the service, and do work
    runtime.block_on(async move {
        let mut client =
            KvClient::new_and_setup(args.authority, config_str).await?;

        if args.op.is_empty() {
            run_repl(&mut client).await
        } else {
            run_op(&mut client, &args.op, &args.key, &args.value).await
        }
    })?;

    Ok(())
}

/// Main function of the client utility.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("c"; "client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
