//! Viewkv view authority daemon executable.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use tokio::runtime::Builder;
use tokio::sync::watch;
use viewkv::{logger_init, pf_error, ViewAuthority, ViewKvError};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the listening socket.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Port of the authority API.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 52600)]
    port: u16,

    /// Authority configuration TOML string.
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
        if self.port <= 1024 {
            Err(ViewKvError::msg(format!("invalid port {}", self.port)))
        } else if self.threads < 2 {
            Err(ViewKvError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// Actual main function of the view authority daemon.
fn authority_main() -> Result<(), ViewKvError> {
    // read in and parse command line arguments
    let mut args = CliArgs::parse();
    args.sanitize()?;

    let bind_addr: SocketAddr =
        format!("{}:{}", args.bind_ip, args.port).parse()?;

    // parse optional config string if given
    let config_str = if args.config.is_empty() {
        None
    } else {
        args.config = args.config.replace('+', "\n");
        Some(&args.config[..])
    };

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("va"; "error sending to term channel: {}", e);
        }
    })
    .map_err(ViewKvError::msg)?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-authority")
        .build()?;

    // enter tokio runtime, set up the authority daemon, and start the main
    // event loop logic
    runtime.block_on(async move {
        let mut authority =
            ViewAuthority::new_and_setup(bind_addr, config_str).await?;
        authority.run(rx_term).await?;
        Ok::<(), ViewKvError>(())
    })?;

    Ok(())
}

/// Main function of the view authority daemon.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = authority_main() {
        pf_error!("va"; "authority_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
