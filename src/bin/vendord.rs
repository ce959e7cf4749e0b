use vendord::{
    chain::HttpSourceChain,
    config::{Config, Mode},
    ledger::Ledger,
    observer::{Handoff, Observer, SignClient},
    rest,
    retry::Backoff,
    signer::Signer,
    vendord::VendorD,
};

use daemonize_simple::Daemonize;

use std::{
    env,
    path::PathBuf,
    process,
    sync::{mpsc, Arc},
    thread,
};

fn parse_args(args: Vec<String>) -> Option<PathBuf> {
    if args.len() == 1 {
        return None;
    }

    if args.len() != 3 {
        eprintln!("Unknown arguments '{:?}'.", args);
        eprintln!("Only '--conf <configuration file path>' is supported.");
        process::exit(1);
    }

    Some(PathBuf::from(args[2].to_owned()))
}

// This creates the log file automagically if it doesn't exist, and logs on
// stdout if None is given
fn setup_logger(
    log_file: Option<&str>,
    log_level: log::LevelFilter,
) -> Result<(), fern::InitError> {
    let dispatcher = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log_level);

    if let Some(log_file) = log_file {
        dispatcher.chain(fern::log_file(log_file)?).apply()?;
    } else {
        dispatcher.chain(std::io::stdout()).apply()?;
    }

    Ok(())
}

// Spin up the workers for the configured mode and never come back: they only
// stop on process shutdown signals.
fn daemon_main(vendord: VendorD, config: Config) {
    let ledger = Arc::new(Ledger::open(vendord.db_file()).unwrap_or_else(|e| {
        log::error!("Error opening ledger: '{}'", e);
        process::exit(1);
    }));
    let chain = HttpSourceChain::new(config.chain_rpc_url.clone()).unwrap_or_else(|e| {
        log::error!("Error creating chain client: '{}'", e);
        process::exit(1);
    });
    let backoff = Backoff::from_secs(config.backoff_secs());

    match vendord.mode {
        Mode::All => {
            let (sender, receiver) = mpsc::sync_channel(config.queue_capacity());
            let observer = Observer::new(
                chain.clone(),
                Handoff::Queue(sender),
                ledger.clone(),
                vendord.binding_key.clone(),
                vendord.data_dir.clone(),
                config.poll_interval(),
                backoff.clone(),
                config.checkpoint_interval(),
                config.start_height(),
            );
            let signer = Signer::new(
                chain,
                ledger,
                vendord.bitcoin_privkey,
                vendord.network,
                vendord.redeem_script.clone(),
                vendord.binding_key.clone(),
                backoff,
            );

            let observer_thread = thread::Builder::new()
                .name("observer".to_string())
                .spawn(move || observer.run())
                .unwrap_or_else(|e| {
                    log::error!("Error spawning observer thread: '{}'", e);
                    process::exit(1);
                });
            let signer_thread = thread::Builder::new()
                .name("signer".to_string())
                .spawn(move || signer.run(receiver))
                .unwrap_or_else(|e| {
                    log::error!("Error spawning signer thread: '{}'", e);
                    process::exit(1);
                });

            let _ = observer_thread.join();
            let _ = signer_thread.join();
        }
        Mode::Observer => {
            let signer_addr = config.signer_addr.as_ref().unwrap_or_else(|| {
                log::error!("'signer_addr' is required in observer mode");
                process::exit(1);
            });
            let client = SignClient::new(signer_addr).unwrap_or_else(|e| {
                log::error!("Error creating sign client: '{}'", e);
                process::exit(1);
            });

            Observer::new(
                chain,
                Handoff::Remote(client),
                ledger,
                vendord.binding_key.clone(),
                vendord.data_dir.clone(),
                config.poll_interval(),
                backoff,
                config.checkpoint_interval(),
                config.start_height(),
            )
            .run();
        }
        Mode::Signer => {
            let listen = config.listen.unwrap_or_else(|| {
                log::error!("'listen' is required in signer mode");
                process::exit(1);
            });
            let signer = Arc::new(Signer::new(
                chain,
                ledger,
                vendord.bitcoin_privkey,
                vendord.network,
                vendord.redeem_script.clone(),
                vendord.binding_key.clone(),
                backoff,
            ));

            rest::serve(listen, signer).unwrap_or_else(|e| {
                log::error!("Error serving signing endpoint: '{}'", e);
                process::exit(1);
            });
        }
    }
}

fn main() {
    let args = env::args().collect();
    let conf_file = parse_args(args);

    let config = Config::from_file(conf_file).unwrap_or_else(|e| {
        eprintln!("Error parsing config: {}", e);
        process::exit(1);
    });
    let log_level = if let Some(ref level) = &config.log_level {
        level.parse().unwrap_or_else(|e| {
            eprintln!("Invalid log level: {}", e);
            process::exit(1);
        })
    } else {
        log::LevelFilter::Trace
    };

    // Construct VendorD (global state)
    let vendord = VendorD::from_config(&config).unwrap_or_else(|e| {
        eprintln!("Error creating global state: {}", e);
        process::exit(1);
    });

    let log_file = vendord.log_file();
    let log_output = Some(log_file.to_str().expect("Valid unicode"));

    setup_logger(log_output, log_level).unwrap_or_else(|e| {
        eprintln!("Error setting up logger: {}", e);
        process::exit(1);
    });

    // run vendord as daemon
    let mut daemon = Daemonize::default();
    daemon.pid_file = Some(vendord.pid_file());
    daemon.doit().unwrap_or_else(|e| {
        eprintln!("Error daemonizing: {}", e);
        process::exit(1);
    });
    log::info!("Started vendord daemon.");

    daemon_main(vendord, config);
}
