// src/main.rs
use clap::Parser;
use presto::logging;
use presto::server::Server;
use presto::syscalls;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "presto")]
#[command(about = "Event-driven HTTP/1.1 server for the C10k regime")]
#[command(version)]
struct Cli {
    /// TCP port to listen on
    #[arg(default_value_t = 8080)]
    port: u16,

    /// Worker threads; 0 or omitted means one per hardware thread
    #[arg(default_value_t = 0)]
    workers: usize,
}

fn main() {
    // usage errors exit 1; --help and --version are not errors
    let cli = Cli::try_parse().unwrap_or_else(|err| {
        let _ = err.print();
        let code = match err.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
            _ => 1,
        };
        process::exit(code);
    });

    logging::init_logging();

    if cli.port == 0 {
        eprintln!("invalid port: 0");
        process::exit(1);
    }
    let workers = if cli.workers == 0 {
        num_cpus::get()
    } else {
        cli.workers
    };

    // broken pipes during send must surface as errors, not kill the process
    syscalls::ignore_sigpipe();

    // SIGINT and SIGTERM both land here (ctrlc "termination" feature)
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(err) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        eprintln!("failed to install signal handler: {err}");
        process::exit(1);
    }

    let mut server = Server::bind(&format!("0.0.0.0:{}", cli.port)).workers(workers);
    if let Err(err) = server.start() {
        eprintln!("failed to start server: {err}");
        process::exit(1);
    }

    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }
    server.stop();
}
