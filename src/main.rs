use beacon_link::app::{Options, RunError, run_with_io};
use beacon_link::transport;
use clap::Parser;
use std::panic::{self, PanicHookInfo};
use tracing_subscriber::EnvFilter;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

/// Log to stderr so stdout carries only event lines.
///
/// `RUST_LOG` takes precedence over `--verbose`.
fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("beacon_link={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(feature = "bluer")]
async fn open_radio(
    sink: transport::EventSink,
) -> Result<Box<dyn transport::Transport>, RunError> {
    let radio = transport::bluer::BluerTransport::start(sink).await?;
    Ok(Box::new(radio))
}

#[cfg(not(feature = "bluer"))]
async fn open_radio(
    _sink: transport::EventSink,
) -> Result<Box<dyn transport::Transport>, RunError> {
    Err(transport::TransportError::BackendNotAvailable(
        "compiled without the bluer feature".to_string(),
    )
    .into())
}

/// Start the radio and run until the transport closes or Ctrl-C.
async fn run(options: Options) -> Result<(), RunError> {
    let (sink, events) = transport::channel();
    let radio = open_radio(sink).await?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let mut stdout = std::io::stdout();
    run_with_io(options, radio, events, &mut stdout, shutdown).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process supervisors
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_tracing(options.verbose);

    match run(options).await {
        Ok(_) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            eprintln!("error: {}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
