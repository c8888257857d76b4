use anyhow::Context;
use armadad::{Cli, LogFormat, Server};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = cli.load_config()?;
    if cli.print_config {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let server = Server::new(config).context("building server")?;
    {
        let machine = server.machine();
        let machine = machine.read().await;
        info!(machine_id = %machine.id, version = %machine.version, "armadad starting");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = server.run(shutdown_rx);
    tokio::pin!(run);

    loop {
        tokio::select! {
            result = &mut run => return result,
            signal = wait_for_signal() => match signal {
                Signal::Shutdown => {
                    info!("gracefully shutting down");
                    shutdown_tx.send_replace(true);
                }
                Signal::DumpState => {
                    let state = server.dump_state().await;
                    println!("{state}");
                }
            },
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

enum Signal {
    Shutdown,
    DumpState,
}

#[cfg(unix)]
async fn wait_for_signal() -> Signal {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut term, mut usr1) = match (signal(SignalKind::terminate()), signal(SignalKind::user_defined1())) {
        (Ok(term), Ok(usr1)) => (term, usr1),
        _ => {
            warn!("cannot install unix signal handlers, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return Signal::Shutdown;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => Signal::Shutdown,
        _ = term.recv() => Signal::Shutdown,
        _ = usr1.recv() => Signal::DumpState,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Signal {
    let _ = tokio::signal::ctrl_c().await;
    Signal::Shutdown
}
