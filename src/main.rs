use std::{env, path::Path, process::exit, rc::Rc};

use args::ArgumentsRequest;
use config::Config;
use relay::BufferPool;
use tokio::{sync::mpsc, task::LocalSet};
use tracing_subscriber::EnvFilter;

mod args;
mod config;
mod dial;
mod listener;
mod netif;
mod relay;
mod socks;
mod sockopt;

fn main() {
    let arguments = match args::parse_arguments(env::args()) {
        Err(err) => {
            eprintln!("{err}\n\nType 'manifold --help' for a help menu");
            exit(1);
        }
        Ok(arguments) => arguments,
    };

    let startup_args = match arguments {
        ArgumentsRequest::Version => {
            println!("{}", args::get_version_string());
            println!("A pool of source-pinned SOCKS5 proxies");
            return;
        }
        ArgumentsRequest::Help => {
            println!("{}", args::get_help_string());
            return;
        }
        ArgumentsRequest::Run(startup_args) => startup_args,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Config::load(Path::new(&startup_args.config_path)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("Failed to load {}: {error}", startup_args.config_path);
            exit(1);
        }
    };

    let endpoints = match config.validate() {
        Ok(endpoints) => endpoints,
        Err(error) => {
            eprintln!("Invalid configuration in {}: {error}", startup_args.config_path);
            exit(1);
        }
    };

    if startup_args.test_config {
        println!("Configuration OK: interface {}, {} endpoint(s)", config.interface, endpoints.len());
        for endpoint in &endpoints {
            println!("  {endpoint}");
        }
        return;
    }

    if let Err(error) = netif::ensure_addresses(&config.interface, &endpoints) {
        eprintln!("Failed to provision addresses on {}: {error}", config.interface);
        exit(1);
    }

    let runtime_result = tokio::runtime::Builder::new_current_thread().enable_all().build();

    match runtime_result {
        Ok(runtime) => LocalSet::new().block_on(&runtime, async_main(endpoints)),
        Err(err) => {
            eprintln!("Failed to start Tokio runtime: {err}");
            exit(1);
        }
    }
}

async fn async_main(endpoints: Vec<config::Endpoint>) {
    let pool = Rc::new(BufferPool::new());

    // Any endpoint dying (bind failure, broken accept loop) takes the whole process down,
    // otherwise a partially-alive pool would go unnoticed.
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
    for endpoint in endpoints {
        let pool = Rc::clone(&pool);
        let fatal_tx = fatal_tx.clone();
        tokio::task::spawn_local(async move {
            let error = listener::run_endpoint(endpoint, pool).await;
            let _ = fatal_tx.send((endpoint, error));
        });
    }
    drop(fatal_tx);

    tokio::select! {
        biased;
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, exiting");
        }
        fatal = fatal_rx.recv() => {
            if let Some((endpoint, error)) = fatal {
                tracing::error!(%endpoint, %error, "endpoint failed, shutting down");
                exit(1);
            }
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(error) => {
            tracing::error!(%error, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
            unreachable!();
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
