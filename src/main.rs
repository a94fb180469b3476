use clap::{Arg, ArgAction, ValueHint};
use shunt::prelude::*;

const ABOUT: &str = "\
Shunt is a hostname-based HTTP load balancer.

Requests are routed on their `host` header through a live table of actions:
respond empty, serve a canned file, redirect, proxy to backends, or wait for
the entry to settle. The table is edited at runtime through the management
listener, e.g. with `shuntctl`.

Use the `SHUNT_LOG` environment variable to set the log level.
See https://docs.rs/env_logger for the syntax.";

#[tokio::main]
async fn main() {
    env_logger::init_from_env(env_logger::Env::new().filter_or("SHUNT_LOG", "info"));

    let matches = clap::command!()
        .about(ABOUT)
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .help("Address of a data-plane listener. Repeat for several.")
                .value_name("ADDRESS")
                .value_parser(clap::value_parser!(std::net::SocketAddr))
                .action(ArgAction::Append)
                .default_value("0.0.0.0:8000"),
        )
        .arg(
            Arg::new("management")
                .short('m')
                .long("management")
                .help("Address of the management listener. Keep it on loopback unless you know what you're doing.")
                .value_name("ADDRESS")
                .value_parser(clap::value_parser!(std::net::SocketAddr))
                .default_value("127.0.0.1:8042"),
        )
        .arg(
            Arg::new("no-management")
                .long("no-management")
                .help("Don't run the management listener.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("static-dir")
                .long("static-dir")
                .help("Directory with the canned response files (unknown.http, no-hosts.http, timeout.http, ...).")
                .value_name("DIR")
                .value_hint(ValueHint::DirPath)
                .default_value("static"),
        )
        .arg(
            Arg::new("state")
                .short('s')
                .long("state")
                .help("JSON file the host table is loaded from and saved to. Without it, nothing persists.")
                .value_name("FILE")
                .value_hint(ValueHint::FilePath),
        )
        .get_matches();

    let state = matches.get_one::<String>("state").map(PathBuf::from);
    let hosts = match &state {
        Some(path) if path.exists() => match HostTable::load(path).await {
            Ok(hosts) => {
                info!("loaded {} host(s) from {}", hosts.len(), path.display());
                hosts
            }
            Err(err) => {
                error!("failed to load state from {}: {err}", path.display());
                std::process::exit(1);
            }
        },
        _ => HostTable::new(),
    };

    let static_dir = matches.get_one::<String>("static-dir").expect("has a default");
    let balancer = Balancer::new(hosts, static_dir, BalancerOptions::default());

    let mut listeners: Vec<Listener> = matches
        .get_many::<std::net::SocketAddr>("bind")
        .expect("has a default")
        .copied()
        .map(Listener::balance)
        .collect();
    if matches.get_flag("no-management") {
        warn!("running without a management listener; the table can't be changed");
    } else {
        let address = *matches
            .get_one::<std::net::SocketAddr>("management")
            .expect("has a default");
        listeners.push(Listener::delegated(
            address,
            management::handler(state.clone()),
        ));
    }

    let shutdown = match balancer.run(listeners).await {
        Ok(manager) => manager,
        Err(err) => {
            error!("failed to bind: {err}");
            std::process::exit(1);
        }
    };
    info!("shunt is up");

    wait_for_signal().await;
    shutdown.shutdown();
    shutdown.wait().await;
    if let Some(path) = &state {
        if let Err(err) = balancer.hosts().save(path).await {
            error!("failed to save state to {}: {err}", path.display());
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received an interrupt"),
                _ = terminate.recv() => info!("received a termination signal"),
            }
        }
        Err(err) => {
            error!("failed to install the TERM handler: {err}");
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("failed to listen for an interrupt: {err}");
                std::future::pending::<()>().await;
            }
            info!("received an interrupt");
        }
    }
}
#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for an interrupt: {err}");
        std::future::pending::<()>().await;
    }
    info!("received an interrupt");
}
