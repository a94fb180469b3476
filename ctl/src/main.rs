use std::io;

use clap::{Arg, ArgAction, ValueHint};
use log::error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const ABOUT: &str = "\nManage a running shunt balancer over its management plane.\n\
Use the `SHUNTCTL_LOG` environment variable to set verbosity. \
Levels `info`, `warn`, `error`, and `off` are available.\n\
\n\
The exit status means: 0 for success; 1 for an error reported by the balancer; \
2 for communication errors; 3 for when no balancer listens on the address; \
and 4 for when the response isn't understood.";

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::init_from_env("SHUNTCTL_LOG");

    let mut command = clap::command!();
    command = command
        .about(ABOUT)
        .arg(
            Arg::new("address")
                .short('a')
                .long("address")
                .help("The address the management plane listens on.")
                .value_name("ADDRESS")
                .value_hint(ValueHint::Hostname)
                .default_value("127.0.0.1:8042"),
        )
        .arg(
            Arg::new("silent")
                .short('q')
                .action(ArgAction::SetTrue)
                .long("quiet")
                .help("Silence output"),
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(clap::Command::new("list").about("List all host entries."))
        .subcommand(
            clap::Command::new("set")
                .about("Create or replace the entry for a host.")
                .arg(
                    Arg::new("host")
                        .required(true)
                        .value_name("HOST")
                        .value_hint(ValueHint::Hostname)
                        .help("The hostname to route. May start with `*.` to match subdomains."),
                )
                .arg(
                    Arg::new("entry")
                        .required(true)
                        .value_name("ENTRY")
                        .value_hint(ValueHint::Other)
                        .help(
                            "The entry as JSON, e.g. '{\"action\": {\"kind\": \"proxy\", \
                            \"params\": {\"backends\": [\"10.0.0.1:80\"]}}}'",
                        ),
                ),
        )
        .subcommand(
            clap::Command::new("rm").about("Remove the entry for a host.").arg(
                Arg::new("host")
                    .required(true)
                    .value_name("HOST")
                    .value_hint(ValueHint::Hostname),
            ),
        )
        .subcommand(clap::Command::new("stats").about("Show per-host connection counters."));

    #[cfg(feature = "completion")]
    {
        command = clap_autocomplete::add_subcommand(command);
    }
    #[cfg(feature = "completion")]
    let shell_completion_command = command.clone();

    let matches = command.get_matches();

    #[cfg(feature = "completion")]
    if let Some(result) = clap_autocomplete::test_subcommand(&matches, shell_completion_command) {
        if let Err(err) = result {
            eprintln!("Insufficient permissions: {err}");
            std::process::exit(2);
        } else {
            std::process::exit(0);
        }
    }

    let address = matches
        .get_one::<String>("address")
        .expect("we provided a default address");

    let (method, path, body) = match matches.subcommand() {
        Some(("list", _)) => ("GET", "/hosts".to_owned(), None),
        Some(("set", matches)) => {
            let host = matches.get_one::<String>("host").expect("the host is required");
            let entry = matches
                .get_one::<String>("entry")
                .expect("the entry is required");
            ("PUT", format!("/hosts/{host}"), Some(entry.as_str()))
        }
        Some(("rm", matches)) => {
            let host = matches.get_one::<String>("host").expect("the host is required");
            ("DELETE", format!("/hosts/{host}"), None)
        }
        Some(("stats", _)) => ("GET", "/stats".to_owned(), None),
        _ => unreachable!("a subcommand is required"),
    };

    match request(address, method, &path, body).await {
        Ok(response) => {
            if !matches.get_flag("silent") {
                println!("{response}");
            }
        }
        Err(status) => std::process::exit(status),
    }
}

/// Sends one HTTP/1.0 request and returns the pretty-printed response body.
///
/// The `Err` variant carries the exit status described in [`ABOUT`].
async fn request(
    address: &str,
    method: &str,
    path: &str,
    body: Option<&str>,
) -> Result<String, i32> {
    let mut stream = match TcpStream::connect(address).await {
        Ok(stream) => stream,
        Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
            error!("No balancer is listening on {address}.");
            return Err(3);
        }
        Err(err) => {
            error!("Failed to reach {address}: {err}");
            return Err(2);
        }
    };

    let body = body.unwrap_or("");
    let head = format!(
        "{method} {path} HTTP/1.0\r\nHost: {address}\r\nContent-length: {}\r\n\r\n",
        body.len()
    );
    let mut response = Vec::new();
    let exchange = async {
        stream.write_all(head.as_bytes()).await?;
        stream.write_all(body.as_bytes()).await?;
        stream.shutdown().await?;
        stream.read_to_end(&mut response).await
    };
    if let Err(err) = exchange.await {
        error!("Communication with the balancer failed: {err}");
        return Err(2);
    }
    parse_response(&response)
}

fn parse_response(response: &[u8]) -> Result<String, i32> {
    let Ok(text) = std::str::from_utf8(response) else {
        error!("The response is binary data.");
        return Err(4);
    };
    let Some((head, body)) = text.split_once("\r\n\r\n") else {
        error!("The response head never ends: {text:?}");
        return Err(4);
    };
    let mut status_line = head.split(' ');
    if !status_line
        .next()
        .is_some_and(|version| version.starts_with("HTTP/"))
    {
        error!("The response doesn't look like HTTP: {head:?}");
        return Err(4);
    }
    let Some(status) = status_line.next().and_then(|code| code.parse::<u16>().ok()) else {
        error!("The response status isn't numeric: {head:?}");
        return Err(4);
    };

    let body = match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| body.to_owned()),
        Err(_) => body.trim_end().to_owned(),
    };
    if status >= 400 {
        error!("The balancer reported an error ({status}): {body}");
        return Err(1);
    }
    Ok(body)
}
