mod arg_parser;
mod client_cli;

use arg_parser::{ArgParser, SubCommand};
use client_cli::ClientCli;

use anyhow::Context;
use clap::Parser;
use std::path::Path;
use tokio::net::UdpSocket;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = ArgParser::parse();
    if !args.needs_server() {
        return send_local(args.sub_command).await;
    }

    let (cert, key) = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => (cert, key),
        _ => anyhow::bail!("--cert and --key are required to talk to the server"),
    };
    let mut client = ClientCli::connect(&args.server, &args.domain, &args.ca, cert, key).await?;

    match args.sub_command {
        SubCommand::Submit { file, output } => {
            let input: Box<dyn tokio::io::AsyncRead + Unpin> = if file == Path::new("-") {
                Box::new(tokio::io::stdin())
            } else {
                Box::new(
                    tokio::fs::File::open(&file)
                        .await
                        .with_context(|| format!("failed to open {}", file.display()))?,
                )
            };
            match output {
                Some(path) => {
                    let mut out = tokio::fs::File::create(&path)
                        .await
                        .with_context(|| format!("failed to create {}", path.display()))?;
                    client.submit(input, &mut out).await?;
                }
                None => client.submit(input, &mut tokio::io::stdout()).await?,
            }
        }
        SubCommand::Stats => client.query_stats().await?,
        SubCommand::Crash => client.report_crash().await?,
        SubCommand::Pid => client.query_pid().await?,
        SubCommand::SendFrame { .. } | SubCommand::SendDatagram { .. } => {
            unreachable!("local messages are sent without a server connection")
        }
    }

    Ok(())
}

async fn send_local(command: SubCommand) -> anyhow::Result<()> {
    match command {
        #[cfg(unix)]
        SubCommand::SendFrame { socket, message } => {
            let mut stream = tokio::net::UnixStream::connect(&socket)
                .await
                .with_context(|| format!("failed to connect to {}", socket.display()))?;
            joblib::framing::write_frame(&mut stream, message.as_bytes()).await?;
        }
        #[cfg(not(unix))]
        SubCommand::SendFrame { .. } => anyhow::bail!("unix sockets are not supported here"),
        SubCommand::SendDatagram { addr, message } => {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket
                .send_to(message.as_bytes(), addr.as_str())
                .await
                .with_context(|| format!("failed to send to {}", addr))?;
        }
        other => anyhow::bail!("{:?} needs a server connection", other),
    }
    Ok(())
}
