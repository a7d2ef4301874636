use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Talk to a job runner server
#[derive(Debug, Parser)]
#[clap(name = "jobrunner")]
pub struct ArgParser {
    /// The address of the server
    #[clap(short = 's', long = "server", env = "JOBRUNNER_SERVER", default_value = "[::1]:50051")]
    pub server: String,

    /// Name the server certificate is checked against
    #[clap(long, env = "JOBRUNNER_DOMAIN", default_value = "localhost")]
    pub domain: String,

    /// PEM certificate of the CA that signed the server certificate
    #[clap(long, env = "JOBRUNNER_TLS_CA", default_value = "tls/ca.cert")]
    pub ca: PathBuf,

    /// PEM client certificate, its subject uid is the caller id
    #[clap(long, env = "JOBRUNNER_TLS_CERT")]
    pub cert: Option<PathBuf>,

    /// PEM key for the client certificate
    #[clap(long, env = "JOBRUNNER_TLS_KEY")]
    pub key: Option<PathBuf>,

    /// The sub-command to use
    #[clap(subcommand)]
    pub sub_command: SubCommand,
}

#[derive(Clone, Debug, PartialEq, Eq, Subcommand)]
pub enum SubCommand {
    /// run a file through the server's program
    Submit {
        /// file to upload, - reads stdin
        file: PathBuf,

        #[clap(short, long)]
        /// write the program's output here instead of stdout
        output: Option<PathBuf>,
    },
    /// show your usage stats
    Stats,
    /// report that the server's program misbehaved
    Crash,
    /// ask for the server's process id (admin only)
    Pid,
    /// send one framed message to the server's unix socket
    SendFrame {
        #[clap(long, default_value = "./jobrunner.sock")]
        /// path of the server's socket
        socket: PathBuf,

        /// message text
        message: String,
    },
    /// send one datagram to the server
    SendDatagram {
        #[clap(long, default_value = "127.0.0.1:9999")]
        /// address the server listens on for datagrams
        addr: String,

        /// message text
        message: String,
    },
}

impl ArgParser {
    /// Only the local message commands get by without a gRPC connection.
    pub fn needs_server(&self) -> bool {
        !matches!(
            self.sub_command,
            SubCommand::SendFrame { .. } | SubCommand::SendDatagram { .. }
        )
    }
}
