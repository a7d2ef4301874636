use clap::Parser;
use joblib::delivery::DeliveryPolicy;
use joblib::executor::ExecutorConfig;
use joblib::types::{CallerId, Envs};
use std::path::PathBuf;
use std::time::Duration;

/// Run uploaded payloads through a program and return its output over gRPC
#[derive(Debug, Parser)]
#[clap(name = "jobrunner-server")]
pub struct ServerConfig {
    /// Address the gRPC service listens on
    #[clap(long, env = "JOBRUNNER_LISTEN", default_value = "[::1]:50051")]
    pub listen: String,

    /// PEM certificate presented by the server
    #[clap(long, env = "JOBRUNNER_TLS_CERT", default_value = "tls/server.cert")]
    pub tls_cert: PathBuf,

    /// PEM key for the server certificate
    #[clap(long, env = "JOBRUNNER_TLS_KEY", default_value = "tls/server.key")]
    pub tls_key: PathBuf,

    /// PEM certificate of the CA that signs client certificates
    #[clap(long, env = "JOBRUNNER_TLS_CA", default_value = "tls/ca.cert")]
    pub tls_ca: PathBuf,

    /// Program every job runs
    #[clap(long, env = "JOBRUNNER_PROGRAM", default_value = "./edU.exe")]
    pub program: String,

    /// Argument passed to the program, may be repeated
    #[clap(long = "program-arg", multiple_occurrences = true, allow_hyphen_values = true)]
    pub program_args: Vec<String>,

    /// VAR=VAL added to the program's environment, may be repeated
    #[clap(long = "program-env", multiple_occurrences = true, parse(try_from_str = var_eq_val))]
    pub program_envs: Vec<(String, String)>,

    /// Seconds a job may run before it is killed
    #[clap(long, env = "JOBRUNNER_DEADLINE", default_value = "30")]
    pub deadline_secs: u64,

    /// Largest output in bytes that is sent back
    #[clap(long, env = "JOBRUNNER_MAX_UPLOAD", default_value = "52428800")]
    pub max_upload: usize,

    /// Seconds allowed for the first output upload
    #[clap(long, env = "JOBRUNNER_UPLOAD_DEADLINE", default_value = "60")]
    pub upload_deadline_secs: u64,

    /// Seconds allowed for the retried output upload
    #[clap(long, env = "JOBRUNNER_UPLOAD_RETRY_DEADLINE", default_value = "600")]
    pub upload_retry_deadline_secs: u64,

    /// Unix socket for framed control messages
    #[clap(long, env = "JOBRUNNER_SOCKET", default_value = "./jobrunner.sock")]
    pub socket: PathBuf,

    /// UDP address for datagram control messages
    #[clap(long, env = "JOBRUNNER_DATAGRAM", default_value = "127.0.0.1:9999")]
    pub datagram: String,

    /// Usage stats document, read at start and rewritten after every job
    #[clap(long, env = "JOBRUNNER_STATS", default_value = "./users.json")]
    pub stats_file: PathBuf,

    /// Caller id allowed to query the server pid
    #[clap(long, env = "JOBRUNNER_ADMIN")]
    pub admin: Option<CallerId>,

    /// Responses buffered per job before an upload counts as stalled
    #[clap(long, env = "JOBRUNNER_RESPONSE_CAPACITY", default_value = "4")]
    pub response_capacity: usize,
}

impl ServerConfig {
    pub fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            program: self.program.clone(),
            args: self.program_args.clone(),
            envs: Envs::from_iter(self.program_envs.iter().cloned()),
            deadline: Duration::from_secs(self.deadline_secs),
        }
    }

    pub fn delivery(&self) -> DeliveryPolicy {
        DeliveryPolicy {
            max_output: self.max_upload,
            deadline: Duration::from_secs(self.upload_deadline_secs),
            extended_deadline: Duration::from_secs(self.upload_retry_deadline_secs),
            job_deadline: Duration::from_secs(self.deadline_secs),
        }
    }
}

/// try_from_str parse function for program env variables
fn var_eq_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((var, val)) if !var.is_empty() => Ok((var.to_string(), val.to_string())),
        _ => Err("Required format is VAR=VAL".to_string()),
    }
}
