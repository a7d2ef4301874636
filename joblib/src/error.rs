use std::{io, result};
use thiserror;

use crate::delivery::TransportError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read job input: {0}")]
    Input(#[source] io::Error),
    #[error("failed to start program {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed waiting on program: {0}")]
    Wait(#[source] io::Error),
    #[error("failed reading program output: {0}")]
    Output(#[source] io::Error),
    #[error("delivery failed: {0}")]
    Delivery(#[from] TransportError),
    #[error("failed to persist usage stats: {0}")]
    Persist(#[source] io::Error),
    #[error("malformed usage stats document: {0}")]
    StatsFormat(#[from] serde_json::Error),
    #[error("usage accountant exited")]
    AccountantStopped,
}

pub type Result<T> = result::Result<T, Error>;
