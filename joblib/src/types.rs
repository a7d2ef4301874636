use std::collections::BTreeMap;
use uuid::Uuid;

use crate::stats::CallerStats;

pub type CallerId = String;
pub type Program = String;
pub type Args = Vec<String>;
pub type Envs = Vec<(String, String)>;
pub type JobId = Uuid;
pub type OutputBlob = bytes::Bytes;

/// Every caller's usage, ordered by caller id so persisted documents are stable.
pub type StatsMap = BTreeMap<CallerId, CallerStats>;
