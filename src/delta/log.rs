//! Newline-delimited JSON commit files under `_delta_log/` (§4.D').

use crate::delta::actions::Action;
use crate::error::DbResult;
use bytes::Bytes;

pub const LOG_DIR: &str = "_delta_log";

pub fn commit_path(table_root: &str, version: u64) -> String {
    format!("{table_root}/{LOG_DIR}/{version:020}.json")
}

pub fn checkpoint_path(table_root: &str, version: u64) -> String {
    format!("{table_root}/{LOG_DIR}/{version:020}.checkpoint.parquet")
}

pub fn last_checkpoint_path(table_root: &str) -> String {
    format!("{table_root}/{LOG_DIR}/_last_checkpoint")
}

pub fn encode_actions(actions: &[Action]) -> DbResult<Bytes> {
    let mut buf = Vec::new();
    for action in actions {
        serde_json::to_writer(&mut buf, action)?;
        buf.push(b'\n');
    }
    Ok(Bytes::from(buf))
}

pub fn decode_actions(bytes: &Bytes) -> DbResult<Vec<Action>> {
    let mut out = Vec::new();
    for line in bytes.split(|b| *b == b'\n') {
        if line.is_empty() {
            continue;
        }
        out.push(serde_json::from_slice(line)?);
    }
    Ok(out)
}

pub fn parse_version(key: &str) -> Option<u64> {
    let file_name = key.rsplit('/').next()?;
    let digits = file_name.strip_suffix(".json")?;
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::actions::Protocol;

    #[test]
    fn actions_round_trip_as_ndjson() {
        let actions = vec![Action::Protocol(Protocol::default())];
        let bytes = encode_actions(&actions).unwrap();
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
        let decoded = decode_actions(&bytes).unwrap();
        assert_eq!(decoded, actions);
    }

    #[test]
    fn version_parses_from_zero_padded_name() {
        assert_eq!(parse_version("t/_delta_log/00000000000000000007.json"), Some(7));
        assert_eq!(parse_version("t/_delta_log/_last_checkpoint"), None);
    }
}
