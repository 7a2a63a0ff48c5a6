use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use thiserror::Error as ThisError;

use crate::task::TaskKey;

const CANDIDATE_ID_PREFIX: &str = "taskCandidate";
const CANDIDATE_ID_SEGMENTS: usize = 2;

#[derive(ThisError, Debug)]
pub enum CandidateIdError {
    #[error("candidate id has prefix {0:?}, expected {CANDIDATE_ID_PREFIX:?}")]
    BadPrefix(String),

    #[error("candidate id has {0} segments, expected {CANDIDATE_ID_SEGMENTS}")]
    BadSegmentCount(usize),

    #[error("candidate id payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("candidate id payload does not decode to a task key: {0}")]
    Decode(#[from] bincode::Error),
}

/// The stable identifier of a task candidate:
/// `taskCandidate|<base64(encoded TaskKey)>`. The encoding is deterministic,
/// so equal keys always produce equal ids.
pub fn candidate_id(key: &TaskKey) -> String {
    let encoded = bincode::serialize(key).expect("task keys always serialize");
    format!(
        "{CANDIDATE_ID_PREFIX}|{}",
        URL_SAFE_NO_PAD.encode(encoded)
    )
}

/// Whether a string is shaped like a candidate id. Cheaper than a full
/// parse when only the namespace matters (candidate ids never collide with
/// store-assigned task ids).
pub fn is_candidate_id(id: &str) -> bool {
    id.starts_with(CANDIDATE_ID_PREFIX)
        && id.as_bytes().get(CANDIDATE_ID_PREFIX.len()) == Some(&b'|')
}

/// Parse a candidate id back into its task key. Rejects a wrong prefix,
/// a wrong segment count, and undecodable payloads with distinct errors.
pub fn parse_candidate_id(id: &str) -> Result<TaskKey, CandidateIdError> {
    let segments: Vec<&str> = id.split('|').collect();
    if segments.len() != CANDIDATE_ID_SEGMENTS {
        return Err(CandidateIdError::BadSegmentCount(segments.len()));
    }
    if segments[0] != CANDIDATE_ID_PREFIX {
        return Err(CandidateIdError::BadPrefix(segments[0].to_string()));
    }
    let payload = URL_SAFE_NO_PAD.decode(segments[1])?;
    Ok(bincode::deserialize(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{Patch, RepoState};
    use pretty_assertions::assert_eq;

    fn sample_key() -> TaskKey {
        TaskKey::new(RepoState::new("https://example.org/repo.git", "abc123"), "Build-Linux")
    }

    #[test]
    fn test_round_trip() {
        let keys = vec![
            sample_key(),
            TaskKey::forced(RepoState::new("r", "rev"), "Test", "job42"),
            TaskKey::new(
                RepoState::with_patch(
                    "r",
                    "rev",
                    Patch {
                        issue: "12345".to_string(),
                        patchset: "7".to_string(),
                        server: "https://review.example.org".to_string(),
                        ..Default::default()
                    },
                ),
                "Try-Task",
            ),
        ];
        for key in keys {
            let id = candidate_id(&key);
            let parsed = parse_candidate_id(&id).unwrap();
            assert_eq!(parsed, key);
            // Deterministic: re-encoding the parsed key gives the same id.
            assert_eq!(candidate_id(&parsed), id);
        }
    }

    #[test]
    fn test_is_candidate_id() {
        assert!(is_candidate_id(&candidate_id(&sample_key())));
        assert!(!is_candidate_id("0000000000000042"));
        assert!(!is_candidate_id("taskCandidate"));
    }

    #[test]
    fn test_bad_prefix() {
        let id = candidate_id(&sample_key());
        let mangled = id.replacen(CANDIDATE_ID_PREFIX, "someTask", 1);
        assert!(matches!(
            parse_candidate_id(&mangled),
            Err(CandidateIdError::BadPrefix(_))
        ));
    }

    #[test]
    fn test_bad_segment_count() {
        assert!(matches!(
            parse_candidate_id("taskCandidate"),
            Err(CandidateIdError::BadSegmentCount(1))
        ));
        assert!(matches!(
            parse_candidate_id("taskCandidate|abc|def"),
            Err(CandidateIdError::BadSegmentCount(3))
        ));
    }

    #[test]
    fn test_bad_payload() {
        assert!(matches!(
            parse_candidate_id("taskCandidate|!!!"),
            Err(CandidateIdError::Base64(_))
        ));
        // Valid base64, but not an encoded key.
        assert!(matches!(
            parse_candidate_id("taskCandidate|AAEC"),
            Err(CandidateIdError::Decode(_))
        ));
    }
}
