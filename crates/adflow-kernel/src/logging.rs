use crate::error::LogError;
use crate::types::{RunStatus, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One recorded status transition of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionEvent {
    /// Position in the log, starting at 0
    pub sequence: u64,
    /// When the transition happened
    pub at: DateTime<Utc>,
    /// Step the transition is attributed to
    pub step: Option<StepId>,
    /// Status before
    pub from: RunStatus,
    /// Status after
    pub to: RunStatus,
    /// Short reason
    pub detail: String,
    /// Hash of the previous event, zeros for the first
    #[serde(with = "hex_hash")]
    pub prev_hash: [u8; 32],
    /// SHA-256 over this event's fields and `prev_hash`
    #[serde(with = "hex_hash")]
    pub hash: [u8; 32],
}

/// Append-only, hash-chained transition history of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransitionLog {
    events: Vec<TransitionEvent>,
}

impl TransitionLog {
    /// Record a transition and return its sequence number.
    pub fn append(
        &mut self,
        at: DateTime<Utc>,
        step: Option<StepId>,
        from: RunStatus,
        to: RunStatus,
        detail: String,
    ) -> u64 {
        let prev_hash = self.events.last().map(|e| e.hash).unwrap_or([0u8; 32]);
        let mut event = TransitionEvent {
            sequence: self.events.len() as u64,
            at,
            step,
            from,
            to,
            detail,
            prev_hash,
            hash: [0u8; 32],
        };
        event.hash = compute_hash(&event);
        let sequence = event.sequence;
        self.events.push(event);
        sequence
    }

    /// Events in order
    pub fn events(&self) -> &[TransitionEvent] {
        &self.events
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// No transitions recorded yet
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Most recent event
    pub fn last(&self) -> Option<&TransitionEvent> {
        self.events.last()
    }

    /// Recompute the chain and report the first event that does not match.
    pub fn verify_integrity(&self) -> Result<(), LogError> {
        let mut prev = [0u8; 32];
        for (index, e) in self.events.iter().enumerate() {
            if e.sequence != index as u64 || e.prev_hash != prev {
                return Err(LogError::IntegrityViolation(index as u64));
            }
            if e.hash != compute_hash(e) {
                return Err(LogError::IntegrityViolation(e.sequence));
            }
            prev = e.hash;
        }
        Ok(())
    }
}

fn compute_hash(event: &TransitionEvent) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(event.sequence.to_le_bytes());
    hasher.update(event.at.to_rfc3339().as_bytes());
    hasher.update([0]);
    if let Some(step) = &event.step {
        hasher.update(step.as_str().as_bytes());
    }
    hasher.update([0]);
    hasher.update(event.from.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(event.to.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(event.detail.as_bytes());
    hasher.update([0]);
    hasher.update(event.prev_hash);
    hasher.finalize().into()
}

mod hex_hash {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(d)?;
        let mut out = [0u8; 32];
        hex::decode_to_slice(&text, &mut out).map_err(D::Error::custom)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_log() -> TransitionLog {
        let mut log = TransitionLog::default();
        let now = Utc::now();
        log.append(now, None, RunStatus::Pending, RunStatus::Running, "start".into());
        log.append(
            now,
            Some("review".into()),
            RunStatus::Running,
            RunStatus::Interrupted,
            "awaiting approval".into(),
        );
        log
    }

    #[test]
    fn chain_verifies() {
        let log = sample_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log.events()[1].prev_hash, log.events()[0].hash);
        assert!(log.verify_integrity().is_ok());
    }

    #[test]
    fn tampering_is_detected() {
        let mut log = sample_log();
        log.events[0].detail = "rewritten".into();
        assert_eq!(log.verify_integrity(), Err(LogError::IntegrityViolation(0)));
    }

    #[test]
    fn hashes_survive_json() {
        let log = sample_log();
        let json = serde_json::to_string(&log).unwrap();
        assert!(json.contains(&hex::encode(log.events()[0].hash)));
        let back: TransitionLog = serde_json::from_str(&json).unwrap();
        assert!(back.verify_integrity().is_ok());
    }
}
