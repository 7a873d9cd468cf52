//! Wire messages exchanged by the coordination core.
//!
//! Messages are postcard-encoded. Senders that retransmit (the repeating
//! transaction sender, the 2B sender) encode once at construction and carry
//! the bytes, so reconnect-driven resends are cheap.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ids::{ReplicaId, TxnId};
use crate::outcome::Outcome;
use crate::txn::Txn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Submitter → active replicas: start proposing this transaction.
    TxnSubmission(Txn),
    /// Acceptor → submitter: the durable outcome of a transaction.
    SubmissionOutcome { txn_id: TxnId, outcome: Outcome },
    /// Acceptor → participating replicas: the chosen (durable) outcome.
    TwoBTxnVotes { txn_id: TxnId, outcome: Outcome },
    /// Replica → acceptor: outcome applied locally.
    TxnLocallyComplete { txn_id: TxnId, sender: ReplicaId },
    /// Submitter → acceptors: enough matching outcomes were collected.
    TxnSubmissionComplete { txn_id: TxnId },
    /// Submitter → active replicas: abandon a retry transaction.
    TxnSubmissionAbort { txn_id: TxnId },
    /// Acceptor → participants: everyone is locally complete, state deleted.
    TxnGloballyComplete { txn_id: TxnId },
}

impl Message {
    /// # Panics
    ///
    /// Panics if postcard serialization fails (should not happen for this
    /// type).
    #[must_use]
    pub fn encode(&self) -> Bytes {
        Bytes::from(postcard::to_allocvec(self).expect("serialization should not fail"))
    }

    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid encoded message.
    pub fn decode(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode() {
        let msg = Message::TxnLocallyComplete {
            txn_id: TxnId([7; 16]),
            sender: ReplicaId(3),
        };
        let bytes = msg.encode();
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(Message::decode(&[0xff, 0xff, 0xff, 0xff]).is_err());
    }
}
