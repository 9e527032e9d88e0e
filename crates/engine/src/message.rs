//! Wire payloads carried on the program queue.

use serde::{Deserialize, Serialize};

use conveyor_core::ProgramId;

/// Payload carried on the program queue.
///
/// Inbound, it reports that `job` finished for `program_id` (a completion);
/// outbound, it triggers the next run of `job`. The shape is the same in
/// both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    program_id: ProgramId,
    job: String,
}

impl JobMessage {
    pub fn new(program_id: ProgramId, job: impl Into<String>) -> Self {
        Self {
            program_id,
            job: job.into(),
        }
    }

    pub fn program_id(&self) -> ProgramId {
        self.program_id
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

/// A raw message as handed over by the broker layer.
///
/// Decoding is deferred to the processor so parse failures surface through
/// its error policy instead of disappearing inside the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    payload: String,
}

impl Delivery {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}
