use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("MSR access denied while programming core {core_id}")]
    MsrAccessDenied { core_id: u32 },

    #[error("PMU already programmed by another owner")]
    PmuBusy,

    #[error("processor model is not supported by any registered event table")]
    UnsupportedProcessor,

    #[error("requested {requested} general-purpose counters but hardware has {available}")]
    ResourceExhausted { requested: usize, available: usize },

    #[error(transparent)]
    Ral(#[from] pcm_ral::RalError),

    #[error(transparent)]
    Events(#[from] pcm_events::EventsError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
