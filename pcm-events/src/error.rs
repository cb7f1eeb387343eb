use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventsError {
    #[error("no event description table is registered for family {family:#x} model {model:#x}")]
    UnknownMicroarchitecture { family: u8, model: u8 },

    #[error("role '{0}' has no default event on this microarchitecture")]
    NoDefaultForRole(&'static str),

    #[error(transparent)]
    Ral(#[from] pcm_ral::RalError),
}

pub type Result<T> = std::result::Result<T, EventsError>;
