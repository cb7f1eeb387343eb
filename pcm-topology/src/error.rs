use thiserror::Error;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("running under a hypervisor without architectural performance monitoring support; set PCM_IGNORE_ARCH_PERFMON=1 to override")]
    UnsupportedGuest,

    #[error("no online logical processors were found")]
    NoOnlineProcessors,

    #[error(transparent)]
    Ral(#[from] pcm_ral::RalError),
}

pub type Result<T> = std::result::Result<T, TopologyError>;
