use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io Error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),
    #[error("Finalizer Error: {0}")]
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),
    #[error("invalid nginx configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::IoError(_) => "io",
            Error::KubeError(_) => "kube",
            Error::FinalizerError(_) => "finalizer",
            Error::InvalidConfig(_) => "invalid_config",
            Error::Other(_) => "other",
        }
    }
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}
