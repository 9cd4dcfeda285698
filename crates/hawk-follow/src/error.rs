use hawk_vision::BoundingBox;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FollowError {
    #[error("invalid region of interest {0:?}")]
    Validation(Option<BoundingBox>),

    #[error("no frame received yet")]
    NoFrame,

    #[error("flight link: {step} failed: {source:#}")]
    Link {
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("tracker: {0:#}")]
    Tracker(#[source] anyhow::Error),

    #[error("config: {0}")]
    Config(String),
}

impl FollowError {
    pub fn link(step: &'static str, source: anyhow::Error) -> Self {
        Self::Link { step, source }
    }
}
