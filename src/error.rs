use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Requested output size has no resolution step
    #[error("invalid image size {0}: expected a power of two between 4 and 1024")]
    InvalidSize(u32),

    /// No checkpoint entry carries the requested prefix
    #[error("checkpoint has no entries under key `{key}`")]
    MissingCheckpointKey { key: String },

    /// A generator variable is absent from the checkpoint
    #[error("checkpoint is missing weight `{0}`")]
    MissingWeight(String),

    #[error("shape mismatch for `{name}`: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        got: Vec<i64>,
    },

    #[error("torch error: {0}")]
    Tch(#[from] tch::TchError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
