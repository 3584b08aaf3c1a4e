use std::{
    error::Error,
    fmt::{self, Display},
    io,
    path::PathBuf,
};

use ndarray::ShapeError;
use rand_distr::NormalError;

/// The result type used in the entire crate.
pub type Result<T> = std::result::Result<T, NetErr>;

/// The crate's error type.
#[derive(Debug)]
pub enum NetErr {
    /// The model or the optimizer were requested before calling `initialize`.
    UninitializedModel,
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    InvalidArchitecture(&'static str),
    InvalidGeometry {
        block: usize,
        size: usize,
        kernel: usize,
        padding: usize,
        stride: usize,
    },
    MalformedVolume {
        path: PathBuf,
        got: usize,
        expected: usize,
    },
    LabelOutOfRange {
        label: usize,
        classes: usize,
    },
    EmptyDataset,
    /// A normalization saw a single value per channel while training.
    BatchTooSmall {
        what: &'static str,
        got: usize,
    },
    InvalidConfig(String),
    Distribution(NormalError),
    Shape(ShapeError),
    Config(serde_json::Error),
    Io(io::Error),
}

impl Display for NetErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetErr::UninitializedModel => "Need to call initialize first".to_string(),
            NetErr::SizeMismatch {
                what,
                got,
                expected,
            } => format!("There's a size mismatch in {what}, got {got} and expected {expected}"),
            NetErr::InvalidArchitecture(reason) => format!("Invalid architecture: {reason}"),
            NetErr::InvalidGeometry {
                block,
                size,
                kernel,
                padding,
                stride,
            } => format!(
                "Block {block} can't convolve an extent of {size} with a kernel of {kernel}, padding {padding} and stride {stride}"
            ),
            NetErr::MalformedVolume {
                path,
                got,
                expected,
            } => format!(
                "The volume at {} has {got} bytes, expected {expected}",
                path.display()
            ),
            NetErr::LabelOutOfRange { label, classes } => {
                format!("Label {label} is out of range for {classes} classes")
            }
            NetErr::EmptyDataset => "The dataset has no volumes".to_string(),
            NetErr::BatchTooSmall { what, got } => format!(
                "Expected more than 1 value per channel in {what} when training, got {got}"
            ),
            NetErr::InvalidConfig(msg) => format!("The training config is invalid: {msg}"),
            NetErr::Distribution(e) => {
                format!("Failed to build the initialization distribution: {e}")
            }
            NetErr::Shape(e) => format!("An array couldn't be reshaped: {e}"),
            NetErr::Config(e) => format!("Failed to parse the training config: {e}"),
            NetErr::Io(e) => format!("There was an io error: {e}"),
        };

        write!(f, "{s}")
    }
}

impl Error for NetErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            NetErr::Distribution(e) => Some(e),
            NetErr::Shape(e) => Some(e),
            NetErr::Config(e) => Some(e),
            NetErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for NetErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ShapeError> for NetErr {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}

impl From<NormalError> for NetErr {
    fn from(value: NormalError) -> Self {
        Self::Distribution(value)
    }
}

impl From<serde_json::Error> for NetErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Config(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_read_as_sentences() {
        let errors = [
            NetErr::UninitializedModel,
            NetErr::EmptyDataset,
            NetErr::InvalidArchitecture("no blocks"),
            NetErr::BatchTooSmall {
                what: "normalization",
                got: 1,
            },
            NetErr::InvalidConfig("growth must be positive, got 0".to_string()),
            NetErr::Io(io::Error::new(io::ErrorKind::NotFound, "missing.raw")),
        ];

        for err in &errors {
            let msg = err.to_string();
            assert!(msg.starts_with(char::is_uppercase), "{msg}");
            assert!(!msg.ends_with('.'), "{msg}");
        }

        assert_eq!(
            errors[3].to_string(),
            "Expected more than 1 value per channel in normalization when training, got 1"
        );
        assert_eq!(
            errors[4].to_string(),
            "The training config is invalid: growth must be positive, got 0"
        );
    }

    #[test]
    fn wrapped_errors_are_the_source() {
        let err = NetErr::from(io::Error::new(io::ErrorKind::NotFound, "missing.raw"));

        assert!(err.source().is_some());
        assert!(NetErr::EmptyDataset.source().is_none());
    }
}
