use std::{fmt, time::Duration};

use super::Decision;

/// The average loss and accuracy of the network over a dataset it isn't trained on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub avg_loss: f32,
    pub accuracy: f32,
}

/// What happened during an epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    pub learning_rate: f32,
    pub momentum: f32,
    pub avg_loss: f32,
    pub accuracy: f32,
    pub decision: Decision,
    /// The validation results of the network kept after the epoch, if there's a validation set.
    pub validation: Option<Evaluation>,
    pub elapsed: Duration,
}

impl fmt::Display for EpochStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let decision = match self.decision {
            Decision::Rejected => "rejected",
            Decision::FirstAccepted => "first",
            Decision::Improved { .. } => "improved",
            Decision::NotImproved => "not improved",
        };

        write!(
            f,
            "epoch {} | lr {:.2e} | momentum {:.2e} | loss {:.4} | accuracy {:.3} | {decision}",
            self.epoch, self.learning_rate, self.momentum, self.avg_loss, self.accuracy
        )?;

        if let Some(Evaluation { avg_loss, accuracy }) = self.validation {
            write!(f, " | val loss {avg_loss:.4} | val accuracy {accuracy:.3}")?;
        }

        write!(f, " | {:.1?}", self.elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(validation: Option<Evaluation>) -> EpochStats {
        EpochStats {
            epoch: 2,
            learning_rate: 1e-2,
            momentum: 0.25,
            avg_loss: 0.5,
            accuracy: 0.75,
            decision: Decision::NotImproved,
            validation,
            elapsed: Duration::from_millis(1500),
        }
    }

    #[test]
    fn display_shows_validation_only_when_present() {
        let line = stats(None).to_string();
        assert_eq!(
            line,
            "epoch 2 | lr 1.00e-2 | momentum 2.50e-1 | loss 0.5000 | accuracy 0.750 | not improved | 1.5s"
        );

        let line = stats(Some(Evaluation {
            avg_loss: 0.625,
            accuracy: 0.5,
        }))
        .to_string();
        assert!(line.contains("| not improved | val loss 0.6250 | val accuracy 0.500 | 1.5s"));
    }
}
