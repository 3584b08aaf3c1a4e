use std::env;

use anyhow::{bail, Context, Result};
use log::info;

use volume_classifier::{config::TrainingConfig, training::ModelTrainer};

fn main() -> Result<()> {
    env_logger::init();

    let Some(path) = env::args().nth(1) else {
        bail!("usage: volume-classifier <config.json>");
    };

    let config = TrainingConfig::from_file(&path)
        .with_context(|| format!("failed to load the training config at {path}"))?;

    let mut trainer = ModelTrainer::from_config(config)?;
    let stats = trainer.train()?;

    let accepted = trainer.classifier().controller().accepted_epochs();
    let best = trainer.classifier().controller().accepted_loss();
    info!(
        "finished {} epochs, {accepted} accepted, best loss {best:?}",
        stats.len()
    );

    if let Some(validation) = stats.last().and_then(|s| s.validation) {
        info!(
            "final validation loss {:.4}, accuracy {:.3}",
            validation.avg_loss, validation.accuracy
        );
    }

    Ok(())
}
