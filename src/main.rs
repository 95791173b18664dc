use std::path::PathBuf;
use std::process::ExitCode;

use burn::backend::Autodiff;
use burn_ndarray::NdArray;
use card_est_rs::{TrialController, TrialSettings};
use tracing::{error, info};

type Backend = Autodiff<NdArray<f32>>;

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    // Optional settings file; CARDEST_* environment variables override it.
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let settings = match TrialSettings::load(config_path.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            error!("Failed to load settings: {err}");
            return ExitCode::FAILURE;
        }
    };

    info!("Starting {:?} trial on dataset `{}`", settings.mode, settings.dataset);
    let mut trial = TrialController::<Backend>::new(settings, Default::default());
    match trial.run() {
        Ok(results) => {
            for result in &results {
                info!("epoch {} done={} {:?}", result.epoch, result.done, result.results);
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("Trial failed: {err}");
            ExitCode::FAILURE
        }
    }
}
