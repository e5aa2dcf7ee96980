//! Prediction polling
//!
//! Sleeps a fixed interval, fetches the job status and repeats until the job
//! reaches a terminal status or the attempt budget runs out. Every sleep and
//! every fetch races the run's cancellation token.

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::PollConfig;
use crate::error::{NodeEngineError, Result};
use crate::remote::{Prediction, PredictionClient, PredictionStatus};

/// Poll `prediction_id` until it finishes and return its raw output
///
/// `on_progress` is called every `config.progress_every` attempts with the
/// attempt number and the latest state. On cancellation the provider is asked
/// to stop the job (best effort) and [`NodeEngineError::Cancelled`] is
/// returned.
pub async fn poll_prediction<F>(
    client: &dyn PredictionClient,
    prediction_id: &str,
    config: &PollConfig,
    cancel: &CancellationToken,
    mut on_progress: F,
) -> Result<Value>
where
    F: FnMut(u32, &Prediction) + Send,
{
    let interval = config.interval();

    for attempt in 1..=config.max_attempts {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return abort(client, prediction_id).await,
            _ = tokio::time::sleep(interval) => {}
        }

        let prediction = tokio::select! {
            biased;
            _ = cancel.cancelled() => return abort(client, prediction_id).await,
            fetched = client.get_prediction(prediction_id) => fetched?,
        };

        log::debug!(
            "Prediction {} attempt {}: {}",
            prediction_id,
            attempt,
            prediction.status.as_str()
        );

        if config.progress_every > 0 && attempt % config.progress_every == 0 {
            on_progress(attempt, &prediction);
        }

        match prediction.status {
            PredictionStatus::Succeeded => return Ok(prediction.output.unwrap_or(Value::Null)),
            PredictionStatus::Failed => {
                let message = prediction
                    .error
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| "Prediction failed".to_string());
                return Err(NodeEngineError::Provider(message));
            }
            PredictionStatus::Canceled => {
                return Err(NodeEngineError::provider(format!(
                    "Prediction {} was canceled",
                    prediction_id
                )));
            }
            _ => {}
        }
    }

    Err(NodeEngineError::Timeout {
        prediction_id: prediction_id.to_string(),
        attempts: config.max_attempts,
    })
}

async fn abort(client: &dyn PredictionClient, prediction_id: &str) -> Result<Value> {
    log::info!("Cancelling prediction {}", prediction_id);
    if let Err(e) = client.cancel_prediction(prediction_id).await {
        log::warn!("Failed to cancel prediction {}: {}", prediction_id, e);
    }
    Err(NodeEngineError::Cancelled)
}
