//! Logging decorator for stage runners.
//!
//! Wraps any [`StageRunner`] and records a span plus a duration/outcome event
//! per invocation. Composition happens at construction time:
//! `LoggingStageRunner::new(CommandStageRunner::from_config(..))`.

use super::{StageContext, StageInput, StageOutput, StageRunner};
use crate::errors::StageError;
use async_trait::async_trait;
use std::time::Instant;
use tracing::Instrument;

pub struct LoggingStageRunner<R> {
    inner: R,
}

impl<R: StageRunner> LoggingStageRunner<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

#[async_trait]
impl<R: StageRunner> StageRunner for LoggingStageRunner<R> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(&self, input: &StageInput, ctx: &StageContext) -> Result<StageOutput, StageError> {
        let span = tracing::info_span!(
            "stage",
            stage = self.inner.name(),
            cycle = input.cycle,
            attempt = input.attempt
        );
        async {
            let start = Instant::now();
            tracing::debug!("stage started");
            let result = self.inner.run(input, ctx).await;
            let elapsed_ms = start.elapsed().as_millis() as u64;
            match &result {
                Ok(output) => tracing::info!(
                    elapsed_ms,
                    text_chars = output.text.len(),
                    score = output.score,
                    "stage completed"
                ),
                Err(e) => tracing::warn!(
                    elapsed_ms,
                    kind = %e.kind(),
                    error = %e,
                    "stage failed"
                ),
            }
            result
        }
        .instrument(span)
        .await
    }
}
