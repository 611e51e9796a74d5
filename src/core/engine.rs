use crate::core::state::BuildLifecycle;
use crate::domain::model::{BuildContext, BuildState, BuildStep, PublishedImage, StepRecord};
use crate::domain::ports::BuildPipeline;
use crate::utils::error::{BootstrapError, Result};
use crate::utils::monitor::SystemMonitor;
use std::time::Instant;

/// Outcome of one build, whether or not it reached `IMAGE_READY`.
#[derive(Debug)]
pub struct BuildReport {
    pub state: BuildState,
    pub history: Vec<BuildState>,
    pub steps: Vec<StepRecord>,
    pub image: Option<PublishedImage>,
    pub failure: Option<BootstrapError>,
}

impl BuildReport {
    pub fn succeeded(&self) -> bool {
        self.state == BuildState::ImageReady
    }

    pub fn into_result(mut self) -> Result<BuildReport> {
        match self.failure.take() {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }
}

/// Drives a [`BuildPipeline`] through every build step in order, stopping
/// at the first failure.
pub struct BuildEngine<P: BuildPipeline> {
    pipeline: P,
    monitor: SystemMonitor,
}

impl<P: BuildPipeline> BuildEngine<P> {
    pub fn new(pipeline: P) -> Self {
        Self::new_with_monitoring(pipeline, false)
    }

    pub fn new_with_monitoring(pipeline: P, monitor_enabled: bool) -> Self {
        Self {
            pipeline,
            monitor: SystemMonitor::new(monitor_enabled),
        }
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    /// Run the build and surface the failure, if any, as an error.
    pub async fn run(&self) -> Result<BuildReport> {
        self.run_with_report().await.into_result()
    }

    pub async fn run_with_report(&self) -> BuildReport {
        tracing::info!("🚀 Starting build...");
        self.monitor.log_stats("start");

        let mut lifecycle = BuildLifecycle::new();
        let mut steps = Vec::with_capacity(BuildStep::ALL.len());

        let mut ctx = match self.pipeline.prepare().await {
            Ok(ctx) => ctx,
            Err(e) => {
                return self
                    .abort(lifecycle, None, steps, BootstrapError::step_failed("prepare", e))
                    .await;
            }
        };

        for step in BuildStep::ALL {
            tracing::debug!("Running step {}", step);
            let started = Instant::now();
            let result = self.pipeline.run_step(step, &mut ctx).await;
            let duration = started.elapsed();

            match result {
                Ok(()) => steps.push(StepRecord {
                    step,
                    duration,
                    succeeded: true,
                }),
                Err(e) if step.is_observational() => {
                    tracing::warn!("⚠️ Step {} failed, ignoring: {}", step, e);
                    steps.push(StepRecord {
                        step,
                        duration,
                        succeeded: false,
                    });
                }
                Err(e) => {
                    tracing::error!("❌ Step {} failed: {}", step, e);
                    steps.push(StepRecord {
                        step,
                        duration,
                        succeeded: false,
                    });
                    let error = BootstrapError::step_failed(step.name(), e);
                    return self.abort(lifecycle, Some(&ctx), steps, error).await;
                }
            }

            if let Some(state) = step.completes() {
                if let Err(e) = self.transition(&mut lifecycle, state) {
                    return self.abort(lifecycle, Some(&ctx), steps, e).await;
                }
            }
            self.monitor.log_stats(step.name());
        }

        let image = match self.pipeline.publish(&ctx).await {
            Ok(image) => image,
            Err(e) => {
                tracing::error!("❌ Publishing failed: {}", e);
                let error = BootstrapError::step_failed("publish", e);
                return self.abort(lifecycle, Some(&ctx), steps, error).await;
            }
        };
        if let Err(e) = self.transition(&mut lifecycle, BuildState::ImageReady) {
            return self.abort(lifecycle, Some(&ctx), steps, e).await;
        }

        tracing::info!("✅ Image ready: {} ({})", image.path.display(), image.digest);
        self.monitor.log_final_stats();

        BuildReport {
            state: lifecycle.state(),
            history: lifecycle.history().to_vec(),
            steps,
            image: Some(image),
            failure: None,
        }
    }

    fn transition(&self, lifecycle: &mut BuildLifecycle, to: BuildState) -> Result<()> {
        let from = lifecycle.advance(to)?;
        tracing::debug!("State {} -> {}", from, to);
        if let Some(observer) = self.pipeline.observer() {
            observer.on_transition(from, to);
        }
        Ok(())
    }

    async fn abort(
        &self,
        mut lifecycle: BuildLifecycle,
        ctx: Option<&BuildContext>,
        steps: Vec<StepRecord>,
        error: BootstrapError,
    ) -> BuildReport {
        if let Ok(from) = lifecycle.fail() {
            if let Some(observer) = self.pipeline.observer() {
                observer.on_transition(from, BuildState::BuildFailed);
            }
        }
        if let Some(ctx) = ctx {
            if let Err(e) = self.pipeline.discard(ctx).await {
                tracing::warn!("⚠️ Could not clean up staging area: {}", e);
            }
        }
        tracing::error!("❌ Build failed in state {}", lifecycle.state());

        BuildReport {
            state: lifecycle.state(),
            history: lifecycle.history().to_vec(),
            steps,
            image: None,
            failure: Some(error),
        }
    }
}
