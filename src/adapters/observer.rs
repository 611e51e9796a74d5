use crate::domain::model::BuildState;
use crate::domain::ports::BuildObserver;
use crate::utils::error::Result;

/// Writes state changes and directory listings to the build log.
#[derive(Debug, Clone, Default)]
pub struct LoggingObserver;

impl BuildObserver for LoggingObserver {
    fn on_transition(&self, from: BuildState, to: BuildState) {
        tracing::debug!("🔁 {} -> {}", from, to);
    }

    fn on_listing(&self, directory: &str, entries: &[String]) -> Result<()> {
        tracing::info!("📂 {} ({} entries)", directory, entries.len());
        for entry in entries {
            tracing::info!("   {}", entry);
        }
        Ok(())
    }
}
