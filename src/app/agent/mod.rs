//! Daily business metrics agent: validates two days of figures, derives
//! profit and acquisition cost changes, and emits alerts with recommendations.

pub mod model;
pub mod nodes;
pub mod workflow;

pub use model::{sample_input, AgentState, Metrics, ProfitStatus, Report};
pub use workflow::{create_workflow, StateGraph, Workflow, END};

use crate::utils::error::Result;
use std::io::Write;

/// Run the default workflow and return the report.
pub fn analyze(input_data: serde_json::Value) -> Result<AgentState> {
    create_workflow()?.invoke(input_data)
}

/// Write metrics as a two-line CSV (header plus values).
pub fn write_metrics_csv<W: Write>(metrics: &Metrics, writer: W) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.serialize(metrics)?;
    csv_writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_csv() {
        let state = analyze(sample_input()).unwrap();
        let mut buffer = Vec::new();
        write_metrics_csv(&state.metrics.unwrap(), &mut buffer).unwrap();

        let csv = String::from_utf8(buffer).unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("profit_today,profit_yesterday,revenue_change_pct,cost_change_pct,cac_today,cac_change_pct")
        );
        assert!(lines.next().unwrap().starts_with("4000.0,3000.0,20.0,"));
    }
}
