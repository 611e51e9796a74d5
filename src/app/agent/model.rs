use serde::{Deserialize, Serialize};

pub const DAYS: [&str; 2] = ["today", "yesterday"];
pub const FIELDS: [&str; 3] = ["revenue", "cost", "customers"];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DayFigures {
    pub revenue: f64,
    pub cost: f64,
    pub customers: f64,
}

impl DayFigures {
    pub fn profit(&self) -> f64 {
        self.revenue - self.cost
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentInput {
    pub today: DayFigures,
    pub yesterday: DayFigures,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub profit_today: f64,
    pub profit_yesterday: f64,
    pub revenue_change_pct: f64,
    pub cost_change_pct: f64,
    pub cac_today: f64,
    pub cac_change_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfitStatus {
    Positive,
    Negative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub profit_status: ProfitStatus,
    pub alerts: Vec<String>,
    pub recommendations: Vec<String>,
}

/// State threaded through the workflow; each node fills in its part.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentState {
    pub input_data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<AgentInput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<Report>,
}

impl AgentState {
    pub fn new(input_data: serde_json::Value) -> Self {
        Self {
            input_data,
            ..Default::default()
        }
    }
}

/// Figures used when the agent runs without input.
pub fn sample_input() -> serde_json::Value {
    serde_json::json!({
        "today": {"revenue": 12000, "cost": 8000, "customers": 100},
        "yesterday": {"revenue": 10000, "cost": 7000, "customers": 90}
    })
}
