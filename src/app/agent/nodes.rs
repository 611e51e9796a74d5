use crate::app::agent::model::{
    AgentInput, AgentState, DayFigures, Metrics, ProfitStatus, Report, DAYS, FIELDS,
};
use crate::utils::error::{BootstrapError, Result};

const CAC_ALERT_THRESHOLD: f64 = 20.0;
const GROWTH_THRESHOLD: f64 = 10.0;
const DECLINE_THRESHOLD: f64 = -5.0;

fn input_error(message: String) -> BootstrapError {
    BootstrapError::AgentInputError { message }
}

/// Validate the raw input and turn it into typed figures.
pub fn input_node(state: &mut AgentState) -> Result<()> {
    let mut figures = Vec::with_capacity(DAYS.len());
    for day in DAYS {
        let Some(data) = state.input_data.get(day) else {
            return Err(input_error(format!("Missing {} data", day)));
        };
        let mut values = [0.0; 3];
        for (slot, field) in values.iter_mut().zip(FIELDS) {
            let value = data
                .get(field)
                .ok_or_else(|| input_error(format!("Missing {} in {} data", field, day)))?;
            *slot = value
                .as_f64()
                .ok_or_else(|| input_error(format!("Invalid {} in {} data: {}", field, day, value)))?;
        }
        figures.push(DayFigures {
            revenue: values[0],
            cost: values[1],
            customers: values[2],
        });
    }

    state.input = Some(AgentInput {
        today: figures[0],
        yesterday: figures[1],
    });
    Ok(())
}

fn ratio(numerator: f64, denominator: f64, what: &str) -> Result<f64> {
    if denominator == 0.0 {
        return Err(BootstrapError::ProcessingError {
            message: format!("{} is zero", what),
        });
    }
    Ok(numerator / denominator)
}

fn change_pct(current: f64, previous: f64, what: &str) -> Result<f64> {
    Ok(ratio(current - previous, previous, what)? * 100.0)
}

/// Compute profit, day-over-day changes and customer acquisition cost.
pub fn process_node(state: &mut AgentState) -> Result<()> {
    let input = state.input.ok_or_else(|| BootstrapError::WorkflowError {
        message: "process ran before input was validated".to_string(),
    })?;
    let (today, yesterday) = (input.today, input.yesterday);

    let cac_today = ratio(today.cost, today.customers, "today's customers")?;
    let cac_yesterday = ratio(yesterday.cost, yesterday.customers, "yesterday's customers")?;

    state.metrics = Some(Metrics {
        profit_today: today.profit(),
        profit_yesterday: yesterday.profit(),
        revenue_change_pct: change_pct(today.revenue, yesterday.revenue, "yesterday's revenue")?,
        cost_change_pct: change_pct(today.cost, yesterday.cost, "yesterday's cost")?,
        cac_today,
        cac_change_pct: change_pct(cac_today, cac_yesterday, "yesterday's CAC")?,
    });
    Ok(())
}

/// Turn metrics into alerts and recommendations.
pub fn recommend_node(state: &mut AgentState) -> Result<()> {
    let metrics = state.metrics.ok_or_else(|| BootstrapError::WorkflowError {
        message: "recommend ran before metrics were computed".to_string(),
    })?;
    state.report = Some(recommend(&metrics));
    Ok(())
}

pub fn recommend(metrics: &Metrics) -> Report {
    let mut alerts = Vec::new();
    let mut recommendations = Vec::new();

    let profit_status = if metrics.profit_today >= 0.0 {
        ProfitStatus::Positive
    } else {
        alerts.push("ALERT: Negative profit detected".to_string());
        recommendations.push("Reduce operational costs immediately".to_string());
        ProfitStatus::Negative
    };

    if metrics.cac_change_pct > CAC_ALERT_THRESHOLD {
        alerts.push(format!("ALERT: CAC increased by {:.1}%", metrics.cac_change_pct));
        recommendations.push("Review marketing campaigns for efficiency".to_string());
    }

    if metrics.revenue_change_pct > GROWTH_THRESHOLD {
        recommendations
            .push("Consider increasing advertising budget to capitalize on growth".to_string());
    } else if metrics.revenue_change_pct < DECLINE_THRESHOLD {
        alerts.push(format!(
            "ALERT: Revenue decreased by {:.1}%",
            -metrics.revenue_change_pct
        ));
        recommendations.push("Analyze sales channels for improvement opportunities".to_string());
    }

    Report {
        profit_status,
        alerts,
        recommendations,
    }
}
