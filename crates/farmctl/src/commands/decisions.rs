//! Cost decision history

use anyhow::Result;
use tabled::Tabled;

use crate::client::{ApiClient, CostDecision};
use crate::output::{format_timestamp, print_json, print_table, OutputFormat};

#[derive(Tabled)]
struct DecisionRow {
    #[tabled(rename = "Time")]
    timestamp: String,
    #[tabled(rename = "Target Nodes")]
    target: u32,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Show the most recent cost decisions, newest last
pub async fn show_decisions(client: &ApiClient, limit: usize, format: OutputFormat) -> Result<()> {
    let path = format!("api/v1/decisions?limit={}", limit);
    let decisions: Vec<CostDecision> = client.get(&path).await?;

    match format {
        OutputFormat::Json => print_json(&decisions)?,
        OutputFormat::Table => {
            let count = decisions.len();
            let rows: Vec<DecisionRow> = decisions
                .into_iter()
                .map(|d| DecisionRow {
                    timestamp: format_timestamp(&d.timestamp),
                    target: d.target_node_count,
                    reason: d.reason,
                })
                .collect();
            print_table(rows, "No decisions recorded yet");
            if count > 0 {
                println!("\nShowing {} decision(s)", count);
            }
        }
    }

    Ok(())
}
