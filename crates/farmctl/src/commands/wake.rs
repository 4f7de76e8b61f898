//! Activity signal

use anyhow::Result;

use crate::client::{ActivityRequest, ActivityResponse, ApiClient};
use crate::output::{format_timestamp, print_json, print_success, OutputFormat};

/// Tell the controller there is work, so a parked farm scales back up
pub async fn wake(client: &ApiClient, source: Option<String>, format: OutputFormat) -> Result<()> {
    let request = ActivityRequest { at: None, source };
    let response: ActivityResponse = client.post("api/v1/activity", &request).await?;

    match format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => print_success(&format!(
            "Activity recorded at {}",
            format_timestamp(&response.recorded_at)
        )),
    }
    Ok(())
}
