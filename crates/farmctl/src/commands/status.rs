//! Controller status and health commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{ApiClient, ControllerStatus, HealthResponse};
use crate::output::{
    color_status, format_timestamp, print_json, print_table, print_warning, OutputFormat,
};

#[derive(Tabled)]
struct ReplicaRow {
    #[tabled(rename = "Replica")]
    id: String,
    #[tabled(rename = "Revision")]
    revision: String,
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Ready")]
    ready: String,
    #[tabled(rename = "Started")]
    started_at: String,
}

#[derive(Tabled)]
struct InstanceRow {
    #[tabled(rename = "Instance")]
    instance: String,
    #[tabled(rename = "Epoch")]
    epoch: u64,
    #[tabled(rename = "Phase")]
    phase: String,
    #[tabled(rename = "Failures")]
    failures: u32,
    #[tabled(rename = "Last Probe")]
    last_probe: String,
}

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
}

/// Show the status of the last reconcile cycle
pub async fn show_status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let status: ControllerStatus = client.get("api/v1/status").await?;

    if format == OutputFormat::Json {
        return print_json(&status);
    }

    println!("{}", "Build Farm Status".bold());
    println!("{}", "=".repeat(50));
    println!("Pool:       {}", status.pool.cyan());
    println!("Workload:   {}", status.workload.cyan());
    println!("Phase:      {}", color_status(&status.phase));
    let pool_phase = status.pool_phase.as_deref().unwrap_or("unknown");
    match status.in_flight_target {
        Some(target) => println!(
            "Nodes:      {} -> {} ({})",
            status.node_count,
            target,
            color_status(pool_phase)
        ),
        None => println!("Nodes:      {} ({})", status.node_count, color_status(pool_phase)),
    }
    println!("Volume:     {}", color_status(&status.volume_state));
    println!(
        "Image:      {}",
        status.image_digest.as_deref().unwrap_or("not published")
    );
    println!("Revision:   {} ({})", status.revision, status.workload_state);
    if let Some(phase) = &status.health_phase {
        println!("Health:     {}", color_status(phase));
    }
    if let Some(decision) = &status.last_decision {
        println!(
            "Decision:   {} node(s), {} at {}",
            decision.target_node_count,
            decision.reason,
            format_timestamp(&decision.timestamp)
        );
    }
    println!("Updated:    {}", format_timestamp(&status.updated_at));

    if let Some(error) = &status.last_error {
        println!();
        print_warning(&format!("Last error: {}", error));
    }

    println!();
    let replicas: Vec<ReplicaRow> = status
        .replicas
        .iter()
        .map(|r| ReplicaRow {
            id: r.id.clone(),
            revision: r.revision.clone(),
            address: r.address.clone(),
            ready: if r.ready {
                "yes".green().to_string()
            } else {
                "no".yellow().to_string()
            },
            started_at: format_timestamp(&r.started_at),
        })
        .collect();
    print_table(replicas, "No replicas scheduled");

    if !status.instances.is_empty() {
        println!();
        let instances: Vec<InstanceRow> = status
            .instances
            .iter()
            .map(|i| InstanceRow {
                instance: i.instance_id.clone(),
                epoch: i.epoch,
                phase: color_status(&i.phase),
                failures: i.consecutive_failures,
                last_probe: i
                    .last_probe_time
                    .as_deref()
                    .map(format_timestamp)
                    .unwrap_or_else(|| "-".to_string()),
            })
            .collect();
        print_table(instances, "");
    }

    Ok(())
}

/// Show controller self-health per component
pub async fn show_health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let (code, health): (_, HealthResponse) = client.probe("healthz").await?;

    if format == OutputFormat::Json {
        return print_json(&health);
    }

    println!("Controller: {} ({})", color_status(&health.status), code);
    let rows: Vec<ComponentRow> = health
        .components
        .iter()
        .map(|(name, component)| ComponentRow {
            name: name.clone(),
            status: color_status(&component.status),
            message: component.message.clone().unwrap_or_default(),
        })
        .collect();
    print_table(rows, "No components registered");

    Ok(())
}
