//! Desired state inspection and updates

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use crate::client::{ActiveHours, ApiClient, DesiredPatch, DesiredState, ResourceQuantities};
use crate::output::{format_currency, format_window, print_info, print_json, print_success, OutputFormat};

/// Memory suffixes and their byte multipliers
const MEMORY_UNITS: [(&str, u64); 8] = [
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
];

const WEEKDAYS: [(&str, &str); 7] = [
    ("Mon", "Monday"),
    ("Tue", "Tuesday"),
    ("Wed", "Wednesday"),
    ("Thu", "Thursday"),
    ("Fri", "Friday"),
    ("Sat", "Saturday"),
    ("Sun", "Sunday"),
];

/// Fields accepted by `farmctl set`
#[derive(Debug, Default, Args)]
pub struct SetArgs {
    /// Container image to run
    #[arg(long)]
    pub image: Option<String>,

    /// Number of workload replicas
    #[arg(long)]
    pub replicas: Option<u32>,

    /// Per-replica resource requests as CPU,MEMORY, e.g. 500m,1Gi
    #[arg(long)]
    pub requests: Option<String>,

    /// Per-replica resource limits as CPU,MEMORY, e.g. 1,2Gi
    #[arg(long)]
    pub limits: Option<String>,

    /// Lower bound on pool size
    #[arg(long)]
    pub min_nodes: Option<u32>,

    /// Upper bound on pool size
    #[arg(long)]
    pub max_nodes: Option<u32>,

    /// Monthly budget in USD
    #[arg(long)]
    pub budget: Option<f64>,

    /// Active hours in UTC, e.g. 08-18
    #[arg(long, requires = "days")]
    pub hours: Option<String>,

    /// Active weekdays, e.g. Mon,Tue,Wed,Thu,Fri
    #[arg(long, requires = "hours")]
    pub days: Option<String>,
}

impl SetArgs {
    pub fn to_patch(&self) -> Result<DesiredPatch> {
        let active_hours = match (&self.hours, &self.days) {
            (Some(hours), Some(days)) => Some(parse_active_hours(hours, days)?),
            _ => None,
        };
        let requests = self
            .requests
            .as_deref()
            .map(parse_resources)
            .transpose()
            .context("Invalid --requests")?;
        let limits = self
            .limits
            .as_deref()
            .map(parse_resources)
            .transpose()
            .context("Invalid --limits")?;
        Ok(DesiredPatch {
            image: self.image.clone(),
            replicas: self.replicas,
            requests,
            limits,
            min_nodes: self.min_nodes,
            max_nodes: self.max_nodes,
            active_hours,
            monthly_budget: self.budget,
        })
    }
}

/// Parse "CPU,MEMORY" such as "500m,1Gi" or "2,4096Mi"
pub fn parse_resources(value: &str) -> Result<ResourceQuantities> {
    let (cpu, memory) = value
        .split_once(',')
        .with_context(|| format!("'{}' is not CPU,MEMORY", value))?;
    Ok(ResourceQuantities {
        cpu_millicores: parse_cpu(cpu.trim())?,
        memory_bytes: parse_memory(memory.trim())?,
    })
}

fn parse_cpu(cpu: &str) -> Result<u32> {
    if let Some(millis) = cpu.strip_suffix('m') {
        return millis
            .parse()
            .with_context(|| format!("Invalid CPU quantity '{}'", cpu));
    }
    let cores: f64 = cpu
        .parse()
        .with_context(|| format!("Invalid CPU quantity '{}'", cpu))?;
    let millis = (cores * 1000.0).round();
    if !(0.0..=f64::from(u32::MAX)).contains(&millis) {
        bail!("CPU quantity '{}' is out of range", cpu);
    }
    Ok(millis as u32)
}

fn parse_memory(memory: &str) -> Result<u64> {
    let (digits, multiplier) = MEMORY_UNITS
        .iter()
        .find_map(|(suffix, multiplier)| memory.strip_suffix(*suffix).map(|d| (d, *multiplier)))
        .unwrap_or((memory, 1));
    let amount: u64 = digits
        .parse()
        .with_context(|| format!("Invalid memory quantity '{}'", memory))?;
    amount
        .checked_mul(multiplier)
        .with_context(|| format!("Memory quantity '{}' is out of range", memory))
}

/// Parse "HH-HH" and a comma-separated weekday list
pub fn parse_active_hours(hours: &str, days: &str) -> Result<ActiveHours> {
    let (start, end) = hours
        .split_once('-')
        .with_context(|| format!("Invalid hours '{}', expected START-END", hours))?;
    let start_hour: u32 = start.trim().parse().context("Invalid start hour")?;
    let end_hour: u32 = end.trim().parse().context("Invalid end hour")?;
    if start_hour > 23 || end_hour > 23 {
        bail!("Hours must be between 0 and 23");
    }

    let mut weekdays = Vec::new();
    for day in days.split(',').map(str::trim).filter(|d| !d.is_empty()) {
        let Some((canonical, _)) = WEEKDAYS
            .iter()
            .find(|(short, long)| short.eq_ignore_ascii_case(day) || long.eq_ignore_ascii_case(day))
        else {
            bail!("Unknown weekday '{}'", day);
        };
        if !weekdays.iter().any(|w: &String| w == *canonical) {
            weekdays.push(canonical.to_string());
        }
    }

    Ok(ActiveHours {
        weekdays,
        start_hour,
        end_hour,
    })
}

/// Show the desired state the controller is working toward
pub async fn show_desired(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let desired: DesiredState = client.get("api/v1/desired").await?;
    match format {
        OutputFormat::Json => print_json(&desired),
        OutputFormat::Table => {
            print_desired(&desired);
            Ok(())
        }
    }
}

/// Apply a partial update to the desired state
pub async fn set_desired(client: &ApiClient, args: &SetArgs, format: OutputFormat) -> Result<()> {
    let patch = args.to_patch()?;
    if patch.is_empty() {
        print_info("Nothing to change; pass at least one field");
        return Ok(());
    }

    let desired: DesiredState = client.put("api/v1/desired", &patch).await?;
    match format {
        OutputFormat::Json => print_json(&desired)?,
        OutputFormat::Table => {
            print_success("Desired state updated");
            print_desired(&desired);
        }
    }
    Ok(())
}

fn print_desired(desired: &DesiredState) {
    println!("{}", "Desired State".bold());
    println!("{}", "=".repeat(50));
    println!("Workload:     {}", desired.workload.cyan());
    println!("Image:        {}", desired.image);
    println!("Replicas:     {}", desired.replicas);
    println!("Requests:     {}", format_resources(desired.requests.as_ref()));
    println!("Limits:       {}", format_resources(desired.limits.as_ref()));
    println!(
        "Nodes:        {}-{}",
        desired.min_nodes.unwrap_or(0),
        desired.max_nodes
    );
    println!(
        "Active hours: {}",
        format_window(
            &desired.active_hours.weekdays,
            desired.active_hours.start_hour,
            desired.active_hours.end_hour
        )
    );
    println!(
        "Volume:       {} ({} GiB)",
        desired.volume.name, desired.volume.size_gb
    );
    match desired.budget.monthly_budget {
        Some(budget) => println!("Budget:       {}/month", format_currency(budget)),
        None => println!("Budget:       unlimited"),
    }
}

fn format_resources(quantities: Option<&ResourceQuantities>) -> String {
    match quantities {
        Some(q) => format!("{}m CPU, {} MiB", q.cpu_millicores, q.memory_bytes >> 20),
        None => "budget default".to_string(),
    }
}
