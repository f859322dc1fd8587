use std::path::Path;

use anyhow::Context;
use feedpipe_core::PipelineConfig;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub definition: String,
    pub rules: usize,
    pub min_idle: u32,
    pub max_size: u32,
    pub statuses: String,
    pub params: Vec<String>,
    pub rewrite_links_to: Option<String>,
}

pub fn check(config: &Path, format: &str) -> anyhow::Result<()> {
    let report = inspect(config)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            println!("✓ {} is valid", config.display());
            println!(
                "  definition: {} ({} rules)",
                report.definition, report.rules
            );
            println!(
                "  pool:       {}..{} engines",
                report.min_idle, report.max_size
            );
            println!("  statuses:   {}", report.statuses);
            if !report.params.is_empty() {
                println!("  params:     {}", report.params.join(", "));
            }
            if let Some(base) = &report.rewrite_links_to {
                println!("  links:      rewritten to {base}");
            }
        }
    }

    Ok(())
}

/// Load, validate and compile a configuration without starting a pool.
pub fn inspect(path: &Path) -> anyhow::Result<CheckReport> {
    let config = PipelineConfig::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let name = &config.definition.name;
    let definition = feedpipe_pool::from_section(&config.definition)
        .with_context(|| format!("definition '{name}' does not compile"))?;
    if let Some(base) = &config.headers.rewrite_links_to {
        feedpipe_pipeline::LinkRewriter::new(base)
            .with_context(|| format!("invalid headers.rewrite_links_to {base:?}"))?;
    }

    let mut params: Vec<String> = config
        .params
        .iter()
        .map(|(name, _)| name.to_string())
        .collect();
    params.extend(config.params_from_headers.keys().cloned());
    params.sort();
    params.dedup();

    Ok(CheckReport {
        definition: definition.name().to_string(),
        rules: config.definition.rules.len(),
        min_idle: config.pool.min_idle,
        max_size: config.pool.max_size,
        statuses: format!("{}-{}", config.policy.status_min, config.policy.status_max),
        params,
        rewrite_links_to: config.headers.rewrite_links_to.clone(),
    })
}
