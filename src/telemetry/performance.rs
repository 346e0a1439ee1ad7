use crate::dependencies::{AssetType, DependencyDescriptor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metrics reported by the running document (`performance-metrics` message)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LiveMetrics {
    pub load_time: Option<f64>,
    pub dom_content_loaded: Option<f64>,
    pub first_contentful_paint: Option<f64>,
    pub render_time: Option<f64>,
    pub memory_used: Option<u64>,
    pub dom_nodes: Option<u64>,
}

impl LiveMetrics {
    /// Overwrite fields the newer sample actually reports.
    pub fn merge(&mut self, newer: &LiveMetrics) {
        fn take<T: Copy>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }
        take(&mut self.load_time, newer.load_time);
        take(&mut self.dom_content_loaded, newer.dom_content_loaded);
        take(&mut self.first_contentful_paint, newer.first_contentful_paint);
        take(&mut self.render_time, newer.render_time);
        take(&mut self.memory_used, newer.memory_used);
        take(&mut self.dom_nodes, newer.dom_nodes);
    }

    pub fn is_empty(&self) -> bool {
        *self == LiveMetrics::default()
    }
}

/// Performance snapshot for one sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub live: LiveMetrics,
    pub samples: u32,
    pub document_bytes: usize,
    pub dependency_count: usize,
    pub estimated_transfer_bytes: u64,
    pub score: u8,
    pub collected_at: DateTime<Utc>,
}

/// Typical compressed size of a catalog asset, in KiB.
fn estimated_kib(dependency: &DependencyDescriptor) -> u64 {
    match dependency.name.as_str() {
        "react" => 11,
        "react-dom" => 42,
        "@babel/standalone" => 800,
        "tailwindcss" => 110,
        "three" => 160,
        "d3" => 90,
        "recharts" | "chart.js" => 70,
        "font-awesome" => 25,
        _ => match dependency.asset_type {
            AssetType::Script => 30,
            AssetType::Style => 10,
        },
    }
}

/// Build a snapshot from the latest live sample plus static document facts.
pub fn profile(
    live: &LiveMetrics,
    samples: u32,
    document_bytes: usize,
    dependencies: &[&DependencyDescriptor],
) -> PerformanceMetrics {
    let estimated_transfer_bytes = document_bytes as u64
        + dependencies
            .iter()
            .map(|d| estimated_kib(d) * 1024)
            .sum::<u64>();

    let mut penalty = 0u32;
    if let Some(load) = live.load_time {
        penalty += if load > 3000.0 { 20 } else if load > 1500.0 { 10 } else { 0 };
    }
    if let Some(fcp) = live.first_contentful_paint {
        penalty += if fcp > 2500.0 { 15 } else if fcp > 1000.0 { 5 } else { 0 };
    }
    if let Some(render) = live.render_time {
        penalty += if render > 500.0 { 10 } else { 0 };
    }
    if let Some(nodes) = live.dom_nodes {
        penalty += if nodes > 1500 { 15 } else if nodes > 800 { 5 } else { 0 };
    }
    if let Some(memory) = live.memory_used {
        penalty += if memory > 100 * 1024 * 1024 { 10 } else { 0 };
    }
    if estimated_transfer_bytes > 3 * 1024 * 1024 {
        penalty += 10;
    }
    if dependencies.len() > 10 {
        penalty += 5;
    }

    PerformanceMetrics {
        live: live.clone(),
        samples,
        document_bytes,
        dependency_count: dependencies.len(),
        estimated_transfer_bytes,
        score: super::score_after(penalty),
        collected_at: Utc::now(),
    }
}
