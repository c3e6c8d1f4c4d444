//! Process-wide table of metric endpoint descriptors.
//!
//! Descriptors are keyed by `(source, tag)`. Registering the same function again updates its
//! descriptor in place. After every registration the whole table is written to the metadata
//! artifact (when a path is configured) so documentation tooling always sees the latest state.

use std::{
    io::Write as _,
    path::{Path, PathBuf},
};

use anyhow::Context;
use parking_lot::{RwLock, RwLockWriteGuard};
use serde::Serialize;
use tempfile::NamedTempFile;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
/// Machine-readable description of one registered metric endpoint.
pub struct MetricDescriptor {
    /// Human-readable label, e.g. `Issues Closed`.
    pub name: String,
    /// URL-safe identifier, e.g. `issues-closed`.
    pub tag: String,
    /// Path pattern the metric is served at.
    pub endpoint: String,
    /// `endpoint` with HTML special characters escaped.
    pub escaped_endpoint: String,
    /// Owning component, e.g. `GitHubAPI`.
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// `timeseries`, `git`, or unset for plain metrics.
    pub metric_type: Option<String>,
    pub frontend_status: String,
}

impl MetricDescriptor {
    /// Derive a descriptor for function `ident` of `source` bound at `endpoint`.
    pub fn for_function(source: &str, ident: &str, endpoint: &str) -> Self {
        Self {
            name: metric_name(ident),
            tag: metric_tag(ident),
            endpoint: endpoint.to_string(),
            escaped_endpoint: escape_html(endpoint),
            source: source.to_string(),
            metric_type: None,
            frontend_status: String::new(),
        }
    }
}

/// `issues_closed` -> `Issues Closed`.
///
/// Each run of letters starts upper-case and continues lower-case.
pub fn metric_name(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len());
    let mut prev_is_alpha = false;
    for ch in ident.chars() {
        let ch = if ch == '_' { ' ' } else { ch };
        if ch.is_alphabetic() {
            if prev_is_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            prev_is_alpha = true;
        } else {
            out.push(ch);
            prev_is_alpha = false;
        }
    }
    out
}

/// `issues_closed` -> `issues-closed`.
pub fn metric_tag(ident: &str) -> String {
    ident.replace('_', "-").to_lowercase()
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Registry of every bound metric endpoint.
pub struct MetricRegistry {
    entries: RwLock<Vec<MetricDescriptor>>,
    metadata_path: Option<PathBuf>,
}

impl MetricRegistry {
    /// An empty registry that exports to `metadata_path` after each registration.
    pub fn new(metadata_path: Option<PathBuf>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            metadata_path,
        }
    }

    /// Insert or update the descriptor keyed by `(source, tag)`, then export the table.
    ///
    /// Registrations are serialized through the export, so the artifact on disk always matches
    /// the table after the latest one. Export failures are logged; the registration itself
    /// always succeeds.
    pub fn register(&self, descriptor: MetricDescriptor) {
        let mut entries = self.entries.write();
        match entries
            .iter_mut()
            .find(|d| d.source == descriptor.source && d.tag == descriptor.tag)
        {
            Some(existing) => *existing = descriptor.clone(),
            None => entries.push(descriptor.clone()),
        }
        // Readers may proceed while the file is written; other registrations wait.
        let entries = RwLockWriteGuard::downgrade(entries);

        tracing::info!(
            event = "metric_registered",
            source = %descriptor.source,
            tag = %descriptor.tag,
            endpoint = %descriptor.endpoint,
            "registered"
        );

        if let Err(err) = self.write_artifact(&entries) {
            tracing::warn!(event = "metadata_export_failed", error = %err, "metadata export failed");
        }
    }

    /// Every descriptor, in registration order.
    pub fn list(&self) -> Vec<MetricDescriptor> {
        self.entries.read().clone()
    }

    pub fn get(&self, source: &str, tag: &str) -> Option<MetricDescriptor> {
        self.entries
            .read()
            .iter()
            .find(|d| d.source == source && d.tag == tag)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Overwrite the metadata artifact with the full table. No-op without a configured path.
    pub fn export(&self) -> anyhow::Result<()> {
        self.write_artifact(&self.entries.read())
    }

    fn write_artifact(&self, entries: &[MetricDescriptor]) -> anyhow::Result<()> {
        let Some(path) = &self.metadata_path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(entries)?;
        write_atomically(path, &bytes)
    }
}

/// Write `bytes` to a uniquely named sibling of `path`, then move it into place.
fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("create temp file in {}", dir.display()))?;
    tmp.write_all(bytes)
        .with_context(|| format!("write {}", tmp.path().display()))?;
    tmp.persist(path)
        .with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}
