//! A gateway with one in-memory metric source.
//!
//! ```text
//! cargo run -p augur-gateway --example github_stub
//! curl 'localhost:5000/api/unstable/chaoss/augur/timeseries/commits?resample=W'
//! ```

use augur_gateway::{
    binder::{BindOptions, Metric, MetricArgs, MetricSource},
    config::GatewayConfig,
    server::{self, GatewayBuilder},
    table::{Cell, MetricValue, Table},
};

/// Serves canned commit counts for any `{owner}/{repo}`.
struct GitHubStub;

impl MetricSource for GitHubStub {
    fn create_routes(&self, builder: &mut GatewayBuilder) -> anyhow::Result<()> {
        let commits = Metric::new("GitHubAPI", "commits", |args: MetricArgs| async move {
            let repo = args.require("repo")?.to_string();
            let mut table = Table::new(["date", "repo", "commits"]);
            for (day, count) in [(1, 3_i64), (2, 5), (9, 1), (16, 4)] {
                table.push_row(vec![
                    Cell::from(format!("2019-01-{day:02}")),
                    repo.clone().into(),
                    count.into(),
                ]);
            }
            anyhow::Ok(MetricValue::Table(table))
        });
        builder.add_timeseries(commits, "commits")?;

        let languages = Metric::new("GitHubAPI", "languages", |_args: MetricArgs| async move {
            anyhow::Ok(MetricValue::Value(serde_json::json!({ "Rust": 0.8, "Shell": 0.2 })))
        });
        builder.add_metric(
            languages,
            "languages",
            BindOptions::default().frontend_status("ready"),
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cfg = GatewayConfig {
        metadata_path: None,
        ..GatewayConfig::load(None)?
    };
    server::serve(&cfg, &[&GitHubStub]).await
}
