//! Demo agents over a small in-memory sales dataset: a lister that names the
//! tables, a querier that aggregates one of them and a charter that draws the
//! aggregate as a text bar chart.

use std::sync::Arc;

use async_trait::async_trait;
use relay_core::{Agent, AgentContext, AgentDescriptor, AgentError};
use relay_engine::{AgentRegistry, RegistryError};
use serde_json::{json, Value};

struct Table {
    name: &'static str,
    label_column: &'static str,
    value_column: &'static str,
    rows: &'static [(&'static str, f64)],
}

const DATASET: &[Table] = &[
    Table {
        name: "revenue",
        label_column: "month",
        value_column: "usd",
        rows: &[("jan", 1200.0), ("feb", 950.0), ("mar", 1410.0), ("apr", 1675.0)],
    },
    Table {
        name: "signups",
        label_column: "region",
        value_column: "users",
        rows: &[("emea", 340.0), ("amer", 512.0), ("apac", 275.0)],
    },
];

struct Lister;

#[async_trait]
impl Agent for Lister {
    async fn execute(&self, ctx: &mut AgentContext) -> Result<(), AgentError> {
        let names: Vec<&str> = DATASET.iter().map(|t| t.name).collect();
        ctx.emit(format!("Found {} tables: {}\n", names.len(), names.join(", ")))
            .await?;
        ctx.provide("tables", json!(names)).await
    }
}

struct Querier;

#[async_trait]
impl Agent for Querier {
    async fn execute(&self, ctx: &mut AgentContext) -> Result<(), AgentError> {
        let tables: Vec<String> = ctx
            .require("tables")?
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
            .unwrap_or_default();

        let query = ctx.query().to_lowercase();
        let table = DATASET
            .iter()
            .filter(|t| tables.iter().any(|name| name == t.name))
            .find(|t| query.contains(t.name))
            .or_else(|| DATASET.iter().find(|t| tables.iter().any(|name| name == t.name)))
            .ok_or_else(|| AgentError::provision("result", "no known table to query"))?;

        let total: f64 = table.rows.iter().map(|(_, v)| v).sum();
        ctx.emit(format!(
            "Queried `{}`: {} rows, total {} {}\n",
            table.name,
            table.rows.len(),
            total,
            table.value_column
        ))
        .await?;

        let rows: Vec<Value> = table
            .rows
            .iter()
            .map(|(label, value)| json!({ "label": label, "value": value }))
            .collect();
        ctx.provide(
            "result",
            json!({
                "table": table.name,
                "label": table.label_column,
                "unit": table.value_column,
                "rows": rows,
            }),
        )
        .await
    }
}

struct Charter;

const BAR_WIDTH: f64 = 30.0;

#[async_trait]
impl Agent for Charter {
    async fn execute(&self, ctx: &mut AgentContext) -> Result<(), AgentError> {
        let result = ctx.require("result")?.clone();
        let rows = result["rows"]
            .as_array()
            .ok_or_else(|| AgentError::provision("chart", "result has no rows"))?;
        let max = rows
            .iter()
            .filter_map(|r| r["value"].as_f64())
            .fold(0.0_f64, f64::max);

        ctx.emit(format!(
            "{} by {} ({})\n",
            result["table"].as_str().unwrap_or("result"),
            result["label"].as_str().unwrap_or("label"),
            result["unit"].as_str().unwrap_or("value"),
        ))
        .await?;

        let mut chart = Vec::with_capacity(rows.len());
        for row in rows {
            let label = row["label"].as_str().unwrap_or("?");
            let value = row["value"].as_f64().unwrap_or(0.0);
            let width = if max > 0.0 {
                (value / max * BAR_WIDTH).round() as usize
            } else {
                0
            };
            let line = format!("{label:>6} | {} {value}\n", "#".repeat(width));
            ctx.emit(line.clone()).await?;
            chart.push(line.trim_end().to_string());
        }

        ctx.provide("chart", json!(chart)).await
    }
}

/// Register the lister, querier and charter.
pub fn register_demo_agents(registry: &mut AgentRegistry) -> Result<(), RegistryError> {
    registry.register(
        AgentDescriptor::new("lister", "list the available data tables", Arc::new(Lister))
            .provides(["tables"]),
    )?;
    registry.register(
        AgentDescriptor::new("querier", "query and aggregate data from a table", Arc::new(Querier))
            .requires(["tables"])
            .provides(["result"]),
    )?;
    registry.register(
        AgentDescriptor::new("charter", "draw a chart of query results", Arc::new(Charter))
            .requires(["result"])
            .provides(["chart"]),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use relay_core::{LexicalSelector, NullSink, Strategy};
    use relay_engine::{CoordinatorDeps, SessionManager};
    use relay_settings::RelaySettings;
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn manager() -> SessionManager {
        let mut registry = AgentRegistry::new();
        register_demo_agents(&mut registry).unwrap();
        SessionManager::new(CoordinatorDeps::new(
            Arc::new(registry),
            Arc::new(LexicalSelector::new()),
            Arc::new(RelaySettings::default()),
        ))
    }

    #[tokio::test]
    async fn resolver_draws_chart_from_scratch() {
        let manager = manager();
        let id = manager.create(Some(Strategy::Resolver));
        let response = manager
            .submit(&id, "draw a chart of revenue", &NullSink, &CancellationToken::new())
            .await
            .unwrap();

        assert!(response.is_success(), "{}", response.text);
        let agents: Vec<&str> = response.executions.iter().map(|e| e.agent_id.as_str()).collect();
        assert_eq!(agents, vec!["lister", "querier", "charter"]);
        // the querier only sees "need key result", so it takes the first table
        assert!(response.text.contains("Queried `revenue`"));
        assert!(response.text.contains("jan |"));
    }

    #[tokio::test]
    async fn planner_follows_the_steps() {
        let manager = manager();
        let id = manager.create(Some(Strategy::Planner));
        let response = manager
            .submit(
                &id,
                "list the tables then query revenue then draw a chart",
                &NullSink,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(response.is_success(), "{}", response.text);
        let agents: Vec<&str> = response.executions.iter().map(|e| e.agent_id.as_str()).collect();
        assert_eq!(agents, vec!["lister", "querier", "charter"]);
    }
}
