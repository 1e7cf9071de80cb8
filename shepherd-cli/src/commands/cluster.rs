use std::collections::BTreeMap;

use anyhow::{bail, Result};
use clap::{Args, Subcommand, ValueEnum};
use serde::Deserialize;
use shepherd_common::cluster::TlsClientConfig;
use shepherd_common::table::render_cluster_table;
use shepherd_common::{Cluster, ClusterConfig, ClusterField};

use crate::api::ApiClient;
use crate::output::{self, OutputFormat};

const CLUSTERS_PATH: &str = "/api/v1/clusters";

#[derive(Subcommand)]
pub enum ClusterCommands {
    /// List registered clusters
    List {
        /// Output format (table, json, yaml)
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Show one cluster
    Get {
        id: String,
        #[command(flatten)]
        id_type: IdTypeArg,
        /// Output format (table, json, yaml)
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Register a cluster and provision its service account
    Add {
        /// Kubernetes API server URL
        #[arg(value_name = "SERVER")]
        url: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        project: Option<String>,
        /// Overwrite an existing entry with the same server
        #[arg(long)]
        upsert: bool,
        /// Namespace to manage, repeatable; none means cluster-wide
        #[arg(long = "namespace")]
        namespaces: Vec<String>,
        /// Manage cluster-scoped resources when namespaces are set
        #[arg(long)]
        cluster_resources: bool,
        /// Label as key=value, repeatable
        #[arg(long = "label", value_parser = parse_key_value)]
        labels: Vec<(String, String)>,
        /// Skip TLS verification of the API server
        #[arg(long)]
        insecure: bool,
        #[arg(long)]
        bearer_token: Option<String>,
        /// Output format (table, json, yaml)
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Update the given attributes of a cluster
    Set {
        id: String,
        #[command(flatten)]
        id_type: IdTypeArg,
        #[arg(long)]
        name: Option<String>,
        /// Replaces the namespace list, repeatable
        #[arg(long = "namespace")]
        namespaces: Vec<String>,
        /// Replaces the label map, repeatable
        #[arg(long = "label", value_parser = parse_key_value)]
        labels: Vec<(String, String)>,
        /// Reject the update unless the entry is still at this version
        #[arg(long)]
        resource_version: Option<u64>,
    },
    /// Remove a cluster and tear down its service account
    Rm {
        id: String,
        #[command(flatten)]
        id_type: IdTypeArg,
    },
    /// Probe a cluster now instead of waiting for the next sweep
    Refresh {
        id: String,
        #[command(flatten)]
        id_type: IdTypeArg,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IdType {
    Name,
    Server,
}

#[derive(Debug, Args)]
pub struct IdTypeArg {
    /// How to interpret the cluster id; guessed from its shape when omitted
    #[arg(long, value_enum)]
    id_type: Option<IdType>,
}

#[derive(Debug, Deserialize)]
struct ClusterList {
    items: Vec<Cluster>,
}

#[derive(Debug, Deserialize)]
struct DeleteOutcome {
    cluster: Cluster,
    #[serde(default)]
    warnings: Vec<String>,
}

pub async fn handle_cluster_command(
    command: ClusterCommands,
    api: &ApiClient,
    default_output: &str,
) -> Result<()> {
    let output_format = |flag: Option<String>| OutputFormat::parse(flag.as_deref().unwrap_or(default_output));

    match command {
        ClusterCommands::List { output } => {
            let list: ClusterList = api.get(CLUSTERS_PATH).await?;
            output::print_as(&list.items, output_format(output), || render_cluster_table(&list.items))?;
        }
        ClusterCommands::Get { id, id_type, output } => {
            let cluster: Cluster = api.get(&cluster_path(&id, id_type.id_type, &[])).await?;
            output::print_as(&cluster, output_format(output), || {
                render_cluster_table(std::slice::from_ref(&cluster))
            })?;
        }
        ClusterCommands::Add {
            url,
            name,
            project,
            upsert,
            namespaces,
            cluster_resources,
            labels,
            insecure,
            bearer_token,
            output,
        } => {
            let cluster = Cluster {
                server: url,
                name: name.unwrap_or_default(),
                project: project.unwrap_or_default(),
                config: ClusterConfig {
                    tls_client_config: TlsClientConfig {
                        insecure,
                        ..Default::default()
                    },
                    bearer_token,
                    ..Default::default()
                },
                namespaces,
                cluster_resources,
                labels: labels.into_iter().collect(),
                ..Default::default()
            };

            let path = if upsert {
                format!("{}?upsert=true", CLUSTERS_PATH)
            } else {
                CLUSTERS_PATH.to_string()
            };
            let created: Cluster = api.post(&path, &cluster).await?;
            output::print_as(&created, output_format(output), || {
                format!("Cluster '{}' added", created.server)
            })?;
        }
        ClusterCommands::Set {
            id,
            id_type,
            name,
            namespaces,
            labels,
            resource_version,
        } => {
            let (patch, fields) = build_patch(name, namespaces, labels)?;
            let mut query = vec![("updatedFields".to_string(), field_list(&fields))];
            if let Some(version) = resource_version {
                query.push(("resourceVersion".to_string(), version.to_string()));
            }

            let updated: Cluster = api
                .put(&cluster_path(&id, id_type.id_type, &query), &patch)
                .await?;
            output::print_info(&format!(
                "Cluster '{}' updated (version {})",
                id, updated.resource_version
            ));
        }
        ClusterCommands::Rm { id, id_type } => {
            let outcome: DeleteOutcome = api.delete(&cluster_path(&id, id_type.id_type, &[])).await?;
            for warning in &outcome.warnings {
                output::print_warning(&format!("{}: {}", outcome.cluster.server, warning));
            }
            println!("Cluster '{}' removed", id);
        }
        ClusterCommands::Refresh { id, id_type } => {
            let _: Cluster = api
                .post_empty(&format!("{}/refresh", cluster_path(&id, id_type.id_type, &[])))
                .await?;
            output::print_info(&format!("Refresh of cluster '{}' scheduled", id));
        }
    }
    Ok(())
}

/// `/api/v1/clusters/<id>` with the id percent-encoded plus query parameters
fn cluster_path(id: &str, id_type: Option<IdType>, query: &[(String, String)]) -> String {
    let mut path = format!("{}/{}", CLUSTERS_PATH, urlencoding::encode(id));

    let mut params: Vec<String> = Vec::new();
    if let Some(id_type) = id_type {
        let value = match id_type {
            IdType::Name => "name",
            IdType::Server => "server",
        };
        params.push(format!("id.type={}", value));
    }
    for (key, value) in query {
        params.push(format!("{}={}", key, urlencoding::encode(value)));
    }

    if !params.is_empty() {
        path.push('?');
        path.push_str(&params.join("&"));
    }
    path
}

fn build_patch(
    name: Option<String>,
    namespaces: Vec<String>,
    labels: Vec<(String, String)>,
) -> Result<(Cluster, Vec<ClusterField>)> {
    let mut patch = Cluster::default();
    let mut fields = Vec::new();

    if let Some(name) = name {
        patch.name = name;
        fields.push(ClusterField::Name);
    }
    if !namespaces.is_empty() {
        patch.namespaces = namespaces;
        fields.push(ClusterField::Namespaces);
    }
    if !labels.is_empty() {
        patch.labels = labels.into_iter().collect::<BTreeMap<_, _>>();
        fields.push(ClusterField::Labels);
    }

    if fields.is_empty() {
        bail!("nothing to update: pass --name, --namespace or --label");
    }
    Ok((patch, fields))
}

fn field_list(fields: &[ClusterField]) -> String {
    fields
        .iter()
        .map(ClusterField::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}
