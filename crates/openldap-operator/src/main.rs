//! OpenLDAP operator entry point

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use openldap_operator::{
    ActionRequest, Backend, DatabaseConnection, MasterChanged, OperatorBuilder, RelationJoined,
    Trigger,
};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "openldap-operator", version, about = "Reconcile an OpenLDAP workload")]
pub struct Cli {
    /// Charm configuration (YAML mapping)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding persisted unit state
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Treat this unit as the leader (local backend)
    #[arg(long, global = true)]
    leader: bool,

    /// Where the local backend writes the pod spec
    #[arg(long, global = true)]
    spec_out: Option<PathBuf>,

    /// Where leader data, leadership and the workload live
    #[arg(long, global = true, value_enum, default_value_t = BackendArg::Local)]
    backend: BackendArg,

    /// Pebble socket of the workload container (pebble backend)
    #[arg(long, global = true)]
    pebble_socket: Option<PathBuf>,

    #[arg(long, global = true, default_value = "default")]
    namespace: String,

    #[arg(long, global = true, default_value = "openldap")]
    app: String,

    #[arg(long, global = true, default_value = "openldap/0")]
    unit: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Deliver a lifecycle hook
    Hook {
        #[arg(value_enum)]
        hook: Hook,

        #[command(flatten)]
        relation: RelationArgs,
    },
    /// Run an action
    Action {
        /// Action name, e.g. get-admin-password
        name: String,
    },
    /// Print the pod spec the current state would produce
    Render,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendArg {
    Local,
    Kubernetes,
    Pebble,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Local => Backend::Local,
            BackendArg::Kubernetes => Backend::Kubernetes,
            BackendArg::Pebble => Backend::Pebble,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hook {
    Start,
    ConfigChanged,
    LeaderElected,
    UpgradeCharm,
    DbRelationJoined,
    DbMasterChanged,
    DbRelationBroken,
}

/// Relation data carried by db-relation-joined and db-master-changed
#[derive(Args, Debug, Default)]
pub struct RelationArgs {
    /// Database name present in the relation data
    #[arg(long)]
    database: Option<String>,

    #[arg(long)]
    db_name: Option<String>,

    #[arg(long)]
    db_user: Option<String>,

    #[arg(long, env = "OPENLDAP_DB_PASSWORD", hide_env_values = true)]
    db_password: Option<String>,

    /// Primary host; without it the primary is treated as unavailable
    #[arg(long)]
    db_host: Option<String>,

    #[arg(long, default_value = "5432")]
    db_port: String,
}

impl RelationArgs {
    fn master(&self) -> Option<DatabaseConnection> {
        let host = self.db_host.clone()?;
        Some(DatabaseConnection {
            dbname: self
                .db_name
                .clone()
                .or_else(|| self.database.clone())
                .unwrap_or_default(),
            user: self.db_user.clone().unwrap_or_default(),
            password: self.db_password.clone().unwrap_or_default(),
            host,
            port: self.db_port.clone(),
        })
    }
}

fn trigger(hook: Hook, relation: &RelationArgs) -> Trigger {
    match hook {
        Hook::Start => Trigger::Start,
        Hook::ConfigChanged => Trigger::ConfigChanged,
        Hook::LeaderElected => Trigger::LeaderElected,
        Hook::UpgradeCharm => Trigger::Upgrade,
        Hook::DbRelationJoined => Trigger::DatabaseRelationJoined(RelationJoined {
            database: relation.database.clone(),
        }),
        Hook::DbMasterChanged => Trigger::MasterChanged(MasterChanged {
            database: relation.database.clone(),
            master: relation.master(),
        }),
        Hook::DbRelationBroken => Trigger::DatabaseRelationBroken,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut builder = OperatorBuilder::new()
        .backend(cli.backend.into())
        .namespace(cli.namespace)
        .app_name(cli.app)
        .unit_name(cli.unit)
        .leader(cli.leader);
    if let Some(dir) = cli.state_dir {
        builder = builder.state_dir(dir);
    }
    if let Some(path) = cli.config {
        builder = builder.config_path(path);
    }
    if let Some(path) = cli.spec_out {
        builder = builder.spec_out(path);
    }
    if let Some(path) = cli.pebble_socket {
        builder = builder.pebble_socket(path);
    }
    let manager = builder.build().await.context("failed to start operator")?;

    let output = match cli.command {
        Commands::Hook { hook, relation } => {
            serde_json::to_string_pretty(&manager.run_hook(trigger(hook, &relation)).await)?
        }
        Commands::Action { name } => {
            let action = ActionRequest::parse(&name)?;
            serde_json::to_string_pretty(&manager.run_hook(Trigger::Action { name: action }).await)?
        }
        Commands::Render => match manager.render().await {
            Some(spec) => serde_json::to_string_pretty(&spec)?,
            None => anyhow::bail!("no database relation data yet, nothing to render"),
        },
    };
    println!("{}", output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing_hook() {
        let cli = Cli::try_parse_from([
            "openldap-operator",
            "--leader",
            "hook",
            "db-master-changed",
            "--database",
            "openldap",
            "--db-host",
            "1.1.1.1",
            "--db-user",
            "ldap_user",
        ])
        .unwrap();

        assert!(cli.leader);
        assert_eq!(cli.backend, BackendArg::Local);
        match cli.command {
            Commands::Hook { hook, relation } => {
                assert_eq!(hook, Hook::DbMasterChanged);
                let master = relation.master().unwrap();
                assert_eq!(master.dbname, "openldap");
                assert_eq!(master.user, "ldap_user");
                assert_eq!(master.port, "5432");
            }
            _ => panic!("Expected Hook command"),
        }
    }

    #[test]
    fn test_master_absent_without_host() {
        let relation = RelationArgs {
            database: Some("openldap".to_string()),
            db_port: "5432".to_string(),
            ..Default::default()
        };
        match trigger(Hook::DbMasterChanged, &relation) {
            Trigger::MasterChanged(event) => {
                assert_eq!(event.database.as_deref(), Some("openldap"));
                assert!(event.master.is_none());
            }
            other => panic!("unexpected trigger {:?}", other),
        }
    }

    #[test]
    fn test_cli_parsing_pebble_backend() {
        let cli = Cli::try_parse_from([
            "openldap-operator",
            "--backend",
            "pebble",
            "--pebble-socket",
            "/charm/containers/openldap/pebble.socket",
            "hook",
            "config-changed",
        ])
        .unwrap();

        assert_eq!(Backend::from(cli.backend), Backend::Pebble);
        assert_eq!(
            cli.pebble_socket,
            Some(PathBuf::from("/charm/containers/openldap/pebble.socket"))
        );
    }

    #[test]
    fn test_cli_parsing_action() {
        let cli =
            Cli::try_parse_from(["openldap-operator", "action", "get-admin-password"]).unwrap();
        match cli.command {
            Commands::Action { name } => assert_eq!(name, "get-admin-password"),
            _ => panic!("Expected Action command"),
        }
    }
}
